//! HybridNet - Hybrid TCP/UDP host and client
//!
//! Runs a host, connects a client to one, or pings a host for liveness.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hybridnet::config::{self, Config};
use hybridnet::network::{resolve_host, Client, ClientEvent, Delivery, Host, HostEvent};
use hybridnet::protocol::{EncoderRegistry, MessageKey};

/// Message key the CLI uses for text messages
const TEXT_KEY: MessageKey = 1;

/// HybridNet - Hybrid TCP/UDP transport
#[derive(Parser)]
#[command(name = "hybridnet")]
#[command(author = "HybridNet Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Hybrid TCP/UDP host and client", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a host
    Host {
        /// TCP port to listen on
        #[arg(short, long)]
        tcp_port: Option<u16>,

        /// UDP port to listen on
        #[arg(short, long)]
        udp_port: Option<u16>,

        /// Maximum simultaneous clients (0 = unlimited)
        #[arg(short, long)]
        max_clients: Option<usize>,

        /// Send every received message back to its sender
        #[arg(long)]
        echo: bool,
    },

    /// Connect to a host
    Client {
        /// Host address to connect to
        #[arg(short, long)]
        server: Option<String>,

        /// Host TCP port
        #[arg(short, long)]
        tcp_port: Option<u16>,

        /// Host UDP port
        #[arg(short, long)]
        udp_port: Option<u16>,

        /// Text to send once connected
        #[arg(long)]
        send: Option<String>,

        /// Send the text over UDP instead of TCP
        #[arg(long)]
        unreliable: bool,
    },

    /// Ask a host for its ping response without connecting
    Ping {
        /// Host address
        server: String,

        /// Host TCP port
        #[arg(short, long)]
        tcp_port: Option<u16>,

        /// Timeout (ms)
        #[arg(long, default_value_t = 2000)]
        timeout: u64,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else if let Some(level) = &config.general.log_level {
        EnvFilter::new(level)
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Host {
            tcp_port,
            udp_port,
            max_clients,
            echo,
        } => {
            let mut config = config;
            if let Some(port) = tcp_port {
                config.host.tcp_port = port;
            }
            if let Some(port) = udp_port {
                config.host.udp_port = port;
            }
            if let Some(max) = max_clients {
                config.host.max_clients = max;
            }
            run_host(config, echo).await?;
        }
        Commands::Client {
            server,
            tcp_port,
            udp_port,
            send,
            unreliable,
        } => {
            let mut config = config;
            if let Some(server) = server {
                config.client.server = Some(server);
            }
            if let Some(port) = tcp_port {
                config.client.tcp_port = port;
            }
            if let Some(port) = udp_port {
                config.client.udp_port = port;
            }
            let delivery = if unreliable {
                Delivery::Unreliable
            } else {
                Delivery::Reliable
            };
            run_client(config, send, delivery).await?;
        }
        Commands::Ping {
            server,
            tcp_port,
            timeout,
        } => {
            let port = tcp_port.unwrap_or(config.client.tcp_port);
            let addr = resolve_host(&server, port).await?;
            let reply = Client::ping(addr, Duration::from_millis(timeout)).await?;
            println!("{}: {}", addr, String::from_utf8_lossy(&reply));
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Run a host until Ctrl+C
async fn run_host(config: Config, echo: bool) -> anyhow::Result<()> {
    let options = config.host_options()?;
    let codec = Arc::new(EncoderRegistry::default());

    tracing::info!(
        "Starting host '{}' on tcp {} / udp {}",
        config.general.name,
        options.tcp_addr,
        options.udp_addr
    );

    let mut host = Host::bind(options, codec.clone()).await?;
    let mut event_rx = host
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("event receiver already taken"))?;
    host.start()?;

    println!("\n========================================");
    println!("  HybridNet Host Running");
    println!("========================================");
    println!("  Name: {}", config.general.name);
    println!("  TCP:  {}", host.tcp_addr());
    println!("  UDP:  {}", host.udp_addr());
    println!("========================================");
    println!("\nWaiting for clients to connect...");
    println!("Press Ctrl+C to stop.\n");

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    HostEvent::Connected { id, endpoint } => {
                        println!("+ Client {} connected (udp {})", id, endpoint);
                    }
                    HostEvent::Disconnected { id, reason } => {
                        println!("- Client {} disconnected ({})", id, reason);
                    }
                    HostEvent::Refused { peer, reason } => {
                        println!("! Refused {} ({})", peer, reason);
                    }
                    HostEvent::Received { id, key, payload, delivery } => {
                        match codec.decode::<String>(&payload) {
                            Ok(text) if key == TEXT_KEY => {
                                println!("[{} {:?}] {}", id, delivery, text);
                            }
                            _ => tracing::debug!(
                                "Message from {} on key {} ({} bytes, {:?})",
                                id,
                                key,
                                payload.len(),
                                delivery
                            ),
                        }

                        if echo {
                            if let Some(conn) = host.find_by_id(id) {
                                if let Err(e) = conn.send_bytes(key, &payload, delivery) {
                                    tracing::warn!("Echo to {} failed: {}", id, e);
                                }
                            }
                        }
                    }
                    HostEvent::Started { .. } | HostEvent::Stopped => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    host.stop().await?;
    Ok(())
}

/// Connect to a host and print what arrives until Ctrl+C
async fn run_client(
    config: Config,
    send: Option<String>,
    delivery: Delivery,
) -> anyhow::Result<()> {
    let Some(server) = config.client.server.clone() else {
        anyhow::bail!("Please specify --server address or set client.server in the config");
    };

    let codec = Arc::new(EncoderRegistry::default());
    let mut client = Client::new(config.client_options(), codec.clone());
    let mut event_rx = client
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("event receiver already taken"))?;

    println!("Connecting to {}...", server);
    let id = client
        .connect_hostname(&server, config.client.tcp_port, config.client.udp_port)
        .await?;

    println!("\n========================================");
    println!("  HybridNet Client Connected");
    println!("========================================");
    println!("  Name:   {}", config.general.name);
    println!("  Server: {}", server);
    println!("  Id:     {}", id);
    println!("========================================");
    println!("\nPress Ctrl+C to disconnect.\n");

    if let Some(text) = send {
        client.send(TEXT_KEY, &text, delivery).await?;
    }

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ClientEvent::Connected { id } => {
                        tracing::info!("Connected as {}", id);
                    }
                    ClientEvent::Disconnected { reason, .. } => {
                        println!("Disconnected: {}", reason);
                        return Ok(());
                    }
                    ClientEvent::Received { key, payload, delivery } => {
                        match codec.decode::<String>(&payload) {
                            Ok(text) if key == TEXT_KEY => {
                                println!("[host {:?}] {}", delivery, text);
                            }
                            _ => tracing::debug!(
                                "Message on key {} ({} bytes, {:?})",
                                key,
                                payload.len(),
                                delivery
                            ),
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    client.disconnect().await?;
    Ok(())
}
