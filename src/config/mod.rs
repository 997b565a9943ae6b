//! Configuration module
//!
//! Handles loading and saving hybridnet configuration.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::{ClientOptions, HostOptions};
use crate::protocol::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Host settings
    #[serde(default)]
    pub host: HostConfig,

    /// Client settings
    #[serde(default)]
    pub client: ClientConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Human-readable name for this node
    #[serde(default = "default_name")]
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Log filter directive (e.g. "info", "hybridnet=debug")
    pub log_level: Option<String>,
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            verbose: false,
            log_level: None,
        }
    }
}

/// Host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP listen port
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// UDP listen port
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    /// Maximum simultaneous clients (0 = unlimited)
    #[serde(default)]
    pub max_clients: usize,
    /// Largest accepted stream frame in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Handshake step deadline in ms
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Text returned to liveness probes
    pub ping_response: Option<String>,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_udp_port() -> u16 {
    DEFAULT_UDP_PORT
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_handshake_timeout() -> u64 {
    5000
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
            max_clients: 0,
            max_frame_size: default_max_frame_size(),
            handshake_timeout_ms: default_handshake_timeout(),
            ping_response: None,
        }
    }
}

impl HostConfig {
    /// Runtime options for [`crate::network::Host`]
    pub fn host_options(&self) -> ConfigResult<HostOptions> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.bind_address.clone()))?;

        Ok(HostOptions {
            tcp_addr: SocketAddr::new(ip, self.tcp_port),
            udp_addr: SocketAddr::new(ip, self.udp_port),
            max_clients: self.max_clients,
            max_frame_size: self.max_frame_size,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            ping_buffer: self
                .ping_response
                .as_ref()
                .map(|text| Bytes::from(text.clone().into_bytes())),
        })
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Host to connect to
    pub server: Option<String>,
    /// Host TCP port
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// Host UDP port
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Handshake step deadline in ms
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Delay between UDP association probes in ms
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,
    /// Give up association after this many ms (0 = keep probing)
    #[serde(default = "default_association_timeout")]
    pub association_timeout_ms: u64,
    /// Largest accepted stream frame in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_probe_interval() -> u64 {
    50
}

fn default_association_timeout() -> u64 {
    10_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: None,
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
            connect_timeout_ms: default_connect_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            probe_interval_ms: default_probe_interval(),
            association_timeout_ms: default_association_timeout(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl ClientConfig {
    /// Runtime options for [`crate::network::Client`]
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            // A zero period would make the probe interval panic
            probe_interval: Duration::from_millis(self.probe_interval_ms.max(1)),
            association_timeout: match self.association_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            max_frame_size: self.max_frame_size,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("hybridnet/config.toml")),
            Some(PathBuf::from("./hybridnet.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn host_options(&self) -> ConfigResult<HostOptions> {
        self.host.host_options()
    }

    pub fn client_options(&self) -> ClientOptions {
        self.client.client_options()
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "arena-01".to_string(),
            verbose: false,
            log_level: Some("info".to_string()),
        },
        host: HostConfig {
            max_clients: 16,
            ping_response: Some("arena-01: open".to_string()),
            ..Default::default()
        },
        client: ClientConfig {
            server: Some("127.0.0.1".to_string()),
            ..Default::default()
        },
    };

    Ok(toml::to_string_pretty(&config)?)
}
