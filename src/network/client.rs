//! Client
//!
//! Talks to exactly one host. Connecting runs the association handshake,
//! then probes the host's UDP port until the host confirms over TCP that
//! the UDP endpoint is bound. Every connect builds a brand new
//! [`Connection`]; nothing carries over from a previous session.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::{
    request_association, request_ping, resolve_host, with_timeout, Connection, ConnectionError,
    ConnectionId, Delivery, DisconnectReason, HandshakeError, TcpChannel, UdpChannel,
};
use crate::protocol::{
    EncoderRegistry, Frame, MessageKey, ASSOCIATION_ACK, ASSOCIATION_KEY, DEFAULT_MAX_FRAME_SIZE,
    PROBE_BYTE,
};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection timeout")]
    Timeout,

    #[error("UDP association timed out")]
    AssociationTimeout,

    #[error("Connection closed during association: {0}")]
    AssociationFailed(DisconnectReason),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Runtime options for a client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Deadline for the TCP connect
    pub connect_timeout: Duration,
    /// Deadline for each handshake step
    pub handshake_timeout: Duration,
    /// Delay between UDP association probes
    pub probe_interval: Duration,
    /// Give up association after this long (`None` = keep probing)
    pub association_timeout: Option<Duration>,
    /// Largest accepted stream frame
    pub max_frame_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_millis(50),
            association_timeout: Some(Duration::from_secs(10)),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Handshake and UDP association complete
    Connected { id: ConnectionId },
    /// The connection ended (reported once per connection)
    Disconnected {
        id: ConnectionId,
        reason: DisconnectReason,
    },
    /// A message arrived from the host
    Received {
        key: MessageKey,
        payload: Bytes,
        delivery: Delivery,
    },
}

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

struct Session {
    connection: Arc<Connection>,
    udp: UdpChannel,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Close everything; returns `true` if this call closed the connection
    fn close(&self, reason: DisconnectReason) -> bool {
        self.udp.close();
        self.connection.close(reason)
    }

    async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Single-connection client
pub struct Client {
    /// Client configuration
    options: ClientOptions,
    /// Shared encoder registry
    codec: Arc<EncoderRegistry>,
    /// Current state
    state: Arc<RwLock<ClientState>>,
    /// The active session
    session: Mutex<Option<Session>>,
    /// Event sender
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
}

impl Client {
    pub fn new(options: ClientOptions, codec: Arc<EncoderRegistry>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            options,
            codec,
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            session: Mutex::new(None),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn codec(&self) -> &Arc<EncoderRegistry> {
        &self.codec
    }

    /// Connect to a host given its TCP and UDP addresses
    pub async fn connect(
        &self,
        tcp_addr: SocketAddr,
        udp_addr: SocketAddr,
    ) -> ClientResult<ConnectionId> {
        let mut session = self.session.lock().await;

        {
            let mut state = self.state.write().await;
            if *state != ClientState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
            *state = ClientState::Connecting;
        }

        // A session whose connection dropped on its own is still parked here
        if let Some(stale) = session.take() {
            stale.close(DisconnectReason::LocalClose);
            stale.join().await;
        }

        match self.establish(tcp_addr, udp_addr).await {
            Ok(established) => {
                let id = established.connection.id();
                *session = Some(established);
                *self.state.write().await = ClientState::Connected;

                tracing::info!("Connected to {} as connection {}", tcp_addr, id);
                let _ = self.event_tx.send(ClientEvent::Connected { id });
                Ok(id)
            }
            Err(e) => {
                *self.state.write().await = ClientState::Disconnected;
                Err(e)
            }
        }
    }

    /// Connect to a host by name
    pub async fn connect_hostname(
        &self,
        host: &str,
        tcp_port: u16,
        udp_port: u16,
    ) -> ClientResult<ConnectionId> {
        let tcp_addr = resolve_host(host, tcp_port).await?;
        let udp_addr = SocketAddr::new(tcp_addr.ip(), udp_port);
        self.connect(tcp_addr, udp_addr).await
    }

    async fn establish(&self, tcp_addr: SocketAddr, udp_addr: SocketAddr) -> ClientResult<Session> {
        tracing::debug!("Connecting to {} (udp {})", tcp_addr, udp_addr);

        let mut stream = tokio::time::timeout(
            self.options.connect_timeout,
            TcpStream::connect(tcp_addr),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;

        let bind_addr: SocketAddr = if udp_addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let udp = UdpChannel::bind(bind_addr).await?;
        let udp_port = udp.local_addr()?.port();

        let id = with_timeout(
            self.options.handshake_timeout,
            request_association(&mut stream, udp_port),
        )
        .await?;

        let (tcp, reader) = TcpChannel::open(stream, self.options.max_frame_size)?;
        let connection = Arc::new(Connection::new(
            id,
            udp_addr,
            tcp,
            udp.clone(),
            self.codec.clone(),
        ));

        let tcp_task = {
            let connection = connection.clone();
            let udp = udp.clone();
            let event_tx = self.event_tx.clone();
            let state = self.state.clone();
            tokio::spawn(async move {
                let reason = reader
                    .run(|frame| on_tcp_frame(&connection, &event_tx, frame))
                    .await;

                udp.close();
                // Before association the pending connect reports the failure
                if connection.close(reason.clone()) && connection.is_associated() {
                    tracing::info!("Disconnected from host: {}", reason);
                    *state.write().await = ClientState::Disconnected;
                    let _ = event_tx.send(ClientEvent::Disconnected {
                        id: connection.id(),
                        reason,
                    });
                }
            })
        };

        let udp_task = {
            let connection = connection.clone();
            let udp = udp.clone();
            let event_tx = self.event_tx.clone();
            tokio::spawn(async move {
                udp.run(|from, frame| {
                    if from != udp_addr {
                        tracing::debug!("Datagram from unexpected sender {} dropped", from);
                        return;
                    }
                    if let Some(payload) = connection.accept_unreliable(&frame) {
                        let _ = event_tx.send(ClientEvent::Received {
                            key: frame.key,
                            payload,
                            delivery: Delivery::Unreliable,
                        });
                    }
                })
                .await;
            })
        };

        let session = Session {
            connection,
            udp,
            tasks: vec![tcp_task, udp_task],
        };

        if let Err(e) = self.associate(&session.connection, &session.udp, udp_addr).await {
            session.close(DisconnectReason::LocalClose);
            session.join().await;
            return Err(e);
        }

        Ok(session)
    }

    /// Probe the host's UDP port until the TCP acknowledgment arrives
    async fn associate(
        &self,
        connection: &Connection,
        udp: &UdpChannel,
        udp_addr: SocketAddr,
    ) -> ClientResult<()> {
        let probing = async {
            let period = self.options.probe_interval.max(Duration::from_millis(1));
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;

                    _ = connection.associated() => return Ok(()),
                    reason = connection.closed() => {
                        return Err(ClientError::AssociationFailed(reason));
                    }
                    _ = interval.tick() => {
                        udp.send(udp_addr, ASSOCIATION_KEY, &[PROBE_BYTE]);
                    }
                }
            }
        };

        match self.options.association_timeout {
            Some(limit) => tokio::time::timeout(limit, probing)
                .await
                .map_err(|_| ClientError::AssociationTimeout)?,
            None => probing.await,
        }
    }

    /// Close the connection and wait for its loops to finish
    pub async fn disconnect(&self) -> ClientResult<()> {
        let session = self.session.lock().await.take();
        let Some(session) = session else {
            return Err(ClientError::NotConnected);
        };

        if session.close(DisconnectReason::LocalClose) {
            let _ = self.event_tx.send(ClientEvent::Disconnected {
                id: session.connection.id(),
                reason: DisconnectReason::LocalClose,
            });
        }
        session.join().await;

        *self.state.write().await = ClientState::Disconnected;
        tracing::info!("Client disconnected");
        Ok(())
    }

    /// The current connection, if any
    pub async fn connection(&self) -> Option<Arc<Connection>> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|s| !s.connection.is_closed())
            .map(|s| s.connection.clone())
    }

    pub async fn connection_id(&self) -> Option<ConnectionId> {
        self.connection().await.map(|c| c.id())
    }

    /// Encode and send a message to the host
    pub async fn send<T: 'static>(
        &self,
        key: MessageKey,
        value: &T,
        delivery: Delivery,
    ) -> ClientResult<()> {
        let connection = self.connection().await.ok_or(ClientError::NotConnected)?;
        connection.send(key, value, delivery)?;
        Ok(())
    }

    /// Send reliably, waiting until the OS accepted the bytes
    pub async fn send_async<T: 'static>(&self, key: MessageKey, value: &T) -> ClientResult<()> {
        let connection = self.connection().await.ok_or(ClientError::NotConnected)?;
        connection.send_async(key, value).await?;
        Ok(())
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ClientState::Connected
    }

    /// Liveness probe: fetch the host's ping buffer without taking a slot
    pub async fn ping(tcp_addr: SocketAddr, timeout: Duration) -> ClientResult<Bytes> {
        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(tcp_addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        let buffer = with_timeout(
            timeout,
            request_ping(&mut stream, DEFAULT_MAX_FRAME_SIZE),
        )
        .await?;
        Ok(buffer)
    }
}

fn on_tcp_frame(
    connection: &Connection,
    event_tx: &mpsc::UnboundedSender<ClientEvent>,
    frame: Frame,
) {
    if frame.key == ASSOCIATION_KEY {
        if frame.payload[..] == [ASSOCIATION_ACK] {
            if connection.mark_associated() {
                tracing::debug!("UDP association confirmed");
            }
        } else {
            tracing::debug!("Malformed association acknowledgment dropped");
        }
        return;
    }

    connection.record_reliable();
    let _ = event_tx.send(ClientEvent::Received {
        key: frame.key,
        payload: frame.payload,
        delivery: Delivery::Reliable,
    });
}
