//! Host
//!
//! The authoritative side. Accepts TCP peers, runs the admission handshake,
//! owns the connection registry and the single UDP socket, and reports
//! everything that happens through [`HostEvent`]s.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{
    with_timeout, Admission, Connection, ConnectionError, ConnectionId, ConnectionRegistry,
    Delivery, DisconnectReason, HandshakeResult, HostHandshake, Opening, UdpChannel,
};
use crate::protocol::{
    encode_to_bytes, CodecError, EncoderRegistry, Frame, MessageKey, ASSOCIATION_ACK,
    ASSOCIATION_KEY, DEFAULT_MAX_FRAME_SIZE, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, PING_KEY,
};

/// Host errors
#[derive(Error, Debug)]
pub enum HostError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Host already running")]
    AlreadyRunning,

    #[error("Host not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

pub type HostResult<T> = Result<T, HostError>;

/// Runtime options for a host
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// TCP listen address
    pub tcp_addr: SocketAddr,
    /// UDP listen address
    pub udp_addr: SocketAddr,
    /// Maximum simultaneous connections (0 = unlimited)
    pub max_clients: usize,
    /// Largest accepted stream frame
    pub max_frame_size: usize,
    /// Deadline for each handshake step
    pub handshake_timeout: Duration,
    /// Bytes returned to liveness probes
    pub ping_buffer: Option<Bytes>,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self::new(DEFAULT_TCP_PORT, DEFAULT_UDP_PORT)
    }
}

impl HostOptions {
    /// Listen on all interfaces
    pub fn new(tcp_port: u16, udp_port: u16) -> Self {
        Self {
            tcp_addr: SocketAddr::from(([0, 0, 0, 0], tcp_port)),
            udp_addr: SocketAddr::from(([0, 0, 0, 0], udp_port)),
            max_clients: 0,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout: Duration::from_secs(5),
            ping_buffer: None,
        }
    }

    /// Loopback with ephemeral ports
    pub fn loopback() -> Self {
        let mut options = Self::new(0, 0);
        options.tcp_addr.set_ip([127, 0, 0, 1].into());
        options.udp_addr.set_ip([127, 0, 0, 1].into());
        options
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn with_ping_buffer(mut self, buffer: impl Into<Bytes>) -> Self {
        self.ping_buffer = Some(buffer.into());
        self
    }
}

/// Events emitted by the host
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// Listening
    Started {
        tcp_addr: SocketAddr,
        udp_addr: SocketAddr,
    },
    /// A peer completed admission
    Connected {
        id: ConnectionId,
        endpoint: SocketAddr,
    },
    /// A connection ended (reported exactly once per connection)
    Disconnected {
        id: ConnectionId,
        reason: DisconnectReason,
    },
    /// A message arrived
    Received {
        id: ConnectionId,
        key: MessageKey,
        payload: Bytes,
        delivery: Delivery,
    },
    /// A handshake finished but admission was denied
    Refused {
        peer: SocketAddr,
        reason: String,
    },
    /// Host stopped
    Stopped,
}

struct Shared {
    options: HostOptions,
    codec: Arc<EncoderRegistry>,
    registry: ConnectionRegistry<Connection>,
    udp: UdpChannel,
    events: mpsc::UnboundedSender<HostEvent>,
    next_id: AtomicU32,
}

impl Shared {
    fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }

    /// Next unused id, or `None` once every `u32` has been handed out.
    /// Ids never wrap, so a live connection's id is never reissued.
    fn allocate_id(&self) -> Option<ConnectionId> {
        self.next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(1))
            .ok()
    }

    /// Close and notify if this call did the closing. Leaves the registry alone.
    fn report_closed(&self, conn: &Connection, reason: DisconnectReason) -> bool {
        let closed = conn.close(reason.clone());
        if closed {
            tracing::info!("Connection {} disconnected: {}", conn.id(), reason);
            self.emit(HostEvent::Disconnected {
                id: conn.id(),
                reason,
            });
        }
        closed
    }

    /// Close, unregister, and notify if this call did the closing
    fn disconnect(&self, conn: &Arc<Connection>, reason: DisconnectReason) -> bool {
        let closed = self.report_closed(conn, reason);
        self.registry.unregister(conn);
        closed
    }

    fn refuse(&self, peer: SocketAddr, reason: String) {
        tracing::warn!("Refused {}: {}", peer, reason);
        self.emit(HostEvent::Refused { peer, reason });
    }

    fn on_tcp_frame(&self, conn: &Connection, frame: Frame) {
        if frame.key == ASSOCIATION_KEY || frame.key == PING_KEY {
            tracing::debug!(
                "Reserved key {} from connection {} ignored",
                frame.key,
                conn.id()
            );
            return;
        }

        conn.record_reliable();
        self.emit(HostEvent::Received {
            id: conn.id(),
            key: frame.key,
            payload: frame.payload,
            delivery: Delivery::Reliable,
        });
    }

    fn on_datagram(&self, from: SocketAddr, frame: Frame) {
        let Some(conn) = self.registry.find_by_endpoint(&from) else {
            tracing::debug!("Datagram from unknown endpoint {} dropped", from);
            return;
        };

        if frame.key == ASSOCIATION_KEY {
            if conn.mark_associated() {
                tracing::debug!("Connection {} associated UDP endpoint {}", conn.id(), from);
            }
            conn.send_control(ASSOCIATION_KEY, &encode_to_bytes(&ASSOCIATION_ACK));
            return;
        }

        if frame.key == PING_KEY {
            tracing::debug!("Reserved key {} from {} ignored", frame.key, from);
            return;
        }

        if let Some(payload) = conn.accept_unreliable(&frame) {
            self.emit(HostEvent::Received {
                id: conn.id(),
                key: frame.key,
                payload,
                delivery: Delivery::Unreliable,
            });
        }
    }
}

/// The authoritative endpoint every peer connects to
pub struct Host {
    shared: Arc<Shared>,
    listener: Option<TcpListener>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    event_rx: Option<mpsc::UnboundedReceiver<HostEvent>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Host {
    /// Bind the TCP listener and UDP socket without accepting yet
    pub async fn bind(options: HostOptions, codec: Arc<EncoderRegistry>) -> HostResult<Self> {
        let listener = TcpListener::bind(options.tcp_addr).await.map_err(|e| {
            HostError::BindFailed(format!("Failed to bind TCP {}: {}", options.tcp_addr, e))
        })?;
        let udp = UdpChannel::bind(options.udp_addr).await.map_err(|e| {
            HostError::BindFailed(format!("Failed to bind UDP {}: {}", options.udp_addr, e))
        })?;

        let tcp_addr = listener.local_addr()?;
        let udp_addr = udp.local_addr()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            options,
            codec,
            registry: ConnectionRegistry::new(),
            udp,
            events: event_tx,
            next_id: AtomicU32::new(1),
        });

        Ok(Self {
            shared,
            listener: Some(listener),
            tcp_addr,
            udp_addr,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            tasks: Vec::new(),
        })
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<HostEvent>> {
        self.event_rx.take()
    }

    /// Start accepting peers and receiving datagrams
    pub fn start(&mut self) -> HostResult<()> {
        let listener = self.listener.take().ok_or(HostError::AlreadyRunning)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(
            "Host listening on tcp {} / udp {}",
            self.tcp_addr,
            self.udp_addr
        );

        let shared = self.shared.clone();
        self.tasks
            .push(tokio::spawn(accept_loop(listener, shared, shutdown_rx)));

        let shared = self.shared.clone();
        self.tasks.push(tokio::spawn(async move {
            let udp = shared.udp.clone();
            udp.run(|from, frame| shared.on_datagram(from, frame)).await;
        }));

        self.shutdown_tx = Some(shutdown_tx);
        self.shared.emit(HostEvent::Started {
            tcp_addr: self.tcp_addr,
            udp_addr: self.udp_addr,
        });

        Ok(())
    }

    fn shutdown(&mut self) -> bool {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return false;
        };

        shutdown_tx.send_replace(true);
        self.shared.udp.close();

        for conn in self.shared.registry.drain() {
            self.shared.disconnect(&conn, DisconnectReason::HostShutdown);
        }
        true
    }

    /// Stop accepting, close every connection, and wait for the loops to end
    pub async fn stop(&mut self) -> HostResult<()> {
        if !self.shutdown() {
            return Err(HostError::NotRunning);
        }

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        self.shared.emit(HostEvent::Stopped);
        tracing::info!("Host stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn codec(&self) -> &Arc<EncoderRegistry> {
        &self.shared.codec
    }

    pub fn options(&self) -> &HostOptions {
        &self.shared.options
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.count()
    }

    pub fn find_by_id(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.shared.registry.find_by_id(id)
    }

    pub fn find_by_endpoint(&self, endpoint: &SocketAddr) -> Option<Arc<Connection>> {
        self.shared.registry.find_by_endpoint(endpoint)
    }

    /// Every live connection
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.registry.snapshot()
    }

    /// Send a message to one connection
    pub fn send_to<T: 'static>(
        &self,
        id: ConnectionId,
        key: MessageKey,
        value: &T,
        delivery: Delivery,
    ) -> HostResult<()> {
        let conn = self
            .find_by_id(id)
            .ok_or(HostError::UnknownConnection(id))?;
        conn.send(key, value, delivery)?;
        Ok(())
    }

    /// Send a message to every connection; returns how many accepted it
    pub fn broadcast<T: 'static>(
        &self,
        key: MessageKey,
        value: &T,
        delivery: Delivery,
    ) -> HostResult<usize> {
        let payload = self.shared.codec.encode(value)?;
        let sent = self
            .connections()
            .iter()
            .filter(|conn| conn.send_bytes(key, &payload, delivery).is_ok())
            .count();
        Ok(sent)
    }

    /// Forcibly disconnect a connection
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        match self.find_by_id(id) {
            Some(conn) => self.shared.disconnect(&conn, DisconnectReason::LocalClose),
            None => false,
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn stop_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        tracing::debug!("New connection from {}", addr);

                        let shared = shared.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_peer(shared, stream, addr).await {
                                tracing::debug!("Handshake with {} failed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            _ = stop_requested(&mut shutdown_rx) => {
                tracing::info!("Host shutdown requested");
                break;
            }
        }
    }
}

/// Drive one accepted socket from handshake to disconnect
async fn handle_peer(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) -> HandshakeResult<()> {
    let timeout = shared.options.handshake_timeout;
    let mut handshake = HostHandshake::new(stream, peer);

    let udp_port = match with_timeout(timeout, handshake.read_opening()).await {
        Ok(Opening::Associate { udp_port }) => udp_port,
        Ok(Opening::Ping) => {
            tracing::debug!("Liveness request from {}", peer);
            let buffer = shared.options.ping_buffer.clone().unwrap_or_default();
            let result = with_timeout(timeout, handshake.answer_ping(&buffer)).await;
            handshake.close();
            return result;
        }
        Err(e) => {
            handshake.close();
            return Err(e);
        }
    };

    let Some(id) = shared.allocate_id() else {
        handshake.close();
        shared.refuse(peer, "connection ids exhausted".to_string());
        return Ok(());
    };

    if let Err(e) = with_timeout(timeout, handshake.acknowledge(id)).await {
        handshake.close();
        return Err(e);
    }

    let (tcp, reader) = handshake.open_channel(shared.options.max_frame_size)?;
    let endpoint = SocketAddr::new(peer.ip(), udp_port);
    let conn = Arc::new(Connection::new(
        id,
        endpoint,
        tcp,
        shared.udp.clone(),
        shared.codec.clone(),
    ));

    // Connected goes out while the registry lock is held, so no datagram
    // can be dispatched to this connection before it
    let admission = shared.registry.admit_with(
        conn.clone(),
        shared.options.max_clients,
        |admitted, evicted| {
            if let Some(old) = evicted {
                tracing::info!(
                    "Endpoint {} reconnected, evicting connection {}",
                    endpoint,
                    old.id()
                );
                shared.report_closed(old, DisconnectReason::Evicted);
            }
            shared.emit(HostEvent::Connected {
                id: admitted.id(),
                endpoint,
            });
        },
    );

    match admission {
        Admission::Admitted { .. } => {}
        Admission::Refused { evicted } => {
            if let Some(old) = evicted {
                shared.disconnect(&old, DisconnectReason::Evicted);
            }
            conn.close(DisconnectReason::Refused);
            handshake.close();
            shared.refuse(
                peer,
                format!(
                    "{} ({} clients)",
                    DisconnectReason::Refused,
                    shared.options.max_clients
                ),
            );
            return Ok(());
        }
        Admission::Closed => {
            tracing::debug!("Host stopping, dropping {} after handshake", peer);
            conn.close(DisconnectReason::HostShutdown);
            handshake.close();
            return Ok(());
        }
    }

    handshake.establish();
    tracing::info!(
        "Connection {} established from {} (udp {})",
        id,
        peer,
        endpoint
    );

    let reason = reader
        .run(|frame| shared.on_tcp_frame(&conn, frame))
        .await;

    shared.disconnect(&conn, reason);
    handshake.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{request_association, TcpChannel};
    use crate::protocol::{pack, stamp};
    use tokio::net::UdpSocket;

    async fn next(rx: &mut mpsc::UnboundedReceiver<HostEvent>) -> HostEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn running_host() -> (Host, mpsc::UnboundedReceiver<HostEvent>) {
        let mut host = Host::bind(HostOptions::loopback(), Arc::new(EncoderRegistry::default()))
            .await
            .unwrap();
        let mut events = host.take_event_receiver().unwrap();
        host.start().unwrap();
        assert!(matches!(next(&mut events).await, HostEvent::Started { .. }));
        (host, events)
    }

    #[tokio::test]
    async fn test_ids_do_not_wrap() {
        let (host, _events) = running_host().await;
        host.shared.next_id.store(u32::MAX - 1, Ordering::SeqCst);

        assert_eq!(host.shared.allocate_id(), Some(u32::MAX - 1));
        assert_eq!(host.shared.allocate_id(), None);
        assert_eq!(host.shared.allocate_id(), None);
    }

    #[tokio::test]
    async fn test_exhausted_ids_refuse_admission() {
        let (host, mut events) = running_host().await;
        host.shared.next_id.store(u32::MAX, Ordering::SeqCst);

        let mut stream = TcpStream::connect(host.tcp_addr()).await.unwrap();
        assert!(request_association(&mut stream, 40_000).await.is_err());

        match next(&mut events).await {
            HostEvent::Refused { reason, .. } => assert!(reason.contains("exhausted")),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(host.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_reserved_datagrams_not_delivered() {
        let (host, mut events) = running_host().await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let mut stream = TcpStream::connect(host.tcp_addr()).await.unwrap();
        let id = request_association(&mut stream, port).await.unwrap();
        assert!(matches!(next(&mut events).await, HostEvent::Connected { .. }));

        let target = host.udp_addr();
        socket
            .send_to(&pack(PING_KEY, &stamp(1, b"x")), target)
            .await
            .unwrap();
        socket
            .send_to(&pack(5, &stamp(1, b"y")), target)
            .await
            .unwrap();

        // Only the application datagram surfaces, even though it was sent last
        match next(&mut events).await {
            HostEvent::Received {
                id: from,
                key,
                payload,
                ..
            } => {
                assert_eq!((from, key), (id, 5));
                assert_eq!(&payload[..], b"y");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(host.find_by_id(id).unwrap().guard().last_accepted(PING_KEY), None);
    }

    #[tokio::test]
    async fn test_admission_after_stop_is_dropped() {
        let (mut host, mut events) = running_host().await;
        let shared = host.shared.clone();
        host.stop().await.unwrap();
        assert!(matches!(next(&mut events).await, HostEvent::Stopped));

        // A handshake that finished while the host was stopping
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_client, accepted) = tokio::join!(
            TcpStream::connect(listener.local_addr().unwrap()),
            listener.accept()
        );
        let (tcp, _reader) = TcpChannel::open(accepted.unwrap().0, 1024).unwrap();
        let conn = Arc::new(Connection::new(
            1,
            SocketAddr::from(([127, 0, 0, 1], 40_000)),
            tcp,
            shared.udp.clone(),
            shared.codec.clone(),
        ));

        let admission = shared.registry.admit_with(conn, 0, |admitted, _| {
            shared.emit(HostEvent::Connected {
                id: admitted.id(),
                endpoint: admitted.endpoint(),
            })
        });

        assert!(matches!(admission, Admission::Closed));
        assert_eq!(host.connection_count(), 0);
        assert!(events.try_recv().is_err());
    }
}
