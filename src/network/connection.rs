//! Connection handling
//!
//! A [`Connection`] is the admitted identity of one remote peer. It owns the
//! reliable channel, knows the peer's UDP endpoint, and keeps the ordering
//! guard for unreliable traffic. Application code only ever talks to a peer
//! through [`Connection::send`].

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

use super::registry::Registered;
use super::{
    ChannelError, ConnectionId, Delivery, DisconnectReason, OrderedPacketGuard, TcpChannel,
    UdpChannel,
};
use crate::protocol::{
    stamp, unstamp, CodecError, EncoderRegistry, Frame, MessageKey, ASSOCIATION_KEY, PING_KEY,
};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Connection closed: {0}")]
    Closed(DisconnectReason),

    #[error("Message key {0} is reserved")]
    ReservedKey(MessageKey),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Connection statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Unreliable packets discarded as stale or duplicate
    pub packets_discarded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    discarded: AtomicU64,
}

/// One admitted peer
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    endpoint: SocketAddr,
    tcp: TcpChannel,
    udp: UdpChannel,
    guard: OrderedPacketGuard,
    codec: Arc<EncoderRegistry>,
    created_at: Instant,
    closed: AtomicBool,
    associated: watch::Sender<bool>,
    counters: Counters,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        endpoint: SocketAddr,
        tcp: TcpChannel,
        udp: UdpChannel,
        codec: Arc<EncoderRegistry>,
    ) -> Self {
        Self {
            id,
            endpoint,
            tcp,
            udp,
            guard: OrderedPacketGuard::new(),
            codec,
            created_at: Instant::now(),
            closed: AtomicBool::new(false),
            associated: watch::channel(false).0,
            counters: Counters::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The peer's UDP endpoint
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// The peer's TCP address
    pub fn peer_addr(&self) -> SocketAddr {
        self.tcp.peer_addr()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn guard(&self) -> &OrderedPacketGuard {
        &self.guard
    }

    pub fn codec(&self) -> &Arc<EncoderRegistry> {
        &self.codec
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            messages_sent: self.counters.sent.load(Ordering::Relaxed),
            messages_received: self.counters.received.load(Ordering::Relaxed),
            packets_discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }

    fn check_open(&self, key: MessageKey) -> ConnectionResult<()> {
        if key == ASSOCIATION_KEY || key == PING_KEY {
            return Err(ConnectionError::ReservedKey(key));
        }
        if self.is_closed() {
            return Err(ConnectionError::Closed(
                self.tcp.closed_reason().unwrap_or(DisconnectReason::LocalClose),
            ));
        }
        Ok(())
    }

    /// Encode `value` and send it on the chosen transport
    pub fn send<T: 'static>(
        &self,
        key: MessageKey,
        value: &T,
        delivery: Delivery,
    ) -> ConnectionResult<()> {
        self.check_open(key)?;
        let payload = self.codec.encode(value)?;
        self.send_bytes(key, &payload, delivery)
    }

    /// Send an already encoded payload
    pub fn send_bytes(
        &self,
        key: MessageKey,
        payload: &[u8],
        delivery: Delivery,
    ) -> ConnectionResult<()> {
        self.check_open(key)?;

        match delivery {
            Delivery::Reliable => self.tcp.send(key, payload),
            Delivery::Unreliable => {
                let timestamp = self.guard.next_timestamp(key);
                self.udp.send(self.endpoint, key, &stamp(timestamp, payload));
            }
        }

        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Send reliably and wait until the OS has accepted the bytes
    pub async fn send_async<T: 'static>(&self, key: MessageKey, value: &T) -> ConnectionResult<()> {
        self.check_open(key)?;
        let payload = self.codec.encode(value)?;
        self.tcp.send_async(key, &payload).await?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Send on a reserved key over TCP (association acknowledgment)
    pub(crate) fn send_control(&self, key: MessageKey, payload: &[u8]) {
        self.tcp.send(key, payload);
    }

    /// Record a reliable frame as received
    pub(crate) fn record_reliable(&self) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Run an unreliable frame through the ordering guard
    ///
    /// Returns the value bytes if the frame is newer than anything seen on
    /// its key, `None` if it is stale, duplicate or unstamped.
    pub fn accept_unreliable(&self, frame: &Frame) -> Option<Bytes> {
        let Some((timestamp, payload)) = unstamp(&frame.payload) else {
            tracing::debug!("Unstamped datagram from connection {} dropped", self.id);
            return None;
        };

        if !self.guard.accept(frame.key, timestamp) {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                "Stale datagram on key {} from connection {} dropped (ts {})",
                frame.key,
                self.id,
                timestamp
            );
            return None;
        }

        self.counters.received.fetch_add(1, Ordering::Relaxed);
        Some(payload)
    }

    /// Mark the UDP endpoint as bound. Returns `true` the first time.
    pub fn mark_associated(&self) -> bool {
        self.associated.send_if_modified(|associated| {
            let changed = !*associated;
            *associated = true;
            changed
        })
    }

    pub fn is_associated(&self) -> bool {
        *self.associated.borrow()
    }

    /// Wait until the UDP endpoint is bound
    pub async fn associated(&self) {
        let _ = self.associated.subscribe().wait_for(|a| *a).await;
    }

    /// Close the connection. Only the first call returns `true`.
    ///
    /// The caller that gets `true` owns the disconnect notification.
    pub fn close(&self, reason: DisconnectReason) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.tcp.close(reason);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tcp.is_closed()
    }

    /// Wait until the reliable channel closes
    pub async fn closed(&self) -> DisconnectReason {
        self.tcp.closed().await
    }
}

impl Registered for Connection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::pack;
    use tokio::net::{TcpListener, TcpStream};

    async fn connection() -> (Connection, UdpChannel, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let peer_udp = UdpChannel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let local_udp = UdpChannel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (tcp, _reader) = TcpChannel::open(accepted.unwrap().0, 1024).unwrap();

        let conn = Connection::new(
            1,
            peer_udp.local_addr().unwrap(),
            tcp,
            local_udp,
            Arc::new(EncoderRegistry::default()),
        );
        (conn, peer_udp, client.unwrap())
    }

    #[tokio::test]
    async fn test_reserved_keys_rejected() {
        let (conn, _udp, _stream) = connection().await;
        assert!(matches!(
            conn.send(ASSOCIATION_KEY, &1u8, Delivery::Reliable),
            Err(ConnectionError::ReservedKey(0))
        ));
        assert!(matches!(
            conn.send(PING_KEY, &1u8, Delivery::Unreliable),
            Err(ConnectionError::ReservedKey(-1))
        ));
    }

    #[tokio::test]
    async fn test_unregistered_type_is_codec_error() {
        struct Unknown;
        let (conn, _udp, _stream) = connection().await;
        assert!(matches!(
            conn.send(5, &Unknown, Delivery::Reliable),
            Err(ConnectionError::Codec(CodecError::UnknownType(_)))
        ));
    }

    #[tokio::test]
    async fn test_unreliable_guarding() {
        let (conn, _udp, _stream) = connection().await;

        let frame = |ts: u16| {
            let datagram = pack(7, &stamp(ts, b"v"));
            crate::protocol::unpack(&datagram).unwrap()
        };

        assert_eq!(conn.accept_unreliable(&frame(10)).as_deref(), Some(&b"v"[..]));
        assert!(conn.accept_unreliable(&frame(9)).is_none());
        assert!(conn.accept_unreliable(&frame(11)).is_some());
        assert!(conn
            .accept_unreliable(&Frame::new(7, Bytes::from_static(&[1])))
            .is_none());
        assert_eq!(conn.stats().messages_received, 2);
        assert_eq!(conn.stats().packets_discarded, 1);
    }

    #[tokio::test]
    async fn test_close_once() {
        let (conn, _udp, _stream) = connection().await;
        assert!(conn.mark_associated());
        assert!(!conn.mark_associated());
        assert!(conn.is_associated());

        assert!(conn.close(DisconnectReason::Evicted));
        assert!(!conn.close(DisconnectReason::LocalClose));
        assert!(conn.is_closed());
        assert_eq!(conn.closed().await, DisconnectReason::Evicted);
        assert!(matches!(
            conn.send(5, &1u8, Delivery::Reliable),
            Err(ConnectionError::Closed(DisconnectReason::Evicted))
        ));
    }

    #[tokio::test]
    async fn test_unreliable_send_is_stamped() {
        let (conn, peer_udp, _stream) = connection().await;
        conn.send(4, &7u32, Delivery::Unreliable).unwrap();
        conn.send(4, &8u32, Delivery::Unreliable).unwrap();

        let mut received = Vec::new();
        for _ in 0..2 {
            let mut buf = [0u8; 64];
            let (len, _) = tokio::time::timeout(
                Duration::from_secs(2),
                peer_udp.socket_for_tests().recv_from(&mut buf),
            )
            .await
            .expect("datagram never arrived")
            .unwrap();
            let frame = crate::protocol::unpack(&buf[..len]).unwrap();
            assert_eq!(frame.key, 4);
            let (ts, value) = unstamp(&frame.payload).unwrap();
            received.push((ts, value));
        }
        received.sort_by_key(|(ts, _)| *ts);

        assert_eq!(received[0].0, 1);
        assert_eq!(&received[0].1[..], &7u32.to_le_bytes());
        assert_eq!(received[1].0, 2);
        assert_eq!(&received[1].1[..], &8u32.to_le_bytes());
    }
}
