//! Admission handshake
//!
//! Client → host: `[len=4][u32 udp port]`
//! Host → client: `[len=1][bool true]`, then `[len=4][u32 connection id]`
//!
//! A first packet of `[len=2][key -1]` is a liveness probe instead: the host
//! answers `[len][ping buffer]` and closes without admitting anyone.
//!
//! Host side, a [`HostHandshake`] walks one accepted socket through
//! `AwaitingLengthPrefix → AwaitingAssociationPacket → Validated →
//! Established → Closed`. Any failure before `Established` drops the socket
//! without a connection ever existing.

use bytes::Bytes;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{read_prefixed, ChannelError, ConnectionId, TcpChannel, TcpReader};
use crate::protocol::{
    decode_exact, encode_to_bytes, length_prefixed, DecodeError, MessageKey, KEY_SIZE,
    LENGTH_PREFIX_SIZE, PING_KEY,
};

/// Upper bound on any handshake packet
pub const MAX_HANDSHAKE_PACKET: usize = 64;

/// Handshake errors
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Connection closed during handshake")]
    ConnectionClosed,

    #[error("Handshake timed out")]
    Timeout,

    #[error("Invalid handshake packet length: {0}")]
    InvalidLength(usize),

    #[error("Invalid UDP port: {0}")]
    InvalidPort(u32),

    #[error("Connection rejected by host")]
    Rejected,
}

pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Run a handshake step with a deadline
pub async fn with_timeout<T, F>(duration: Duration, step: F) -> HandshakeResult<T>
where
    F: Future<Output = HandshakeResult<T>>,
{
    tokio::time::timeout(duration, step)
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

/// Host-side handshake states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingLengthPrefix,
    AwaitingAssociationPacket,
    Validated,
    Established,
    Closed,
}

/// What the peer asked for with its first packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opening {
    /// Become a connection; the peer's UDP socket listens on `udp_port`
    Associate { udp_port: u16 },
    /// Liveness probe
    Ping,
}

fn map_eof(e: io::Error) -> HandshakeError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        HandshakeError::ConnectionClosed
    } else {
        HandshakeError::Io(e)
    }
}

/// Parse the body of the first packet
pub fn parse_opening(body: &[u8]) -> HandshakeResult<Opening> {
    if body.len() == KEY_SIZE && MessageKey::from_le_bytes([body[0], body[1]]) == PING_KEY {
        return Ok(Opening::Ping);
    }

    let port: u32 = decode_exact(body)?;
    match u16::try_from(port) {
        Ok(udp_port) if udp_port != 0 => Ok(Opening::Associate { udp_port }),
        _ => Err(HandshakeError::InvalidPort(port)),
    }
}

/// Host side of the handshake for one accepted socket
#[derive(Debug)]
pub struct HostHandshake {
    stream: Option<TcpStream>,
    peer_addr: SocketAddr,
    state: HandshakeState,
}

impl HostHandshake {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            stream: Some(stream),
            peer_addr,
            state: HandshakeState::AwaitingLengthPrefix,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn transition(&mut self, next: HandshakeState) {
        tracing::trace!("Handshake {}: {:?} -> {:?}", self.peer_addr, self.state, next);
        self.state = next;
    }

    fn stream(&mut self) -> HandshakeResult<&mut TcpStream> {
        self.stream.as_mut().ok_or(HandshakeError::ConnectionClosed)
    }

    /// Abort: drop the socket and move to `Closed`
    pub fn close(&mut self) {
        self.stream = None;
        self.transition(HandshakeState::Closed);
    }

    fn fail<T>(&mut self, error: HandshakeError) -> HandshakeResult<T> {
        self.close();
        Err(error)
    }

    /// Read and validate the first packet
    pub async fn read_opening(&mut self) -> HandshakeResult<Opening> {
        match self.read_opening_inner().await {
            Ok(opening) => {
                self.transition(HandshakeState::Validated);
                Ok(opening)
            }
            Err(e) => self.fail(e),
        }
    }

    async fn read_opening_inner(&mut self) -> HandshakeResult<Opening> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        self.stream()?
            .read_exact(&mut prefix)
            .await
            .map_err(map_eof)?;

        let len = u32::from_le_bytes(prefix) as usize;
        if len > MAX_HANDSHAKE_PACKET {
            return Err(HandshakeError::InvalidLength(len));
        }
        self.transition(HandshakeState::AwaitingAssociationPacket);

        let mut body = vec![0u8; len];
        self.stream()?.read_exact(&mut body).await.map_err(map_eof)?;

        parse_opening(&body)
    }

    /// Answer a liveness probe and close
    pub async fn answer_ping(&mut self, buffer: &[u8]) -> HandshakeResult<()> {
        let result: HandshakeResult<()> = async {
            let stream = self.stream()?;
            stream.write_all(&length_prefixed(buffer)).await?;
            stream.shutdown().await?;
            Ok(())
        }
        .await;

        self.close();
        result
    }

    /// Send `true` and the allocated id
    pub async fn acknowledge(&mut self, id: ConnectionId) -> HandshakeResult<()> {
        let result: HandshakeResult<()> = async {
            let stream = self.stream()?;
            stream
                .write_all(&length_prefixed(&encode_to_bytes(&true)))
                .await?;
            stream
                .write_all(&length_prefixed(&encode_to_bytes(&id)))
                .await?;
            stream.flush().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e),
        }
    }

    /// Hand the socket over to a reliable channel
    pub fn open_channel(&mut self, max_frame_size: usize) -> HandshakeResult<(TcpChannel, TcpReader)> {
        let Some(stream) = self.stream.take() else {
            return self.fail(HandshakeError::ConnectionClosed);
        };
        match TcpChannel::open(stream, max_frame_size) {
            Ok(pair) => Ok(pair),
            Err(e) => self.fail(e.into()),
        }
    }

    /// The connection is registered
    pub fn establish(&mut self) {
        self.transition(HandshakeState::Established);
    }
}

async fn read_packet(stream: &mut TcpStream, max_len: usize) -> HandshakeResult<Vec<u8>> {
    read_prefixed(stream, max_len)
        .await?
        .ok_or(HandshakeError::ConnectionClosed)
}

/// Client side: announce the local UDP port and receive the connection id
pub async fn request_association(
    stream: &mut TcpStream,
    udp_port: u16,
) -> HandshakeResult<ConnectionId> {
    stream
        .write_all(&length_prefixed(&encode_to_bytes(&u32::from(udp_port))))
        .await?;
    stream.flush().await?;

    let accepted: bool = decode_exact(&read_packet(stream, MAX_HANDSHAKE_PACKET).await?)?;
    if !accepted {
        return Err(HandshakeError::Rejected);
    }

    let id: ConnectionId = decode_exact(&read_packet(stream, MAX_HANDSHAKE_PACKET).await?)?;
    Ok(id)
}

/// Client side: send a liveness probe and return the host's ping buffer
pub async fn request_ping(stream: &mut TcpStream, max_len: usize) -> HandshakeResult<Bytes> {
    stream
        .write_all(&length_prefixed(&PING_KEY.to_le_bytes()))
        .await?;
    stream.flush().await?;

    Ok(Bytes::from(read_packet(stream, max_len).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn accepted() -> (TcpStream, HostHandshake) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (stream, peer) = accepted.unwrap();
        (client.unwrap(), HostHandshake::new(stream, peer))
    }

    #[test]
    fn test_parse_opening() {
        assert_eq!(
            parse_opening(&5001u32.to_le_bytes()).unwrap(),
            Opening::Associate { udp_port: 5001 }
        );
        assert_eq!(parse_opening(&[0xff, 0xff]).unwrap(), Opening::Ping);
        assert!(matches!(
            parse_opening(&70_000u32.to_le_bytes()),
            Err(HandshakeError::InvalidPort(70_000))
        ));
        assert!(matches!(
            parse_opening(&0u32.to_le_bytes()),
            Err(HandshakeError::InvalidPort(0))
        ));
        assert!(matches!(
            parse_opening(&[1, 2, 3]),
            Err(HandshakeError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_association_exchange() {
        let (mut client, mut host) = accepted().await;
        assert_eq!(host.state(), HandshakeState::AwaitingLengthPrefix);

        let client_side = tokio::spawn(async move { request_association(&mut client, 5001).await });

        let opening = host.read_opening().await.unwrap();
        assert_eq!(opening, Opening::Associate { udp_port: 5001 });
        assert_eq!(host.state(), HandshakeState::Validated);

        host.acknowledge(1).await.unwrap();
        assert_eq!(client_side.await.unwrap().unwrap(), 1);

        let (_channel, _reader) = host.open_channel(1024).unwrap();
        host.establish();
        assert_eq!(host.state(), HandshakeState::Established);
    }

    #[tokio::test]
    async fn test_oversized_prefix_aborts() {
        let (mut client, mut host) = accepted().await;
        client.write_all(&1000u32.to_le_bytes()).await.unwrap();

        assert!(matches!(
            host.read_opening().await,
            Err(HandshakeError::InvalidLength(1000))
        ));
        assert_eq!(host.state(), HandshakeState::Closed);
        assert!(host.open_channel(1024).is_err());
    }

    #[tokio::test]
    async fn test_disconnect_mid_packet_aborts() {
        let (mut client, mut host) = accepted().await;
        client.write_all(&[4, 0, 0, 0, 0x89]).await.unwrap();
        drop(client);

        assert!(matches!(
            host.read_opening().await,
            Err(HandshakeError::ConnectionClosed)
        ));
        assert_eq!(host.state(), HandshakeState::Closed);
    }

    #[tokio::test]
    async fn test_acknowledge_failure_closes() {
        let (mut client, mut host) = accepted().await;
        client
            .write_all(&length_prefixed(&5001u32.to_le_bytes()))
            .await
            .unwrap();
        assert_eq!(
            host.read_opening().await.unwrap(),
            Opening::Associate { udp_port: 5001 }
        );

        // Reset the connection so the host's writes fail
        client.set_linger(Some(Duration::ZERO)).unwrap();
        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(host.acknowledge(1).await.is_err());
        assert_eq!(host.state(), HandshakeState::Closed);
        assert!(host.open_channel(1024).is_err());
    }

    #[tokio::test]
    async fn test_ping_exchange() {
        let (mut client, mut host) = accepted().await;
        let client_side = tokio::spawn(async move { request_ping(&mut client, 1024).await });

        assert_eq!(host.read_opening().await.unwrap(), Opening::Ping);
        host.answer_ping(b"pong").await.unwrap();
        assert_eq!(host.state(), HandshakeState::Closed);

        assert_eq!(&client_side.await.unwrap().unwrap()[..], b"pong");
    }

    #[tokio::test]
    async fn test_timeout() {
        let (_client, mut host) = accepted().await;
        let result = with_timeout(Duration::from_millis(20), host.read_opening()).await;
        assert!(matches!(result, Err(HandshakeError::Timeout)));
    }
}
