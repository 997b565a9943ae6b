//! Reliable stream channel
//!
//! A [`TcpChannel`] is the send side of one TCP connection; a dedicated writer
//! task owns the socket's write half so frames leave in send order. The
//! matching [`TcpReader`] drives the read loop and reports why it ended.
//!
//! Closing is first-writer-wins: whichever of an explicit close, a read fault
//! or a write fault happens first decides the [`DisconnectReason`], and every
//! later attempt is a no-op.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

use super::DisconnectReason;
use crate::protocol::{pack_stream, unpack, Frame, MessageKey, KEY_SIZE, LENGTH_PREFIX_SIZE};

/// Channel errors
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Channel closed: {0}")]
    Closed(DisconnectReason),

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Frames that may wait for the writer before the channel counts as stalled
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

type CloseState = watch::Sender<Option<DisconnectReason>>;

fn close_state(state: &CloseState, reason: DisconnectReason) -> bool {
    state.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        true
    })
}

async fn wait_closed(state: &mut watch::Receiver<Option<DisconnectReason>>) -> DisconnectReason {
    match state.wait_for(Option::is_some).await {
        Ok(reason) => (*reason).clone().unwrap_or(DisconnectReason::LocalClose),
        Err(_) => DisconnectReason::LocalClose,
    }
}

/// Read one length-prefixed packet
///
/// Returns `Ok(None)` on a clean end of stream before the prefix.
pub async fn read_prefixed<R>(reader: &mut R, max_len: usize) -> ChannelResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(prefix) as usize;
    if len > max_len {
        return Err(ChannelError::FrameTooLarge(len, max_len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

struct Outbound {
    frame: Bytes,
    ack: Option<oneshot::Sender<io::Result<()>>>,
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Outbound>,
    state: Arc<CloseState>,
) {
    let mut closed = state.subscribe();

    loop {
        // Closing wins over queued frames and over a write in flight
        let message = tokio::select! {
            biased;

            _ = wait_closed(&mut closed) => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let result = tokio::select! {
            biased;

            _ = wait_closed(&mut closed) => break,
            result = async {
                writer.write_all(&message.frame).await?;
                writer.flush().await
            } => result,
        };

        let failure = result.as_ref().err().map(|e| e.to_string());
        if let Some(ack) = message.ack {
            let _ = ack.send(result);
        }
        if let Some(error) = failure {
            close_state(&state, DisconnectReason::WriteFailed(error));
            break;
        }
    }

    let _ = writer.shutdown().await;
}

/// Send side of a reliable channel
#[derive(Debug)]
pub struct TcpChannel {
    peer_addr: SocketAddr,
    outbound: mpsc::Sender<Outbound>,
    state: Arc<CloseState>,
    max_frame_size: usize,
}

/// Read side of a reliable channel
pub struct TcpReader {
    peer_addr: SocketAddr,
    reader: OwnedReadHalf,
    state: Arc<CloseState>,
    max_frame_size: usize,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound").field("len", &self.frame.len()).finish()
    }
}

impl TcpChannel {
    /// Split an established stream into a channel and its read loop
    ///
    /// Spawns the writer task, so this must run inside a tokio runtime.
    pub fn open(stream: TcpStream, max_frame_size: usize) -> io::Result<(TcpChannel, TcpReader)> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let state = Arc::new(watch::channel(None).0);

        tokio::spawn(write_loop(writer, outbound_rx, state.clone()));

        let channel = TcpChannel {
            peer_addr,
            outbound: outbound_tx,
            state: state.clone(),
            max_frame_size,
        };
        let reader = TcpReader {
            peer_addr,
            reader,
            state,
            max_frame_size,
        };

        Ok((channel, reader))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn check_size(&self, payload: &[u8]) -> ChannelResult<()> {
        let len = KEY_SIZE + payload.len();
        if len > self.max_frame_size {
            return Err(ChannelError::FrameTooLarge(len, self.max_frame_size));
        }
        Ok(())
    }

    fn closed_error(&self) -> ChannelError {
        ChannelError::Closed(self.closed_reason().unwrap_or(DisconnectReason::LocalClose))
    }

    /// Queue a frame without waiting
    ///
    /// Failures are not reported to the caller; they close the channel and
    /// surface through the read loop as a disconnect. A full queue means the
    /// peer stopped reading and counts as a write failure.
    pub fn send(&self, key: MessageKey, payload: &[u8]) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.check_size(payload) {
            tracing::warn!("Dropping frame to {}: {}", self.peer_addr, e);
            return;
        }

        let message = Outbound {
            frame: pack_stream(key, payload),
            ack: None,
        };
        match self.outbound.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Outbound queue to {} is full, closing", self.peer_addr);
                self.close(DisconnectReason::WriteFailed(
                    "outbound queue full".to_string(),
                ));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close(DisconnectReason::WriteFailed("writer stopped".to_string()));
            }
        }
    }

    /// Send a frame and wait until the OS has accepted the bytes
    pub async fn send_async(&self, key: MessageKey, payload: &[u8]) -> ChannelResult<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.check_size(payload)?;

        let (ack_tx, ack_rx) = oneshot::channel();
        let message = Outbound {
            frame: pack_stream(key, payload),
            ack: Some(ack_tx),
        };
        tokio::select! {
            sent = self.outbound.send(message) => sent.map_err(|_| self.closed_error())?,
            reason = self.closed() => return Err(ChannelError::Closed(reason)),
        }

        match ack_rx.await {
            Ok(result) => result.map_err(ChannelError::Io),
            Err(_) => Err(self.closed_error()),
        }
    }

    /// Close the channel. Returns `true` for the call that actually closed it.
    pub fn close(&self, reason: DisconnectReason) -> bool {
        close_state(&self.state, reason)
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub fn closed_reason(&self) -> Option<DisconnectReason> {
        self.state.borrow().clone()
    }

    /// Wait until the channel is closed
    pub async fn closed(&self) -> DisconnectReason {
        wait_closed(&mut self.state.subscribe()).await
    }
}

impl TcpReader {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Run the read loop until the channel closes, handing each frame to `on_frame`
    ///
    /// Short frames are dropped. End of stream, read faults and oversized
    /// frames close the channel. The returned reason is the one that closed
    /// the channel first.
    pub async fn run<F>(mut self, mut on_frame: F) -> DisconnectReason
    where
        F: FnMut(Frame),
    {
        let mut closed = self.state.subscribe();

        let reason = loop {
            tokio::select! {
                biased;

                reason = wait_closed(&mut closed) => break reason,
                result = read_prefixed(&mut self.reader, self.max_frame_size) => match result {
                    Ok(Some(body)) => match unpack(&body) {
                        Some(frame) => on_frame(frame),
                        None => tracing::trace!("Short frame from {} dropped", self.peer_addr),
                    },
                    Ok(None) => break DisconnectReason::PeerClosed,
                    Err(ChannelError::FrameTooLarge(len, _)) => break DisconnectReason::FrameTooLarge(len),
                    Err(e) => break DisconnectReason::ReadFailed(e.to_string()),
                },
            }
        };

        close_state(&self.state, reason.clone());
        let winner = self.state.borrow().clone();
        winner.unwrap_or(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_read_prefixed() {
        let data: Vec<u8> = vec![3, 0, 0, 0, 7, 8, 9, 2, 0, 0, 0, 1];
        let mut reader = &data[..];

        let first = read_prefixed(&mut reader, 16).await.unwrap();
        assert_eq!(first, Some(vec![7, 8, 9]));

        // Truncated body is a read error, not a clean close
        assert!(read_prefixed(&mut reader, 16).await.is_err());

        let mut empty: &[u8] = &[];
        assert!(read_prefixed(&mut empty, 16).await.unwrap().is_none());

        let mut oversized: &[u8] = &[0xff, 0, 0, 0];
        assert!(matches!(
            read_prefixed(&mut oversized, 16).await,
            Err(ChannelError::FrameTooLarge(255, 16))
        ));
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (a, b) = pair().await;
        let (sender, _sender_reader) = TcpChannel::open(a, 1024).unwrap();
        let (receiver, reader) = TcpChannel::open(b, 1024).unwrap();

        sender.send(1, b"one");
        sender.send(2, &[]);
        tokio_test::assert_ok!(sender.send_async(3, b"three").await);

        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(reader.run(move |frame| {
            let _ = frames_tx.send(frame);
        }));

        for (key, payload) in [(1, &b"one"[..]), (2, &b""[..]), (3, &b"three"[..])] {
            let frame = frames_rx.recv().await.unwrap();
            assert_eq!(frame.key, key);
            assert_eq!(&frame.payload[..], payload);
        }

        assert!(receiver.close(DisconnectReason::LocalClose));
        assert!(!receiver.close(DisconnectReason::Evicted));
        assert_eq!(task.await.unwrap(), DisconnectReason::LocalClose);
    }

    #[tokio::test]
    async fn test_peer_close_ends_read_loop() {
        let (a, b) = pair().await;
        let (sender, _sender_reader) = TcpChannel::open(a, 1024).unwrap();
        let (receiver, reader) = TcpChannel::open(b, 1024).unwrap();

        sender.close(DisconnectReason::LocalClose);

        let reason = reader.run(|_| {}).await;
        assert_eq!(reason, DisconnectReason::PeerClosed);
        assert!(receiver.is_closed());
        assert!(matches!(
            receiver.send_async(1, b"late").await,
            Err(ChannelError::Closed(DisconnectReason::PeerClosed))
        ));
    }

    #[tokio::test]
    async fn test_full_queue_closes_channel() {
        let (a, _stalled_peer) = pair().await;
        let (sender, _reader) = TcpChannel::open(a, 1024).unwrap();

        // Nothing yields in between, so the writer never gets to drain the queue
        for _ in 0..=OUTBOUND_QUEUE_CAPACITY {
            sender.send(1, &[0u8; 16]);
        }

        assert!(sender.is_closed());
        assert!(matches!(
            sender.closed_reason(),
            Some(DisconnectReason::WriteFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_close_abandons_stalled_writes() {
        use std::time::Duration;

        const FRAME: usize = 256 * 1024;
        const FRAMES: usize = 250;

        let (a, mut peer) = pair().await;
        let (sender, _reader) = TcpChannel::open(a, 2 * FRAME).unwrap();

        let payload = vec![0u8; FRAME];
        for _ in 0..FRAMES {
            sender.send(1, &payload);
        }
        assert!(!sender.is_closed());

        // Let the writer fill the socket buffers and block on the stalled peer
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sender.close(DisconnectReason::LocalClose));

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), peer.read_to_end(&mut received))
            .await
            .expect("writer kept the stream open after close")
            .unwrap();
        assert!(received.len() < FRAME * FRAMES);
    }

    #[tokio::test]
    async fn test_oversized_send_rejected() {
        let (a, _b) = pair().await;
        let (sender, _reader) = TcpChannel::open(a, 8).unwrap();
        assert!(matches!(
            sender.send_async(1, &[0u8; 32]).await,
            Err(ChannelError::FrameTooLarge(34, 8))
        ));
        assert!(!sender.is_closed());
    }
}
