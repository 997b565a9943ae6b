//! Unreliable datagram channel
//!
//! One socket per process side. The receive loop never stops on bad input:
//! garbage or spoofed datagrams are dropped and the loop carries on.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::protocol::{pack, unpack, Frame, MessageKey};

/// Largest datagram the receive loop accepts
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Datagram transport bound to a local port
#[derive(Debug, Clone)]
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl UdpChannel {
    /// Bind to a fixed (host) or ephemeral (client, port 0) address
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            shutdown: Arc::new(watch::channel(false).0),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Fire-and-forget send
    ///
    /// Goes out immediately when the socket is writable. Otherwise the send
    /// is finished on a spawned task once it is. Returns `false` only if the
    /// datagram was dropped.
    pub fn send(&self, endpoint: SocketAddr, key: MessageKey, payload: &[u8]) -> bool {
        let datagram = pack(key, payload);
        match self.socket.try_send_to(&datagram, endpoint) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    tracing::debug!("Datagram to {} dropped: no runtime", endpoint);
                    return false;
                };
                let socket = self.socket.clone();
                runtime.spawn(async move {
                    if let Err(e) = socket.send_to(&datagram, endpoint).await {
                        tracing::debug!("Datagram to {} dropped: {}", endpoint, e);
                    }
                });
                true
            }
            Err(e) => {
                tracing::debug!("Datagram to {} dropped: {}", endpoint, e);
                false
            }
        }
    }

    /// Send, waiting for socket readiness
    pub async fn send_to(
        &self,
        endpoint: SocketAddr,
        key: MessageKey,
        payload: &[u8],
    ) -> io::Result<()> {
        self.socket.send_to(&pack(key, payload), endpoint).await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn socket_for_tests(&self) -> &UdpSocket {
        &self.socket
    }

    /// Stop the receive loop
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Receive datagrams until closed, handing each frame and its sender to `on_frame`
    pub async fn run<F>(&self, mut on_frame: F)
    where
        F: FnMut(SocketAddr, Frame),
    {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                biased;

                _ = async { let _ = shutdown.wait_for(|closed| *closed).await; } => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => match unpack(&buf[..len]) {
                        Some(frame) => on_frame(from, frame),
                        None => tracing::debug!("Malformed datagram from {} dropped", from),
                    },
                    Err(e) => tracing::warn!("UDP receive error: {}", e),
                },
            }
        }

        tracing::debug!("UDP receive loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_datagrams_and_garbage() {
        let receiver = UdpChannel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let sender = UdpChannel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let target = receiver.local_addr().unwrap();
        let sender_addr = sender.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let loop_channel = receiver.clone();
        let task = tokio::spawn(async move {
            loop_channel
                .run(move |from, frame| {
                    let _ = tx.send((from, frame));
                })
                .await;
        });

        // A single byte cannot hold a key and must not stop the loop
        sender.socket.send_to(&[0x01], target).await.unwrap();
        sender.send_to(target, 7, b"hi").await.unwrap();

        let (from, frame) = rx.recv().await.unwrap();
        assert_eq!(from, sender_addr);
        assert_eq!(frame.key, 7);
        assert_eq!(&frame.payload[..], b"hi");

        receiver.close();
        assert!(receiver.is_closed());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_first_send_after_bind_arrives() {
        let receiver = UdpChannel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let sender = UdpChannel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        // No await between bind and send: tokio has not seen the socket writable yet
        assert!(sender.send(receiver.local_addr().unwrap(), 4, b"x"));

        let mut buf = [0u8; 16];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            receiver.socket.recv_from(&mut buf),
        )
        .await
        .expect("first datagram never arrived")
        .unwrap();
        let frame = unpack(&buf[..len]).unwrap();
        assert_eq!(frame.key, 4);
        assert_eq!(&frame.payload[..], b"x");
    }
}
