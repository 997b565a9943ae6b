//! Network module - Hybrid TCP/UDP transport between a host and its peers
//!
//! Provides:
//! - Host for admitting peers and routing their traffic
//! - Client for talking to exactly one host
//! - Reliable (TCP) and unreliable (UDP) channels
//! - Connection registry and per-key ordering guard

mod client;
mod connection;
mod guard;
mod handshake;
mod host;
mod registry;
mod tcp;
mod udp;


pub use client::*;
pub use connection::*;
pub use guard::*;
pub use handshake::*;
pub use host::*;
pub use registry::*;
pub use tcp::*;
pub use udp::*;

use std::net::SocketAddr;
use thiserror::Error;

/// Host-assigned identity of a connection
pub type ConnectionId = u32;

/// Which transport a message travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// Ordered, reliable stream (TCP)
    Reliable,
    /// Datagram with stale/duplicate rejection (UDP)
    Unreliable,
}

/// Why a connection ended
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    #[error("Connection closed by peer")]
    PeerClosed,

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Closed locally")]
    LocalClose,

    #[error("Replaced by a newer connection on the same endpoint")]
    Evicted,

    #[error("Refused: host is full")]
    Refused,

    #[error("Host shutting down")]
    HostShutdown,
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
