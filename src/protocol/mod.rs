//! Protocol module - Defines the wire protocol shared by hosts and peers
//!
//! Stream frames are laid out as:
//! - 4 bytes length (little-endian), counting everything after it
//! - 2 bytes message key (little-endian, signed)
//! - Variable length payload
//!
//! Datagram frames drop the length prefix, one frame per datagram.

mod codec;
mod frame;
mod geometry;

pub use codec::*;
pub use frame::*;
pub use geometry::*;

/// Identifies the application-level meaning of a payload
pub type MessageKey = i16;

/// Default TCP port a host listens on
pub const DEFAULT_TCP_PORT: u16 = 5000;

/// Default UDP port a host listens on
pub const DEFAULT_UDP_PORT: u16 = 5001;

/// Reserved key for UDP association probes and their TCP acknowledgment
pub const ASSOCIATION_KEY: MessageKey = 0;

/// Reserved key that turns the first stream packet into a liveness probe
pub const PING_KEY: MessageKey = -1;

/// Payload byte a client puts in each UDP association probe
pub const PROBE_BYTE: u8 = 0;

/// Payload byte the host sends on TCP once the UDP endpoint is bound
pub const ASSOCIATION_ACK: u8 = 255;

/// Default upper bound on a single stream frame (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;
