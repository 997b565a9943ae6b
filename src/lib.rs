//! HybridNet - Hybrid TCP/UDP transport for real-time applications
//!
//! A host admits peers over TCP, binds each one's UDP endpoint, and carries
//! type-keyed messages on either transport: reliable and ordered over TCP,
//! or latest-wins over UDP.

pub mod config;
pub mod network;
pub mod protocol;
