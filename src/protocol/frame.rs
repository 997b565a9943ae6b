//! Packet framing
//!
//! Wraps a message key and payload into wire frames and parses them back.
//! Parsing never errors: a buffer too short to hold a header is a normal
//! condition at stream boundaries and simply yields `None`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::MessageKey;

/// Size of the length prefix on the stream transport
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the message key
pub const KEY_SIZE: usize = 2;

/// Size of the timestamp carried by unreliable payloads
pub const TIMESTAMP_SIZE: usize = 2;

/// Per-key counter stamped on unreliable packets
pub type Timestamp = u16;

/// A parsed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message key
    pub key: MessageKey,
    /// Encoded payload
    pub payload: Bytes,
}

impl Frame {
    pub fn new(key: MessageKey, payload: impl Into<Bytes>) -> Self {
        Self {
            key,
            payload: payload.into(),
        }
    }
}

/// Build a datagram frame: `[key][payload]`
pub fn pack(key: MessageKey, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(KEY_SIZE + payload.len());
    buf.put_i16_le(key);
    buf.put_slice(payload);
    buf.freeze()
}

/// Build a stream frame: `[length][key][payload]`
pub fn pack_stream(key: MessageKey, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + KEY_SIZE + payload.len());
    buf.put_u32_le((KEY_SIZE + payload.len()) as u32);
    buf.put_i16_le(key);
    buf.put_slice(payload);
    buf.freeze()
}

/// Parse a frame body (without length prefix)
pub fn unpack(frame: &[u8]) -> Option<Frame> {
    if frame.len() < KEY_SIZE {
        return None;
    }

    let mut buf = frame;
    let key = buf.get_i16_le();
    Some(Frame::new(key, Bytes::copy_from_slice(buf)))
}

/// Prefix an unreliable payload with its timestamp
pub fn stamp(timestamp: Timestamp, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(TIMESTAMP_SIZE + payload.len());
    buf.put_u16_le(timestamp);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a stamped payload into timestamp and value bytes
pub fn unstamp(payload: &Bytes) -> Option<(Timestamp, Bytes)> {
    if payload.len() < TIMESTAMP_SIZE {
        return None;
    }

    let timestamp = u16::from_le_bytes([payload[0], payload[1]]);
    Some((timestamp, payload.slice(TIMESTAMP_SIZE..)))
}

/// Prefix a raw handshake payload with its length: `[length][payload]`
pub fn length_prefixed(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}
