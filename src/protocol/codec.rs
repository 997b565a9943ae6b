//! Binary codec for typed payloads
//!
//! Values are turned into payload bytes through an [`EncoderRegistry`] keyed
//! by the Rust type of the value. Primitives, strings and geometry types use
//! hand-written little-endian encoders from [`WireEncode`]; composite records
//! and collections are registered structurally and go through serde+bincode.
//!
//! The registry is assembled once through [`EncoderRegistryBuilder`] and is
//! read-only afterwards, so encode/decode never take a lock.

use bincode::Options;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use super::{Rect, Vec2, Vec3, DEFAULT_MAX_FRAME_SIZE};

/// Errors raised while decoding a payload
///
/// A decode error means "drop this packet"; it is never fatal to a connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("Invalid bool byte: {0:#04x}")]
    InvalidBool(u8),

    #[error("Invalid option tag: {0:#04x}")]
    InvalidTag(u8),

    #[error("Invalid UTF-8 in string")]
    InvalidUtf8,

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("Type not registered: {0}")]
    UnknownType(&'static str),

    #[error("Structural decode failed: {0}")]
    Structural(String),
}

/// Errors raised while encoding a value
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Type not registered: {0}")]
    UnknownType(&'static str),

    #[error("Structural encode failed: {0}")]
    Structural(#[from] bincode::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Compact hand-written binary encoding
pub trait WireEncode: Sized {
    /// Append the encoded value to `buf`
    fn encode(&self, buf: &mut BytesMut);

    /// Read one value from the front of `buf`, advancing it
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError>;
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), DecodeError> {
    if buf.len() < needed {
        return Err(DecodeError::UnexpectedEof {
            needed,
            remaining: buf.len(),
        });
    }
    Ok(())
}

/// Decode a value that must occupy the whole buffer
pub fn decode_exact<T: WireEncode>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut buf = bytes;
    let value = T::decode(&mut buf)?;
    if !buf.is_empty() {
        return Err(DecodeError::TrailingBytes(buf.len()));
    }
    Ok(value)
}

/// Encode a single value into a fresh buffer
pub fn encode_to_bytes<T: WireEncode>(value: &T) -> Bytes {
    let mut buf = BytesMut::new();
    value.encode(&mut buf);
    buf.freeze()
}

macro_rules! impl_wire_number {
    ($($ty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl WireEncode for $ty {
                fn encode(&self, buf: &mut BytesMut) {
                    buf.$put(*self);
                }

                fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
                    ensure(buf, std::mem::size_of::<$ty>())?;
                    Ok(buf.$get())
                }
            }
        )*
    };
}

impl_wire_number! {
    u8 => put_u8, get_u8;
    i8 => put_i8, get_i8;
    u16 => put_u16_le, get_u16_le;
    i16 => put_i16_le, get_i16_le;
    u32 => put_u32_le, get_u32_le;
    i32 => put_i32_le, get_i32_le;
    u64 => put_u64_le, get_u64_le;
    i64 => put_i64_le, get_i64_le;
    f32 => put_f32_le, get_f32_le;
    f64 => put_f64_le, get_f64_le;
}

impl WireEncode for bool {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::decode(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidBool(other)),
        }
    }
}

fn decode_len(buf: &mut &[u8]) -> Result<usize, DecodeError> {
    Ok(u32::decode(buf)? as usize)
}

impl WireEncode for String {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len() as u32);
        buf.put_slice(self.as_bytes());
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = decode_len(buf)?;
        ensure(buf, len)?;
        let slice: &[u8] = *buf;
        let (raw, rest) = slice.split_at(len);
        let value = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
        *buf = rest;
        Ok(value.to_owned())
    }
}

impl WireEncode for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len() as u32);
        buf.put_slice(self);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = decode_len(buf)?;
        ensure(buf, len)?;
        Ok(buf.copy_to_bytes(len))
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len() as u32);
        for item in self {
            item.encode(buf);
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let count = decode_len(buf)?;
        // Every element takes at least one byte, cap the allocation accordingly
        let mut items = Vec::with_capacity(count.min(buf.len()));
        for _ in 0..count {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }
}

impl<T: WireEncode> WireEncode for Option<T> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Some(value) => {
                buf.put_u8(1);
                value.encode(buf);
            }
            None => buf.put_u8(0),
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::decode(buf)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(buf)?)),
            other => Err(DecodeError::InvalidTag(other)),
        }
    }
}

impl<A: WireEncode, B: WireEncode> WireEncode for (A, B) {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf);
        self.1.encode(buf);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok((A::decode(buf)?, B::decode(buf)?))
    }
}

fn structural_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(DEFAULT_MAX_FRAME_SIZE as u64)
        .reject_trailing_bytes()
}

type EncodeFn = fn(&dyn Any, &mut BytesMut) -> CodecResult<()>;
type DecodeFn = fn(&[u8]) -> Result<Box<dyn Any + Send>, DecodeError>;

/// How a registered type is laid out on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingKind {
    /// Hand-written [`WireEncode`] layout
    Wire,
    /// Field-by-field serde layout
    Structural,
}

#[derive(Clone, Copy)]
struct Entry {
    name: &'static str,
    kind: EncodingKind,
    encode: EncodeFn,
    decode: DecodeFn,
}

fn encode_wire<T: WireEncode + 'static>(value: &dyn Any, buf: &mut BytesMut) -> CodecResult<()> {
    let value = value
        .downcast_ref::<T>()
        .ok_or(CodecError::UnknownType(type_name::<T>()))?;
    value.encode(buf);
    Ok(())
}

fn decode_wire<T: WireEncode + Send + 'static>(
    bytes: &[u8],
) -> Result<Box<dyn Any + Send>, DecodeError> {
    let value: T = decode_exact(bytes)?;
    Ok(Box::new(value))
}

fn encode_structural<T: Serialize + 'static>(
    value: &dyn Any,
    buf: &mut BytesMut,
) -> CodecResult<()> {
    let value = value
        .downcast_ref::<T>()
        .ok_or(CodecError::UnknownType(type_name::<T>()))?;
    let encoded = structural_options().serialize(value)?;
    buf.put_slice(&encoded);
    Ok(())
}

fn decode_structural<T: DeserializeOwned + Send + 'static>(
    bytes: &[u8],
) -> Result<Box<dyn Any + Send>, DecodeError> {
    let value: T = structural_options()
        .deserialize(bytes)
        .map_err(|e| DecodeError::Structural(e.to_string()))?;
    Ok(Box::new(value))
}

/// Builds an [`EncoderRegistry`]; the only place registration is allowed
#[derive(Default)]
pub struct EncoderRegistryBuilder {
    entries: HashMap<TypeId, Entry>,
}

impl EncoderRegistryBuilder {
    /// An empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// A builder pre-populated with primitives, strings and geometry types
    pub fn with_defaults() -> Self {
        Self::new()
            .register::<bool>()
            .register::<u8>()
            .register::<i8>()
            .register::<u16>()
            .register::<i16>()
            .register::<u32>()
            .register::<i32>()
            .register::<u64>()
            .register::<i64>()
            .register::<f32>()
            .register::<f64>()
            .register::<String>()
            .register::<Bytes>()
            .register::<Vec<u8>>()
            .register::<Vec<String>>()
            .register::<Vec2>()
            .register::<Vec3>()
            .register::<Rect>()
    }

    /// Register a type with a hand-written encoder
    pub fn register<T: WireEncode + Send + 'static>(self) -> Self {
        self.insert::<T>(Entry {
            name: type_name::<T>(),
            kind: EncodingKind::Wire,
            encode: encode_wire::<T>,
            decode: decode_wire::<T>,
        })
    }

    /// Register a composite type encoded field-by-field through serde
    pub fn register_structural<T: Serialize + DeserializeOwned + Send + 'static>(self) -> Self {
        self.insert::<T>(Entry {
            name: type_name::<T>(),
            kind: EncodingKind::Structural,
            encode: encode_structural::<T>,
            decode: decode_structural::<T>,
        })
    }

    fn insert<T: 'static>(mut self, entry: Entry) -> Self {
        if self.entries.insert(TypeId::of::<T>(), entry).is_some() {
            tracing::debug!("Replaced encoder for {}", entry.name);
        }
        self
    }

    /// Freeze the registry
    pub fn build(self) -> EncoderRegistry {
        EncoderRegistry {
            entries: self.entries,
        }
    }
}

/// Immutable mapping from Rust type to encode/decode functions
pub struct EncoderRegistry {
    entries: HashMap<TypeId, Entry>,
}

impl Default for EncoderRegistry {
    fn default() -> Self {
        EncoderRegistryBuilder::with_defaults().build()
    }
}

impl fmt::Debug for EncoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.values().map(|e| e.name).collect();
        names.sort_unstable();
        f.debug_struct("EncoderRegistry").field("types", &names).finish()
    }
}

impl EncoderRegistry {
    /// Start building a registry with the default encoders
    pub fn builder() -> EncoderRegistryBuilder {
        EncoderRegistryBuilder::with_defaults()
    }

    /// Encode a value into a payload
    pub fn encode<T: 'static>(&self, value: &T) -> CodecResult<Bytes> {
        let mut buf = BytesMut::new();
        self.encode_into(value, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Encode a value, appending to an existing buffer
    pub fn encode_into<T: 'static>(&self, value: &T, buf: &mut BytesMut) -> CodecResult<()> {
        let entry = self
            .entries
            .get(&TypeId::of::<T>())
            .ok_or(CodecError::UnknownType(type_name::<T>()))?;
        (entry.encode)(value, buf)
    }

    /// Decode a payload into a value of type `T`
    pub fn decode<T: 'static>(&self, bytes: &[u8]) -> Result<T, DecodeError> {
        let entry = self
            .entries
            .get(&TypeId::of::<T>())
            .ok_or(DecodeError::UnknownType(type_name::<T>()))?;
        let value = (entry.decode)(bytes)?;
        value
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| DecodeError::UnknownType(type_name::<T>()))
    }

    /// Whether `T` has an encoder
    pub fn contains<T: 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    /// How `T` is encoded, if registered
    pub fn kind_of<T: 'static>(&self) -> Option<EncodingKind> {
        self.entries.get(&TypeId::of::<T>()).map(|e| e.kind)
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PlayerState {
        name: String,
        position: Vec3,
        inventory: Vec<u32>,
        stats: BTreeMap<String, i64>,
        title: Option<String>,
    }

    fn registry() -> EncoderRegistry {
        EncoderRegistry::builder()
            .register::<Option<u32>>()
            .register::<(u16, String)>()
            .register_structural::<PlayerState>()
            .build()
    }

    fn roundtrip<T: PartialEq + fmt::Debug + 'static>(registry: &EncoderRegistry, value: T) {
        let bytes = registry.encode(&value).unwrap();
        let decoded: T = registry.decode(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_primitive_roundtrip() {
        let registry = registry();
        roundtrip(&registry, true);
        roundtrip(&registry, -17i8);
        roundtrip(&registry, u16::MAX);
        roundtrip(&registry, i32::MIN);
        roundtrip(&registry, u64::MAX - 1);
        roundtrip(&registry, 1.5f32);
        roundtrip(&registry, -0.25f64);
        roundtrip(&registry, "héllo".to_string());
        roundtrip(&registry, String::new());
        roundtrip(&registry, vec![1u8, 2, 3]);
        roundtrip(&registry, Bytes::from_static(b"raw"));
    }

    #[test]
    fn test_composite_roundtrip() {
        let registry = registry();
        roundtrip(&registry, Vec2::new(1.0, -2.0));
        roundtrip(&registry, Rect::new(0.0, 0.0, 640.0, 480.0));
        roundtrip(&registry, Some(7u32));
        roundtrip(&registry, None::<u32>);
        roundtrip(&registry, (9u16, "nine".to_string()));
        roundtrip(&registry, vec!["a".to_string(), "bc".to_string()]);

        let mut stats = BTreeMap::new();
        stats.insert("kills".to_string(), 12);
        stats.insert("deaths".to_string(), -1);
        roundtrip(
            &registry,
            PlayerState {
                name: "ada".to_string(),
                position: Vec3::new(1.0, 2.0, 3.0),
                inventory: vec![4, 8, 15],
                stats,
                title: None,
            },
        );
    }

    #[test]
    fn test_compact_layout() {
        let registry = registry();
        assert_eq!(&registry.encode(&true).unwrap()[..], &[1]);
        assert_eq!(&registry.encode(&1u32).unwrap()[..], &[1, 0, 0, 0]);
        assert_eq!(registry.encode(&Vec3::ZERO).unwrap().len(), 12);
        assert_eq!(registry.kind_of::<Vec3>(), Some(EncodingKind::Wire));
        assert_eq!(
            registry.kind_of::<PlayerState>(),
            Some(EncodingKind::Structural)
        );
    }

    #[test]
    fn test_unknown_type() {
        let registry = EncoderRegistryBuilder::new().build();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.encode(&1u8),
            Err(CodecError::UnknownType(_))
        ));
        assert!(matches!(
            registry.decode::<u8>(&[1]),
            Err(DecodeError::UnknownType(_))
        ));
    }

    #[test]
    fn test_malformed_input() {
        let registry = registry();
        assert!(matches!(
            registry.decode::<u32>(&[1, 2]),
            Err(DecodeError::UnexpectedEof { needed: 4, remaining: 2 })
        ));
        assert_eq!(
            registry.decode::<u8>(&[1, 2]),
            Err(DecodeError::TrailingBytes(1))
        );
        assert_eq!(registry.decode::<bool>(&[2]), Err(DecodeError::InvalidBool(2)));
        assert_eq!(
            registry.decode::<String>(&[2, 0, 0, 0, 0xff, 0xfe]),
            Err(DecodeError::InvalidUtf8)
        );
        assert!(registry.decode::<Vec<u8>>(&[0xff, 0xff, 0xff, 0xff]).is_err());
        assert!(matches!(
            registry.decode::<PlayerState>(&[1, 2, 3]),
            Err(DecodeError::Structural(_))
        ));
    }
}
