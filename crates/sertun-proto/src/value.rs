//! The tagged value union stored in a [`crate::payload_map::PayloadMap`].
//!
//! Modeled as a plain Rust enum over the frozen value-tag table rather than
//! a dynamic any-type: adding a variant is a compile error in every `match`
//! that isn't already exhaustive, and there is no runtime type-id machinery.

use bytes::Bytes;
use uuid::Uuid;

use crate::payload_map::PayloadMap;

/// Wire tag identifying a [`Value`] variant. Values are frozen by the
/// protocol; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueTag {
    /// Reserved; never produced by this implementation.
    Unspecified = 0,
    /// UTF-8 string, length-prefixed.
    String = 1,
    /// Single byte, 0 or 1.
    Bool = 2,
    /// Raw bytes, length-prefixed.
    ByteArray = 3,
    /// Unsigned 8-bit integer.
    U8 = 4,
    /// Signed 16-bit integer.
    I16 = 5,
    /// Unsigned 16-bit integer.
    U16 = 6,
    /// Signed 32-bit integer.
    I32 = 7,
    /// Unsigned 32-bit integer.
    U32 = 8,
    /// Signed 64-bit integer.
    I64 = 9,
    /// Unsigned 64-bit integer.
    U64 = 10,
    /// IEEE-754 single precision float.
    F32 = 11,
    /// IEEE-754 double precision float.
    F64 = 12,
    /// Opaque 16-byte fixed-point decimal.
    Decimal = 13,
    /// Nested map.
    Map = 14,
    /// 16-byte GUID.
    Guid = 15,
}

impl ValueTag {
    /// Recovers a tag from its wire byte, or `None` for an unrecognized tag.
    #[must_use]
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::Unspecified,
            1 => Self::String,
            2 => Self::Bool,
            3 => Self::ByteArray,
            4 => Self::U8,
            5 => Self::I16,
            6 => Self::U16,
            7 => Self::I32,
            8 => Self::U32,
            9 => Self::I64,
            10 => Self::U64,
            11 => Self::F32,
            12 => Self::F64,
            13 => Self::Decimal,
            14 => Self::Map,
            15 => Self::Guid,
            _ => return None,
        })
    }
}

/// Maximum byte length of a [`Value::String`] or [`Value::ByteArray`].
pub const MAX_VALUE_BYTES: usize = 4096;

/// Maximum byte length of a map key.
pub const MAX_KEY_BYTES: usize = 128;

/// A tagged value stored under a key in a [`PayloadMap`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// UTF-8 string, at most [`MAX_VALUE_BYTES`] bytes.
    String(String),
    /// Boolean.
    Bool(bool),
    /// Raw bytes, at most [`MAX_VALUE_BYTES`] bytes.
    ByteArray(Bytes),
    /// Unsigned 8-bit integer.
    U8(u8),
    /// Signed 16-bit integer.
    I16(i16),
    /// Unsigned 16-bit integer.
    U16(u16),
    /// Signed 32-bit integer.
    I32(i32),
    /// Unsigned 32-bit integer.
    U32(u32),
    /// Signed 64-bit integer.
    I64(i64),
    /// Unsigned 64-bit integer.
    U64(u64),
    /// IEEE-754 single precision float.
    F32(f32),
    /// IEEE-754 double precision float.
    F64(f64),
    /// Opaque 16-byte fixed-point decimal. This layer never performs
    /// arithmetic on it; it is transported verbatim.
    Decimal([u8; 16]),
    /// 16-byte GUID.
    Guid(Uuid),
    /// A nested map.
    Map(PayloadMap),
}

impl Value {
    /// The wire tag for this value's variant.
    #[must_use]
    pub fn tag(&self) -> ValueTag {
        match self {
            Self::String(_) => ValueTag::String,
            Self::Bool(_) => ValueTag::Bool,
            Self::ByteArray(_) => ValueTag::ByteArray,
            Self::U8(_) => ValueTag::U8,
            Self::I16(_) => ValueTag::I16,
            Self::U16(_) => ValueTag::U16,
            Self::I32(_) => ValueTag::I32,
            Self::U32(_) => ValueTag::U32,
            Self::I64(_) => ValueTag::I64,
            Self::U64(_) => ValueTag::U64,
            Self::F32(_) => ValueTag::F32,
            Self::F64(_) => ValueTag::F64,
            Self::Decimal(_) => ValueTag::Decimal,
            Self::Guid(_) => ValueTag::Guid,
            Self::Map(_) => ValueTag::Map,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Self::U8(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Guid(v)
    }
}

impl From<PayloadMap> for Value {
    fn from(v: PayloadMap) -> Self {
        Self::Map(v)
    }
}
