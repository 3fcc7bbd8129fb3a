//! Error types for wire framing and the typed payload map.
//!
//! These are parse/encode-time errors only. They never carry I/O failures —
//! transport errors belong to `sertun-core`.

use thiserror::Error;

/// Result alias used throughout the protocol crate.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while framing, stuffing, or encoding/decoding a payload map.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer ended before a frame, header, or map entry was fully read.
    #[error("truncated input: expected at least {expected} more bytes, got {actual}")]
    Truncated {
        /// Bytes still needed when truncation was detected.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// A value tag, map header, or footer did not match the wire grammar.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A key or value exceeded its fixed size limit.
    #[error("bounds exceeded: {field} is {actual} bytes, limit is {limit}")]
    BoundsExceeded {
        /// Name of the field that overflowed (e.g. "key", "string value").
        field: &'static str,
        /// Actual size in bytes.
        actual: usize,
        /// Maximum allowed size in bytes.
        limit: usize,
    },

    /// A nested map reaches back to an ancestor, forming a cycle.
    #[error("cycle detected while nesting or serializing a map")]
    CycleDetected,

    /// Mutation attempted on a map after `lock()`.
    #[error("map is read-only")]
    ReadOnlyViolation,

    /// `get::<T>()` requested a type incompatible with the stored value and
    /// no lexical coercion applied.
    #[error("type mismatch: cannot read key {key:?} as the requested type")]
    TypeMismatch {
        /// The key that was requested.
        key: String,
    },

    /// Frame payload exceeds the transport MTU.
    #[error("payload too large: {size} bytes exceeds MTU of {max} bytes")]
    PayloadTooLarge {
        /// Size of the offending payload.
        size: usize,
        /// Maximum allowed payload size (the MTU).
        max: usize,
    },
}
