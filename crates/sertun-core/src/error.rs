//! Error types for the transport core: port engines, the multiplexer, and
//! virtual channels.
//!
//! Framing and payload-map errors live in [`sertun_proto::ProtocolError`];
//! this layer wraps those plus the failure modes that only exist once bytes
//! are actually flowing over a device.

use thiserror::Error;

/// Result alias used throughout `sertun-core`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the port engine, multiplexer, or a virtual channel.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A read or write was attempted on a channel that has already closed.
    #[error("channel {cid} is closed")]
    Closed {
        /// The channel id that was closed.
        cid: i64,
    },

    /// The physical serial device failed in a way the reader/sender loop
    /// could not recover from.
    #[error("transport error: {0}")]
    Transport(String),

    /// A control-channel RPC's pending-reply slot was dropped or cancelled
    /// before a callback arrived.
    #[error("RPC cancelled before a reply arrived")]
    RpcCancelled,

    /// The peer's callback reported a failure for an RPC (e.g. channel
    /// allocation failed, or the outbound TCP dial failed).
    #[error("RPC failed: {0}")]
    RpcFailed(String),

    /// No port engine is registered on this multiplexer.
    #[error("no port engines available")]
    NoPortsAvailable,

    /// A framing or payload-map error surfaced while building or parsing a
    /// control message.
    #[error(transparent)]
    Protocol(#[from] sertun_proto::ProtocolError),
}
