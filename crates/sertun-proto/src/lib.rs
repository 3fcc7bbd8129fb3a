//! Wire framing, byte-stuffing, and the typed payload map that carries
//! control-channel RPC for the serial tunnel protocol.
//!
//! This crate has no knowledge of channels, ports, or I/O — it only encodes
//! and decodes bytes. The multiplexing and transport layers live in
//! `sertun-core`.

pub mod control;
pub mod errors;
pub mod frame;
pub mod payload_map;
pub mod stuffing;
pub mod value;

pub use control::{Cmd, ControlMessage, Flag, FrontEnd, Token};
pub use errors::{ProtocolError, Result};
pub use frame::{Frame, MTU};
pub use payload_map::{MapFlags, PayloadMap};
pub use value::{Value, ValueTag};
