//! The serial multiplexing transport: per-link I/O engines, the channel
//! multiplexer, virtual channels, and the control-channel RPC that
//! establishes them.
//!
//! Wire framing and the typed payload map live in [`sertun_proto`]; this
//! crate adds everything that only exists once bytes are actually flowing
//! over a device: task lifecycles, backpressure, channel bookkeeping, and
//! RPC correlation.

pub mod channel;
pub mod config;
pub mod connect_handler;
pub mod error;
pub mod multiplexer;
pub mod port_engine;

pub use channel::VirtualChannel;
pub use config::{MultiplexerConfig, PortEngineConfig};
pub use connect_handler::{ConnectHandler, RejectingConnectHandler};
pub use error::{CoreError, Result};
pub use multiplexer::Multiplexer;
pub use port_engine::PortEngine;
