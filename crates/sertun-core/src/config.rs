//! Tunable constants for the port engine and multiplexer, plain structs
//! constructed by the binary crates from parsed CLI flags.

use std::time::Duration;

/// Configuration for a single [`crate::port_engine::PortEngine`].
#[derive(Debug, Clone)]
pub struct PortEngineConfig {
    /// Maximum bytes read from the device per ingress pass.
    pub scratch_size: usize,
    /// How long the ingress reader waits before polling again when the
    /// device reported no bytes available.
    pub ingress_idle_wait: Duration,
    /// Backoff before retrying after a transient device I/O error.
    pub transient_retry_wait: Duration,
    /// Capacity of the outbound data queue. This is the value
    /// `back_pressure()` is measured against, and the bound that makes
    /// [`crate::channel::VirtualChannel::write`] apply backpressure.
    pub data_queue_capacity: usize,
}

impl Default for PortEngineConfig {
    fn default() -> Self {
        Self {
            scratch_size: 4096,
            ingress_idle_wait: Duration::from_millis(1),
            transient_retry_wait: Duration::from_millis(50),
            data_queue_capacity: 256,
        }
    }
}

/// Configuration for a [`crate::multiplexer::Multiplexer`].
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Timeout the proxy side applies to its outbound TCP dial on a
    /// `Connect` RPC, so one hung dial cannot wedge the control responder.
    pub connect_timeout: Duration,
    /// Capacity of each virtual channel's inbound delivery queue.
    pub channel_inbound_capacity: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(10), channel_inbound_capacity: 64 }
    }
}
