//! The collaborator contract a binary crate implements to service inbound
//! `Connect` RPCs.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::channel::VirtualChannel;

/// Dials a real destination on behalf of a freshly established virtual
/// channel and shuttles bytes until either side reaches EOF.
///
/// Implementations own all error handling: the control RPC has already been
/// acknowledged by the time this is invoked, so a dial or I/O failure must be
/// reported by closing `channel`, not by returning an error here.
#[async_trait]
pub trait ConnectHandler: Send + Sync {
    /// Services one `Connect` request for `host:port`.
    async fn connect(&self, channel: VirtualChannel, host: String, port: u16);
}

/// A [`ConnectHandler`] that closes every channel handed to it immediately.
///
/// The host side of this system only ever originates `Connect` RPCs; it
/// never expects to service one, but [`crate::multiplexer::Multiplexer`]
/// still requires a handler to satisfy its contract symmetrically. A peer
/// that nonetheless sends one gets a clean, immediate close rather than a
/// channel that hangs open with no consumer.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectingConnectHandler;

#[async_trait]
impl ConnectHandler for RejectingConnectHandler {
    async fn connect(&self, mut channel: VirtualChannel, host: String, port: u16) {
        warn!(host, port, "rejecting unexpected inbound Connect request");
        if let Err(e) = channel.shutdown().await {
            warn!(error = %e, "failed to close rejected channel");
        }
    }
}
