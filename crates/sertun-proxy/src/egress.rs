//! The egress connect handler: dials real TCP destinations on behalf of
//! `Connect` RPCs serviced by this side's multiplexer (`§4.8`).

use std::time::Duration;

use async_trait::async_trait;
use sertun_core::{ConnectHandler, VirtualChannel};
use tokio::{
    io::{self, AsyncWriteExt},
    net::TcpStream,
    time,
};
use tracing::{info, warn};

/// Dials `host:port` and pipes bytes between the resulting socket and the
/// virtual channel until either side reaches EOF.
#[derive(Debug, Clone, Copy)]
pub struct TcpEgress {
    connect_timeout: Duration,
}

impl TcpEgress {
    /// Builds an egress handler whose dial is bounded by `connect_timeout`,
    /// so a single hung dial cannot wedge the control responder.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ConnectHandler for TcpEgress {
    async fn connect(&self, mut channel: VirtualChannel, host: String, port: u16) {
        let cid = channel.cid();
        let mut socket = match time::timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                warn!(cid, host = %host, port, error = %e, "dial failed");
                let _ = channel.shutdown().await;
                return;
            },
            Err(_) => {
                warn!(cid, host = %host, port, "dial timed out");
                let _ = channel.shutdown().await;
                return;
            },
        };

        info!(cid, host = %host, port, "dialed, piping bytes");
        if let Err(e) = io::copy_bidirectional(&mut socket, &mut channel).await {
            warn!(cid, error = %e, "egress pipe ended with an error");
        }
        let _ = channel.shutdown().await;
    }
}
