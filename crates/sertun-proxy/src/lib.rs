//! Runtime glue for the `sertun-proxy` binary: opens the serial link and
//! runs the Multiplexer with a [`TcpEgress`] collaborator servicing inbound
//! `Connect` RPCs.

use std::sync::Arc;

use sertun_core::{Multiplexer, MultiplexerConfig, PortEngineConfig};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

pub mod egress;
pub mod error;

pub use egress::TcpEgress;
pub use error::RunError;

/// Everything needed to start the proxy side: where the serial link is and
/// what baud rate to open it at.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Path to the serial device, e.g. `/dev/ttyUSB0`.
    pub serial_path: String,
    /// Baud rate to open the serial device at.
    pub baud_rate: u32,
}

/// Opens the serial device and brings up the Multiplexer. This future does
/// not return on success: it runs forever, servicing RPCs as they arrive.
pub async fn run(config: ProxyConfig) -> Result<(), RunError> {
    let device = open_serial(&config.serial_path, config.baud_rate)?;
    let mux_config = MultiplexerConfig::default();
    let egress = Arc::new(TcpEgress::new(mux_config.connect_timeout));

    let mux = Multiplexer::new(vec![device], PortEngineConfig::default(), mux_config, egress);
    mux.start();

    info!(serial = config.serial_path, baud = config.baud_rate, "proxy serving");
    std::future::pending::<()>().await;
    Ok(())
}

fn open_serial(path: &str, baud_rate: u32) -> Result<SerialStream, RunError> {
    tokio_serial::new(path, baud_rate)
        .open_native_async()
        .map_err(|source| RunError::SerialOpen { path: path.to_owned(), source })
}
