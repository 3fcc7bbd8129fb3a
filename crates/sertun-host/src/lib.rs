//! Runtime glue for the `sertun-host` binary: opens the serial link(s),
//! starts the Multiplexer, and runs the local SOCKS5/HTTP-CONNECT front-ends
//! against it.

use std::{sync::Arc, time::Duration};

use sertun_core::{Multiplexer, MultiplexerConfig, PortEngineConfig, RejectingConnectHandler};
use tokio::net::TcpListener;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

pub mod error;
pub mod http_connect;
pub mod socks5;

pub use error::RunError;

/// Upper bound on how long a front-end waits for a control-channel RPC
/// (Establish or Connect) to complete before giving up on that connection.
pub const CONTROL_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to start the host side: where the serial link is, what
/// baud rate to open it at, and where the local front-ends should listen.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Path to the serial device, e.g. `/dev/ttyUSB0`.
    pub serial_path: String,
    /// Baud rate to open the serial device at.
    pub baud_rate: u32,
    /// Local address the SOCKS5 front-end listens on.
    pub socks_bind: String,
    /// Local address the HTTP-CONNECT front-end listens on.
    pub http_bind: String,
}

/// Opens the serial device, brings up the Multiplexer, and runs both local
/// front-ends until one of the listeners fails to bind.
///
/// This future does not return on success: the front-end accept loops run
/// forever. It returns early only if a listener cannot be bound.
pub async fn run(config: HostConfig) -> Result<(), RunError> {
    let device = open_serial(&config.serial_path, config.baud_rate)?;

    let mux = Multiplexer::new(
        vec![device],
        PortEngineConfig::default(),
        MultiplexerConfig::default(),
        Arc::new(RejectingConnectHandler),
    );
    mux.start();

    let socks_listener =
        TcpListener::bind(&config.socks_bind).await.map_err(|source| RunError::Bind { addr: config.socks_bind.clone(), source })?;
    let http_listener =
        TcpListener::bind(&config.http_bind).await.map_err(|source| RunError::Bind { addr: config.http_bind.clone(), source })?;

    info!(socks_bind = config.socks_bind, http_bind = config.http_bind, "host front-ends listening");

    tokio::join!(socks5::serve(socks_listener, Arc::clone(&mux)), http_connect::serve(http_listener, mux));

    Ok(())
}

fn open_serial(path: &str, baud_rate: u32) -> Result<SerialStream, RunError> {
    tokio_serial::new(path, baud_rate)
        .open_native_async()
        .map_err(|source| RunError::SerialOpen { path: path.to_owned(), source })
}
