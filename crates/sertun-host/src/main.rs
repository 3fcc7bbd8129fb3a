//! Accepts local SOCKS5/HTTP-CONNECT clients and tunnels them over a serial
//! link to a `sertun-proxy` peer.

use clap::Parser;
use sertun_host::{run, HostConfig, RunError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "sertun-host", about = "Local SOCKS5/HTTP-CONNECT front-end for a serial tunnel")]
struct Args {
    /// Path to the serial device, e.g. /dev/ttyUSB0.
    #[arg(long)]
    serial: String,

    /// Baud rate to open the serial device at.
    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Local address the SOCKS5 front-end listens on.
    #[arg(long, default_value = "127.0.0.1:1080")]
    socks_bind: String,

    /// Local address the HTTP-CONNECT front-end listens on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    http_bind: String,

    /// Log level, used when `RUST_LOG` is unset.
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), RunError> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    run(HostConfig {
        serial_path: args.serial,
        baud_rate: args.baud,
        socks_bind: args.socks_bind,
        http_bind: args.http_bind,
    })
    .await
}
