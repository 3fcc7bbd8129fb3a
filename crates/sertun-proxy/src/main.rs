//! Egress side of the serial tunnel: services Establish/Connect RPCs and
//! dials real TCP destinations on behalf of a `sertun-host` peer.

use clap::Parser;
use sertun_proxy::{run, ProxyConfig, RunError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "sertun-proxy", about = "Egress side of a serial tunnel")]
struct Args {
    /// Path to the serial device, e.g. /dev/ttyUSB0.
    #[arg(long)]
    serial: String,

    /// Baud rate to open the serial device at.
    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Log level, used when `RUST_LOG` is unset.
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), RunError> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    run(ProxyConfig { serial_path: args.serial, baud_rate: args.baud }).await
}
