//! Top-level error type for the `sertun-proxy` binary.

use thiserror::Error;

/// Errors that can abort the `sertun-proxy` process before it reaches its
/// serving loop. Per-connection failures never propagate here: the egress
/// collaborator reports them by closing the offending channel, not by
/// returning an error up to `main`.
#[derive(Debug, Error)]
pub enum RunError {
    /// The serial device could not be opened.
    #[error("failed to open serial device {path}: {source}")]
    SerialOpen {
        /// Path passed on the command line.
        path: String,
        /// Underlying I/O failure.
        #[source]
        source: tokio_serial::Error,
    },
}
