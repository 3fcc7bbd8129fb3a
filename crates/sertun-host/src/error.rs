//! Top-level error type for the `sertun-host` binary.

use thiserror::Error;

/// Errors that can abort the `sertun-host` process before it reaches its
/// accept loops. Per-connection failures never propagate here: a front-end
/// collaborator reports them by closing the offending socket, not by
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

    /// A local TCP listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address passed on the command line.
        addr: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}
