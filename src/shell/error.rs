//! Error type for remote shell sessions.

use thiserror::Error;

/// Errors raised by [`super::RemoteShellSession`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ShellError {
    /// The transport could not be opened or the startup handshake failed,
    /// after the relaxed retry.
    #[error("failed to connect to {address}: {message}")]
    Connection {
        /// Remote address.
        address: String,
        /// Underlying failure.
        message: String,
    },
    /// Reading from or writing to a live session failed.
    #[error("session I/O with {address} failed: {message}")]
    Io {
        /// Remote address.
        address: String,
        /// Underlying failure.
        message: String,
    },
    /// An operation needed a live session and none was open.
    #[error("no live session to {address}")]
    Closed {
        /// Remote address.
        address: String,
    },
}
