//! Error types

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by sockets, servers and the connect facade
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed call shape, detected before any network I/O
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Outbound connection failed (DNS, refused, timeout)
    #[error("unable to open socket to {target}: {source}")]
    Connection {
        /// Host/port or path that was dialed
        target: String,
        /// Underlying I/O failure
        #[source]
        source: io::Error,
    },

    /// Invalid upgrade request (already secure, not connected, in progress)
    #[error("cannot upgrade socket to TLS: {0}")]
    Upgrade(String),

    /// Listen-time failure
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested listen address
        addr: String,
        /// Underlying I/O failure
        #[source]
        source: io::Error,
    },

    /// Operation attempted or in flight on a closed socket
    #[error("socket is closed")]
    Closed,

    /// TLS handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Invalid configuration (TLS material, runtime)
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid lifecycle transition
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// What the operation required
        expected: String,
        /// What was observed
        actual: String,
    },

    /// I/O error on an established transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the failure is transient (a caller may retry)
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connection { .. } | Error::Io(_))
    }

    /// Static label for metrics
    pub fn category(&self) -> &'static str {
        match self {
            Error::Argument(_) => "argument",
            Error::Connection { .. } => "connection",
            Error::Upgrade(_) => "upgrade",
            Error::Bind { .. } => "bind",
            Error::Closed => "closed",
            Error::Tls(_) => "tls",
            Error::Config(_) => "config",
            Error::InvalidState { .. } => "invalid_state",
            Error::Io(_) => "io",
        }
    }
}
