//! Canonical outbound connect request

use super::tls::TlsOptions;
use std::path::PathBuf;
use std::time::Duration;

/// Where a socket connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP host (name or IP literal) and port
    Tcp {
        /// Host name or address
        host: String,
        /// Port number
        port: u16,
    },
    /// Unix domain socket path
    Unix(PathBuf),
}

impl Endpoint {
    /// Host name to use for TLS verification, if the endpoint has one
    pub fn host(&self) -> Option<&str> {
        match self {
            Endpoint::Tcp { host, .. } => Some(host),
            Endpoint::Unix(_) => None,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Outbound connection request for a single socket
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Target endpoint
    pub endpoint: Endpoint,
    /// Negotiate TLS before reporting the socket connected
    pub tls: Option<TlsOptions>,
    /// Connect timeout (None = wait for the OS)
    pub timeout: Option<Duration>,
    /// Disable Nagle's algorithm on TCP sockets
    pub no_delay: bool,
}

impl ConnectRequest {
    /// Request a TCP connection
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(Endpoint::Tcp {
            host: host.into(),
            port,
        })
    }

    /// Request a Unix domain socket connection
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::new(Endpoint::Unix(path.into()))
    }

    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            tls: None,
            timeout: None,
            no_delay: false,
        }
    }

    /// Negotiate TLS as part of the connect
    pub fn tls(mut self, options: TlsOptions) -> Self {
        self.tls = Some(options);
        self
    }

    /// Fail the connect if it does not complete within `duration`
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Disable Nagle's algorithm
    pub fn no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }
}
