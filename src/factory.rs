//! Connect call-shape normalization
//!
//! Supports the conventional stream-connect shapes:
//! * `connect(port)` / `connect((port, host))`
//! * `connect(path)` for Unix domain sockets
//! * `connect(ConnectOptions { host, port, path, tls, .. })`
//! * `connect(ConnectOptions { socket, tls, .. })` to upgrade an existing socket
//!
//! Every shape resolves to a [`ConnectionRequest`]; malformed shapes are
//! rejected with `Error::Argument` before any I/O happens.

use crate::socket::{ConnectRequest, Endpoint, Socket, TlsOptions};
use crate::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host used when none is given
pub const DEFAULT_HOST: &str = "localhost";

/// Options object accepted by [`connect`]
///
/// # Examples
///
/// ```ignore
/// // From a config file
/// let options: ConnectOptions = serde_json::from_str(
///     r#"{ "host": "example.com", "port": 443, "timeout_ms": 5000 }"#,
/// )?;
///
/// // Upgrade an existing plaintext socket in place
/// let options = ConnectOptions::upgrade(socket, TlsOptions::default());
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectOptions {
    /// Host name or address (default: localhost)
    pub host: Option<String>,
    /// TCP port
    pub port: Option<u16>,
    /// Unix domain socket path, instead of host/port
    pub path: Option<PathBuf>,
    /// Connect timeout; zero or absent means no timeout
    #[serde(rename = "timeout_ms", deserialize_with = "deserialize_millis")]
    pub timeout: Option<Duration>,
    /// Disable Nagle's algorithm
    pub no_delay: bool,
    /// TLS options (default options when absent)
    pub tls: Option<TlsOptions>,
    /// Existing socket to upgrade in place
    #[serde(skip)]
    pub socket: Option<Socket>,
}

impl ConnectOptions {
    /// Empty options
    pub fn new() -> Self {
        Self::default()
    }

    /// Options that upgrade `socket` in place with `tls`
    pub fn upgrade(socket: Socket, tls: TlsOptions) -> Self {
        Self::new().socket(socket).tls(tls)
    }

    /// Set the host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Connect to a Unix domain socket
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set the connect timeout
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Disable Nagle's algorithm
    pub fn no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    /// Set TLS options
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Upgrade this existing socket instead of dialing
    pub fn socket(mut self, socket: Socket) -> Self {
        self.socket = Some(socket);
        self
    }

    fn into_request(self) -> Result<ConnectionRequest> {
        if let Some(socket) = self.socket {
            if self.host.is_some() || self.port.is_some() || self.path.is_some() {
                return Err(Error::Argument(
                    "socket cannot be combined with host, port or path".into(),
                ));
            }
            if self.timeout.is_some() {
                return Err(Error::Argument(
                    "timeout does not apply when upgrading an existing socket".into(),
                ));
            }
            return Ok(ConnectionRequest::Upgrade {
                socket,
                tls: self.tls.unwrap_or_default(),
            });
        }

        let endpoint = match (self.path, self.port) {
            (Some(_), Some(_)) => {
                return Err(Error::Argument(
                    "port and path are mutually exclusive".into(),
                ))
            }
            (Some(path), None) => {
                if self.host.is_some() {
                    return Err(Error::Argument("host cannot be combined with path".into()));
                }
                if path.as_os_str().is_empty() {
                    return Err(Error::Argument("path must not be empty".into()));
                }
                Endpoint::Unix(path)
            }
            (None, Some(0)) => return Err(Error::Argument("port must be 1-65535".into())),
            (None, Some(port)) => {
                let host = self.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
                if host.is_empty() {
                    return Err(Error::Argument("host must not be empty".into()));
                }
                Endpoint::Tcp { host, port }
            }
            (None, None) => return Err(Error::Argument("port or path is required".into())),
        };

        Ok(ConnectionRequest::Connect(ConnectRequest {
            endpoint,
            tls: self.tls,
            timeout: self.timeout.filter(|limit| !limit.is_zero()),
            no_delay: self.no_delay,
        }))
    }
}

fn deserialize_millis<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
}

/// Supported connect call shapes
#[derive(Debug, Clone)]
pub enum ConnectArgs {
    /// Port on the default host
    Port(u16),
    /// Port and host
    PortHost(u16, String),
    /// Unix domain socket path
    Path(PathBuf),
    /// Options object
    Options(ConnectOptions),
}

impl From<u16> for ConnectArgs {
    fn from(port: u16) -> Self {
        ConnectArgs::Port(port)
    }
}

impl From<(u16, &str)> for ConnectArgs {
    fn from((port, host): (u16, &str)) -> Self {
        ConnectArgs::PortHost(port, host.to_string())
    }
}

impl From<(u16, String)> for ConnectArgs {
    fn from((port, host): (u16, String)) -> Self {
        ConnectArgs::PortHost(port, host)
    }
}

impl From<&Path> for ConnectArgs {
    fn from(path: &Path) -> Self {
        ConnectArgs::Path(path.to_path_buf())
    }
}

impl From<PathBuf> for ConnectArgs {
    fn from(path: PathBuf) -> Self {
        ConnectArgs::Path(path)
    }
}

impl From<ConnectOptions> for ConnectArgs {
    fn from(options: ConnectOptions) -> Self {
        ConnectArgs::Options(options)
    }
}

/// Canonical connection request: dial a new socket, or upgrade an existing one
#[derive(Debug, Clone)]
pub enum ConnectionRequest {
    /// Dial a fresh socket
    Connect(ConnectRequest),
    /// Upgrade `socket` in place
    Upgrade {
        /// Socket to upgrade
        socket: Socket,
        /// TLS options for the handshake
        tls: TlsOptions,
    },
}

/// Resolve a call shape into a connection request.
pub fn normalize(args: ConnectArgs) -> Result<ConnectionRequest> {
    let options = match args {
        ConnectArgs::Port(port) => ConnectOptions::new().port(port),
        ConnectArgs::PortHost(port, host) => ConnectOptions::new().port(port).host(host),
        ConnectArgs::Path(path) => ConnectOptions::new().path(path),
        ConnectArgs::Options(options) => options,
    };
    options.into_request()
}

/// Open a TLS connection, or upgrade an existing socket to TLS.
///
/// With an options object carrying `socket`, that socket is upgraded in
/// place and the same socket is returned. Otherwise a new secure-pending
/// socket is created and connected; it reports `Connected` and
/// `SecureConnected` once the handshake completes.
///
/// # Examples
///
/// ```ignore
/// use tls_sockets::{connect, ConnectOptions, TlsOptions};
///
/// let socket = connect((443, "example.com"))?;
///
/// let tls = TlsOptions::builder().server_name("example.com").build()?;
/// let same = connect(ConnectOptions::upgrade(plain_socket.clone(), tls))?;
/// assert!(same.same_socket(&plain_socket));
/// ```
///
/// # Errors
///
/// Malformed arguments (`Error::Argument`), invalid TLS options, and invalid
/// upgrades (`Error::Upgrade`) fail synchronously. Network failures are
/// reported on the socket's event stream.
pub fn connect(args: impl Into<ConnectArgs>) -> Result<Socket> {
    match normalize(args.into())? {
        ConnectionRequest::Upgrade { socket, tls } => socket.upgrade_to_secure(tls),
        ConnectionRequest::Connect(mut request) => {
            let socket = Socket::new();
            socket.enable_tls(request.tls.take().unwrap_or_default())?;
            tracing::debug!(id = %socket.id(), endpoint = %request.endpoint, "creating TLS connection");
            socket.connect(request)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_connect(request: ConnectionRequest) -> ConnectRequest {
        match request {
            ConnectionRequest::Connect(request) => request,
            other => panic!("expected connect request, got {:?}", other),
        }
    }

    #[test]
    fn test_port_defaults_to_localhost() {
        let request = expect_connect(normalize(8443.into()).expect("normalize"));
        assert_eq!(
            request.endpoint,
            Endpoint::Tcp {
                host: "localhost".into(),
                port: 8443
            }
        );
        assert!(request.tls.is_none());
        assert!(request.timeout.is_none());
    }

    #[test]
    fn test_port_and_host() {
        let request = expect_connect(normalize((443, "example.com").into()).expect("normalize"));
        assert_eq!(request.endpoint.to_string(), "example.com:443");
    }

    #[test]
    fn test_zero_timeout_means_no_timeout() {
        let options = ConnectOptions::new().port(443).timeout(Duration::ZERO);
        let request = expect_connect(normalize(options.into()).expect("normalize"));
        assert!(request.timeout.is_none());
    }

    #[test]
    fn test_unix_path() {
        let request =
            expect_connect(normalize(PathBuf::from("/tmp/app.sock").into()).expect("normalize"));
        assert_eq!(request.endpoint, Endpoint::Unix("/tmp/app.sock".into()));
    }

    #[test]
    fn test_options_object() {
        let options = ConnectOptions::new()
            .host("10.0.0.1")
            .port(993)
            .timeout(Duration::from_secs(3))
            .no_delay(true)
            .tls(TlsOptions::default());
        let request = expect_connect(normalize(options.into()).expect("normalize"));
        assert_eq!(request.endpoint.host(), Some("10.0.0.1"));
        assert_eq!(request.timeout, Some(Duration::from_secs(3)));
        assert!(request.no_delay);
        assert!(request.tls.is_some());
    }

    #[test]
    fn test_socket_becomes_upgrade() {
        let socket = Socket::new();
        let request = normalize(ConnectOptions::upgrade(socket.clone(), TlsOptions::default()).into())
            .expect("normalize");
        match request {
            ConnectionRequest::Upgrade { socket: target, .. } => {
                assert!(target.same_socket(&socket))
            }
            other => panic!("expected upgrade, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_shapes_rejected() {
        let cases = vec![
            ConnectOptions::new(),
            ConnectOptions::new().host("example.com"),
            ConnectOptions::new().port(0),
            ConnectOptions::new().port(80).host(""),
            ConnectOptions::new().port(80).path("/tmp/app.sock"),
            ConnectOptions::new().path("/tmp/app.sock").host("example.com"),
            ConnectOptions::new().path(""),
            ConnectOptions::new().socket(Socket::new()).port(80),
            ConnectOptions::new().socket(Socket::new()).host("example.com"),
            ConnectOptions::new()
                .socket(Socket::new())
                .timeout(Duration::from_secs(1)),
        ];

        for options in cases {
            let debug = format!("{:?}", options);
            let result = normalize(options.into());
            assert!(
                matches!(result, Err(Error::Argument(_))),
                "expected argument error for {}",
                debug
            );
        }
    }

    #[test]
    fn test_connect_rejects_before_io() {
        // No runtime here: an argument error must surface before any spawn
        let err = connect(ConnectOptions::new()).unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
    }

    #[test]
    fn test_upgrade_of_unconnected_socket_fails() {
        let socket = Socket::new();
        let err = connect(ConnectOptions::upgrade(socket.clone(), TlsOptions::default()))
            .unwrap_err();
        assert!(matches!(err, Error::Upgrade(_)));
    }

    #[test]
    fn test_options_from_json() {
        let options: ConnectOptions = serde_json::from_value(serde_json::json!({
            "host": "example.com",
            "port": 443,
            "timeout_ms": 2500,
            "tls": { "verify_mode": "peer", "min_version": "1.3" }
        }))
        .expect("deserialize");

        assert_eq!(options.timeout, Some(Duration::from_millis(2500)));
        let request = expect_connect(normalize(options.into()).expect("normalize"));
        assert_eq!(request.endpoint.to_string(), "example.com:443");
        assert!(request.tls.is_some());
    }

    #[test]
    fn test_unknown_json_fields_rejected() {
        let result = serde_json::from_value::<ConnectOptions>(serde_json::json!({
            "port": 443,
            "family": 6
        }));
        assert!(result.is_err());
    }
}
