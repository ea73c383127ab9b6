//! Transport abstraction (TCP or Unix socket, plain or TLS)

use super::request::Endpoint;
use crate::{Error, Result};
use bytes::BytesMut;
use rustls_pki_types::ServerName;
use sha2::Digest;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

/// Raw byte stream underneath an optional TLS session
#[derive(Debug)]
pub enum Stream {
    /// TCP socket
    Tcp(TcpStream),
    /// Unix domain socket
    Unix(UnixStream),
}

impl Stream {
    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Stream::Tcp(s) => s.local_addr().ok(),
            Stream::Unix(_) => None,
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Stream::Tcp(s) => s.peer_addr().ok(),
            Stream::Unix(_) => None,
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Which side of a TLS handshake to perform, with its compiled configuration
#[derive(Clone)]
pub enum Handshake {
    /// Client side: connect with SNI
    Client {
        /// rustls client configuration
        config: Arc<rustls::ClientConfig>,
        /// Name sent via SNI and verified against the certificate
        server_name: ServerName<'static>,
    },
    /// Server side: accept using the configured identity
    Server {
        /// rustls server configuration
        config: Arc<rustls::ServerConfig>,
    },
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handshake::Client { server_name, .. } => f
                .debug_struct("Handshake::Client")
                .field("server_name", server_name)
                .finish(),
            Handshake::Server { .. } => f.write_str("Handshake::Server"),
        }
    }
}

/// Transport layer: plain stream or TLS session over it
#[allow(clippy::large_enum_variant)]
pub enum Transport {
    /// Plaintext stream
    Plain(Stream),
    /// TLS-encrypted stream
    Tls(Box<TlsStream<Stream>>),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Plain(s) => f.debug_tuple("Transport::Plain").field(s).finish(),
            Transport::Tls(_) => f.write_str("Transport::Tls(TlsStream)"),
        }
    }
}

impl Transport {
    /// Open a plain stream to `endpoint`, bounded by `timeout` if given.
    ///
    /// A zero timeout means no timeout.
    pub async fn connect(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<Self> {
        let dial = async {
            match endpoint {
                Endpoint::Tcp { host, port } => {
                    TcpStream::connect((host.as_str(), *port)).await.map(Stream::Tcp)
                }
                Endpoint::Unix(path) => UnixStream::connect(path).await.map(Stream::Unix),
            }
        };

        let stream = match timeout.filter(|limit| !limit.is_zero()) {
            Some(limit) => match tokio::time::timeout(limit, dial).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", limit),
                )),
            },
            None => dial.await,
        };

        stream
            .map(Transport::Plain)
            .map_err(|source| Error::Connection {
                target: endpoint.to_string(),
                source,
            })
    }

    /// Wrap an accepted TCP stream.
    pub fn accepted(stream: TcpStream) -> Self {
        Transport::Plain(Stream::Tcp(stream))
    }

    /// Whether the transport is TLS-encrypted
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    fn stream(&self) -> &Stream {
        match self {
            Transport::Plain(s) => s,
            Transport::Tls(tls) => tls.get_ref().0,
        }
    }

    /// Local socket address (TCP only)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream().local_addr()
    }

    /// Remote socket address (TCP only)
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream().peer_addr()
    }

    /// Disable Nagle's algorithm (TCP only, no-op otherwise)
    pub fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        if let Stream::Tcp(s) = self.stream() {
            s.set_nodelay(nodelay)?;
        }
        Ok(())
    }

    /// Upgrade a plain transport to TLS over the same stream.
    ///
    /// Consumes `self` and returns a new `Transport` wrapping the TLS session.
    /// Returns an error if the transport is already encrypted.
    pub async fn upgrade_to_tls(self, handshake: Handshake) -> Result<Self> {
        let stream = match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(_) => {
                return Err(Error::Upgrade("transport is already TLS-encrypted".into()))
            }
        };

        let tls = match handshake {
            Handshake::Client {
                config,
                server_name,
            } => TlsConnector::from(config)
                .connect(server_name, stream)
                .await
                .map(TlsStream::Client),
            Handshake::Server { config } => TlsAcceptor::from(config)
                .accept(stream)
                .await
                .map(TlsStream::Server),
        }
        .map_err(|e| Error::Tls(format!("TLS handshake failed: {}", e)))?;

        Ok(Transport::Tls(Box::new(tls)))
    }

    /// Write all bytes to the transport
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Transport::Plain(stream) => stream.write_all(buf).await?,
            Transport::Tls(stream) => stream.write_all(buf).await?,
        }
        Ok(())
    }

    /// Flush the transport
    pub async fn flush(&mut self) -> Result<()> {
        match self {
            Transport::Plain(stream) => stream.flush().await?,
            Transport::Tls(stream) => stream.flush().await?,
        }
        Ok(())
    }

    /// Read bytes into buffer
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let n = match self {
            Transport::Plain(stream) => stream.read_buf(buf).await?,
            Transport::Tls(stream) => stream.read_buf(buf).await?,
        };
        Ok(n)
    }

    /// Shutdown the transport
    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            Transport::Plain(stream) => stream.shutdown().await?,
            Transport::Tls(stream) => stream.shutdown().await?,
        }
        Ok(())
    }

    /// SHA-256 of the peer's DER-encoded leaf certificate.
    ///
    /// Returns `None` for plain transports or when the peer sent no certificate.
    pub fn peer_fingerprint(&self) -> Option<[u8; 32]> {
        let certs = match self {
            Transport::Plain(_) => return None,
            Transport::Tls(tls) => tls.get_ref().1.peer_certificates(),
        }?;
        let leaf = certs.first()?;
        Some(sha2::Sha256::digest(leaf.as_ref()).into())
    }

    /// Negotiated TLS protocol version, e.g. `TLSv1.3`.
    pub fn protocol(&self) -> Option<&'static str> {
        let version = match self {
            Transport::Plain(_) => return None,
            Transport::Tls(tls) => tls.get_ref().1.protocol_version(),
        }?;
        match version {
            rustls::ProtocolVersion::TLSv1_2 => Some("TLSv1.2"),
            rustls::ProtocolVersion::TLSv1_3 => Some("TLSv1.3"),
            _ => Some("unknown"),
        }
    }
}
