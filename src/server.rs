//! Listening server
//!
//! A `Server` binds a TCP listener and runs a single accept loop. Every
//! accepted connection is wrapped in a Connected, plaintext [`Socket`] and
//! handed to the connection listener inline, before the next accept and
//! before the socket's driver starts reading. The server keeps weak
//! references to live sockets; ownership stays with the listener.

use crate::socket::{cancelled, lock, Socket, SocketId, Transport, WeakSocket};
use crate::{Error, Result};
use futures::Stream;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

/// Pause after a failed accept (e.g. file descriptor exhaustion)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Callback invoked once per accepted connection
pub type ConnectionListener = Arc<dyn Fn(Socket) + Send + Sync>;

/// Server options
///
/// # Examples
///
/// ```ignore
/// let options: ServerOptions = serde_json::from_str(r#"{ "max_connections": 128 }"#)?;
/// let server = Server::with_options(options, |socket| { /* ... */ });
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerOptions {
    /// Drop new connections while this many are live (None = unlimited)
    pub max_connections: Option<usize>,
    /// Disable Nagle's algorithm on accepted sockets
    pub no_delay: bool,
}

impl ServerOptions {
    /// Limit the number of live connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Disable Nagle's algorithm on accepted sockets
    pub fn no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }
}

/// Server state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not yet listening
    Created,
    /// Accepting connections
    Listening,
    /// Stopped accepting
    Closed,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Listening => write!(f, "listening"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Notification emitted by a server
#[derive(Debug)]
pub enum ServerEvent {
    /// Bound and accepting on this address
    Listening(SocketAddr),
    /// Accept failure; the server keeps accepting
    Error(Error),
    /// Stopped accepting; nothing follows
    Closed,
}

/// Ordered stream of a server's events
#[derive(Debug)]
pub struct ServerEvents {
    rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl ServerEvents {
    /// Receive the next event, or `None` once the server has closed.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }
}

impl Stream for ServerEvents {
    type Item = ServerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct Status {
    state: ServerState,
    local_addr: Option<SocketAddr>,
    events: Option<mpsc::UnboundedSender<ServerEvent>>,
}

struct ServerShared {
    options: ServerOptions,
    listener: ConnectionListener,
    status: Mutex<Status>,
    connections: Mutex<HashMap<SocketId, WeakSocket>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    cancel: watch::Sender<bool>,
}

/// TCP server handing accepted sockets to a connection listener.
///
/// # Examples
///
/// ```ignore
/// use tls_sockets::Server;
///
/// let server = Server::new(|socket| {
///     let _ = socket.write("hello\n");
/// });
/// let addr = server.listen(0, Some("127.0.0.1")).await?;
/// ```
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// Create a server with default options.
    pub fn new(listener: impl Fn(Socket) + Send + Sync + 'static) -> Self {
        Self::with_options(ServerOptions::default(), listener)
    }

    /// Create a server with custom options.
    pub fn with_options(
        options: ServerOptions,
        listener: impl Fn(Socket) + Send + Sync + 'static,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel, _) = watch::channel(false);

        Self {
            shared: Arc::new(ServerShared {
                options,
                listener: Arc::new(listener),
                status: Mutex::new(Status {
                    state: ServerState::Created,
                    local_addr: None,
                    events: Some(events_tx),
                }),
                connections: Mutex::new(HashMap::new()),
                events_rx: Mutex::new(Some(events_rx)),
                cancel,
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> ServerState {
        lock(&self.shared.status).state
    }

    /// Bound address, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared.status).local_addr
    }

    /// Take the server's event stream; `None` if already taken.
    pub fn events(&self) -> Option<ServerEvents> {
        lock(&self.shared.events_rx)
            .take()
            .map(|rx| ServerEvents { rx })
    }

    /// Bind to `host:port` and start accepting connections.
    ///
    /// `host` defaults to the IPv4 wildcard; port 0 picks an ephemeral port.
    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// `Error::Bind` if the address is in use, not permitted, or does not
    /// resolve; `Error::InvalidState` if the server already listened.
    pub async fn listen(&self, port: u16, host: Option<&str>) -> Result<SocketAddr> {
        self.ensure_state(ServerState::Created)?;

        let host = host.unwrap_or("0.0.0.0");
        let requested = if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };

        let bound = match TcpListener::bind((host, port)).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = bound.map_err(|source| {
            tracing::warn!(addr = %requested, error = %source, "bind failed");
            Error::Bind {
                addr: requested,
                source,
            }
        })?;

        {
            let mut status = lock(&self.shared.status);
            if status.state != ServerState::Created {
                return Err(Error::InvalidState {
                    expected: ServerState::Created.to_string(),
                    actual: status.state.to_string(),
                });
            }
            status.state = ServerState::Listening;
            status.local_addr = Some(local_addr);
            if let Some(events) = &status.events {
                let _ = events.send(ServerEvent::Listening(local_addr));
            }
        }

        tracing::info!(addr = %local_addr, "listening");
        let shared = self.shared.clone();
        tokio::spawn(
            accept_loop(shared, listener).instrument(tracing::info_span!(
                "server",
                addr = %local_addr
            )),
        );

        Ok(local_addr)
    }

    /// Stop accepting connections. Idempotent.
    ///
    /// Sockets already accepted are unaffected.
    pub fn close(&self) -> Result<()> {
        let mut status = lock(&self.shared.status);
        match status.state {
            ServerState::Closed => {}
            ServerState::Created => {
                status.state = ServerState::Closed;
                if let Some(events) = status.events.take() {
                    let _ = events.send(ServerEvent::Closed);
                }
            }
            ServerState::Listening => {
                status.state = ServerState::Closed;
                self.shared.cancel.send_replace(true);
                tracing::debug!("close requested");
            }
        }
        Ok(())
    }

    /// Live accepted sockets
    pub fn connections(&self) -> Vec<Socket> {
        lock(&self.shared.connections)
            .values()
            .filter_map(WeakSocket::upgrade)
            .collect()
    }

    /// Number of live accepted sockets
    pub fn connection_count(&self) -> usize {
        self.shared.connection_count()
    }

    /// Close every live accepted socket.
    pub fn close_all_connections(&self) {
        for socket in self.connections() {
            if let Err(e) = socket.close() {
                tracing::debug!(id = %socket.id(), error = %e, "failed to close connection");
            }
        }
    }

    fn ensure_state(&self, expected: ServerState) -> Result<()> {
        let state = self.state();
        if state != expected {
            return Err(Error::InvalidState {
                expected: expected.to_string(),
                actual: state.to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = lock(&self.shared.status);
        f.debug_struct("Server")
            .field("state", &status.state)
            .field("local_addr", &status.local_addr)
            .field("options", &self.shared.options)
            .finish()
    }
}

impl ServerShared {
    fn connection_count(&self) -> usize {
        lock(&self.connections)
            .values()
            .filter(|weak| weak.upgrade().is_some())
            .count()
    }

    fn emit(&self, event: ServerEvent) {
        if let Some(events) = &lock(&self.status).events {
            let _ = events.send(event);
        }
    }

    fn handle_accepted(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Some(max) = self.options.max_connections {
            if self.connection_count() >= max {
                tracing::warn!(%peer, max, "connection limit reached, dropping connection");
                return;
            }
        }

        if self.options.no_delay {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(%peer, error = %e, "failed to set TCP_NODELAY");
            }
        }

        let transport = Transport::accepted(stream);
        let socket = Socket::accepted(&transport);
        let id = socket.id();
        lock(&self.connections).insert(id, socket.downgrade());

        let server = Arc::downgrade(self);
        socket.on_close(move |id| {
            if let Some(server) = server.upgrade() {
                lock(&server.connections).remove(&id);
            }
        });

        crate::metrics::counters::connection_accepted();
        tracing::debug!(%id, %peer, "accepted connection");

        (self.listener)(socket.clone());
        socket.start_accepted(transport);
    }
}

async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener) {
    let mut cancel = shared.cancel.subscribe();

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => Some(result),
            _ = cancelled(&mut cancel) => None,
        };

        match accepted {
            Some(Ok((stream, peer))) => shared.handle_accepted(stream, peer),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "accept failed");
                shared.emit(ServerEvent::Error(Error::Io(e)));
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
            None => break,
        }
    }

    drop(listener);
    tracing::info!("stopped accepting");
    if let Some(events) = lock(&shared.status).events.take() {
        let _ = events.send(ServerEvent::Closed);
    }
}
