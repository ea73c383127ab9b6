//! Core socket type
//!
//! A `Socket` is a cheap, cloneable handle. The transport itself is owned by a
//! driver task spawned on connect (or on accept); callers talk to it through a
//! command channel, and every lifecycle transition is taken under one short
//! lock so that state changes and event emission are serialized per socket.
//!
//! Inbound data is flow-controlled: the driver reads only while it holds one of
//! `DATA_EVENT_CREDITS` credits, and the event stream hands a credit back for
//! every `Data` event it yields. A consumer that stops draining stops the reads,
//! and TCP pushes back on the peer. A stream never taken counts as not draining.
//! Writes are queued without a bound since `write` never waits;
//! `buffered_amount` reports what is still queued.

use super::events::{SocketEvent, SocketEvents};
use super::request::{ConnectRequest, Endpoint};
use super::state::SocketState;
use super::tls::{resolve_server_name, TlsOptions};
use super::transport::{Handshake, Transport};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use rustls_pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tracing::Instrument;

const READ_BUFFER_SIZE: usize = 8192;

/// Undelivered `Data` events allowed before the driver stops reading
const DATA_EVENT_CREDITS: usize = 16;

/// How long `close` waits for queued writes to drain
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique socket identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    fn next() -> Self {
        Self(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Outbound socket created by `connect`
    Client,
    /// Inbound socket accepted by a server
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
        }
    }
}

enum Command {
    Write(Bytes),
    Upgrade(TlsSetup),
    Close,
}

/// TLS parameters checked at call time. Configurations that are not compiled
/// yet are built on the blocking pool by the driver.
enum TlsSetup {
    Client {
        options: TlsOptions,
        server_name: ServerName<'static>,
    },
    Server {
        options: TlsOptions,
    },
}

impl TlsSetup {
    fn client(options: TlsOptions, host: Option<&str>) -> Result<Self> {
        options.validate()?;
        let name = options.server_name().or(host).ok_or_else(|| {
            Error::Argument("TLS without a host name requires server_name".into())
        })?;
        let server_name = resolve_server_name(name)?;
        Ok(TlsSetup::Client {
            options,
            server_name,
        })
    }

    fn server(options: TlsOptions) -> Result<Self> {
        options.validate()?;
        if !options.has_identity() {
            return Err(Error::Argument(
                "server-side TLS requires a certificate and private key".into(),
            ));
        }
        Ok(TlsSetup::Server { options })
    }

    fn side(&self) -> &'static str {
        match self {
            TlsSetup::Client { .. } => "client",
            TlsSetup::Server { .. } => "server",
        }
    }

    async fn into_handshake(self) -> Result<Handshake> {
        match self {
            TlsSetup::Client {
                options,
                server_name,
            } => {
                let config = match options.cached_client_config() {
                    Some(config) => config,
                    None => compile_off_thread(move || options.client_config()).await?,
                };
                Ok(Handshake::Client {
                    config,
                    server_name,
                })
            }
            TlsSetup::Server { options } => {
                let config = match options.cached_server_config() {
                    Some(config) => config,
                    None => compile_off_thread(move || options.server_config()).await?,
                };
                Ok(Handshake::Server { config })
            }
        }
    }
}

struct Lifecycle {
    state: SocketState,
    secure: bool,
    /// Dropped once `Closed` has been emitted, which ends the event stream
    events: Option<mpsc::UnboundedSender<SocketEvent>>,
}

#[derive(Default)]
struct Peer {
    endpoint: Option<Endpoint>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    fingerprint: Option<[u8; 32]>,
    protocol: Option<&'static str>,
}

type CloseHook = Box<dyn FnOnce(SocketId) + Send>;

struct Shared {
    id: SocketId,
    role: Role,
    lifecycle: Mutex<Lifecycle>,
    secure_pending: Mutex<Option<TlsOptions>>,
    commands: mpsc::UnboundedSender<Command>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SocketEvent>>>,
    cancel: watch::Sender<bool>,
    data_credits: Arc<Semaphore>,
    buffered: AtomicUsize,
    peer: Mutex<Peer>,
    close_hooks: Mutex<Vec<CloseHook>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A bidirectional stream connection with an optional in-place TLS upgrade.
///
/// Handles are cheap to clone and all clones refer to the same connection.
/// Dropping handles does not close the connection; call [`Socket::close`].
#[derive(Clone)]
pub struct Socket {
    shared: Arc<Shared>,
}

/// Non-owning reference to a socket
#[derive(Clone)]
pub struct WeakSocket {
    shared: Weak<Shared>,
}

impl WeakSocket {
    /// Upgrade to a strong handle if the socket is still alive
    pub fn upgrade(&self) -> Option<Socket> {
        self.shared.upgrade().map(|shared| Socket { shared })
    }
}

impl Default for Socket {
    fn default() -> Self {
        Self::new()
    }
}

impl Socket {
    /// Create an unconnected client socket.
    pub fn new() -> Self {
        Self::with_role(Role::Client, SocketState::Created)
    }

    fn with_role(role: Role, state: SocketState) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                id: SocketId::next(),
                role,
                lifecycle: Mutex::new(Lifecycle {
                    state,
                    secure: false,
                    events: Some(events_tx),
                }),
                secure_pending: Mutex::new(None),
                commands,
                command_rx: Mutex::new(Some(command_rx)),
                events_rx: Mutex::new(Some(events_rx)),
                cancel,
                data_credits: Arc::new(Semaphore::new(DATA_EVENT_CREDITS)),
                buffered: AtomicUsize::new(0),
                peer: Mutex::new(Peer::default()),
                close_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Wrap an accepted, plaintext transport. The socket starts Connected;
    /// its driver is started separately with [`Socket::start_accepted`].
    pub(crate) fn accepted(transport: &Transport) -> Self {
        let socket = Self::with_role(Role::Server, SocketState::Connected);
        {
            let mut peer = lock(&socket.shared.peer);
            peer.local_addr = transport.local_addr();
            peer.remote_addr = transport.peer_addr();
        }
        socket
    }

    /// Socket identifier
    pub fn id(&self) -> SocketId {
        self.shared.id
    }

    /// Whether this socket was dialed or accepted
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Current lifecycle state
    pub fn state(&self) -> SocketState {
        lock(&self.shared.lifecycle).state
    }

    /// Whether the transport is TLS-encrypted
    pub fn is_secure(&self) -> bool {
        lock(&self.shared.lifecycle).secure
    }

    /// Whether TLS will be negotiated as part of the initial connect
    pub fn is_secure_pending(&self) -> bool {
        lock(&self.shared.secure_pending).is_some()
    }

    /// Local address (TCP only, once connected)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared.peer).local_addr
    }

    /// Remote address (TCP only, once connected)
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared.peer).remote_addr
    }

    /// SHA-256 fingerprint of the peer's leaf certificate, as colon-separated hex.
    pub fn peer_fingerprint(&self) -> Option<String> {
        let fingerprint = lock(&self.shared.peer).fingerprint?;
        Some(
            fingerprint
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(":"),
        )
    }

    /// Negotiated TLS protocol version (`TLSv1.2`, `TLSv1.3`)
    pub fn protocol(&self) -> Option<&'static str> {
        lock(&self.shared.peer).protocol
    }

    /// Whether two handles refer to the same socket
    pub fn same_socket(&self, other: &Socket) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Non-owning reference to this socket
    pub fn downgrade(&self) -> WeakSocket {
        WeakSocket {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Take the socket's event stream.
    ///
    /// Each socket has exactly one stream; returns `None` if it was already taken.
    pub fn events(&self) -> Option<SocketEvents> {
        lock(&self.shared.events_rx)
            .take()
            .map(|rx| SocketEvents::new(rx, self.shared.data_credits.clone()))
    }

    /// Bytes queued by `write` that have not reached the transport yet
    pub fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::Relaxed)
    }

    /// Mark the socket secure-pending: TLS is negotiated during `connect`.
    ///
    /// Only valid before connecting.
    pub fn enable_tls(&self, options: TlsOptions) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            return Err(Error::Closed);
        }
        if state != SocketState::Created || self.shared.role != Role::Client {
            return Err(Error::InvalidState {
                expected: SocketState::Created.to_string(),
                actual: state.to_string(),
            });
        }
        options.validate()?;
        *lock(&self.shared.secure_pending) = Some(options);
        Ok(())
    }

    /// Start connecting. Returns this same socket.
    ///
    /// Validation failures (inconsistent TLS options, wrong state, no runtime)
    /// are returned immediately; a closed socket gives `Error::Closed`. Network
    /// failures, and TLS material that cannot be loaded for options not built
    /// with `TlsOptionsBuilder`, arrive later as a single `SocketEvent::Error`
    /// followed by `SocketEvent::Closed`.
    ///
    /// If TLS options are set on the request, or the socket is secure-pending,
    /// the TLS handshake completes before `Connected` is emitted.
    pub fn connect(&self, request: ConnectRequest) -> Result<Socket> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Config("connect requires a Tokio runtime".into()))?;

        let tls = request
            .tls
            .clone()
            .or_else(|| lock(&self.shared.secure_pending).clone());
        let setup = match tls {
            Some(options) => Some(TlsSetup::client(options, request.endpoint.host())?),
            None => None,
        };

        let commands = {
            let mut lifecycle = lock(&self.shared.lifecycle);
            if lifecycle.state.is_terminal() {
                return Err(Error::Closed);
            }
            lifecycle.state.transition(SocketState::Connecting)?;
            lock(&self.shared.command_rx).take()
        }
        .ok_or_else(|| Error::InvalidState {
            expected: "socket with an idle driver".into(),
            actual: "driver already started".into(),
        })?;

        lock(&self.shared.peer).endpoint = Some(request.endpoint.clone());

        tracing::debug!(
            id = %self.shared.id,
            endpoint = %request.endpoint,
            secure = setup.is_some(),
            "connecting"
        );

        let span = tracing::debug_span!("socket", id = %self.shared.id, role = %Role::Client);
        let socket = self.clone();
        runtime.spawn(
            async move { socket.drive_client(request, setup, commands).await }.instrument(span),
        );

        Ok(self.clone())
    }

    /// Upgrade a connected plaintext socket to TLS in place. Returns this same socket.
    ///
    /// Fails immediately with `Error::Upgrade`, leaving the socket untouched,
    /// if the socket is already secure, an upgrade is in progress, or it is not
    /// connected. Client sockets perform the client side of the handshake and
    /// verify against the dialed host (or `server_name`); accepted sockets
    /// perform the server side and need an identity in `options`.
    ///
    /// On success the socket emits `SecureConnected`; a failed handshake emits
    /// `Error` and closes the socket.
    pub fn upgrade_to_secure(&self, options: TlsOptions) -> Result<Socket> {
        {
            let lifecycle = lock(&self.shared.lifecycle);
            check_upgradable(&lifecycle)?;
        }

        let setup = match self.shared.role {
            Role::Client => {
                let endpoint = lock(&self.shared.peer).endpoint.clone();
                TlsSetup::client(options, endpoint.as_ref().and_then(Endpoint::host))?
            }
            Role::Server => TlsSetup::server(options)?,
        };

        let mut lifecycle = lock(&self.shared.lifecycle);
        check_upgradable(&lifecycle)?;
        lifecycle.state.transition(SocketState::UpgradingToSecure)?;
        self.shared
            .commands
            .send(Command::Upgrade(setup))
            .map_err(|_| Error::Closed)?;
        drop(lifecycle);

        tracing::debug!(id = %self.shared.id, role = %self.shared.role, "upgrading to TLS");
        Ok(self.clone())
    }

    /// Queue bytes for writing.
    ///
    /// Writes issued before the socket is connected, or while an upgrade is in
    /// progress, are delivered in order once the transport is ready.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        let lifecycle = lock(&self.shared.lifecycle);
        if lifecycle.state.is_terminal() {
            return Err(Error::Closed);
        }
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len();
        self.shared.buffered.fetch_add(len, Ordering::Relaxed);
        self.shared
            .commands
            .send(Command::Write(data))
            .map_err(|_| {
                self.shared.buffered.fetch_sub(len, Ordering::Relaxed);
                Error::Closed
            })
    }

    /// Close the socket. Idempotent.
    ///
    /// Already queued writes are flushed before the transport shuts down, for at
    /// most two seconds; whatever a stalled peer has not taken by then is
    /// dropped. A connect or upgrade still in flight terminates with an
    /// `Error(Error::Closed)` event. No `Data` event is emitted after this returns.
    pub fn close(&self) -> Result<()> {
        let mut lifecycle = lock(&self.shared.lifecycle);
        match lifecycle.state {
            SocketState::Closed | SocketState::Errored => return Ok(()),
            SocketState::Created => {
                // No driver yet: terminate right here
                lifecycle.state = SocketState::Closed;
                drop(lifecycle);
                self.finish(None);
                return Ok(());
            }
            _ => {}
        }

        lifecycle.state.transition(SocketState::Closed)?;
        let _ = self.shared.commands.send(Command::Close);
        self.shared.cancel.send_replace(true);
        drop(lifecycle);

        tracing::debug!(id = %self.shared.id, "close requested");
        Ok(())
    }

    /// Register a hook run once after the socket emits `Closed`.
    pub(crate) fn on_close(&self, hook: impl FnOnce(SocketId) + Send + 'static) {
        let lifecycle = lock(&self.shared.lifecycle);
        if lifecycle.events.is_some() {
            lock(&self.shared.close_hooks).push(Box::new(hook));
            return;
        }
        drop(lifecycle);
        hook(self.shared.id);
    }

    /// Start the driver of an accepted socket.
    pub(crate) fn start_accepted(&self, transport: Transport) {
        let Some(commands) = lock(&self.shared.command_rx).take() else {
            return;
        };
        let span = tracing::debug_span!("socket", id = %self.shared.id, role = %Role::Server);
        let socket = self.clone();
        tokio::spawn(
            async move {
                let cancel = socket.shared.cancel.subscribe();
                socket.run(transport, commands, cancel).await;
            }
            .instrument(span),
        );
    }

    async fn drive_client(
        &self,
        request: ConnectRequest,
        setup: Option<TlsSetup>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut cancel = self.shared.cancel.subscribe();

        let established = tokio::select! {
            result = establish(&request, setup) => result,
            _ = cancelled(&mut cancel) => Err(Error::Closed),
        };

        let mut transport = match established {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(endpoint = %request.endpoint, error = %e, "connect failed");
                crate::metrics::counters::connection_failed(e.category());
                self.finish(Some(e));
                return;
            }
        };

        self.record_peer(&transport);
        let secure = transport.is_tls();
        if !self.mark_established(secure) {
            let _ = transport.shutdown().await;
            self.finish(Some(Error::Closed));
            return;
        }

        crate::metrics::counters::connection_opened(secure);
        tracing::info!(endpoint = %request.endpoint, secure, "connection established");

        self.run(transport, commands, cancel).await;
    }

    async fn run(
        &self,
        mut transport: Transport,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut flush_deadline = None;

        loop {
            let step = tokio::select! {
                biased;
                command = commands.recv() => Step::Command(command),
                (read, credit) = self.read_with_credit(&mut transport, &mut buf) => Step::Read(read, credit),
            };

            match step {
                Step::Command(Some(Command::Write(data))) => {
                    let written = tokio::select! {
                        result = write_flushed(&mut transport, &data) => Some(result),
                        _ = close_deadline(&mut cancel, &mut flush_deadline) => None,
                    };
                    self.shared.buffered.fetch_sub(data.len(), Ordering::Relaxed);

                    match written {
                        Some(Ok(())) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "write failed");
                            self.finish(Some(e));
                            return;
                        }
                        None => {
                            tracing::warn!(
                                unsent = self.buffered_amount() + data.len(),
                                "peer stalled during close, dropping unsent data"
                            );
                            self.finish(None);
                            return;
                        }
                    }
                }
                Step::Command(Some(Command::Upgrade(setup))) => {
                    let side = setup.side();
                    let started = Instant::now();
                    let upgraded = tokio::select! {
                        result = async {
                            let handshake = setup.into_handshake().await?;
                            transport.upgrade_to_tls(handshake).await
                        } => result,
                        _ = cancelled(&mut cancel) => Err(Error::Closed),
                    };

                    match upgraded {
                        Ok(secure) => transport = secure,
                        Err(e) => {
                            tracing::warn!(error = %e, "TLS upgrade failed");
                            crate::metrics::counters::upgrade(crate::metrics::labels::RESULT_FAILED);
                            self.finish(Some(e));
                            return;
                        }
                    }

                    crate::metrics::histograms::handshake_duration(
                        side,
                        started.elapsed().as_millis() as u64,
                    );
                    self.record_peer(&transport);
                    if !self.mark_upgraded() {
                        let _ = shutdown_by(&mut transport, CLOSE_FLUSH_TIMEOUT).await;
                        self.finish(Some(Error::Closed));
                        return;
                    }
                    crate::metrics::counters::upgrade(crate::metrics::labels::RESULT_OK);
                    tracing::info!(protocol = ?transport.protocol(), "upgraded to TLS");
                }
                Step::Command(Some(Command::Close)) | Step::Command(None) => {
                    let deadline = *flush_deadline
                        .get_or_insert_with(|| tokio::time::Instant::now() + CLOSE_FLUSH_TIMEOUT);
                    let closed = tokio::time::timeout_at(deadline, async {
                        transport.flush().await?;
                        transport.shutdown().await
                    })
                    .await;
                    if !matches!(closed, Ok(Ok(()))) {
                        tracing::debug!("transport did not shut down cleanly");
                    }
                    tracing::debug!("closed");
                    self.finish(None);
                    return;
                }
                Step::Read(Ok(0), _) => {
                    tracing::debug!("peer closed the connection");
                    let _ = shutdown_by(&mut transport, CLOSE_FLUSH_TIMEOUT).await;
                    self.finish(None);
                    return;
                }
                Step::Read(Ok(_), credit) => {
                    let data = buf.split().freeze();
                    self.emit_data(data, credit);
                    buf.reserve(READ_BUFFER_SIZE);
                }
                Step::Read(Err(e), _) => {
                    tracing::warn!(error = %e, "read failed");
                    self.finish(Some(e));
                    return;
                }
            }
        }
    }

    /// Wait for a data credit, then read. Without a consumer to hand credits
    /// back (the event stream was dropped) reads are not limited.
    async fn read_with_credit(
        &self,
        transport: &mut Transport,
        buf: &mut BytesMut,
    ) -> (Result<usize>, Option<OwnedSemaphorePermit>) {
        let credit = self.shared.data_credits.clone().acquire_owned().await.ok();
        (transport.read_buf(buf).await, credit)
    }

    fn record_peer(&self, transport: &Transport) {
        let mut peer = lock(&self.shared.peer);
        peer.local_addr = transport.local_addr();
        peer.remote_addr = transport.peer_addr();
        peer.fingerprint = transport.peer_fingerprint();
        peer.protocol = transport.protocol();
    }

    /// Connecting -> Connected/Secure, emitting the matching events.
    /// Returns false if the socket was closed meanwhile.
    fn mark_established(&self, secure: bool) -> bool {
        let mut lifecycle = lock(&self.shared.lifecycle);
        let next = if secure {
            SocketState::Secure
        } else {
            SocketState::Connected
        };
        if lifecycle.state.transition(next).is_err() {
            return false;
        }
        lifecycle.secure = secure;
        if let Some(events) = &lifecycle.events {
            let _ = events.send(SocketEvent::Connected);
            if secure {
                let _ = events.send(SocketEvent::SecureConnected);
            }
        }
        true
    }

    /// UpgradingToSecure -> Secure, emitting `SecureConnected`.
    fn mark_upgraded(&self) -> bool {
        let mut lifecycle = lock(&self.shared.lifecycle);
        if lifecycle.state.transition(SocketState::Secure).is_err() {
            return false;
        }
        lifecycle.secure = true;
        if let Some(events) = &lifecycle.events {
            let _ = events.send(SocketEvent::SecureConnected);
        }
        true
    }

    /// Emit received bytes unless the socket is closed. A delivered event keeps
    /// its credit until the consumer takes it off the stream.
    fn emit_data(&self, data: Bytes, credit: Option<OwnedSemaphorePermit>) {
        let lifecycle = lock(&self.shared.lifecycle);
        if lifecycle.state.is_terminal() {
            tracing::trace!(len = data.len(), "dropping data after close");
            return;
        }
        let delivered = lifecycle
            .events
            .as_ref()
            .is_some_and(|events| events.send(SocketEvent::Data(data)).is_ok());
        if let (true, Some(credit)) = (delivered, credit) {
            credit.forget();
        }
    }

    /// Emit the optional error and the final `Closed`, then end the event stream.
    fn finish(&self, error: Option<Error>) {
        let hooks = {
            let mut lifecycle = lock(&self.shared.lifecycle);
            let Some(events) = lifecycle.events.take() else {
                return;
            };

            let had_error = error.is_some();
            if !lifecycle.state.is_terminal() {
                lifecycle.state = if had_error {
                    SocketState::Errored
                } else {
                    SocketState::Closed
                };
            }
            if let Some(e) = error {
                let _ = events.send(SocketEvent::Error(e));
            }
            let _ = events.send(SocketEvent::Closed { had_error });

            std::mem::take(&mut *lock(&self.shared.close_hooks))
        };

        for hook in hooks {
            hook(self.shared.id);
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lifecycle = lock(&self.shared.lifecycle);
        f.debug_struct("Socket")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("state", &lifecycle.state)
            .field("secure", &lifecycle.secure)
            .finish()
    }
}

enum Step {
    Command(Option<Command>),
    Read(Result<usize>, Option<OwnedSemaphorePermit>),
}

fn check_upgradable(lifecycle: &Lifecycle) -> Result<()> {
    if lifecycle.secure {
        return Err(Error::Upgrade("socket is already secure".into()));
    }
    match lifecycle.state {
        SocketState::Connected => Ok(()),
        SocketState::UpgradingToSecure => {
            Err(Error::Upgrade("an upgrade is already in progress".into()))
        }
        other => Err(Error::Upgrade(format!(
            "socket is {}, expected connected",
            other
        ))),
    }
}

/// Compile a TLS configuration on the blocking pool; it may read files.
async fn compile_off_thread<T, F>(compile: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(compile)
        .await
        .map_err(|e| Error::Config(format!("TLS configuration task failed: {}", e)))?
}

async fn establish(request: &ConnectRequest, setup: Option<TlsSetup>) -> Result<Transport> {
    let handshake = match setup {
        Some(setup) => Some(setup.into_handshake().await?),
        None => None,
    };

    let transport = Transport::connect(&request.endpoint, request.timeout).await?;
    if request.no_delay {
        transport.set_nodelay(true)?;
    }

    match handshake {
        Some(handshake) => {
            let started = Instant::now();
            let transport = transport.upgrade_to_tls(handshake).await?;
            crate::metrics::histograms::handshake_duration(
                "client",
                started.elapsed().as_millis() as u64,
            );
            Ok(transport)
        }
        None => Ok(transport),
    }
}

pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|closed| *closed).await;
}

/// Resolves once `close` was requested and the flush deadline has passed.
async fn close_deadline(
    cancel: &mut watch::Receiver<bool>,
    deadline: &mut Option<tokio::time::Instant>,
) {
    cancelled(cancel).await;
    let at = *deadline.get_or_insert_with(|| tokio::time::Instant::now() + CLOSE_FLUSH_TIMEOUT);
    tokio::time::sleep_until(at).await;
}

async fn write_flushed(transport: &mut Transport, data: &[u8]) -> Result<()> {
    transport.write_all(data).await?;
    transport.flush().await
}

async fn shutdown_by(transport: &mut Transport, limit: Duration) -> Result<()> {
    tokio::time::timeout(limit, transport.shutdown())
        .await
        .map_err(|_| Error::Io(std::io::ErrorKind::TimedOut.into()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn next_event(events: &mut SocketEvents) -> SocketEvent {
        tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended")
    }

    #[test]
    fn test_socket_ids_are_unique() {
        let a = Socket::new();
        let b = Socket::new();
        assert_ne!(a.id(), b.id());
        assert!(a.same_socket(&a.clone()));
        assert!(!a.same_socket(&b));
    }

    #[test]
    fn test_new_socket_defaults() {
        let socket = Socket::new();
        assert_eq!(socket.state(), SocketState::Created);
        assert_eq!(socket.role(), Role::Client);
        assert!(!socket.is_secure());
        assert!(!socket.is_secure_pending());
        assert!(socket.local_addr().is_none());
    }

    #[test]
    fn test_events_taken_once() {
        let socket = Socket::new();
        assert!(socket.events().is_some());
        assert!(socket.events().is_none());
    }

    #[test]
    fn test_upgrade_before_connect_fails() {
        let socket = Socket::new();
        let err = socket.upgrade_to_secure(TlsOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Upgrade(_)));
        assert_eq!(socket.state(), SocketState::Created);
    }

    #[test]
    fn test_connect_without_runtime_fails() {
        let socket = Socket::new();
        let err = socket
            .connect(ConnectRequest::tcp("127.0.0.1", 1))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(socket.state(), SocketState::Created);
    }

    #[test]
    fn test_enable_tls_marks_secure_pending() {
        let socket = Socket::new();
        socket
            .enable_tls(TlsOptions::default())
            .expect("enable tls");
        assert!(socket.is_secure_pending());
        assert!(!socket.is_secure());
    }

    #[tokio::test]
    async fn test_close_unconnected_socket() {
        let socket = Socket::new();
        let mut events = socket.events().expect("events");

        socket.close().expect("close");
        assert_eq!(socket.state(), SocketState::Closed);
        assert!(matches!(
            next_event(&mut events).await,
            SocketEvent::Closed { had_error: false }
        ));
        assert!(events.recv().await.is_none());

        // Idempotent
        socket.close().expect("second close");
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let socket = Socket::new();
        socket.close().expect("close");
        assert!(matches!(socket.write("hello"), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let socket = Socket::new();
        socket
            .connect(ConnectRequest::tcp("127.0.0.1", port))
            .expect("connect");
        let err = socket
            .connect(ConnectRequest::tcp("127.0.0.1", port))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        socket.close().expect("close");
    }

    #[tokio::test]
    async fn test_connect_refused_emits_single_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let socket = Socket::new();
        let mut events = socket.events().expect("events");
        let returned = socket
            .connect(ConnectRequest::tcp("127.0.0.1", port))
            .expect("connect is accepted synchronously");
        assert!(returned.same_socket(&socket));

        assert!(matches!(
            next_event(&mut events).await,
            SocketEvent::Error(Error::Connection { .. })
        ));
        assert!(matches!(
            next_event(&mut events).await,
            SocketEvent::Closed { had_error: true }
        ));
        assert!(events.recv().await.is_none());
        assert_eq!(socket.state(), SocketState::Errored);
        assert!(matches!(socket.write("late"), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_plain_connect_and_receive() {
        use tokio::io::AsyncWriteExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let socket = Socket::new();
        let mut events = socket.events().expect("events");
        socket
            .connect(ConnectRequest::tcp("127.0.0.1", port).no_delay(true))
            .expect("connect");

        let (mut peer, _) = listener.accept().await.expect("accept");
        assert!(matches!(next_event(&mut events).await, SocketEvent::Connected));
        assert_eq!(socket.state(), SocketState::Connected);
        assert_eq!(socket.remote_addr().map(|a| a.port()), Some(port));

        peer.write_all(b"hello").await.expect("peer write");
        match next_event(&mut events).await {
            SocketEvent::Data(data) => assert_eq!(&data[..], b"hello"),
            other => panic!("expected data, got {:?}", other),
        }

        drop(peer);
        assert!(matches!(
            next_event(&mut events).await,
            SocketEvent::Closed { had_error: false }
        ));
        assert_eq!(socket.state(), SocketState::Closed);
    }

    #[tokio::test]
    async fn test_close_during_secure_connect_reports_closed() {
        // Accepts TCP but never answers the TLS handshake
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let socket = Socket::new();
        let mut events = socket.events().expect("events");
        let tls = TlsOptions::builder()
            .danger_accept_invalid_certs()
            .build()
            .expect("tls");
        socket.enable_tls(tls).expect("enable tls");
        socket
            .connect(ConnectRequest::tcp("127.0.0.1", port))
            .expect("connect");

        let (_peer, _) = listener.accept().await.expect("accept");
        socket.close().expect("close");

        assert!(matches!(
            next_event(&mut events).await,
            SocketEvent::Error(Error::Closed)
        ));
        assert!(matches!(
            next_event(&mut events).await,
            SocketEvent::Closed { had_error: true }
        ));
        assert!(events.recv().await.is_none());
        assert!(!socket.is_secure());
    }

    #[tokio::test]
    async fn test_on_close_hook_runs_once() {
        let socket = Socket::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hook_tx = tx.clone();
        socket.on_close(move |id| {
            let _ = hook_tx.send(id);
        });
        socket.close().expect("close");
        socket.close().expect("close again");

        assert_eq!(rx.recv().await, Some(socket.id()));
        // Registered after close: runs immediately
        socket.on_close(move |id| {
            let _ = tx.send(id);
        });
        assert_eq!(rx.recv().await, Some(socket.id()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_writes_before_connect_are_buffered() {
        let socket = Socket::new();
        socket.write("hello").expect("write");
        socket.write(Bytes::new()).expect("empty write");
        assert_eq!(socket.buffered_amount(), 5);
    }

    #[tokio::test]
    async fn test_closed_socket_rejects_connect_and_enable_tls() {
        let socket = Socket::new();
        socket.close().expect("close");

        let err = socket
            .connect(ConnectRequest::tcp("127.0.0.1", 1))
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
        assert!(matches!(
            socket.enable_tls(TlsOptions::default()),
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_undrained_events_push_back_on_peer() {
        use tokio::io::AsyncWriteExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let socket = Socket::new();
        let mut events = socket.events().expect("events");
        socket
            .connect(ConnectRequest::tcp("127.0.0.1", port))
            .expect("connect");
        let (mut peer, _) = listener.accept().await.expect("accept");
        assert!(matches!(next_event(&mut events).await, SocketEvent::Connected));

        // Far more than the kernel buffers plus the event credits can hold
        let payload = vec![7u8; 64 << 20];
        let sent =
            tokio::time::timeout(Duration::from_millis(500), peer.write_all(&payload)).await;
        assert!(sent.is_err(), "peer was never pushed back");

        // Draining lets the socket read again
        match next_event(&mut events).await {
            SocketEvent::Data(data) => assert!(data.iter().all(|b| *b == 7)),
            other => panic!("expected data, got {:?}", other),
        }

        socket.close().expect("close");
    }

    #[tokio::test]
    async fn test_close_with_stalled_peer_still_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let socket = Socket::new();
        let mut events = socket.events().expect("events");
        socket
            .connect(ConnectRequest::tcp("127.0.0.1", port))
            .expect("connect");
        // Never reads
        let (_peer, _) = listener.accept().await.expect("accept");
        assert!(matches!(next_event(&mut events).await, SocketEvent::Connected));

        socket.write(vec![0u8; 64 << 20]).expect("write");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(socket.buffered_amount() > 0);

        socket.close().expect("close");
        let closed = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT * 3, events.recv())
            .await
            .expect("close did not complete");
        assert!(matches!(
            closed,
            Some(SocketEvent::Closed { had_error: false })
        ));
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_during_upgrade_reports_closed() {
        // Accepts TCP but never answers the ClientHello
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let socket = Socket::new();
        let mut events = socket.events().expect("events");
        socket
            .connect(ConnectRequest::tcp("127.0.0.1", port))
            .expect("connect");
        let (_peer, _) = listener.accept().await.expect("accept");
        assert!(matches!(next_event(&mut events).await, SocketEvent::Connected));

        let tls = TlsOptions::builder()
            .danger_accept_invalid_certs()
            .build()
            .expect("tls");
        socket.upgrade_to_secure(tls).expect("upgrade");
        assert_eq!(socket.state(), SocketState::UpgradingToSecure);
        socket.close().expect("close");

        assert!(matches!(
            next_event(&mut events).await,
            SocketEvent::Error(Error::Closed)
        ));
        assert!(matches!(
            next_event(&mut events).await,
            SocketEvent::Closed { had_error: true }
        ));
        assert!(events.recv().await.is_none());
        assert!(!socket.is_secure());
        assert!(socket.protocol().is_none());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_connect_timeout_emits_connection_error() {
        // Accept queue of one, filled up: further SYNs are dropped
        let listener = tokio::net::TcpSocket::new_v4().expect("socket");
        listener
            .bind("127.0.0.1:0".parse().expect("addr"))
            .expect("bind");
        let listener = listener.listen(1).expect("listen");
        let addr = listener.local_addr().expect("addr");
        let mut backlog = Vec::new();
        for _ in 0..8 {
            let connect = tokio::net::TcpStream::connect(addr);
            let connected = tokio::time::timeout(Duration::from_millis(100), connect).await;
            if let Ok(Ok(stream)) = connected {
                backlog.push(stream);
            }
        }

        let socket = Socket::new();
        let mut events = socket.events().expect("events");
        socket
            .connect(
                ConnectRequest::tcp("127.0.0.1", addr.port()).timeout(Duration::from_millis(200)),
            )
            .expect("connect");

        match next_event(&mut events).await {
            SocketEvent::Error(Error::Connection { source, .. }) => {
                assert_eq!(source.kind(), std::io::ErrorKind::TimedOut)
            }
            other => panic!("expected connection timeout, got {:?}", other),
        }
        assert!(matches!(
            next_event(&mut events).await,
            SocketEvent::Closed { had_error: true }
        ));
        drop(backlog);
    }
}
