//! Socket management
//!
//! This module handles:
//! * Transport abstraction (TCP vs Unix socket, plain vs TLS)
//! * Socket lifecycle (connect, upgrade, close)
//! * State machine enforcement
//! * TLS options and their compilation for rustls

mod events;
mod request;
#[allow(clippy::module_inception)]
mod socket;
mod state;
mod tls;
mod transport;

pub use events::{SocketEvent, SocketEvents};
pub use request::{ConnectRequest, Endpoint};
pub use socket::{Role, Socket, SocketId, WeakSocket};
pub(crate) use socket::{cancelled, lock};
pub use state::SocketState;
pub use tls::{resolve_server_name, TlsOptions, TlsOptionsBuilder, TlsVersion, VerifyMode};
pub(crate) use transport::Transport;
