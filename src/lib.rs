//! tls-sockets: TLS-capable stream sockets for tokio
//!
//! A small facade over plain and TLS-secured stream connections:
//!
//! * [`create_server`] starts a TCP server whose accepted sockets can be
//!   upgraded to TLS in place
//! * [`connect`] dials a TLS connection, or upgrades an existing plaintext
//!   socket without changing its identity
//! * [`is_ip`], [`is_ipv4`], [`is_ipv6`] classify address strings
//!
//! Every [`Socket`] reports its lifecycle on an ordered event stream
//! (`Connected`, `SecureConnected`, `Data`, `Error`, `Closed`).
//!
//! ```ignore
//! use tls_sockets::{connect, SocketEvent, TlsOptions, ConnectOptions};
//!
//! let tls = TlsOptions::builder().server_name("example.com").build()?;
//! let socket = connect(ConnectOptions::new().host("example.com").port(443).tls(tls))?;
//! let mut events = socket.events().expect("events");
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SocketEvent::SecureConnected => socket.write("ping\n")?,
//!         SocketEvent::Data(bytes) => println!("{:?}", bytes),
//!         _ => {}
//!     }
//! }
//! ```

pub mod address;
pub mod error;
pub mod factory;
pub mod metrics;
pub mod server;
pub mod socket;

pub use address::{classify, is_ip, is_ipv4, is_ipv6, AddressKind};
pub use error::{Error, Result};
pub use factory::{connect, connect as create_connection, ConnectArgs, ConnectOptions};
pub use server::{Server, ServerEvent, ServerOptions, ServerState};
pub use socket::{
    Socket, SocketEvent, SocketEvents, SocketId, SocketState, TlsOptions, TlsVersion, VerifyMode,
};

/// Create a TCP server; `listener` runs once for every accepted socket.
///
/// The server does nothing until [`Server::listen`] is called.
pub fn create_server(listener: impl Fn(Socket) + Send + Sync + 'static) -> Server {
    Server::new(listener)
}
