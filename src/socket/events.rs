//! Socket lifecycle notifications

use crate::Error;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Semaphore};

/// Notification emitted by a socket
#[derive(Debug)]
pub enum SocketEvent {
    /// Stream established. For secure-pending sockets this follows the TLS
    /// handshake and is immediately followed by `SecureConnected`.
    Connected,
    /// TLS session established (secure-pending connect or upgrade)
    SecureConnected,
    /// Bytes received from the peer
    Data(Bytes),
    /// Asynchronous failure; always followed by `Closed`
    Error(Error),
    /// Final notification; nothing follows it
    Closed {
        /// Whether the socket terminated because of an error
        had_error: bool,
    },
}

impl SocketEvent {
    /// Event name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            SocketEvent::Connected => "connected",
            SocketEvent::SecureConnected => "secure_connected",
            SocketEvent::Data(_) => "data",
            SocketEvent::Error(_) => "error",
            SocketEvent::Closed { .. } => "closed",
        }
    }
}

/// Ordered stream of a socket's events.
///
/// Events are buffered from the moment the socket is created, so taking the
/// stream late never loses notifications. The stream ends after `Closed`.
///
/// Only a few `Data` events are buffered at a time: the socket stops reading
/// from the network until the consumer catches up. Dropping the stream lifts
/// the limit and discards further data.
///
/// # Examples
///
/// ```ignore
/// use futures::StreamExt;
///
/// let mut events = socket.events().expect("events already taken");
/// while let Some(event) = events.next().await {
///     if let SocketEvent::Data(bytes) = event {
///         println!("received {} bytes", bytes.len());
///     }
/// }
/// ```
#[derive(Debug)]
pub struct SocketEvents {
    rx: mpsc::UnboundedReceiver<SocketEvent>,
    data_credits: Arc<Semaphore>,
}

impl SocketEvents {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<SocketEvent>,
        data_credits: Arc<Semaphore>,
    ) -> Self {
        Self { rx, data_credits }
    }

    /// Receive the next event, or `None` once the socket has closed.
    pub async fn recv(&mut self) -> Option<SocketEvent> {
        let event = self.rx.recv().await;
        self.consumed(event.as_ref());
        event
    }

    fn consumed(&self, event: Option<&SocketEvent>) {
        if let Some(SocketEvent::Data(_)) = event {
            self.data_credits.add_permits(1);
        }
    }
}

impl Stream for SocketEvents {
    type Item = SocketEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(event) = &polled {
            self.consumed(event.as_ref());
        }
        polled
    }
}

impl Drop for SocketEvents {
    fn drop(&mut self) {
        self.data_credits.close();
    }
}
