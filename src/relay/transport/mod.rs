// Boundary between the broker loop and the network

pub mod loopback;
pub mod websocket;

use crate::relay::error::TransportError;
use crate::relay::outbox::Chunk;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub use loopback::{LoopbackController, LoopbackTransport, WrittenFrame};
pub use websocket::WebSocketTransport;

/// Opaque transport-side handle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportHandle(pub u64);

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Notifications delivered to the broker loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A client finished its handshake
    Connected(TransportHandle),
    /// A client went away
    Disconnected(TransportHandle),
    /// A fragment of an inbound message arrived
    Readable {
        handle: TransportHandle,
        data: Vec<u8>,
        first: bool,
        last: bool,
    },
    /// The connection can take another chunk
    Writable(TransportHandle),
}

/// Wakes a broker loop parked in [`Transport::poll`]. Callable from any thread.
pub trait LoopWaker: Send + Sync {
    fn wake(&self);
}

/// Event source and sink driven exclusively by the broker loop thread
pub trait Transport: Send + 'static {
    /// Wait up to `timeout` for events and append them to `events`.
    ///
    /// Returns early when woken. An error means the transport as a whole is
    /// unusable and the broker loop stops.
    fn poll(
        &mut self,
        timeout: Duration,
        events: &mut Vec<TransportEvent>,
    ) -> Result<(), TransportError>;

    /// Ask for a [`TransportEvent::Writable`] for `handle`
    fn request_writable(&mut self, handle: TransportHandle);

    /// Hand one chunk to the connection. Returns the number of bytes accepted.
    fn write(&mut self, handle: TransportHandle, chunk: &Chunk) -> Result<usize, TransportError>;

    /// Abort a connection
    fn close(&mut self, handle: TransportHandle);

    /// Handle that interrupts a pending [`Transport::poll`]
    fn waker(&self) -> Arc<dyn LoopWaker>;

    /// Address of the plain listener, if the transport has one
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Release all resources. Called once by the broker loop on exit.
    fn shutdown(&mut self);
}
