// Message and connection identifier types

use bytes::Bytes;
use std::fmt;

/// Identifier of a connection admitted by the registry.
///
/// Id `0` is reserved: on an outbound message it means "every connection".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    /// Target id addressing every connection
    pub const BROADCAST: ConnectionId = ConnectionId(0);

    /// Whether this id addresses every connection
    pub fn is_broadcast(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ConnectionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// A message travelling through the relay.
///
/// Inbound messages carry the id of the connection they came from; outbound
/// messages carry their target ([`ConnectionId::BROADCAST`] for fan-out).
/// The payload is reference counted so fan-out shares one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub connection_id: ConnectionId,
    pub payload: Bytes,
}

impl Message {
    /// Create a new message
    pub fn new(connection_id: ConnectionId, payload: impl Into<Bytes>) -> Self {
        Self {
            connection_id,
            payload: payload.into(),
        }
    }

    /// Create a message addressed to every connection
    pub fn broadcast(payload: impl Into<Bytes>) -> Self {
        Self::new(ConnectionId::BROADCAST, payload)
    }

    /// Payload as UTF-8 text, if it is valid
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Whether this outbound message should be assigned to `id`
    pub fn is_for(&self, id: ConnectionId) -> bool {
        self.connection_id.is_broadcast() || self.connection_id == id
    }
}
