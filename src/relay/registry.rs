// Connection registry with admission control

use crate::relay::error::BrokerError;
use crate::relay::message::{ConnectionId, Message};
use crate::relay::outbox::Outbox;
use crate::relay::transport::TransportHandle;
use parking_lot::Mutex;
use std::collections::HashMap;

/// State of one admitted connection.
///
/// `inbox` and `outbox` are only touched by the broker loop thread.
pub(crate) struct Connection {
    pub id: ConnectionId,
    pub handle: TransportHandle,
    pub(crate) inbox: Vec<u8>,
    pub(crate) outbox: Outbox,
}

impl Connection {
    fn new(id: ConnectionId, handle: TransportHandle) -> Self {
        Self {
            id,
            handle,
            inbox: Vec::new(),
            outbox: Outbox::new(),
        }
    }
}

/// Read-only view of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub handle: TransportHandle,
    pub sending: bool,
}

struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    next_id: u32,
}

impl Inner {
    fn allocate_id(&mut self) -> ConnectionId {
        loop {
            if self.next_id == 0 {
                self.next_id = 1;
            }
            let id = ConnectionId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            if !self.connections.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Capacity-bounded map of live connections
pub struct Registry {
    inner: Mutex<Inner>,
    max_capacity: usize,
}

impl Registry {
    /// Create a registry admitting at most `max_capacity` connections
    pub fn new(max_capacity: usize) -> Self {
        Self::with_first_id(max_capacity, 1)
    }

    pub(crate) fn with_first_id(max_capacity: usize, first_id: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                connections: HashMap::new(),
                next_id: first_id,
            }),
            max_capacity,
        }
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Admit a connection and assign it a fresh id
    pub fn admit(&self, handle: TransportHandle) -> Result<ConnectionId, BrokerError> {
        let mut inner = self.inner.lock();

        if inner.connections.len() >= self.max_capacity {
            return Err(BrokerError::AdmissionRejected {
                capacity: self.max_capacity,
            });
        }

        let id = inner.allocate_id();
        inner.connections.insert(id, Connection::new(id, handle));
        Ok(id)
    }

    /// Snapshot of a connection, if it exists
    pub fn lookup(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.inner.lock().connections.get(&id).map(|conn| ConnectionInfo {
            id: conn.id,
            handle: conn.handle,
            sending: conn.outbox.is_sending(),
        })
    }

    /// Remove a connection. Returns whether it existed.
    pub fn evict(&self, id: ConnectionId) -> bool {
        self.inner.lock().connections.remove(&id).is_some()
    }

    /// Run `f` on a connection while holding the registry lock
    pub(crate) fn with_connection<R>(&self, id: ConnectionId, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        self.inner.lock().connections.get_mut(&id).map(f)
    }

    /// Assign an outbound message to every eligible idle connection.
    ///
    /// Connections still sending a previous payload are skipped. Returns the
    /// handles that need a writable notification.
    pub fn assign(&self, message: &Message) -> Vec<TransportHandle> {
        let mut inner = self.inner.lock();
        let mut scheduled = Vec::new();

        for conn in inner.connections.values_mut() {
            if !message.is_for(conn.id) {
                continue;
            }
            if !conn.outbox.assign(message.payload.clone()) {
                tracing::debug!("Connection {} busy sending; skipping", conn.id);
                continue;
            }
            scheduled.push(conn.handle);
        }

        scheduled
    }

    /// Number of admitted connections
    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().connections.is_empty()
    }

    /// Ids of all admitted connections
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.inner.lock().connections.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Drop every connection
    pub fn clear(&self) {
        self.inner.lock().connections.clear();
    }
}
