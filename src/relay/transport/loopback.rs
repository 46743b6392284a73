// In-process transport for embedding and tests

use crate::relay::channel::wait_deadline;
use crate::relay::error::TransportError;
use crate::relay::outbox::Chunk;
use crate::relay::transport::{LoopWaker, Transport, TransportEvent, TransportHandle};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A chunk as the loopback peer received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFrame {
    pub data: Vec<u8>,
    pub first: bool,
    pub last: bool,
}

#[derive(Default)]
struct Peer {
    frames: Vec<WrittenFrame>,
    write_limit: Option<usize>,
    paused: bool,
    closed: bool,
}

#[derive(Default)]
struct LoopbackState {
    next_handle: u64,
    events: VecDeque<TransportEvent>,
    writable: Vec<TransportHandle>,
    peers: HashMap<TransportHandle, Peer>,
    woken: bool,
    shut_down: bool,
}

impl LoopbackState {
    fn collect(&mut self, events: &mut Vec<TransportEvent>) {
        events.extend(self.events.drain(..));

        let peers = &self.peers;
        let mut ready = Vec::new();
        self.writable.retain(|handle| match peers.get(handle) {
            Some(peer) if peer.closed => false,
            Some(peer) if peer.paused => true,
            Some(_) => {
                ready.push(*handle);
                false
            }
            None => false,
        });
        events.extend(ready.into_iter().map(TransportEvent::Writable));
    }
}

struct Inner {
    state: Mutex<LoopbackState>,
    cond: Condvar,
}

impl Inner {
    fn push_event(&self, event: TransportEvent) {
        let mut state = self.state.lock();
        state.events.push_back(event);
        self.cond.notify_all();
    }
}

struct LoopbackWaker {
    inner: Arc<Inner>,
}

impl LoopWaker for LoopbackWaker {
    fn wake(&self) {
        let mut state = self.inner.state.lock();
        state.woken = true;
        self.inner.cond.notify_all();
    }
}

/// Transport whose "network" is a [`LoopbackController`] in the same process
pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

impl LoopbackTransport {
    /// Create a transport and the controller that plays the remote peers
    pub fn new() -> (Self, LoopbackController) {
        let inner = Arc::new(Inner {
            state: Mutex::new(LoopbackState::default()),
            cond: Condvar::new(),
        });

        (
            Self {
                inner: inner.clone(),
            },
            LoopbackController { inner },
        )
    }
}

impl Transport for LoopbackTransport {
    fn poll(
        &mut self,
        timeout: Duration,
        events: &mut Vec<TransportEvent>,
    ) -> Result<(), TransportError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.state.lock();

        loop {
            state.collect(events);
            if !events.is_empty() || state.woken || state.shut_down {
                state.woken = false;
                return Ok(());
            }
            if wait_deadline(&self.inner.cond, &mut state, deadline) {
                state.collect(events);
                state.woken = false;
                return Ok(());
            }
        }
    }

    fn request_writable(&mut self, handle: TransportHandle) {
        let mut state = self.inner.state.lock();
        if !state.writable.contains(&handle) {
            state.writable.push(handle);
        }
    }

    fn write(&mut self, handle: TransportHandle, chunk: &Chunk) -> Result<usize, TransportError> {
        let mut state = self.inner.state.lock();
        let peer = match state.peers.get_mut(&handle) {
            Some(peer) if !peer.closed => peer,
            _ => return Err(TransportError::Closed(handle)),
        };

        let accepted = peer
            .write_limit
            .map_or(chunk.len(), |limit| limit.min(chunk.len()));
        peer.frames.push(WrittenFrame {
            data: chunk.data[..accepted].to_vec(),
            first: chunk.first,
            last: chunk.last,
        });
        self.inner.cond.notify_all();

        Ok(accepted)
    }

    fn close(&mut self, handle: TransportHandle) {
        let mut state = self.inner.state.lock();
        if let Some(peer) = state.peers.get_mut(&handle) {
            peer.closed = true;
        }
        state.writable.retain(|h| *h != handle);
        self.inner.cond.notify_all();
    }

    fn waker(&self) -> Arc<dyn LoopWaker> {
        Arc::new(LoopbackWaker {
            inner: self.inner.clone(),
        })
    }

    fn shutdown(&mut self) {
        let mut state = self.inner.state.lock();
        state.shut_down = true;
        state.writable.clear();
        for peer in state.peers.values_mut() {
            peer.closed = true;
        }
        self.inner.cond.notify_all();
    }
}

/// Drives the peers of a [`LoopbackTransport`]
#[derive(Clone)]
pub struct LoopbackController {
    inner: Arc<Inner>,
}

impl LoopbackController {
    /// Open a new connection and return its handle
    pub fn connect(&self) -> TransportHandle {
        let handle = {
            let mut state = self.inner.state.lock();
            state.next_handle += 1;
            let handle = TransportHandle(state.next_handle);
            state.peers.insert(handle, Peer::default());
            handle
        };
        self.inner.push_event(TransportEvent::Connected(handle));
        handle
    }

    /// Close a connection from the peer side
    pub fn disconnect(&self, handle: TransportHandle) {
        {
            let mut state = self.inner.state.lock();
            if let Some(peer) = state.peers.get_mut(&handle) {
                peer.closed = true;
            }
        }
        self.inner.push_event(TransportEvent::Disconnected(handle));
    }

    /// Deliver a complete message
    pub fn send(&self, handle: TransportHandle, data: impl AsRef<[u8]>) {
        self.send_fragment(handle, data, true, true);
    }

    /// Deliver one fragment of a message
    pub fn send_fragment(&self, handle: TransportHandle, data: impl AsRef<[u8]>, first: bool, last: bool) {
        self.inner.push_event(TransportEvent::Readable {
            handle,
            data: data.as_ref().to_vec(),
            first,
            last,
        });
    }

    /// Withhold writable notifications for `handle`
    pub fn pause(&self, handle: TransportHandle) {
        if let Some(peer) = self.inner.state.lock().peers.get_mut(&handle) {
            peer.paused = true;
        }
    }

    /// Resume writable notifications for `handle`
    pub fn resume(&self, handle: TransportHandle) {
        let mut state = self.inner.state.lock();
        if let Some(peer) = state.peers.get_mut(&handle) {
            peer.paused = false;
        }
        self.inner.cond.notify_all();
    }

    /// Accept at most `limit` bytes per write on `handle`
    pub fn limit_writes(&self, handle: TransportHandle, limit: Option<usize>) {
        if let Some(peer) = self.inner.state.lock().peers.get_mut(&handle) {
            peer.write_limit = limit;
        }
    }

    /// Whether the connection was closed by either side
    pub fn is_closed(&self, handle: TransportHandle) -> bool {
        self.inner
            .state
            .lock()
            .peers
            .get(&handle)
            .map_or(true, |peer| peer.closed)
    }

    /// Every chunk written to `handle` so far
    pub fn frames(&self, handle: TransportHandle) -> Vec<WrittenFrame> {
        self.inner
            .state
            .lock()
            .peers
            .get(&handle)
            .map(|peer| peer.frames.clone())
            .unwrap_or_default()
    }

    /// Complete messages written to `handle`, reassembled from their chunks
    pub fn messages(&self, handle: TransportHandle) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        let mut current = Vec::new();
        for frame in self.frames(handle) {
            if frame.first {
                current.clear();
            }
            current.extend_from_slice(&frame.data);
            if frame.last {
                messages.push(std::mem::take(&mut current));
            }
        }
        messages
    }

    /// Wait until `handle` has received `count` complete messages
    pub fn wait_for_messages(&self, handle: TransportHandle, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.messages(handle).len() >= count {
                return true;
            }
            let mut state = self.inner.state.lock();
            if wait_deadline(&self.inner.cond, &mut state, deadline) {
                drop(state);
                return self.messages(handle).len() >= count;
            }
        }
    }
}
