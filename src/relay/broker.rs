// Broker loop and message dispatcher

use crate::relay::channel::Channel;
use crate::relay::config::Limits;
use crate::relay::error::{Interrupted, TransportError};
use crate::relay::message::{ConnectionId, Message};
use crate::relay::outbox::WriteOutcome;
use crate::relay::registry::Registry;
use crate::relay::transport::{LoopWaker, Transport, TransportEvent, TransportHandle};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// User callback receiving inbound messages
pub type MessageCallback = Arc<dyn Fn(ConnectionId, &[u8]) + Send + Sync>;

/// State of one broker run, from `start` to `stop`
pub(crate) struct Session {
    pub(crate) running: AtomicBool,
    pub(crate) registry: Registry,
    pub(crate) incoming: Channel<Message>,
    pub(crate) outgoing: Channel<Message>,
    waker: Option<Arc<dyn LoopWaker>>,
}

impl Session {
    pub(crate) fn new(limits: &Limits, waker: Option<Arc<dyn LoopWaker>>) -> Self {
        Self {
            running: AtomicBool::new(false),
            registry: Registry::new(limits.max_clients),
            incoming: Channel::new(limits.queue_capacity),
            outgoing: Channel::new(limits.queue_capacity),
            waker,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Interrupt the transport wait of the broker loop
    pub(crate) fn wake(&self) {
        if let Some(waker) = &self.waker {
            waker.wake();
        }
    }
}

/// State shared by the broker, its handles and its threads
pub(crate) struct Core {
    session: RwLock<Arc<Session>>,
    callback: RwLock<Option<MessageCallback>>,
}

impl Core {
    pub(crate) fn new(limits: &Limits) -> Self {
        Self {
            session: RwLock::new(Arc::new(Session::new(limits, None))),
            callback: RwLock::new(None),
        }
    }

    pub(crate) fn session(&self) -> Arc<Session> {
        self.session.read().clone()
    }

    pub(crate) fn replace_session(&self, session: Arc<Session>) {
        *self.session.write() = session;
    }

    pub(crate) fn callback(&self) -> Option<MessageCallback> {
        self.callback.read().clone()
    }

    pub(crate) fn set_callback(&self, callback: Option<MessageCallback>) {
        *self.callback.write() = callback;
    }
}

/// The single thread that owns the transport and every connection's
/// inbox and outbox.
pub(crate) struct BrokerLoop<T: Transport> {
    transport: T,
    core: Arc<Core>,
    session: Arc<Session>,
    handles: HashMap<TransportHandle, ConnectionId>,
    limits: Limits,
    events: Vec<TransportEvent>,
}

impl<T: Transport> BrokerLoop<T> {
    pub(crate) fn new(transport: T, core: Arc<Core>, session: Arc<Session>, limits: Limits) -> Self {
        Self {
            transport,
            core,
            session,
            handles: HashMap::new(),
            limits,
            events: Vec::new(),
        }
    }

    /// Run until the session stops or the transport fails
    pub(crate) fn run(mut self) {
        tracing::info!("Broker loop started");

        let dispatcher = self.spawn_dispatcher();

        while self.session.is_running() {
            if let Err(e) = self.turn() {
                tracing::error!("Broker loop stopping: {}", e);
                break;
            }
        }

        tracing::info!("Broker loop releasing transport");
        self.transport.shutdown();
        self.session.running.store(false, Ordering::Release);
        self.session.registry.clear();
        self.handles.clear();

        if let Some(dispatcher) = dispatcher {
            tracing::debug!("Waiting for dispatcher to exit");
            self.session.incoming.interrupt();
            if dispatcher.join().is_err() {
                tracing::error!("Dispatcher thread panicked");
            }
        }

        tracing::info!("Broker loop stopped");
    }

    /// One iteration: deliver transport events, then fan out queued messages
    pub(crate) fn turn(&mut self) -> Result<(), TransportError> {
        let mut events = std::mem::take(&mut self.events);
        let polled = self.transport.poll(self.limits.poll_interval(), &mut events);

        for event in events.drain(..) {
            self.handle_event(event);
        }
        self.events = events;
        polled?;

        self.fan_out();
        Ok(())
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(handle) => self.on_connected(handle),
            TransportEvent::Disconnected(handle) => self.on_disconnected(handle),
            TransportEvent::Readable {
                handle,
                data,
                first,
                last,
            } => self.on_readable(handle, &data, first, last),
            TransportEvent::Writable(handle) => self.on_writable(handle),
        }
    }

    fn on_connected(&mut self, handle: TransportHandle) {
        match self.session.registry.admit(handle) {
            Ok(id) => {
                self.handles.insert(handle, id);
                tracing::info!(
                    "Client {} connected ({} clients)",
                    id,
                    self.session.registry.len()
                );
            }
            Err(e) => {
                tracing::warn!("Rejecting connection {}: {}", handle, e);
                self.transport.close(handle);
            }
        }
    }

    fn on_disconnected(&mut self, handle: TransportHandle) {
        if let Some(id) = self.handles.remove(&handle) {
            self.session.registry.evict(id);
            tracing::info!(
                "Client {} disconnected ({} clients)",
                id,
                self.session.registry.len()
            );
        }
    }

    fn on_readable(&mut self, handle: TransportHandle, data: &[u8], first: bool, last: bool) {
        let Some(&id) = self.handles.get(&handle) else {
            return;
        };

        tracing::debug!(
            "RX from {}: len={} first={} final={}",
            id,
            data.len(),
            first,
            last
        );

        let complete = self
            .session
            .registry
            .with_connection(id, |conn| {
                if first {
                    conn.inbox.clear();
                }
                conn.inbox.extend_from_slice(data);
                last.then(|| std::mem::take(&mut conn.inbox))
            })
            .flatten();

        if let Some(payload) = complete {
            let len = payload.len();
            if !self
                .session
                .incoming
                .offer_timeout(Message::new(id, payload), Duration::ZERO)
            {
                tracing::warn!(
                    "Incoming queue full; discarding {} byte message from {}",
                    len,
                    id
                );
            }
        }
    }

    fn on_writable(&mut self, handle: TransportHandle) {
        let Some(&id) = self.handles.get(&handle) else {
            return;
        };

        let max_chunk = self.limits.max_chunk;
        let Some(chunk) = self
            .session
            .registry
            .with_connection(id, |conn| conn.outbox.next_chunk(max_chunk))
            .flatten()
        else {
            // Nothing pending
            return;
        };

        let accepted = match self.transport.write(handle, &chunk) {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Write to client {} failed: {}", id, e);
                self.abort(handle, id);
                return;
            }
        };

        tracing::debug!(
            "TX to {}: len={} accepted={} first={} final={}",
            id,
            chunk.len(),
            accepted,
            chunk.first,
            chunk.last
        );

        let outcome = self
            .session
            .registry
            .with_connection(id, |conn| conn.outbox.complete(&chunk, accepted));

        match outcome {
            Some(WriteOutcome::Continue) => self.transport.request_writable(handle),
            Some(WriteOutcome::Rejected) => {
                let err = TransportError::ShortWrite {
                    handle,
                    written: accepted,
                    expected: chunk.len(),
                };
                tracing::error!("Aborting client {}: {}", id, err);
                self.abort(handle, id);
            }
            Some(WriteOutcome::Done) | None => {}
        }
    }

    /// Drain the outbound queue into idle connections
    fn fan_out(&mut self) {
        while let Some(message) = self.session.outgoing.take_timeout(Duration::ZERO) {
            let scheduled = self.session.registry.assign(&message);
            if scheduled.is_empty() {
                tracing::debug!(
                    "No idle connection for message to {}; dropped",
                    message.connection_id
                );
            }
            for handle in scheduled {
                self.transport.request_writable(handle);
            }
        }
    }

    /// Close the connection and drop its state, pending outbox included
    fn abort(&mut self, handle: TransportHandle, id: ConnectionId) {
        self.session
            .registry
            .with_connection(id, |conn| conn.outbox.clear());
        self.transport.close(handle);
        self.handles.remove(&handle);
        self.session.registry.evict(id);
    }

    fn spawn_dispatcher(&self) -> Option<JoinHandle<()>> {
        self.core.callback()?;

        let core = self.core.clone();
        let session = self.session.clone();
        match thread::Builder::new()
            .name("wsrelay-dispatch".into())
            .spawn(move || dispatch(core, session))
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!("Failed to start dispatcher thread: {}", e);
                None
            }
        }
    }
}

/// Deliver inbound messages to the user callback until shutdown
fn dispatch(core: Arc<Core>, session: Arc<Session>) {
    tracing::info!("Dispatcher thread started");

    while session.is_running() && core.callback().is_some() {
        match session.incoming.take() {
            Ok(message) => {
                let Some(callback) = core.callback() else {
                    tracing::warn!(
                        "Callback removed; dropping message from {}",
                        message.connection_id
                    );
                    break;
                };
                let delivered = catch_unwind(AssertUnwindSafe(|| {
                    callback(message.connection_id, &message.payload)
                }));
                if delivered.is_err() {
                    tracing::error!("Message callback panicked");
                }
            }
            Err(Interrupted) => tracing::debug!("Dispatcher interrupted"),
        }
    }

    tracing::info!("Dispatcher thread exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::outbox::Chunk;
    use crate::relay::transport::{LoopbackController, LoopbackTransport};

    fn setup(limits: Limits) -> (BrokerLoop<LoopbackTransport>, LoopbackController, Arc<Session>) {
        let (transport, controller) = LoopbackTransport::new();
        let core = Arc::new(Core::new(&limits));
        let session = Arc::new(Session::new(&limits, Some(transport.waker())));
        session.running.store(true, Ordering::Release);
        let broker = BrokerLoop::new(transport, core, session.clone(), limits);
        (broker, controller, session)
    }

    fn fast_limits() -> Limits {
        Limits {
            poll_interval_ms: 1,
            ..Default::default()
        }
    }

    fn turns(broker: &mut BrokerLoop<LoopbackTransport>, n: usize) {
        for _ in 0..n {
            broker.turn().unwrap();
        }
    }

    #[test]
    fn test_fragments_reassembled() {
        let (mut broker, controller, session) = setup(fast_limits());
        let handle = controller.connect();
        controller.send_fragment(handle, b"hel", true, false);
        controller.send_fragment(handle, b"lo", false, true);
        turns(&mut broker, 1);

        let id = session.registry.ids()[0];
        let message = session.incoming.take_timeout(Duration::ZERO).unwrap();
        assert_eq!(message.connection_id, id);
        assert_eq!(&message.payload[..], b"hello");
    }

    #[test]
    fn test_first_fragment_resets_inbox() {
        let (mut broker, controller, session) = setup(fast_limits());
        let handle = controller.connect();
        controller.send_fragment(handle, b"stale", true, false);
        controller.send_fragment(handle, b"fresh", true, true);
        turns(&mut broker, 1);

        let message = session.incoming.take_timeout(Duration::ZERO).unwrap();
        assert_eq!(&message.payload[..], b"fresh");
    }

    #[test]
    fn test_rejects_over_capacity() {
        let limits = Limits {
            max_clients: 1,
            ..fast_limits()
        };
        let (mut broker, controller, session) = setup(limits);
        let first = controller.connect();
        let second = controller.connect();
        turns(&mut broker, 1);

        assert_eq!(session.registry.len(), 1);
        assert!(!controller.is_closed(first));
        assert!(controller.is_closed(second));
    }

    #[test]
    fn test_disconnect_evicts() {
        let (mut broker, controller, session) = setup(fast_limits());
        let handle = controller.connect();
        turns(&mut broker, 1);
        assert_eq!(session.registry.len(), 1);

        controller.disconnect(handle);
        turns(&mut broker, 1);
        assert!(session.registry.is_empty());
    }

    #[test]
    fn test_chunked_write() {
        let limits = Limits {
            max_chunk: 4,
            ..fast_limits()
        };
        let (mut broker, controller, session) = setup(limits);
        let handle = controller.connect();
        turns(&mut broker, 1);

        session.outgoing.offer(Message::broadcast("0123456789")).unwrap();
        turns(&mut broker, 5);

        let frames = controller.frames(handle);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].data, b"0123");
        assert!(frames[0].first && !frames[0].last);
        assert_eq!(frames[2].data, b"89");
        assert!(!frames[2].first && frames[2].last);
        assert_eq!(controller.messages(handle), vec![b"0123456789".to_vec()]);
        assert!(!session.registry.lookup(session.registry.ids()[0]).unwrap().sending);
    }

    #[test]
    fn test_unicast_reaches_only_target() {
        let (mut broker, controller, session) = setup(fast_limits());
        let a = controller.connect();
        let b = controller.connect();
        turns(&mut broker, 1);

        let target = broker.handles[&b];
        session.outgoing.offer(Message::new(target, "for b")).unwrap();
        turns(&mut broker, 3);

        assert!(controller.messages(a).is_empty());
        assert_eq!(controller.messages(b), vec![b"for b".to_vec()]);
    }

    #[test]
    fn test_broadcast_skips_sending_connection() {
        let (mut broker, controller, session) = setup(fast_limits());
        let held = controller.connect();
        let free = controller.connect();
        turns(&mut broker, 1);

        controller.pause(held);
        session.outgoing.offer(Message::broadcast("one")).unwrap();
        turns(&mut broker, 2);
        assert_eq!(controller.messages(free), vec![b"one".to_vec()]);

        session.outgoing.offer(Message::broadcast("two")).unwrap();
        turns(&mut broker, 2);
        assert_eq!(controller.messages(free), vec![b"one".to_vec(), b"two".to_vec()]);

        controller.resume(held);
        turns(&mut broker, 2);
        assert_eq!(controller.messages(held), vec![b"one".to_vec()]);
    }

    #[test]
    fn test_short_write_aborts_connection() {
        let (mut broker, controller, session) = setup(fast_limits());
        let bad = controller.connect();
        let good = controller.connect();
        turns(&mut broker, 1);

        controller.limit_writes(bad, Some(2));
        session.outgoing.offer(Message::broadcast("payload")).unwrap();
        turns(&mut broker, 3);

        assert!(controller.is_closed(bad));
        assert_eq!(session.registry.len(), 1);
        assert_eq!(controller.messages(good), vec![b"payload".to_vec()]);
    }

    /// Loopback transport whose writes always fail
    struct FailingWrites(LoopbackTransport);

    impl Transport for FailingWrites {
        fn poll(
            &mut self,
            timeout: Duration,
            events: &mut Vec<TransportEvent>,
        ) -> Result<(), TransportError> {
            self.0.poll(timeout, events)
        }

        fn request_writable(&mut self, handle: TransportHandle) {
            self.0.request_writable(handle)
        }

        fn write(&mut self, handle: TransportHandle, _chunk: &Chunk) -> Result<usize, TransportError> {
            Err(TransportError::Closed(handle))
        }

        fn close(&mut self, handle: TransportHandle) {
            self.0.close(handle)
        }

        fn waker(&self) -> Arc<dyn LoopWaker> {
            self.0.waker()
        }

        fn shutdown(&mut self) {
            self.0.shutdown()
        }
    }

    #[test]
    fn test_failed_write_aborts_even_for_empty_payload() {
        let limits = fast_limits();
        let (transport, controller) = LoopbackTransport::new();
        let transport = FailingWrites(transport);
        let core = Arc::new(Core::new(&limits));
        let session = Arc::new(Session::new(&limits, Some(transport.waker())));
        session.running.store(true, Ordering::Release);
        let mut broker = BrokerLoop::new(transport, core, session.clone(), limits);

        let handle = controller.connect();
        broker.turn().unwrap();
        assert_eq!(session.registry.len(), 1);

        session.outgoing.offer(Message::broadcast("")).unwrap();
        for _ in 0..3 {
            broker.turn().unwrap();
        }

        assert!(session.registry.is_empty());
        assert!(controller.is_closed(handle));
    }

    #[test]
    fn test_full_incoming_queue_drops() {
        let limits = Limits {
            queue_capacity: 1,
            ..fast_limits()
        };
        let (mut broker, controller, session) = setup(limits);
        let handle = controller.connect();
        controller.send(handle, b"kept");
        controller.send(handle, b"dropped");
        turns(&mut broker, 1);

        assert_eq!(session.incoming.len(), 1);
        let message = session.incoming.take_timeout(Duration::ZERO).unwrap();
        assert_eq!(&message.payload[..], b"kept");
    }
}
