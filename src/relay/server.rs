// Public broker API: configuration, lifecycle, send and receive

use crate::relay::broker::{BrokerLoop, Core, MessageCallback, Session};
use crate::relay::config::BrokerConfig;
use crate::relay::error::BrokerError;
use crate::relay::message::{ConnectionId, Message};
use crate::relay::transport::{Transport, WebSocketTransport};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Cloneable handle for talking to a broker from any thread
#[derive(Clone)]
pub struct BrokerHandle {
    core: Arc<Core>,
}

impl BrokerHandle {
    /// Queue a message for delivery to `target` (or every connection for
    /// [`ConnectionId::BROADCAST`]).
    ///
    /// Never blocks. Fails with [`BrokerError::Stopped`] if the broker is not
    /// running and [`BrokerError::ChannelFull`] if the outgoing queue is full.
    pub fn try_send(&self, payload: impl Into<Bytes>, target: ConnectionId) -> Result<(), BrokerError> {
        let session = self.core.session();
        if !session.is_running() {
            return Err(BrokerError::Stopped);
        }

        if !session
            .outgoing
            .offer_timeout(Message::new(target, payload), Duration::ZERO)
        {
            tracing::debug!("Outgoing queue full; message to {} refused", target);
            return Err(BrokerError::ChannelFull);
        }
        session.wake();
        Ok(())
    }

    /// Like [`BrokerHandle::try_send`], reporting only whether the message
    /// was queued
    pub fn send(&self, payload: impl Into<Bytes>, target: ConnectionId) -> bool {
        self.try_send(payload, target).is_ok()
    }

    /// Queue a message for every connection
    pub fn broadcast(&self, payload: impl Into<Bytes>) -> bool {
        self.send(payload, ConnectionId::BROADCAST)
    }

    /// Wait up to `timeout` for an inbound message.
    ///
    /// Always `None` while a message callback is registered; the callback
    /// receives every message instead.
    pub fn receive(&self, timeout: Duration) -> Option<Message> {
        if self.core.callback().is_some() {
            return None;
        }
        self.core.session().incoming.take_timeout(timeout)
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.core.session().registry.len()
    }

    pub fn is_running(&self) -> bool {
        self.core.session().is_running()
    }
}

/// A WebSocket message broker.
///
/// One broker thread drives every connection; an optional dispatcher thread
/// hands inbound messages to the registered callback. Dropping the broker
/// stops it.
pub struct Broker {
    config: BrokerConfig,
    core: Arc<Core>,
    worker: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Broker {
    /// Create a stopped broker
    pub fn new(config: BrokerConfig) -> Self {
        let core = Arc::new(Core::new(&config.limits));
        Self {
            config,
            core,
            worker: None,
            local_addr: None,
        }
    }

    /// Replace the configuration. Refused while running.
    pub fn configure(&mut self, config: BrokerConfig) -> Result<(), BrokerError> {
        if self.is_running() {
            return Err(BrokerError::Running {
                action: "change the configuration",
            });
        }
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Register the callback that receives every inbound message.
    ///
    /// Takes effect for delivery immediately; the dispatcher thread is only
    /// started by a `start` that happens while a callback is registered.
    pub fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(ConnectionId, &[u8]) + Send + Sync + 'static,
    {
        let callback: MessageCallback = Arc::new(callback);
        self.core.set_callback(Some(callback));
    }

    /// Remove the message callback; inbound messages go to [`Broker::receive`]
    pub fn clear_message_callback(&self) {
        self.core.set_callback(None);
    }

    /// Validate the configuration, bind the WebSocket listener and start the
    /// broker threads. Does nothing if already running.
    pub fn start(&mut self) -> Result<(), BrokerError> {
        if self.is_running() {
            return Ok(());
        }
        self.config.validate()?;
        let transport = WebSocketTransport::bind(&self.config)?;
        self.start_with(transport)
    }

    /// Start the broker threads on a caller-supplied transport.
    ///
    /// Only the limits are validated; listener settings belong to the
    /// transport.
    pub fn start_with<T: Transport>(&mut self, transport: T) -> Result<(), BrokerError> {
        if self.is_running() {
            return Ok(());
        }
        self.config.limits.validate()?;

        // Reap a loop that ended on its own
        self.join_worker();

        let limits = self.config.limits.clone();
        let session = Arc::new(Session::new(&limits, Some(transport.waker())));
        session.running.store(true, Ordering::Release);
        self.local_addr = transport.local_addr();
        self.core.replace_session(session.clone());

        let broker_loop = BrokerLoop::new(transport, self.core.clone(), session.clone(), limits);
        let worker = thread::Builder::new()
            .name("wsrelay-broker".into())
            .spawn(move || broker_loop.run());

        match worker {
            Ok(worker) => {
                self.worker = Some(worker);
                tracing::info!("Broker started");
                Ok(())
            }
            Err(e) => {
                session.running.store(false, Ordering::Release);
                Err(BrokerError::Io(e))
            }
        }
    }

    /// Stop the broker and wait for its threads. Does nothing if stopped.
    pub fn stop(&mut self) {
        if self.worker.is_none() {
            return;
        }

        let session = self.core.session();
        session.running.store(false, Ordering::Release);
        session.wake();

        self.join_worker();
        tracing::info!("Broker stopped");
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Broker thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.core.session().is_running()
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.core.session().registry.len()
    }

    /// Address of the plain listener of the current run
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// See [`BrokerHandle::send`]
    pub fn send(&self, payload: impl Into<Bytes>, target: ConnectionId) -> bool {
        self.handle().send(payload, target)
    }

    /// See [`BrokerHandle::try_send`]
    pub fn try_send(&self, payload: impl Into<Bytes>, target: ConnectionId) -> Result<(), BrokerError> {
        self.handle().try_send(payload, target)
    }

    /// See [`BrokerHandle::receive`]
    pub fn receive(&self, timeout: Duration) -> Option<Message> {
        self.handle().receive(timeout)
    }

    /// A cloneable handle for other threads
    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            core: self.core.clone(),
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.stop();
    }
}
