// WebSocket transport: tokio + tungstenite on a dedicated network thread

use crate::relay::channel::Channel;
use crate::relay::config::BrokerConfig;
use crate::relay::error::{BrokerError, TransportError};
use crate::relay::outbox::Chunk;
use crate::relay::transport::{LoopWaker, Transport, TransportEvent, TransportHandle};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data, OpCode};
use tokio_tungstenite::tungstenite::protocol::frame::Frame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Frames a connection's writer task may hold before it stops being writable
const WRITE_QUEUE_DEPTH: usize = 16;

enum Inbound {
    Event(TransportEvent),
    Wake,
}

struct Shared {
    connections: Mutex<HashMap<TransportHandle, mpsc::Sender<WsMessage>>>,
    next_handle: AtomicU64,
    events: Channel<Inbound>,
    wake_pending: AtomicBool,
}

impl Shared {
    fn push(&self, event: TransportEvent) {
        // Unbounded, never blocks the network thread
        let _ = self.events.offer(Inbound::Event(event));
    }
}

struct WsWaker {
    shared: Arc<Shared>,
}

impl LoopWaker for WsWaker {
    fn wake(&self) {
        if !self.shared.wake_pending.swap(true, Ordering::AcqRel) {
            let _ = self.shared.events.offer(Inbound::Wake);
        }
    }
}

/// Plain WebSocket listener feeding the broker loop
pub struct WebSocketTransport {
    shared: Arc<Shared>,
    pending_writable: Vec<TransportHandle>,
    binary_frames: bool,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    /// Bind the configured listener and start the network thread.
    ///
    /// Binding happens on the calling thread so an unusable address is
    /// reported before anything runs in the background.
    pub fn bind(config: &BrokerConfig) -> Result<Self, BrokerError> {
        if config.tls.is_some() {
            return Err(BrokerError::config(
                "TLS listeners need a TLS-capable transport; use Broker::start_with",
            ));
        }
        let port = config
            .port
            .ok_or_else(|| BrokerError::config("no plain port configured"))?;

        let listener = std::net::TcpListener::bind((config.hostname.as_str(), port)).map_err(|e| {
            BrokerError::config(format!("cannot listen on {}:{}: {}", config.hostname, port, e))
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let shared = Arc::new(Shared {
            connections: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            events: Channel::unbounded(),
            wake_pending: AtomicBool::new(false),
        });
        let cancel = CancellationToken::new();

        let thread_shared = shared.clone();
        let thread_cancel = cancel.clone();
        let thread = std::thread::Builder::new()
            .name("wsrelay-net".into())
            .spawn(move || {
                runtime.block_on(async move {
                    match TcpListener::from_std(listener) {
                        Ok(listener) => accept_loop(listener, thread_shared, thread_cancel).await,
                        Err(e) => error!("Failed to register listener: {}", e),
                    }
                });
                debug!("Network thread stopped");
            })?;

        info!("Listening for WebSocket clients on {}", local_addr);

        Ok(Self {
            shared,
            pending_writable: Vec::new(),
            binary_frames: config.binary_frames,
            local_addr,
            cancel,
            thread: Some(thread),
        })
    }

    fn collect_writable(&mut self, events: &mut Vec<TransportEvent>) {
        let connections = self.shared.connections.lock();
        self.pending_writable.retain(|handle| match connections.get(handle) {
            None => false,
            Some(tx) if tx.capacity() > 0 => {
                events.push(TransportEvent::Writable(*handle));
                false
            }
            Some(_) => true,
        });
    }

    fn accept(&self, inbound: Inbound, events: &mut Vec<TransportEvent>) {
        match inbound {
            Inbound::Event(event) => events.push(event),
            Inbound::Wake => self.shared.wake_pending.store(false, Ordering::Release),
        }
    }
}

impl Transport for WebSocketTransport {
    fn poll(
        &mut self,
        timeout: Duration,
        events: &mut Vec<TransportEvent>,
    ) -> Result<(), TransportError> {
        if self.thread.as_ref().map_or(true, |t| t.is_finished()) {
            return Err(TransportError::Failed {
                message: "network thread is not running".to_string(),
            });
        }

        self.collect_writable(events);

        let wait = if events.is_empty() { timeout } else { Duration::ZERO };
        if let Some(inbound) = self.shared.events.take_timeout(wait) {
            self.accept(inbound, events);
        }
        while let Some(inbound) = self.shared.events.take_timeout(Duration::ZERO) {
            self.accept(inbound, events);
        }

        Ok(())
    }

    fn request_writable(&mut self, handle: TransportHandle) {
        if !self.pending_writable.contains(&handle) {
            self.pending_writable.push(handle);
        }
    }

    fn write(&mut self, handle: TransportHandle, chunk: &Chunk) -> Result<usize, TransportError> {
        let tx = self
            .shared
            .connections
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(TransportError::Closed(handle))?;

        let opcode = if !chunk.first {
            OpCode::Data(Data::Continue)
        } else if self.binary_frames {
            OpCode::Data(Data::Binary)
        } else {
            OpCode::Data(Data::Text)
        };
        let frame = Frame::message(chunk.data.to_vec(), opcode, chunk.last);

        match tx.try_send(WsMessage::Frame(frame)) {
            Ok(()) => Ok(chunk.len()),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(0),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed(handle)),
        }
    }

    fn close(&mut self, handle: TransportHandle) {
        // Dropping the sender lets the writer task flush and send a close frame
        self.shared.connections.lock().remove(&handle);
        self.pending_writable.retain(|h| *h != handle);
    }

    fn waker(&self) -> Arc<dyn LoopWaker> {
        Arc::new(WsWaker {
            shared: self.shared.clone(),
        })
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Network thread panicked");
            }
        }
        self.shared.connections.lock().clear();
        self.pending_writable.clear();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(handle_connection(stream, addr, shared.clone(), cancel.clone()));
                }
                Err(e) => warn!("Accept error: {}", e),
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let handle = TransportHandle(shared.next_handle.fetch_add(1, Ordering::Relaxed));
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::channel::<WsMessage>(WRITE_QUEUE_DEPTH);

    shared.connections.lock().insert(handle, tx);
    shared.push(TransportEvent::Connected(handle));
    debug!("Connection {} from {}", handle, addr);

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                debug!("Write to {} failed: {}", handle, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(WsMessage::Text(text))) => shared.push(TransportEvent::Readable {
                    handle,
                    data: text.as_bytes().to_vec(),
                    first: true,
                    last: true,
                }),
                Some(Ok(WsMessage::Binary(data))) => shared.push(TransportEvent::Readable {
                    handle,
                    data: data.to_vec(),
                    first: true,
                    last: true,
                }),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Read from {} failed: {}", handle, e);
                    break;
                }
            }
        }
    }

    shared.connections.lock().remove(&handle);
    shared.push(TransportEvent::Disconnected(handle));
}
