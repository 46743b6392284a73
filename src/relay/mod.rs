// WebSocket message relay
//
// This module provides a broker that moves messages between many
// concurrently connected WebSocket clients and application threads, with
// one thread driving all network I/O and bounded queues in both directions.

pub mod channel;
pub mod message;
pub mod registry;
pub mod outbox;
pub mod transport;
pub mod broker;
pub mod server;
pub mod config;
pub mod error;
pub mod cli;

pub use channel::Channel;
pub use message::{ConnectionId, Message};
pub use registry::{ConnectionInfo, Registry};
pub use outbox::{Chunk, Outbox, WriteOutcome, DEFAULT_MAX_CHUNK};
pub use transport::{
    LoopWaker, LoopbackController, LoopbackTransport, Transport, TransportEvent, TransportHandle,
    WebSocketTransport, WrittenFrame,
};
pub use broker::MessageCallback;
pub use server::{Broker, BrokerHandle};
pub use config::{BrokerConfig, Limits, TlsConfig};
pub use error::{BrokerError, Interrupted, TransportError};
pub use cli::RelayCli;
