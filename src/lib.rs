//! wsrelay - Real-time message relay for WebSocket clients
//!
//! This library provides a broker that sits between network clients and an
//! application's producer/consumer threads, built on a bounded interruptible
//! channel and a per-connection chunked write state machine.

pub mod relay;

pub use relay::{Broker, BrokerConfig, BrokerError, BrokerHandle, Channel, ConnectionId, Message};
