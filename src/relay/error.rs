// Error types for the relay

use crate::relay::transport::TransportHandle;

/// Raised to producers and consumers blocked on a channel when it is
/// interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("channel interrupted")]
pub struct Interrupted;

/// Failures reported by a transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport accepted fewer bytes than offered
    #[error("incomplete write on {handle}: {written} of {expected} bytes")]
    ShortWrite {
        handle: TransportHandle,
        written: usize,
        expected: usize,
    },

    /// The connection behind the handle is gone
    #[error("connection {0} is closed")]
    Closed(TransportHandle),

    /// The transport itself can no longer deliver events
    #[error("transport failed: {message}")]
    Failed { message: String },
}

/// Main error type for broker operations
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The registry is at capacity
    #[error("connection rejected: {capacity} clients already connected")]
    AdmissionRejected { capacity: usize },

    /// A bounded channel could not accept another message
    #[error("queue full")]
    ChannelFull,

    /// The broker is not running
    #[error("broker is not running")]
    Stopped,

    /// A per-connection transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Invalid startup parameters
    #[error("invalid configuration: {message}")]
    Configuration { message: String },

    /// Operation not allowed while the broker is running
    #[error("cannot {action} while the broker is running")]
    Running { action: &'static str },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        BrokerError::Configuration {
            message: message.into(),
        }
    }
}

