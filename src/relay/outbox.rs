// Outbound framing state for a single connection

use bytes::Bytes;

/// Default upper bound for a single write, in bytes
pub const DEFAULT_MAX_CHUNK: usize = 4096;

/// One bounded slice of an outgoing payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Bytes,
    /// First chunk of the payload
    pub first: bool,
    /// Last chunk of the payload
    pub last: bool,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Result of handing a chunk to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// More chunks remain; request another writable notification
    Continue,
    /// The final chunk went out; the outbox is idle again
    Done,
    /// The transport took fewer bytes than offered; the outbox was cleared
    Rejected,
}

/// Cursor over the payload currently being written to a connection.
///
/// Idle while empty, Sending while a payload is assigned. A Sending outbox
/// refuses new payloads until the last chunk has been written.
#[derive(Debug, Default)]
pub struct Outbox {
    pending: Option<Bytes>,
    cursor: usize,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no payload is assigned
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    /// Whether a payload is being written
    pub fn is_sending(&self) -> bool {
        self.pending.is_some()
    }

    /// Bytes already handed to the transport
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Assign a payload. Returns `false` and leaves the outbox untouched if
    /// it is already sending.
    pub fn assign(&mut self, payload: Bytes) -> bool {
        if self.is_sending() {
            return false;
        }
        self.pending = Some(payload);
        self.cursor = 0;
        true
    }

    /// The next chunk to write, or `None` when idle
    pub fn next_chunk(&self, max_chunk: usize) -> Option<Chunk> {
        let payload = self.pending.as_ref()?;
        let start = self.cursor;
        let end = payload.len().min(start + max_chunk);

        Some(Chunk {
            data: payload.slice(start..end),
            first: start == 0,
            last: start + max_chunk >= payload.len(),
        })
    }

    /// Record that the transport accepted `accepted` bytes of `chunk`
    pub fn complete(&mut self, chunk: &Chunk, accepted: usize) -> WriteOutcome {
        self.cursor += accepted.min(chunk.len());

        if accepted < chunk.len() {
            self.clear();
            return WriteOutcome::Rejected;
        }
        if chunk.last {
            self.clear();
            return WriteOutcome::Done;
        }
        WriteOutcome::Continue
    }

    /// Drop the pending payload
    pub fn clear(&mut self) {
        self.pending = None;
        self.cursor = 0;
    }
}
