//! Receive buffer
//!
//! An append-only byte accumulator fed by DATA payloads in the order they are
//! dequeued and drained from the front by the application. Payloads are not
//! reordered. A bounded history of delivered sequence numbers suppresses
//! retransmitted duplicates whose ACK was lost on the way back.

use bytes::{Bytes, BytesMut};
use std::collections::{HashSet, VecDeque};

/// Default number of delivered sequence numbers remembered for duplicate checks
pub const DEFAULT_HISTORY: usize = 1024;

/// Byte-stream receive buffer
#[derive(Debug)]
pub struct ReceiveBuffer {
    data: BytesMut,
    seen: HashSet<u32>,
    order: VecDeque<u32>,
    history: usize,
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveBuffer {
    /// Create an empty buffer with the default duplicate history
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    /// Create an empty buffer remembering up to `history` sequence numbers
    pub fn with_history(history: usize) -> Self {
        ReceiveBuffer {
            data: BytesMut::new(),
            seen: HashSet::new(),
            order: VecDeque::new(),
            history,
        }
    }

    /// Append the payload of DATA segment `seq`
    ///
    /// Returns false, appending nothing, if `seq` was already delivered.
    pub fn push(&mut self, seq: u32, payload: &[u8]) -> bool {
        if self.seen.contains(&seq) {
            return false;
        }
        if self.history > 0 {
            if self.order.len() == self.history {
                if let Some(oldest) = self.order.pop_front() {
                    self.seen.remove(&oldest);
                }
            }
            self.order.push_back(seq);
            self.seen.insert(seq);
        }
        self.data.extend_from_slice(payload);
        true
    }

    /// Remove and return up to `max` bytes from the front
    pub fn take(&mut self, max: usize) -> Bytes {
        let n = max.min(self.data.len());
        self.data.split_to(n).freeze()
    }

    /// Buffered byte count
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no bytes are buffered
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drop buffered bytes and history
    pub fn clear(&mut self) {
        self.data.clear();
        self.seen.clear();
        self.order.clear();
    }
}
