//! Sequence Number Allocation
//!
//! Every segment that needs an acknowledgement (SYN, FIN, DATA) draws its
//! sequence number from one counter per bound socket. Connections multiplexed
//! over the same socket share the counter, so sequence numbers double as keys
//! of the unacknowledged-packet registry and never collide while in flight.

use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonic per-socket sequence counter
///
/// The first allocated number is 1. The counter wraps after `u32::MAX`
/// allocations; a wrapped number could only collide with a packet that has
/// been in flight for four billion sends.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    last: AtomicU32,
}

impl SequenceCounter {
    /// Create a counter whose first allocation is 1
    pub fn new() -> Self {
        Self::starting_after(0)
    }

    /// Create a counter whose first allocation is `last + 1`
    pub fn starting_after(last: u32) -> Self {
        SequenceCounter {
            last: AtomicU32::new(last),
        }
    }

    /// Allocate the next sequence number
    #[inline]
    pub fn next(&self) -> u32 {
        self.last.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Most recently allocated sequence number (0 if none yet)
    #[inline]
    pub fn last(&self) -> u32 {
        self.last.load(Ordering::Relaxed)
    }
}
