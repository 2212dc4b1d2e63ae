//! Send window and outbound byte cursor
//!
//! The send window is a fixed number of slots. Each slot is either empty or
//! holds the sequence number of a DATA segment that was sent from it and is
//! still unacknowledged. Filling the window slices the outbound buffer into
//! segments of at most `segment_size` bytes, one per empty slot, and is rerun
//! after every acknowledgement so the window stays maximally full.

use bytes::{Bytes, BytesMut};

/// Bytes queued by `send` plus a cursor over what has been segmented already
#[derive(Debug, Default)]
pub struct Outbound {
    data: Bytes,
    cursor: usize,
}

impl Outbound {
    /// Create an empty outbound buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `data` after the bytes not yet segmented
    ///
    /// Already segmented bytes are dropped and the cursor restarts at zero.
    pub fn enqueue(&mut self, data: &[u8]) {
        let rest = &self.data[self.cursor..];
        let mut combined = BytesMut::with_capacity(rest.len() + data.len());
        combined.extend_from_slice(rest);
        combined.extend_from_slice(data);
        self.data = combined.freeze();
        self.cursor = 0;
    }

    /// Slice the next segment of at most `max` bytes, advancing the cursor
    pub fn next_segment(&mut self, max: usize) -> Option<Bytes> {
        if self.remaining() == 0 || max == 0 {
            return None;
        }
        let end = (self.cursor + max).min(self.data.len());
        let segment = self.data.slice(self.cursor..end);
        self.cursor = end;
        Some(segment)
    }

    /// Bytes not yet segmented
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Position of the cursor in the current buffer
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.data = Bytes::new();
        self.cursor = 0;
    }
}

/// Fixed-size window of in-flight DATA sequence numbers
#[derive(Debug, Clone)]
pub struct SendWindow {
    slots: Vec<Option<u32>>,
    size: usize,
}

impl SendWindow {
    /// Create a window with `size` empty slots
    pub fn new(size: usize) -> Self {
        SendWindow {
            slots: vec![None; size],
            size,
        }
    }

    /// Configured number of slots
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current slots, in order
    pub fn slots(&self) -> &[Option<u32>] {
        &self.slots
    }

    /// Number of occupied slots
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether `seq` occupies a slot
    pub fn contains(&self, seq: u32) -> bool {
        self.slots.contains(&Some(seq))
    }

    /// Fill every empty slot from `outbound`
    ///
    /// `transmit` sends one segment and returns the sequence number it was
    /// given. Slots stay empty once the outbound buffer is exhausted. Returns
    /// the number of segments sent. A segment `transmit` fails on goes back to
    /// `outbound`, so the next fill starts with it.
    pub fn fill<E, F>(
        &mut self,
        outbound: &mut Outbound,
        segment_size: usize,
        mut transmit: F,
    ) -> Result<usize, E>
    where
        F: FnMut(Bytes) -> Result<u32, E>,
    {
        let mut sent = 0;
        for slot in self.slots.iter_mut().filter(|slot| slot.is_none()) {
            let Some(segment) = outbound.next_segment(segment_size) else {
                break;
            };
            let len = segment.len();
            match transmit(segment) {
                Ok(seq) => *slot = Some(seq),
                Err(e) => {
                    outbound.cursor -= len;
                    return Err(e);
                }
            }
            sent += 1;
        }
        Ok(sent)
    }

    /// Clear the slot holding `seq`; returns whether one matched
    ///
    /// Sequence numbers are never reused inside a window, so at most one slot
    /// can match. Surplus empty slots left behind by a shrink are dropped.
    pub fn acknowledge(&mut self, seq: u32) -> bool {
        let Some(slot) = self.slots.iter_mut().find(|slot| **slot == Some(seq)) else {
            return false;
        };
        *slot = None;
        self.compact();
        true
    }

    /// Change the number of slots
    ///
    /// Growing adds empty slots. Shrinking removes empty slots only; occupied
    /// slots beyond the new size drain as they are acknowledged.
    pub fn resize(&mut self, size: usize) {
        self.size = size;
        if self.slots.len() < size {
            self.slots.resize(size, None);
        } else {
            self.compact();
        }
    }

    /// Empty every slot
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    fn compact(&mut self) {
        while self.slots.len() > self.size {
            match self.slots.iter().rposition(Option::is_none) {
                Some(idx) => {
                    self.slots.remove(idx);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn counter() -> impl FnMut(Bytes) -> Result<u32, Infallible> {
        let mut next = 0;
        move |_segment| {
            next += 1;
            Ok(next)
        }
    }

    #[test]
    fn test_next_segment() {
        let mut outbound = Outbound::new();
        outbound.enqueue(b"hello my friend! guy");

        assert_eq!(outbound.next_segment(8).unwrap(), &b"hello my"[..]);
        assert_eq!(outbound.next_segment(8).unwrap(), &b" friend!"[..]);
        assert_eq!(outbound.next_segment(8).unwrap(), &b" guy"[..]);
        assert_eq!(outbound.next_segment(8), None);
    }

    #[test]
    fn test_enqueue_keeps_unsent_bytes() {
        let mut outbound = Outbound::new();
        outbound.enqueue(b"abcdef");
        outbound.next_segment(4);
        outbound.enqueue(b"gh");

        assert_eq!(outbound.cursor(), 0);
        assert_eq!(outbound.remaining(), 4);
        assert_eq!(outbound.next_segment(8).unwrap(), &b"efgh"[..]);
    }

    #[test]
    fn test_fill_one_byte_segments() {
        let mut window = SendWindow::new(10);
        let mut outbound = Outbound::new();
        outbound.enqueue(b"0123456789");

        let sent = window.fill(&mut outbound, 1, counter()).unwrap();
        assert_eq!(sent, 10);
        let expected: Vec<_> = (1..=10).map(Some).collect();
        assert_eq!(window.slots(), expected.as_slice());
    }

    #[test]
    fn test_fill_leaves_slots_empty_when_data_runs_out() {
        let mut window = SendWindow::new(4);
        let mut outbound = Outbound::new();
        outbound.enqueue(b"0123456789");

        window.fill(&mut outbound, 8, counter()).unwrap();
        assert_eq!(window.slots(), &[Some(1), Some(2), None, None]);
        assert_eq!(outbound.remaining(), 0);
    }

    #[test]
    fn test_acknowledge_and_refill() {
        let mut window = SendWindow::new(10);
        let mut outbound = Outbound::new();
        outbound.enqueue(b"0123456789");
        let mut transmit = counter();
        window.fill(&mut outbound, 1, &mut transmit).unwrap();

        for seq in 1..10 {
            assert!(window.acknowledge(seq));
            assert!(!window.contains(seq));
        }
        assert!(!window.acknowledge(1));
        assert_eq!(window.in_flight(), 1);

        outbound.enqueue(b"ab");
        window.fill(&mut outbound, 1, &mut transmit).unwrap();
        assert_eq!(window.slots()[0], Some(11));
        assert_eq!(window.slots()[1], Some(12));
        assert_eq!(window.in_flight(), 3);
    }

    #[test]
    fn test_failed_segment_is_sent_again() {
        let mut window = SendWindow::new(3);
        let mut outbound = Outbound::new();
        outbound.enqueue(b"abc");

        let mut wire = Vec::new();
        let mut calls = 0;
        let mut transmit = |segment: Bytes| {
            calls += 1;
            if calls == 2 {
                return Err("socket gone");
            }
            wire.extend_from_slice(&segment);
            Ok(calls)
        };

        assert_eq!(window.fill(&mut outbound, 1, &mut transmit), Err("socket gone"));
        assert_eq!(window.slots(), &[Some(1), None, None]);
        assert_eq!(outbound.remaining(), 2);

        assert_eq!(window.fill(&mut outbound, 1, &mut transmit), Ok(2));
        assert_eq!(window.slots(), &[Some(1), Some(3), Some(4)]);
        drop(transmit);
        assert_eq!(wire, b"abc");
    }

    #[test]
    fn test_resize() {
        let mut window = SendWindow::new(2);
        let mut outbound = Outbound::new();
        outbound.enqueue(b"abcd");
        let mut transmit = counter();
        window.fill(&mut outbound, 1, &mut transmit).unwrap();

        window.resize(4);
        assert_eq!(window.slots().len(), 4);
        window.fill(&mut outbound, 1, &mut transmit).unwrap();
        assert_eq!(window.slots(), &[Some(1), Some(2), Some(3), Some(4)]);

        window.resize(1);
        assert_eq!(window.slots().len(), 4);
        window.acknowledge(2);
        window.acknowledge(3);
        assert_eq!(window.slots(), &[Some(1), Some(4)]);
        window.acknowledge(1);
        window.acknowledge(4);
        assert_eq!(window.slots(), &[None]);
    }
}
