//! Single slot hand-off between the application and the link worker.
//!
//! The producer fills the slot and bumps `seq`; the consumer reads it and
//! bumps `ack`. The slot is free again once `ack == seq`, the producer never
//! refills it before that.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

#[derive(Debug)]
pub(crate) struct Mailbox<T> {
    seq: AtomicU32,
    ack: AtomicU32,
    slot: Mutex<T>,
}

impl<T> Mailbox<T> {
    pub fn new(slot: T) -> Self {
        Self {
            seq: AtomicU32::new(0),
            ack: AtomicU32::new(0),
            slot: Mutex::new(slot),
        }
    }

    /// An entry is waiting for the consumer.
    pub fn is_pending(&self) -> bool {
        self.seq.load(Ordering::Acquire) != self.ack.load(Ordering::Acquire)
    }

    /// Fill the slot if it is free. Returns false if the previous entry
    /// has not been consumed yet.
    pub fn post(&self, fill: impl FnOnce(&mut T)) -> bool {
        if self.is_pending() {
            return false;
        }
        fill(&mut self.slot.lock());
        self.seq.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Look at the pending entry without consuming it.
    pub fn peek<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        if !self.is_pending() {
            return None;
        }
        Some(f(&self.slot.lock()))
    }

    /// Consume the pending entry.
    pub fn take<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let r = self.peek(f)?;
        self.ack.fetch_add(1, Ordering::AcqRel);
        Some(r)
    }

    /// Drop whatever is pending.
    pub fn drain(&self) -> bool {
        let seq = self.seq.load(Ordering::Acquire);
        self.ack.swap(seq, Ordering::AcqRel) != seq
    }
}
