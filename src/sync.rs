//! Blocking primitives shared by the link worker and the application.
//!
//! Every wait is bounded by a timeout.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Counting semaphore, posted by the worker for each delivered frame.
#[derive(Debug, Default)]
pub(crate) struct Semaphore {
    count: Mutex<u32>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn post(&self) {
        *self.count.lock() += 1;
        self.condvar.notify_one();
    }

    /// Take one count, waiting at most `timeout`. Returns false on timeout.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.condvar.wait_until(&mut count, deadline).timed_out() {
                break;
            }
        }
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    locked: bool,
}

/// A gate admits one thread at a time, and only while open.
///
/// The worker opens it when the transmit mailbox may be filled. A thread
/// passing the gate closes it behind itself; [`Gate::exit`] may reopen it.
/// Opening a locked gate leaves it open once the holder exits.
#[derive(Debug, Default)]
pub(crate) struct Gate {
    state: Mutex<GateState>,
    condvar: Condvar,
}

impl Gate {
    pub fn open(&self) {
        self.state.lock().open = true;
        self.condvar.notify_one();
    }

    pub fn close(&self) {
        self.state.lock().open = false;
    }

    /// Wait until the gate is open and pass it. Returns false on timeout.
    pub fn timed_enter(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.open || state.locked {
            if self.condvar.wait_until(&mut state, deadline).timed_out() {
                return false;
            }
        }
        state.open = false;
        state.locked = true;
        true
    }

    pub fn exit(&self, reopen: bool) {
        let mut state = self.state.lock();
        state.locked = false;
        if reopen {
            state.open = true;
        }
        if state.open {
            self.condvar.notify_one();
        }
    }
}

/// Broadcast signal for role, link-up and management handshakes.
///
/// Waiters pass a condition which is re-checked on every signal, so a
/// single flag can serve several unrelated waits.
#[derive(Debug, Default)]
pub(crate) struct Flag {
    generation: Mutex<u64>,
    condvar: Condvar,
}

impl Flag {
    pub fn give(&self) {
        *self.generation.lock() += 1;
        self.condvar.notify_all();
    }

    /// Wait until `cond` holds, at most `timeout`. Returns the final value of `cond`.
    pub fn wait_for(&self, timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        loop {
            if cond() {
                return true;
            }
            if self.condvar.wait_until(&mut generation, deadline).timed_out() {
                return cond();
            }
        }
    }
}
