//! Notifications from the link worker to the application.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

use log::warn;
use parking_lot::Mutex;

use crate::types::Address;

/// Link events, delivered to every [`Link::subscribe`](crate::Link::subscribe) receiver.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Event {
    /// The link can transmit, sent once per up transition.
    LinkUp,
    LinkDown,
    /// No other master answered a full poll cycle.
    SoleMaster,
    /// Another master appeared after a sole master period.
    MultiMaster,
    /// The bus was silent for the no-token time.
    TokenLost,
    /// A run of header errors, the transport may need a reset.
    TooManyErrors,
    LineBreak,
    /// A loopback probe was put on the bus.
    ProbeBegin,
    ProbeEnd,
    /// A management request was received and answered.
    MgmtRequest { source: Address, opcode: u8 },
}

/// Answers management requests carried in test request frames.
pub trait MgmtHandler: Send {
    /// Handle `opcode` with `argument` from `source`, returning the value
    /// carried back in the response.
    fn request(&mut self, source: Address, opcode: u8, argument: u8, payload: &[u8]) -> u8;
}

/// Handler used until the application installs its own.
#[derive(Debug, Default)]
pub struct NullHandler;

impl MgmtHandler for NullHandler {
    fn request(&mut self, _source: Address, _opcode: u8, _argument: u8, _payload: &[u8]) -> u8 {
        0
    }
}

impl<F> MgmtHandler for F
where
    F: FnMut(Address, u8, u8, &[u8]) -> u8 + Send,
{
    fn request(&mut self, source: Address, opcode: u8, argument: u8, payload: &[u8]) -> u8 {
        self(source, opcode, argument, payload)
    }
}

/// Fan-out of events to bounded subscriber queues. Never blocks the worker:
/// events for a full queue are dropped.
#[derive(Debug)]
pub(crate) struct EventSink {
    tag: String,
    capacity: usize,
    subscribers: Mutex<Vec<SyncSender<Event>>>,
}

impl EventSink {
    pub fn new(tag: &str, capacity: usize) -> Self {
        Self {
            tag: tag.to_owned(),
            capacity,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = sync_channel(self.capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: Event) {
        let tag = &self.tag;
        self.subscribers
            .lock()
            .retain(|tx| match tx.try_send(event) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("[{}] event queue full, dropping {:?}", tag, event);
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
    }
}
