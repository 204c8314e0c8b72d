use std::sync::Arc;

use parking_lot::Mutex;

use epsile_core::events::ServerEvent;
use epsile_core::ids::ConnectionId;

use crate::outbox::Outbox;

/// Addressee of a recorded event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recipient {
    One(ConnectionId),
    All,
}

/// Outbox that records every event in order, for deterministic assertions.
///
/// Clones share the same log, so a test can keep one while the engine owns another.
#[derive(Clone, Default)]
pub struct RecordingOutbox {
    log: Arc<Mutex<Vec<(Recipient, ServerEvent)>>>,
}

impl RecordingOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far, in order.
    pub fn events(&self) -> Vec<(Recipient, ServerEvent)> {
        self.log.lock().clone()
    }

    /// Events addressed directly to `id` (broadcasts excluded).
    pub fn sent_to(&self, id: &ConnectionId) -> Vec<ServerEvent> {
        self.log
            .lock()
            .iter()
            .filter(|(r, _)| matches!(r, Recipient::One(to) if to == id))
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn broadcasts(&self) -> Vec<ServerEvent> {
        self.log
            .lock()
            .iter()
            .filter(|(r, _)| *r == Recipient::All)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Most recent presence count broadcast, if any.
    pub fn last_presence(&self) -> Option<u64> {
        self.log.lock().iter().rev().find_map(|(r, e)| match (r, e) {
            (Recipient::All, ServerEvent::Presence(p)) => Some(p.active_count),
            _ => None,
        })
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }
}

impl Outbox for RecordingOutbox {
    fn send(&self, to: &ConnectionId, event: ServerEvent) {
        self.log.lock().push((Recipient::One(to.clone()), event));
    }

    fn broadcast(&self, event: ServerEvent) {
        self.log.lock().push((Recipient::All, event));
    }
}
