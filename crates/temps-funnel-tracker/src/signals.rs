//! Local re-emission of dispatched events
//!
//! Other in-process systems subscribe here to react to funnel events without
//! a round trip through the collector.

use crate::config::SIGNAL_NAME;
use crate::listeners::{Listener, ListenerId, Listeners};
use crate::types::QueuedEvent;

#[derive(Default)]
pub struct LocalSignals {
    listeners: Listeners<QueuedEvent>,
}

impl LocalSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self) -> &'static str {
        SIGNAL_NAME
    }

    pub fn subscribe(&self, listener: Listener<QueuedEvent>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn emit(&self, event: &QueuedEvent) {
        self.listeners.emit(event);
    }
}
