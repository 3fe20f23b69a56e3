//! In-process change notification.
//!
//! Writers publish a [`ChangeEvent`] for every committed mutation of a
//! syncable record. Subscribers are either in-process handlers (the scope
//! maintainer) or channel receivers.
//!
//! Events are published after the write commits, in commit order.

use crate::error::CoreResult;
use crate::types::{RecordId, RecordKey, RecordType, Tick};
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use tracing::warn;

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A new row.
    Insert,
    /// An existing row changed.
    Update,
    /// A row was tombstoned or purged.
    Delete,
}

/// A committed change to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Type of the changed record.
    pub record_type: RecordType,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Fields whose values changed (all fields for inserts).
    pub changed_fields: Vec<String>,
    /// Id of the changed record.
    pub record_id: RecordId,
    /// Tick the record now carries.
    pub tick: Tick,
}

impl ChangeEvent {
    /// Key of the changed record.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.record_type.clone(), self.record_id.clone())
    }

    /// Returns true if `field` is among the changed fields.
    pub fn touches(&self, field: &str) -> bool {
        self.changed_fields.iter().any(|f| f == field)
    }
}

/// A handler invoked synchronously for every published event.
pub trait ChangeSubscriber: Send + Sync {
    /// Handles one event. Errors are logged and do not stop delivery.
    fn on_change(&self, event: &ChangeEvent) -> CoreResult<()>;
}

/// Fan-out of change events to handlers and channels.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn ChangeSubscriber>>>,
    channels: RwLock<Vec<Sender<ChangeEvent>>>,
}

impl EventBus {
    /// Creates a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler.
    pub fn subscribe(&self, handler: Arc<dyn ChangeSubscriber>) {
        self.handlers.write().push(handler);
    }

    /// Registers a channel subscriber and returns its receiver.
    pub fn subscribe_channel(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        self.channels.write().push(tx);
        rx
    }

    /// Number of registered subscribers of either kind.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len() + self.channels.read().len()
    }

    /// Delivers events in order.
    pub fn publish(&self, events: &[ChangeEvent]) {
        if events.is_empty() {
            return;
        }
        let handlers = self.handlers.read().clone();
        for event in events {
            for handler in &handlers {
                if let Err(err) = handler.on_change(event) {
                    warn!(
                        record_type = %event.record_type,
                        record_id = %event.record_id,
                        error = %err,
                        "change subscriber failed"
                    );
                }
            }
        }

        // Drop channels whose receiver has gone away.
        let mut channels = self.channels.write();
        channels.retain(|tx| events.iter().all(|e| tx.send(e.clone()).is_ok()));
    }
}


