//! Typed event bus for cross-component signaling

use tokio::sync::broadcast;

use crate::models::{EntityKind, RecordId, SyncStatus};

const DEFAULT_CAPACITY: usize = 256;

/// Which party a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Local,
    Peer,
    Cloud,
}

/// Events published after the corresponding store commit succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Roots whose subgraph was inserted or updated
    RecordsChanged {
        source: ChangeSource,
        roots: Vec<(EntityKind, RecordId)>,
    },
    RecordsDeleted {
        source: ChangeSource,
        records: Vec<(EntityKind, RecordId)>,
    },
    GoalsReplaced {
        count: usize,
    },
    CloudStatus {
        kind: EntityKind,
        id: RecordId,
        status: SyncStatus,
    },
    Connectivity {
        online: bool,
    },
}

/// Broadcast bus shared by the sync components.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers; having none is not an error.
    pub fn publish(&self, event: SyncEvent) {
        tracing::trace!(?event, "publishing sync event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
