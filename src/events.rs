use tokio::sync::broadcast;
use tracing::trace;

use crate::op::AggregateKey;
use crate::project::Snapshot;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Why a snapshot changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// Recorded through the local mutation gateway.
    Local,
    /// New operations merged from the remote store.
    Remote,
    /// Recomputed because an aggregate it is derived from changed.
    Derived,
}

/// "Snapshot changed" notification delivered to UI subscribers.
#[derive(Debug, Clone)]
pub struct SnapshotChanged {
    pub key: AggregateKey,
    pub snapshot: Snapshot,
    pub source: ChangeSource,
}

/// Fan-out of snapshot changes. Cheap to clone; publishing never blocks.
#[derive(Debug, Clone)]
pub struct SnapshotEvents {
    tx: broadcast::Sender<SnapshotChanged>,
}

impl SnapshotEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotChanged> {
        self.tx.subscribe()
    }

    pub fn publish(&self, key: &AggregateKey, snapshot: &Snapshot, source: ChangeSource) {
        let event = SnapshotChanged {
            key: key.clone(),
            snapshot: snapshot.clone(),
            source,
        };
        if self.tx.send(event).is_err() {
            trace!(%key, "no snapshot subscribers");
        }
    }
}

impl Default for SnapshotEvents {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
