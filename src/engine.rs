use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::SyncConfig;
use crate::coordinator::SyncCoordinator;
use crate::events::{SnapshotChanged, SnapshotEvents};
use crate::gateway::Gateway;
use crate::op::DeviceId;
use crate::oplog::{AggregateLocks, LogError, OperationLog};
use crate::reconcile::Reconciler;
use crate::remote::RemoteStore;

/// Owns the operation log and hands out the handles that share it.
pub struct SyncEngine {
    device_id: DeviceId,
    log: Arc<OperationLog>,
    locks: Arc<AggregateLocks>,
    events: SnapshotEvents,
    config: SyncConfig,
}

impl SyncEngine {
    /// Open the log at `path`. A log keeps the device id it was first opened
    /// with; `device_id` is only used for a fresh log.
    pub fn open(
        path: impl AsRef<Path>,
        device_id: DeviceId,
        config: SyncConfig,
    ) -> Result<Self, LogError> {
        Self::from_log(OperationLog::open(path)?, device_id, config)
    }

    pub fn in_memory(device_id: DeviceId, config: SyncConfig) -> Result<Self, LogError> {
        Self::from_log(OperationLog::open_in_memory()?, device_id, config)
    }

    pub fn from_log(
        log: OperationLog,
        device_id: DeviceId,
        config: SyncConfig,
    ) -> Result<Self, LogError> {
        let device_id = log.bind_device(&device_id)?;
        Ok(Self {
            device_id,
            log: Arc::new(log),
            locks: Arc::new(AggregateLocks::default()),
            events: SnapshotEvents::new(config.event_capacity),
            config,
        })
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<OperationLog> {
        &self.log
    }

    pub fn gateway(&self) -> Gateway {
        Gateway::new(
            self.device_id.clone(),
            self.log.clone(),
            self.locks.clone(),
            self.events.clone(),
        )
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.log.clone(), self.locks.clone(), self.events.clone())
    }

    /// Snapshot-changed events for UI subscribers.
    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotChanged> {
        self.events.subscribe()
    }

    /// Start background sync against `remote`. Must be called inside a tokio runtime.
    pub fn spawn_coordinator(
        &self,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<SyncCoordinator, LogError> {
        SyncCoordinator::spawn(
            self.log.clone(),
            self.reconciler(),
            remote,
            self.config.clone(),
            self.events.subscribe(),
        )
    }
}
