pub mod config;
pub mod coordinator;
pub mod engine;
pub mod events;
pub mod ffi;
pub mod gateway;
pub mod op;
pub mod oplog;
pub mod project;
pub mod reconcile;
pub mod remote;

pub use config::{ConfigError, SyncConfig};
pub use coordinator::{
    CoordinatorState, CycleOutcome, CycleReport, ErrorKind, SyncCoordinator, SyncError, SyncStatus,
};
pub use engine::SyncEngine;
pub use events::{ChangeSource, SnapshotChanged};
pub use gateway::{Gateway, GatewayError, Recorded};
pub use op::{AggregateKey, AggregateType, DeviceId, GrantKey, OpId, OpKind, Operation, WalkRecord};
pub use oplog::{LogError, OperationLog};
pub use project::{Snapshot, project};
pub use reconcile::{ReconcileOutcome, Reconciler, merge};
pub use remote::{
    Ack, Cursor, MemoryRemote, PullBatch, PullError, PushError, RemoteRecord, RemoteStore,
};
