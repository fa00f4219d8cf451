#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use async_trait::async_trait;
use streak_sync::project::{ChallengeBoard, ShieldSnapshot};
use streak_sync::remote::{
    Ack, Cursor, MemoryRemote, PullBatch, PullError, PushError, RemoteStore,
};
use streak_sync::{AggregateKey, DeviceId, Gateway, Operation, Snapshot, SyncConfig, SyncEngine};
use tokio::sync::Notify;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Config whose debounce never fires during a test; cycles are driven by hand.
pub fn manual_config() -> SyncConfig {
    SyncConfig {
        debounce_ms: 60 * 60 * 1_000,
        ..SyncConfig::default()
    }
}

pub struct Device {
    pub engine: SyncEngine,
    pub gateway: Gateway,
}

impl Device {
    pub fn new(name: &str) -> Self {
        Self::with_config(name, manual_config())
    }

    pub fn with_config(name: &str, config: SyncConfig) -> Self {
        init_tracing();
        let engine = SyncEngine::in_memory(DeviceId::new(name), config).unwrap();
        let gateway = engine.gateway();
        Self { engine, gateway }
    }

    pub fn xp(&self) -> u64 {
        match self.gateway.snapshot(&AggregateKey::rank()).unwrap() {
            Snapshot::Rank(r) => r.xp,
            other => panic!("unexpected {other:?}"),
        }
    }

    pub fn shields(&self) -> ShieldSnapshot {
        match self.gateway.snapshot(&AggregateKey::shields()).unwrap() {
            Snapshot::Shields(s) => s,
            other => panic!("unexpected {other:?}"),
        }
    }

    pub fn challenges(&self) -> ChallengeBoard {
        match self.gateway.snapshot(&AggregateKey::challenges()).unwrap() {
            Snapshot::Challenges(c) => c,
            other => panic!("unexpected {other:?}"),
        }
    }
}

/// Remote whose pulls can be held open until the test releases them.
#[derive(Default)]
pub struct GatedRemote {
    pub inner: MemoryRemote,
    pub gated: AtomicBool,
    pub pull_entered: Notify,
    pub release: Notify,
}

impl GatedRemote {
    pub fn gated() -> Arc<Self> {
        let remote = Self::default();
        remote.gated.store(true, Ordering::SeqCst);
        Arc::new(remote)
    }

    pub fn open_gate(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
        // Also covers a pull that has signalled but not yet parked.
        self.release.notify_one();
    }
}

#[async_trait]
impl RemoteStore for GatedRemote {
    async fn push_batch(&self, ops: &[Operation]) -> Result<Ack, PushError> {
        self.inner.push_batch(ops).await
    }

    async fn pull(
        &self,
        key: &AggregateKey,
        since: Option<&Cursor>,
    ) -> Result<PullBatch, PullError> {
        if self.gated.load(Ordering::SeqCst) {
            self.pull_entered.notify_one();
            self.release.notified().await;
        }
        self.inner.pull(key, since).await
    }
}
