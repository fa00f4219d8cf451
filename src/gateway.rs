//! Local mutation gateway: the only path business logic uses to change
//! synchronized state. Works fully offline; the new snapshot is visible
//! before any network activity happens.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{ChangeSource, SnapshotEvents};
use crate::op::{AggregateKey, AggregateType, DeviceId, GrantKey, OpId, OpKind, Operation};
use crate::oplog::{AggregateLocks, LogError, OperationLog};
use crate::project::{EntryStatus, LedgerMovement, Snapshot, project, protect_with_shields};

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Local storage failed; the operation was not recorded.
    #[error("operation log: {0}")]
    Log(#[from] LogError),
    #[error("{kind} cannot be recorded against {key}")]
    KindMismatch { key: AggregateKey, kind: &'static str },
    #[error("no shield left to protect {0}")]
    NoShields(NaiveDate),
}

/// Result of recording one local change.
#[derive(Debug, Clone, Serialize)]
pub struct Recorded {
    pub operation: Operation,
    pub snapshot: Snapshot,
}

#[derive(Clone)]
pub struct Gateway {
    device_id: DeviceId,
    log: Arc<OperationLog>,
    locks: Arc<AggregateLocks>,
    events: SnapshotEvents,
}

impl Gateway {
    pub fn new(
        device_id: DeviceId,
        log: Arc<OperationLog>,
        locks: Arc<AggregateLocks>,
        events: SnapshotEvents,
    ) -> Self {
        Self {
            device_id,
            log,
            locks,
            events,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Record a state change: stamp id and clocks, append it, and return the
    /// re-projected snapshot. Storage failures surface here synchronously.
    pub fn record(&self, key: &AggregateKey, kind: OpKind) -> Result<Recorded, GatewayError> {
        if kind.aggregate_type() != key.aggregate_type {
            return Err(GatewayError::KindMismatch {
                key: key.clone(),
                kind: kind.name(),
            });
        }

        let lock = self.locks.handle(key)?;
        let guard = lock.lock().map_err(|_| LogError::Poisoned)?;
        let (operation, snapshot) = self.append_locked(key, kind)?;
        drop(guard);
        Ok(self.announce(key, operation, snapshot))
    }

    /// Current snapshot, served from the cache when the log has not changed
    /// since it was stored.
    pub fn snapshot(&self, key: &AggregateKey) -> Result<Snapshot, GatewayError> {
        let snapshot = load_snapshot(&self.log, &self.locks, key)?;
        Ok(present(&self.log, &self.locks, snapshot)?)
    }

    /// Wrap a raw daily step total from the health provider as an increment
    /// over what the day already holds. Totals at or below the projected
    /// value record nothing, so replayed readings cannot double-count.
    pub fn observe_daily_steps(
        &self,
        date: NaiveDate,
        raw_count: u64,
    ) -> Result<Option<Recorded>, GatewayError> {
        let key = AggregateKey::daily(date);
        let lock = self.locks.handle(&key)?;
        let guard = lock.lock().map_err(|_| LogError::Poisoned)?;

        let current = match current_snapshot(&self.log, &key)? {
            Snapshot::Daily(day) => day.steps,
            _ => 0,
        };
        if raw_count <= current {
            return Ok(None);
        }
        let delta = raw_count - current;
        let (operation, snapshot) = self.append_locked(&key, OpKind::AddSteps { delta })?;
        drop(guard);
        Ok(Some(self.announce(&key, operation, snapshot)))
    }

    /// Issue the monthly shield refill for the month containing `today`.
    /// Skipped if this device already sees an applied grant for the period;
    /// concurrent grants from other devices collapse on merge.
    pub fn grant_monthly_refill(
        &self,
        today: NaiveDate,
        count: u32,
    ) -> Result<Option<Recorded>, GatewayError> {
        let key = AggregateKey::shields();
        let grant = GrantKey::monthly_refill(today);
        let lock = self.locks.handle(&key)?;
        let guard = lock.lock().map_err(|_| LogError::Poisoned)?;

        if let Snapshot::Shields(ledger) = current_snapshot(&self.log, &key)? {
            let already = ledger.entries.iter().any(|e| {
                e.status == EntryStatus::Applied
                    && matches!(&e.movement, LedgerMovement::Grant { grant: g, .. } if *g == grant)
            });
            if already {
                return Ok(None);
            }
        }
        info!(%grant, count, "granting monthly shield refill");
        let (operation, snapshot) =
            self.append_locked(&key, OpKind::GrantShield { grant, count })?;
        drop(guard);
        Ok(Some(self.announce(&key, operation, snapshot)))
    }

    /// Spend one shield to protect `date` in the streak. The day counts as
    /// protected only while the consume stays applied in the merged ledger.
    /// Returns `None` when this device already protects the day.
    pub fn protect_day(&self, date: NaiveDate) -> Result<Option<Recorded>, GatewayError> {
        let key = AggregateKey::shields();
        let lock = self.locks.handle(&key)?;
        let guard = lock.lock().map_err(|_| LogError::Poisoned)?;

        if let Snapshot::Shields(ledger) = current_snapshot(&self.log, &key)? {
            let protected = ledger.entries.iter().any(|e| {
                e.status == EntryStatus::Applied
                    && matches!(e.movement, LedgerMovement::Consume { date: d } if d == date)
            });
            if protected {
                return Ok(None);
            }
            if ledger.balance == 0 {
                return Err(GatewayError::NoShields(date));
            }
        }
        let (operation, snapshot) = self.append_locked(&key, OpKind::ConsumeShield { date })?;
        drop(guard);
        Ok(Some(self.announce(&key, operation, snapshot)))
    }

    /// Stamp, append and re-project. The caller holds the aggregate lock.
    fn append_locked(
        &self,
        key: &AggregateKey,
        kind: OpKind,
    ) -> Result<(Operation, Snapshot), LogError> {
        let wall_clock = now_millis();
        let operation = self.log.append_local(|logical_clock| Operation {
            op_id: OpId::new(),
            device_id: self.device_id.clone(),
            aggregate: key.clone(),
            kind,
            logical_clock,
            wall_clock,
        })?;
        let ops = self.log.all_ops(key)?;
        let snapshot = project(key.aggregate_type, &ops);
        self.log.store_snapshot(key, &snapshot)?;
        Ok((operation, snapshot))
    }

    /// Publish a durable local change. Failures past this point only affect
    /// how the change is presented, never whether it was recorded.
    fn announce(&self, key: &AggregateKey, operation: Operation, snapshot: Snapshot) -> Recorded {
        debug!(
            %key,
            op_id = %operation.op_id,
            kind = operation.kind.name(),
            clock = operation.logical_clock,
            "recorded local operation"
        );
        let snapshot = match present(&self.log, &self.locks, snapshot.clone()) {
            Ok(presented) => presented,
            Err(err) => {
                warn!(%key, error = %err, "cannot derive presented snapshot");
                snapshot
            }
        };
        self.events.publish(key, &snapshot, ChangeSource::Local);
        if key.aggregate_type == AggregateType::ShieldLedger {
            publish_streak_view(&self.log, &self.locks, &self.events);
        }
        Recorded {
            operation,
            snapshot,
        }
    }
}

/// Cached snapshot, or a fresh projection that is then cached. The caller
/// holds the aggregate lock.
fn current_snapshot(log: &OperationLog, key: &AggregateKey) -> Result<Snapshot, LogError> {
    if let Some(cached) = log.cached_snapshot(key)? {
        return Ok(cached);
    }
    let snapshot = project(key.aggregate_type, &log.all_ops(key)?);
    log.store_snapshot(key, &snapshot)?;
    Ok(snapshot)
}

pub(crate) fn load_snapshot(
    log: &OperationLog,
    locks: &AggregateLocks,
    key: &AggregateKey,
) -> Result<Snapshot, LogError> {
    let lock = locks.handle(key)?;
    let _guard = lock.lock().map_err(|_| LogError::Poisoned)?;
    current_snapshot(log, key)
}

/// Snapshot as shown to callers. Streaks gain the days protected by applied
/// shield consumes; every other aggregate is returned as projected.
pub(crate) fn present(
    log: &OperationLog,
    locks: &AggregateLocks,
    snapshot: Snapshot,
) -> Result<Snapshot, LogError> {
    let Snapshot::Streak(streak) = snapshot else {
        return Ok(snapshot);
    };
    let streak = match load_snapshot(log, locks, &AggregateKey::shields())? {
        Snapshot::Shields(ledger) => protect_with_shields(streak, &ledger),
        _ => streak,
    };
    Ok(Snapshot::Streak(streak))
}

/// Tell subscribers the streak view moved after a shield ledger change.
pub(crate) fn publish_streak_view(
    log: &OperationLog,
    locks: &AggregateLocks,
    events: &SnapshotEvents,
) {
    let key = AggregateKey::streak();
    match load_snapshot(log, locks, &key).and_then(|s| present(log, locks, s)) {
        Ok(view) => events.publish(&key, &view, ChangeSource::Derived),
        Err(err) => warn!(%key, error = %err, "cannot refresh streak view"),
    }
}

/// Wall clock truncated to the millisecond precision the log persists.
fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
