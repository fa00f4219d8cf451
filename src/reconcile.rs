//! Reconciliation of local and pulled remote operations.
//!
//! The merged state is the projection of the deduplicated union of both
//! operation sets. Nothing is compared snapshot-to-snapshot, so applying the
//! same remote batch twice, or two batches in either order, converges to the
//! same value.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::events::{ChangeSource, SnapshotEvents};
use crate::gateway::{present, publish_streak_view};
use crate::op::{AggregateKey, AggregateType, OpId, Operation};
use crate::oplog::{AggregateLocks, LogError, OperationLog};
use crate::project::{Snapshot, canonical_order, project};

/// Deduplicated union of two operation sets. Ledger aggregates come back in
/// the deterministic replay order; other rules are order independent and keep
/// local-then-remote order.
pub fn merge<'a>(
    aggregate_type: AggregateType,
    local: &'a [Operation],
    remote: &'a [Operation],
) -> Vec<&'a Operation> {
    if aggregate_type.merge_rule().is_order_sensitive() {
        return canonical_order(local.iter().chain(remote));
    }
    let mut seen = HashSet::new();
    local
        .iter()
        .chain(remote)
        .filter(|op| seen.insert(op.op_id))
        .collect()
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// Remote operations that were new to the local log.
    pub appended: Vec<OpId>,
    /// Remote operations already present locally.
    pub duplicates: usize,
    pub snapshot: Snapshot,
}

#[derive(Clone)]
pub struct Reconciler {
    log: Arc<OperationLog>,
    locks: Arc<AggregateLocks>,
    events: SnapshotEvents,
}

impl Reconciler {
    pub fn new(log: Arc<OperationLog>, locks: Arc<AggregateLocks>, events: SnapshotEvents) -> Self {
        Self { log, locks, events }
    }

    /// Merge `remote_ops` into the local log for `key` and re-project.
    /// Operations addressed to a different aggregate are ignored.
    pub fn reconcile(
        &self,
        key: &AggregateKey,
        remote_ops: &[Operation],
    ) -> Result<ReconcileOutcome, LogError> {
        let remote: Vec<Operation> = remote_ops
            .iter()
            .filter(|op| op.aggregate == *key && op.is_well_formed())
            .cloned()
            .collect();

        let lock = self.locks.handle(key)?;
        let guard = lock.lock().map_err(|_| LogError::Poisoned)?;

        let local = self.log.all_ops(key)?;
        let known: HashSet<OpId> = local.iter().map(|op| op.op_id).collect();
        let mut fresh_ids = HashSet::new();
        let fresh: Vec<Operation> = remote
            .iter()
            .filter(|op| !known.contains(&op.op_id) && fresh_ids.insert(op.op_id))
            .cloned()
            .collect();

        let appended = if fresh.is_empty() {
            Vec::new()
        } else {
            self.log.append_remote_batch(&fresh)?
        };

        // Project what the log actually holds: an id already stored under
        // another aggregate is not appended and must not be counted here.
        let stored = if appended.is_empty() { local } else { self.log.all_ops(key)? };
        let snapshot = project(key.aggregate_type, &stored);
        self.log.store_snapshot(key, &snapshot)?;
        drop(guard);

        let snapshot = match present(&self.log, &self.locks, snapshot.clone()) {
            Ok(presented) => presented,
            Err(err) => {
                warn!(%key, error = %err, "cannot derive presented snapshot");
                snapshot
            }
        };

        let duplicates = remote.len() - appended.len();
        debug!(
            %key,
            pulled = remote.len(),
            appended = appended.len(),
            duplicates,
            "reconciled"
        );
        if !appended.is_empty() {
            info!(%key, appended = appended.len(), "merged remote operations");
            self.events.publish(key, &snapshot, ChangeSource::Remote);
            if key.aggregate_type == AggregateType::ShieldLedger {
                publish_streak_view(&self.log, &self.locks, &self.events);
            }
        }
        Ok(ReconcileOutcome {
            appended,
            duplicates,
            snapshot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{DeviceId, GrantKey, OpKind};
    use crate::project::{EntryStatus, VoidReason};
    use chrono::{NaiveDate, TimeZone, Utc};

    fn reconciler() -> Reconciler {
        Reconciler::new(
            Arc::new(OperationLog::open_in_memory().unwrap()),
            Arc::new(AggregateLocks::default()),
            SnapshotEvents::default(),
        )
    }

    fn shield_op(device: &str, clock: u64, kind: OpKind) -> Operation {
        Operation {
            op_id: OpId::new(),
            device_id: DeviceId::new(device),
            aggregate: AggregateKey::shields(),
            kind,
            logical_clock: clock,
            wall_clock: Utc.timestamp_opt(1_700_000_000 + clock as i64, 0).unwrap(),
        }
    }

    #[test]
    fn merge_dedups_by_op_id() {
        let a = shield_op("a", 1, OpKind::ConsumeShield {
            date: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
        });
        let local = vec![a.clone()];
        let remote = vec![a.clone(), a];
        assert_eq!(merge(AggregateType::ShieldLedger, &local, &remote).len(), 1);
        assert_eq!(merge(AggregateType::RankProgress, &local, &remote).len(), 1);
    }

    #[test]
    fn reconcile_twice_appends_once() {
        let r = reconciler();
        let key = AggregateKey::shields();
        let grant = shield_op("b", 1, OpKind::GrantShield {
            grant: GrantKey::new("refill:2026-10"),
            count: 1,
        });
        let first = r.reconcile(&key, std::slice::from_ref(&grant)).unwrap();
        assert_eq!(first.appended, vec![grant.op_id]);
        let second = r.reconcile(&key, std::slice::from_ref(&grant)).unwrap();
        assert!(second.appended.is_empty());
        assert_eq!(second.duplicates, 1);
        assert_eq!(first.snapshot, second.snapshot);
    }

    #[test]
    fn remote_overdraw_is_voided_against_local_history() {
        let r = reconciler();
        let key = AggregateKey::shields();
        let day = NaiveDate::from_ymd_opt(2026, 10, 5).unwrap();
        let grant = shield_op("a", 1, OpKind::GrantShield {
            grant: GrantKey::new("refill:2026-10"),
            count: 1,
        });
        r.reconcile(&key, &[grant]).unwrap();

        let local_consume = shield_op("a", 2, OpKind::ConsumeShield { date: day });
        r.log.append(&local_consume, crate::oplog::Origin::Local).unwrap();

        let remote_consume = shield_op("b", 3, OpKind::ConsumeShield { date: day });
        let outcome = r.reconcile(&key, &[remote_consume.clone()]).unwrap();
        match outcome.snapshot {
            Snapshot::Shields(s) => {
                assert_eq!(s.balance, 0);
                let voided = s.entries.iter().find(|e| e.op_id == remote_consume.op_id).unwrap();
                assert_eq!(voided.status, EntryStatus::Voided(VoidReason::InsufficientBalance));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn foreign_records_are_ignored() {
        let r = reconciler();
        let stray = shield_op("b", 1, OpKind::GrantShield {
            grant: GrantKey::new("refill:2026-10"),
            count: 3,
        });
        let outcome = r.reconcile(&AggregateKey::rank(), &[stray]).unwrap();
        assert!(outcome.appended.is_empty());
        assert!(r.log.all_ops(&AggregateKey::rank()).unwrap().is_empty());
    }

    #[test]
    fn id_stored_under_another_aggregate_is_not_counted() {
        let r = reconciler();
        let date = NaiveDate::from_ymd_opt(2026, 10, 3).unwrap();
        let mut steps = shield_op("b", 1, OpKind::AddSteps { delta: 900 });
        steps.aggregate = AggregateKey::daily(date);
        r.reconcile(&AggregateKey::daily(date), std::slice::from_ref(&steps))
            .unwrap();

        let mut xp = shield_op("b", 2, OpKind::EarnXp { amount: 250 });
        xp.op_id = steps.op_id;
        xp.aggregate = AggregateKey::rank();
        let key = AggregateKey::rank();
        let outcome = r.reconcile(&key, &[xp]).unwrap();

        assert!(outcome.appended.is_empty());
        match &outcome.snapshot {
            Snapshot::Rank(rank) => assert_eq!(rank.xp, 0),
            other => panic!("unexpected {other:?}"),
        }
        let stored = project(AggregateType::RankProgress, &r.log.all_ops(&key).unwrap());
        assert_eq!(r.log.cached_snapshot(&key).unwrap(), Some(stored));
    }

    #[test]
    fn shield_merge_refreshes_streak_view() {
        let r = reconciler();
        let mut rx = r.events.subscribe();
        let day = NaiveDate::from_ymd_opt(2026, 10, 7).unwrap();
        let grant = shield_op("b", 1, OpKind::GrantShield {
            grant: GrantKey::new("refill:2026-10"),
            count: 1,
        });
        let consume = shield_op("b", 2, OpKind::ConsumeShield { date: day });
        r.reconcile(&AggregateKey::shields(), &[grant, consume]).unwrap();

        let remote = rx.try_recv().unwrap();
        assert_eq!(remote.source, ChangeSource::Remote);
        let derived = rx.try_recv().unwrap();
        assert_eq!(derived.key, AggregateKey::streak());
        assert_eq!(derived.source, ChangeSource::Derived);
        match derived.snapshot {
            Snapshot::Streak(streak) => {
                assert!(streak.protected_days.contains(&day));
                assert_eq!(streak.current_streak, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
