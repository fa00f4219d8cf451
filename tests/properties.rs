//! Merge laws over randomly generated operation sets.
//!
//! For every aggregate type, the snapshot of merged operation sets must not
//! depend on merge order, grouping or repetition, and the shield ledger must
//! never go below zero.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use proptest::prelude::*;
use serde_json::json;
use streak_sync::events::SnapshotEvents;
use streak_sync::oplog::AggregateLocks;
use streak_sync::{
    AggregateKey, AggregateType, DeviceId, GrantKey, OpId, OpKind, Operation, OperationLog,
    Reconciler, Snapshot, WalkRecord, merge, project,
};
use uuid::Uuid;

const DEVICES: [&str; 3] = ["phone", "tablet", "watch"];

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
}

fn kind_strategy(aggregate_type: AggregateType) -> BoxedStrategy<OpKind> {
    match aggregate_type {
        AggregateType::Profile => prop_oneof![
            prop::sample::select(vec!["onboarded", "notifications", "beta"])
                .prop_map(|f| OpKind::SetFlag { flag: f.into() }),
            (prop::sample::select(vec!["units", "goal"]), 0..5i64).prop_map(|(field, v)| {
                OpKind::SetPreference {
                    field: field.into(),
                    value: json!(v),
                }
            }),
        ]
        .boxed(),
        AggregateType::StreakState => (1..20u32)
            .prop_map(|d| OpKind::SetGoalMet { date: day(d) })
            .boxed(),
        AggregateType::ShieldLedger => prop_oneof![
            (0..3u8, 1..3u32).prop_map(|(g, count)| OpKind::GrantShield {
                grant: GrantKey::new(format!("purchase:{g}")),
                count,
            }),
            (1..28u32).prop_map(|d| OpKind::ConsumeShield { date: day(d) }),
        ]
        .boxed(),
        AggregateType::RankProgress => (0..500u64)
            .prop_map(|amount| OpKind::EarnXp { amount })
            .boxed(),
        AggregateType::DailyLog => prop_oneof![
            (0..5_000u64).prop_map(|delta| OpKind::AddSteps { delta }),
            Just(OpKind::MarkGoalMet),
        ]
        .boxed(),
        AggregateType::TrackedWalk => (0..4u128, 0..10_000u64)
            .prop_map(|(id, steps)| OpKind::RecordWalk {
                walk: WalkRecord {
                    walk_id: Uuid::from_u128(id + 1),
                    started_at: DateTime::from_timestamp(1_760_000_000, 0).unwrap(),
                    duration_secs: 600,
                    steps,
                    distance_m: (steps / 2) as u32,
                },
            })
            .boxed(),
        AggregateType::ChallengeProgress => prop_oneof![
            (prop::sample::select(vec!["a", "b"]), 0..300u64).prop_map(|(id, delta)| {
                OpKind::AddChallengeProgress {
                    challenge_id: id.into(),
                    delta,
                }
            }),
            prop::sample::select(vec!["a", "b"])
                .prop_map(|id| OpKind::CompleteChallenge { challenge_id: id.into() }),
        ]
        .boxed(),
    }
}

fn op_strategy(aggregate_type: AggregateType) -> impl Strategy<Value = Operation> {
    (
        any::<u128>(),
        0..DEVICES.len(),
        1..40u64,
        0..5i64,
        kind_strategy(aggregate_type),
    )
        .prop_map(move |(id, device, clock, secs, kind)| Operation {
            op_id: OpId(Uuid::from_u128(id)),
            device_id: DeviceId::new(DEVICES[device]),
            aggregate: AggregateKey::new(aggregate_type, "user"),
            kind,
            logical_clock: clock,
            wall_clock: DateTime::<Utc>::from_timestamp(1_760_000_000 + secs, 0).unwrap(),
        })
}

type Replicas = (AggregateType, Vec<Operation>, Vec<Operation>, Vec<Operation>);

/// Three overlapping replicas drawn from one pool of operations.
fn replicas() -> impl Strategy<Value = Replicas> {
    prop::sample::select(AggregateType::ALL.to_vec()).prop_flat_map(|aggregate_type| {
        prop::collection::vec((op_strategy(aggregate_type), 0..8u8), 0..24).prop_map(
            move |pool| {
                let pick = |bit: u8| -> Vec<Operation> {
                    pool.iter()
                        .filter(|(_, mask)| mask & bit != 0)
                        .map(|(op, _)| op.clone())
                        .collect()
                };
                (aggregate_type, pick(1), pick(2), pick(4))
            },
        )
    })
}

fn owned(ops: Vec<&Operation>) -> Vec<Operation> {
    ops.into_iter().cloned().collect()
}

proptest! {
    #[test]
    fn merge_is_commutative((t, a, b, _) in replicas()) {
        prop_assert_eq!(project(t, merge(t, &a, &b)), project(t, merge(t, &b, &a)));
    }

    #[test]
    fn merge_is_idempotent((t, a, b, _) in replicas()) {
        let once = owned(merge(t, &a, &b));
        let twice = owned(merge(t, &once, &b));
        prop_assert_eq!(project(t, &once), project(t, &twice));
        prop_assert_eq!(project(t, merge(t, &a, &a)), project(t, &a));
    }

    #[test]
    fn merge_is_associative((t, a, b, c) in replicas()) {
        let left = owned(merge(t, &owned(merge(t, &a, &b)), &c));
        let right = owned(merge(t, &a, &owned(merge(t, &b, &c))));
        prop_assert_eq!(project(t, &left), project(t, &right));
    }

    #[test]
    fn shield_balance_never_negative(
        ops in prop::collection::vec(op_strategy(AggregateType::ShieldLedger), 0..40)
    ) {
        let Snapshot::Shields(ledger) = project(AggregateType::ShieldLedger, &ops) else {
            panic!("shield ledger projected to another snapshot");
        };
        prop_assert!(ledger.granted >= ledger.consumed);
        prop_assert_eq!(ledger.balance, ledger.granted - ledger.consumed);
    }

    #[test]
    fn reconcilers_converge_in_either_order((t, a, b, _) in replicas()) {
        let key = AggregateKey::new(t, "user");
        let reconciler = || {
            Reconciler::new(
                Arc::new(OperationLog::open_in_memory().unwrap()),
                Arc::new(AggregateLocks::default()),
                SnapshotEvents::default(),
            )
        };
        let (first, second) = (reconciler(), reconciler());

        first.reconcile(&key, &a).unwrap();
        let left = first.reconcile(&key, &b).unwrap().snapshot;
        second.reconcile(&key, &b).unwrap();
        let right = second.reconcile(&key, &a).unwrap().snapshot;

        prop_assert_eq!(&left, &right);
        prop_assert_eq!(left, project(t, a.iter().chain(&b)));
    }
}
