//! Pure projection of an aggregate's operation set into its current value.
//!
//! Every aggregate type has exactly one reduction rule (see
//! [`AggregateType::merge_rule`]). Projection is total: malformed operations are
//! skipped and duplicate `op_id`s are applied once, so replaying the same set
//! any number of times yields the same snapshot.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::op::{AggregateType, GrantKey, MergeRule, OpId, OpKind, Operation, WalkRecord};

/// Materialized value of one aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "aggregate", rename_all = "snake_case")]
pub enum Snapshot {
    Profile(ProfileSnapshot),
    Streak(StreakSnapshot),
    Shields(ShieldSnapshot),
    Rank(RankSnapshot),
    Daily(DailySnapshot),
    Walks(WalkHistory),
    Challenges(ChallengeBoard),
}

impl Snapshot {
    pub fn aggregate_type(&self) -> AggregateType {
        match self {
            Snapshot::Profile(_) => AggregateType::Profile,
            Snapshot::Streak(_) => AggregateType::StreakState,
            Snapshot::Shields(_) => AggregateType::ShieldLedger,
            Snapshot::Rank(_) => AggregateType::RankProgress,
            Snapshot::Daily(_) => AggregateType::DailyLog,
            Snapshot::Walks(_) => AggregateType::TrackedWalk,
            Snapshot::Challenges(_) => AggregateType::ChallengeProgress,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub flags: BTreeSet<String>,
    pub preferences: BTreeMap<String, serde_json::Value>,
}

impl ProfileSnapshot {
    pub fn flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakSnapshot {
    pub goal_met_days: BTreeSet<NaiveDate>,
    /// Days covered by an applied shield consume. Empty in the stored
    /// projection; filled in by [`protect_with_shields`].
    pub protected_days: BTreeSet<NaiveDate>,
    /// Most recent day covered by a met goal or a shield.
    pub last_covered_day: Option<NaiveDate>,
    /// Length of the run of consecutive covered days ending at `last_covered_day`.
    pub current_streak: u32,
    pub longest_streak: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoidReason {
    InsufficientBalance,
    DuplicateGrant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum EntryStatus {
    Applied,
    Voided(VoidReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum LedgerMovement {
    Grant { grant: GrantKey, count: u32 },
    Consume { date: NaiveDate },
}

/// One replayed ledger operation with its outcome, kept for auditing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub op_id: OpId,
    pub movement: LedgerMovement,
    pub status: EntryStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShieldSnapshot {
    pub balance: u32,
    pub granted: u32,
    pub consumed: u32,
    pub entries: Vec<LedgerEntry>,
}

impl ShieldSnapshot {
    pub fn voided(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.status, EntryStatus::Voided(_)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankTier {
    #[default]
    Bronze,
    Silver,
    Gold,
    Platinum,
    Diamond,
}

impl RankTier {
    const THRESHOLDS: [(u64, RankTier); 5] = [
        (40_000, RankTier::Diamond),
        (15_000, RankTier::Platinum),
        (5_000, RankTier::Gold),
        (1_000, RankTier::Silver),
        (0, RankTier::Bronze),
    ];

    pub fn for_xp(xp: u64) -> Self {
        Self::THRESHOLDS
            .iter()
            .find(|(min, _)| xp >= *min)
            .map(|(_, tier)| *tier)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankSnapshot {
    pub xp: u64,
    pub tier: RankTier,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySnapshot {
    pub steps: u64,
    pub goal_met: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkHistory {
    pub walks: BTreeMap<Uuid, WalkRecord>,
    pub total_steps: u64,
    pub total_distance_m: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeState {
    pub progress: u64,
    pub completed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeBoard {
    pub challenges: BTreeMap<String, ChallengeState>,
}

impl ChallengeBoard {
    pub fn is_completed(&self, challenge_id: &str) -> bool {
        self.challenges
            .get(challenge_id)
            .is_some_and(|c| c.completed)
    }
}

/// Drop duplicate `op_id`s (first occurrence wins) and sort into the
/// deterministic causal order.
pub fn canonical_order<'a, I>(ops: I) -> Vec<&'a Operation>
where
    I: IntoIterator<Item = &'a Operation>,
{
    let mut seen = HashSet::new();
    let mut out: Vec<&Operation> = ops.into_iter().filter(|op| seen.insert(op.op_id)).collect();
    out.sort_by(|a, b| a.causal_cmp(b));
    out
}

/// Replay `ops` into the snapshot of an aggregate of type `aggregate_type`.
pub fn project<'a, I>(aggregate_type: AggregateType, ops: I) -> Snapshot
where
    I: IntoIterator<Item = &'a Operation>,
{
    let ordered: Vec<&Operation> = canonical_order(ops)
        .into_iter()
        .filter(|op| {
            let ok = op.is_well_formed() && op.aggregate.aggregate_type == aggregate_type;
            if !ok {
                warn!(
                    op_id = %op.op_id,
                    kind = op.kind.name(),
                    aggregate = %op.aggregate,
                    "skipping operation that does not belong to {aggregate_type}"
                );
            }
            ok
        })
        .collect();

    trace!(%aggregate_type, ops = ordered.len(), "projecting");

    match aggregate_type.merge_rule() {
        MergeRule::Settings => Snapshot::Profile(project_profile(&ordered)),
        MergeRule::DaySet => Snapshot::Streak(project_streak(&ordered)),
        MergeRule::Ledger => Snapshot::Shields(project_ledger(&ordered)),
        MergeRule::Sum => Snapshot::Rank(project_rank(&ordered)),
        MergeRule::DailyRecord => Snapshot::Daily(project_daily(&ordered)),
        MergeRule::InsertIfAbsentMap => Snapshot::Walks(project_walks(&ordered)),
        MergeRule::ChallengeBoard => Snapshot::Challenges(project_challenges(&ordered)),
    }
}

fn project_profile(ops: &[&Operation]) -> ProfileSnapshot {
    let mut out = ProfileSnapshot::default();
    // Ops arrive in causal order, so the last write per field is the greatest.
    for op in ops {
        match &op.kind {
            OpKind::SetFlag { flag } => {
                out.flags.insert(flag.clone());
            }
            OpKind::SetPreference { field, value } => {
                out.preferences.insert(field.clone(), value.clone());
            }
            _ => {}
        }
    }
    out
}

fn project_streak(ops: &[&Operation]) -> StreakSnapshot {
    let mut out = StreakSnapshot::default();
    for op in ops {
        if let OpKind::SetGoalMet { date } = &op.kind {
            out.goal_met_days.insert(*date);
        }
    }
    fill_runs(&mut out);
    out
}

/// Fold the days protected by applied shield consumes into a streak. Voided
/// consumes protect nothing, so a shield spent twice across devices covers
/// only the day its surviving consume names.
pub fn protect_with_shields(
    mut streak: StreakSnapshot,
    ledger: &ShieldSnapshot,
) -> StreakSnapshot {
    streak.protected_days = ledger
        .entries
        .iter()
        .filter_map(|e| match (&e.movement, e.status) {
            (LedgerMovement::Consume { date }, EntryStatus::Applied) => Some(*date),
            _ => None,
        })
        .collect();
    fill_runs(&mut streak);
    streak
}

fn fill_runs(out: &mut StreakSnapshot) {
    let covered: BTreeSet<NaiveDate> = out
        .goal_met_days
        .union(&out.protected_days)
        .copied()
        .collect();

    let mut run = 0u32;
    let mut longest = 0u32;
    let mut prev: Option<NaiveDate> = None;
    for day in &covered {
        run = match prev.and_then(|p| p.succ_opt()) {
            Some(next) if next == *day => run.saturating_add(1),
            _ => 1,
        };
        longest = longest.max(run);
        prev = Some(*day);
    }
    out.longest_streak = longest;
    out.current_streak = run;
    out.last_covered_day = prev;
}

fn project_ledger(ops: &[&Operation]) -> ShieldSnapshot {
    let mut out = ShieldSnapshot::default();
    let mut seen_grants: HashSet<&GrantKey> = HashSet::new();

    for op in ops {
        let (movement, status) = match &op.kind {
            OpKind::GrantShield { grant, count } => {
                let status = if seen_grants.insert(grant) {
                    out.balance = out.balance.saturating_add(*count);
                    out.granted = out.granted.saturating_add(*count);
                    EntryStatus::Applied
                } else {
                    EntryStatus::Voided(VoidReason::DuplicateGrant)
                };
                let movement = LedgerMovement::Grant {
                    grant: grant.clone(),
                    count: *count,
                };
                (movement, status)
            }
            OpKind::ConsumeShield { date } => {
                let status = if out.balance > 0 {
                    out.balance -= 1;
                    out.consumed += 1;
                    EntryStatus::Applied
                } else {
                    EntryStatus::Voided(VoidReason::InsufficientBalance)
                };
                (LedgerMovement::Consume { date: *date }, status)
            }
            _ => continue,
        };

        if let EntryStatus::Voided(reason) = status {
            warn!(op_id = %op.op_id, device = %op.device_id, ?reason, "voiding ledger entry");
        }
        out.entries.push(LedgerEntry {
            op_id: op.op_id,
            movement,
            status,
        });
    }
    out
}

fn project_rank(ops: &[&Operation]) -> RankSnapshot {
    let xp = ops
        .iter()
        .filter_map(|op| match op.kind {
            OpKind::EarnXp { amount } => Some(amount),
            _ => None,
        })
        .fold(0u64, u64::saturating_add);
    RankSnapshot {
        xp,
        tier: RankTier::for_xp(xp),
    }
}

fn project_daily(ops: &[&Operation]) -> DailySnapshot {
    let mut out = DailySnapshot::default();
    for op in ops {
        match op.kind {
            OpKind::AddSteps { delta } => out.steps = out.steps.saturating_add(delta),
            OpKind::MarkGoalMet => out.goal_met = true,
            _ => {}
        }
    }
    out
}

fn project_walks(ops: &[&Operation]) -> WalkHistory {
    let mut out = WalkHistory::default();
    for op in ops {
        if let OpKind::RecordWalk { walk } = &op.kind {
            // Records are immutable: the earliest insert for an id wins.
            out.walks.entry(walk.walk_id).or_insert_with(|| walk.clone());
        }
    }
    for walk in out.walks.values() {
        out.total_steps = out.total_steps.saturating_add(walk.steps);
        out.total_distance_m = out.total_distance_m.saturating_add(u64::from(walk.distance_m));
    }
    out
}

fn project_challenges(ops: &[&Operation]) -> ChallengeBoard {
    let mut out = ChallengeBoard::default();
    for op in ops {
        match &op.kind {
            OpKind::AddChallengeProgress {
                challenge_id,
                delta,
            } => {
                let state = out.challenges.entry(challenge_id.clone()).or_default();
                state.progress = state.progress.saturating_add(*delta);
            }
            OpKind::CompleteChallenge { challenge_id } => {
                out.challenges.entry(challenge_id.clone()).or_default().completed = true;
            }
            _ => {}
        }
    }
    out
}
