use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Largest logical clock accepted from any device. Leaves the rest of the
/// `i64` range the log stores as headroom for local stamping, so one record
/// from a misbehaving peer cannot exhaust this device's clock.
pub const MAX_LOGICAL_CLOCK: u64 = 1 << 48;

/// Globally unique operation id, generated on the device that authored it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(pub Uuid);

impl OpId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for OpId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable identifier of one installation of the app.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of synchronized entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AggregateType {
    Profile,
    StreakState,
    ShieldLedger,
    RankProgress,
    DailyLog,
    TrackedWalk,
    ChallengeProgress,
}

impl AggregateType {
    pub const ALL: [AggregateType; 7] = [
        AggregateType::Profile,
        AggregateType::StreakState,
        AggregateType::ShieldLedger,
        AggregateType::RankProgress,
        AggregateType::DailyLog,
        AggregateType::TrackedWalk,
        AggregateType::ChallengeProgress,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AggregateType::Profile => "profile",
            AggregateType::StreakState => "streak_state",
            AggregateType::ShieldLedger => "shield_ledger",
            AggregateType::RankProgress => "rank_progress",
            AggregateType::DailyLog => "daily_log",
            AggregateType::TrackedWalk => "tracked_walk",
            AggregateType::ChallengeProgress => "challenge_progress",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// The single reduction rule used to project this aggregate type.
    pub fn merge_rule(self) -> MergeRule {
        match self {
            AggregateType::Profile => MergeRule::Settings,
            AggregateType::StreakState => MergeRule::DaySet,
            AggregateType::ShieldLedger => MergeRule::Ledger,
            AggregateType::RankProgress => MergeRule::Sum,
            AggregateType::DailyLog => MergeRule::DailyRecord,
            AggregateType::TrackedWalk => MergeRule::InsertIfAbsentMap,
            AggregateType::ChallengeProgress => MergeRule::ChallengeBoard,
        }
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an aggregate's operation set reduces to a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// Additive counter.
    Sum,
    /// Boolean flags (OR) plus preference registers won by the greatest op.
    Settings,
    /// Grow-only set of covered days.
    DaySet,
    /// Floor-checked replay of grants and consumes.
    Ledger,
    /// Per-day record: summed counters and absorbing flags.
    DailyRecord,
    /// Immutable records inserted if absent by their own id.
    InsertIfAbsentMap,
    /// Per-challenge summed progress and absorbing completion flag.
    ChallengeBoard,
}

impl MergeRule {
    /// Whether the projection depends on the replay order of the operations.
    pub fn is_order_sensitive(self) -> bool {
        matches!(self, MergeRule::Ledger)
    }
}

pub const USER_SCOPE: &str = "user";

/// Address of one aggregate instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateKey {
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
}

impl AggregateKey {
    pub fn new(aggregate_type: AggregateType, aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_type,
            aggregate_id: aggregate_id.into(),
        }
    }

    pub fn profile() -> Self {
        Self::new(AggregateType::Profile, USER_SCOPE)
    }

    pub fn streak() -> Self {
        Self::new(AggregateType::StreakState, USER_SCOPE)
    }

    pub fn shields() -> Self {
        Self::new(AggregateType::ShieldLedger, USER_SCOPE)
    }

    pub fn rank() -> Self {
        Self::new(AggregateType::RankProgress, USER_SCOPE)
    }

    pub fn daily(date: NaiveDate) -> Self {
        Self::new(AggregateType::DailyLog, date.format("%Y-%m-%d").to_string())
    }

    pub fn walks() -> Self {
        Self::new(AggregateType::TrackedWalk, USER_SCOPE)
    }

    pub fn challenges() -> Self {
        Self::new(AggregateType::ChallengeProgress, USER_SCOPE)
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.aggregate_type, self.aggregate_id)
    }
}

/// Deterministic identity of a shield grant. Two grants with the same key are
/// one grant, whichever device issued them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantKey(String);

impl GrantKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Monthly refill keyed by the UTC calendar month of `today`.
    pub fn monthly_refill(today: NaiveDate) -> Self {
        Self(format!("refill:{:04}-{:02}", today.year(), today.month()))
    }

    pub fn purchase(transaction: Uuid) -> Self {
        Self(format!("purchase:{transaction}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GrantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A completed walk as captured by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkRecord {
    pub walk_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_secs: u32,
    pub steps: u64,
    pub distance_m: u32,
}

/// State change carried by an operation. Every variant belongs to exactly one
/// aggregate type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpKind {
    // Profile
    SetFlag { flag: String },
    SetPreference { field: String, value: serde_json::Value },
    // StreakState
    SetGoalMet { date: NaiveDate },
    // ShieldLedger
    GrantShield { grant: GrantKey, count: u32 },
    ConsumeShield { date: NaiveDate },
    // RankProgress
    EarnXp { amount: u64 },
    // DailyLog
    AddSteps { delta: u64 },
    MarkGoalMet,
    // TrackedWalk
    RecordWalk { walk: WalkRecord },
    // ChallengeProgress
    AddChallengeProgress { challenge_id: String, delta: u64 },
    CompleteChallenge { challenge_id: String },
}

impl OpKind {
    pub fn aggregate_type(&self) -> AggregateType {
        match self {
            OpKind::SetFlag { .. } | OpKind::SetPreference { .. } => AggregateType::Profile,
            OpKind::SetGoalMet { .. } => AggregateType::StreakState,
            OpKind::GrantShield { .. } | OpKind::ConsumeShield { .. } => {
                AggregateType::ShieldLedger
            }
            OpKind::EarnXp { .. } => AggregateType::RankProgress,
            OpKind::AddSteps { .. } | OpKind::MarkGoalMet => AggregateType::DailyLog,
            OpKind::RecordWalk { .. } => AggregateType::TrackedWalk,
            OpKind::AddChallengeProgress { .. } | OpKind::CompleteChallenge { .. } => {
                AggregateType::ChallengeProgress
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpKind::SetFlag { .. } => "set_flag",
            OpKind::SetPreference { .. } => "set_preference",
            OpKind::SetGoalMet { .. } => "set_goal_met",
            OpKind::GrantShield { .. } => "grant_shield",
            OpKind::ConsumeShield { .. } => "consume_shield",
            OpKind::EarnXp { .. } => "earn_xp",
            OpKind::AddSteps { .. } => "add_steps",
            OpKind::MarkGoalMet => "mark_goal_met",
            OpKind::RecordWalk { .. } => "record_walk",
            OpKind::AddChallengeProgress { .. } => "add_challenge_progress",
            OpKind::CompleteChallenge { .. } => "complete_challenge",
        }
    }
}

/// Immutable record of a single state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub op_id: OpId,
    pub device_id: DeviceId,
    pub aggregate: AggregateKey,
    pub kind: OpKind,
    pub logical_clock: u64,
    pub wall_clock: DateTime<Utc>,
}

impl Operation {
    /// True when the kind belongs to the aggregate type it is addressed to
    /// and the logical clock is within the accepted range.
    pub fn is_well_formed(&self) -> bool {
        self.kind.aggregate_type() == self.aggregate.aggregate_type
            && (1..=MAX_LOGICAL_CLOCK).contains(&self.logical_clock)
    }

    /// Deterministic total order: logical clock first, wall clock and device
    /// only break ties between concurrent operations.
    pub fn causal_cmp(&self, other: &Self) -> Ordering {
        self.logical_clock
            .cmp(&other.logical_clock)
            .then_with(|| self.wall_clock.cmp(&other.wall_clock))
            .then_with(|| self.device_id.cmp(&other.device_id))
            .then_with(|| self.op_id.cmp(&other.op_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn op(clock: u64, secs: i64, device: &str) -> Operation {
        Operation {
            op_id: OpId::new(),
            device_id: DeviceId::new(device),
            aggregate: AggregateKey::rank(),
            kind: OpKind::EarnXp { amount: 1 },
            logical_clock: clock,
            wall_clock: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn aggregate_type_names_round_trip() {
        for t in AggregateType::ALL {
            assert_eq!(AggregateType::parse(t.as_str()), Some(t));
        }
        assert_eq!(AggregateType::parse("nope"), None);
    }

    #[test]
    fn only_ledger_is_order_sensitive() {
        let sensitive: Vec<_> = AggregateType::ALL
            .into_iter()
            .filter(|t| t.merge_rule().is_order_sensitive())
            .collect();
        assert_eq!(sensitive, vec![AggregateType::ShieldLedger]);
    }

    #[test]
    fn kind_serializes_with_type_tag() {
        let kind = OpKind::GrantShield {
            grant: GrantKey::new("refill:2026-10"),
            count: 2,
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "grant_shield");
        assert_eq!(json["grant"], "refill:2026-10");
        let back: OpKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, kind);
        assert_eq!(back.aggregate_type(), AggregateType::ShieldLedger);
    }

    #[test]
    fn monthly_refill_key_is_month_granular() {
        let a = GrantKey::monthly_refill(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        let b = GrantKey::monthly_refill(NaiveDate::from_ymd_opt(2026, 3, 31).unwrap());
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "refill:2026-03");
    }

    #[test]
    fn logical_clock_dominates_wall_clock() {
        let early_wall_late_clock = op(5, 10, "b");
        let late_wall_early_clock = op(4, 99, "a");
        assert_eq!(
            late_wall_early_clock.causal_cmp(&early_wall_late_clock),
            Ordering::Less
        );

        let a = op(3, 10, "a");
        let b = op(3, 10, "b");
        assert_eq!(a.causal_cmp(&b), Ordering::Less);
    }

    #[test]
    fn mismatched_kind_is_not_well_formed() {
        let mut o = op(1, 0, "a");
        assert!(o.is_well_formed());
        o.kind = OpKind::MarkGoalMet;
        assert!(!o.is_well_formed());
    }

    #[test]
    fn clock_outside_accepted_range_is_not_well_formed() {
        assert!(op(MAX_LOGICAL_CLOCK, 0, "a").is_well_formed());
        assert!(!op(MAX_LOGICAL_CLOCK + 1, 0, "a").is_well_formed());
        assert!(!op(i64::MAX as u64, 0, "a").is_well_formed());
        assert!(!op(0, 0, "a").is_well_formed());
    }
}
