//! Boundary to the opaque remote record service.
//!
//! The backend only has to store records, hand them back in a stable order
//! behind an opaque cursor, and tolerate a repeated `op_id`. Everything else
//! (merge, ordering, dedup) happens on the device.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::op::{AggregateKey, AggregateType, DeviceId, MAX_LOGICAL_CLOCK, OpId, OpKind, Operation};

/// Most records the backend accepts in one write.
pub const MAX_PUSH_BATCH: usize = 400;

/// Opaque marker of how far an aggregate's remote history has been pulled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Record shape stored by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub op_id: String,
    pub device_id: String,
    pub kind: serde_json::Value,
    pub logical_clock: u64,
    pub wall_clock_ms: i64,
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("bad op_id: {0}")]
    OpId(#[from] uuid::Error),
    #[error("unknown aggregate type {0}")]
    AggregateType(String),
    #[error("bad kind: {0}")]
    Kind(#[from] serde_json::Error),
    #[error("wall clock out of range: {0}")]
    WallClock(i64),
    #[error("logical clock out of range: {0}")]
    LogicalClock(u64),
    #[error("{kind} does not belong to {aggregate_type}")]
    KindMismatch {
        kind: &'static str,
        aggregate_type: AggregateType,
    },
}

impl TryFrom<&Operation> for RemoteRecord {
    type Error = serde_json::Error;

    fn try_from(op: &Operation) -> Result<Self, Self::Error> {
        Ok(Self {
            aggregate_type: op.aggregate.aggregate_type.as_str().to_string(),
            aggregate_id: op.aggregate.aggregate_id.clone(),
            op_id: op.op_id.to_string(),
            device_id: op.device_id.as_str().to_string(),
            kind: serde_json::to_value(&op.kind)?,
            logical_clock: op.logical_clock,
            wall_clock_ms: op.wall_clock.timestamp_millis(),
        })
    }
}

impl RemoteRecord {
    pub fn decode(&self) -> Result<Operation, DecodeError> {
        if !(1..=MAX_LOGICAL_CLOCK).contains(&self.logical_clock) {
            return Err(DecodeError::LogicalClock(self.logical_clock));
        }
        let aggregate_type = AggregateType::parse(&self.aggregate_type)
            .ok_or_else(|| DecodeError::AggregateType(self.aggregate_type.clone()))?;
        let kind: OpKind = serde_json::from_value(self.kind.clone())?;
        if kind.aggregate_type() != aggregate_type {
            return Err(DecodeError::KindMismatch {
                kind: kind.name(),
                aggregate_type,
            });
        }
        let wall_clock: DateTime<Utc> = DateTime::from_timestamp_millis(self.wall_clock_ms)
            .ok_or(DecodeError::WallClock(self.wall_clock_ms))?;
        Ok(Operation {
            op_id: OpId::parse(&self.op_id)?,
            device_id: DeviceId::new(self.device_id.clone()),
            aggregate: AggregateKey::new(aggregate_type, self.aggregate_id.clone()),
            kind,
            logical_clock: self.logical_clock,
            wall_clock,
        })
    }
}

/// Decode the records pulled for `key`. Corrupt records and records for
/// other aggregates are skipped and logged; they never abort the batch.
pub fn decode_batch(key: &AggregateKey, records: &[RemoteRecord]) -> Vec<Operation> {
    records
        .iter()
        .filter_map(|record| match record.decode() {
            Ok(op) if op.aggregate == *key => Some(op),
            Ok(op) => {
                warn!(
                    %key,
                    found = %op.aggregate,
                    op_id = %op.op_id,
                    "skipping record for another aggregate"
                );
                None
            }
            Err(err) => {
                warn!(%key, op_id = %record.op_id, error = %err, "skipping corrupt remote record");
                None
            }
        })
        .collect()
}

/// Server acknowledgement of a push. Re-pushed ids are acknowledged too.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    pub accepted: Vec<OpId>,
}

#[derive(Debug, Clone)]
pub struct PullBatch {
    pub records: Vec<RemoteRecord>,
    pub cursor: Cursor,
    /// More records are available past `cursor`.
    pub has_more: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("transient push failure: {0}")]
    Transient(String),
    #[error("remote capacity exceeded: {0}")]
    Capacity(String),
    #[error("push rejected for {} conflicting records", conflicting.len())]
    Rejected { conflicting: Vec<OpId> },
    #[error("push failed: {0}")]
    Fatal(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PullError {
    #[error("transient pull failure: {0}")]
    Transient(String),
    #[error("remote capacity exceeded: {0}")]
    Capacity(String),
    #[error("pull failed: {0}")]
    Fatal(String),
}

/// Adapter over the remote record service.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Store a batch of at most [`MAX_PUSH_BATCH`] operations. Must be idempotent per `op_id`.
    async fn push_batch(&self, ops: &[Operation]) -> Result<Ack, PushError>;

    /// Fetch records of one aggregate stored after `since`.
    async fn pull(
        &self,
        key: &AggregateKey,
        since: Option<&Cursor>,
    ) -> Result<PullBatch, PullError>;
}

#[derive(Default)]
struct MemoryState {
    records: Vec<RemoteRecord>,
    ids: HashSet<String>,
    push_faults: VecDeque<PushError>,
    pull_faults: VecDeque<PullError>,
    pushes: usize,
    pulls: usize,
}

/// Remote store held in process memory. Cursors are positions in one global
/// append order. Useful for local-only setups and for driving sync in tests.
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
    page_size: usize,
    max_records: Option<usize>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::default(),
            page_size: MAX_PUSH_BATCH,
            max_records: None,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Reject writes that would grow the store past `max_records`.
    pub fn with_quota(mut self, max_records: usize) -> Self {
        self.max_records = Some(max_records);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panic while holding this lock can only come from a test thread.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next push with `err`.
    pub fn fail_next_push(&self, err: PushError) {
        self.state().push_faults.push_back(err);
    }

    /// Fail the next pull with `err`.
    pub fn fail_next_pull(&self, err: PullError) {
        self.state().pull_faults.push_back(err);
    }

    /// Store a raw record as-is, bypassing validation.
    pub fn insert_raw(&self, record: RemoteRecord) {
        let mut state = self.state();
        state.ids.insert(record.op_id.clone());
        state.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, op_id: OpId) -> bool {
        self.state().ids.contains(&op_id.to_string())
    }

    pub fn push_count(&self) -> usize {
        self.state().pushes
    }

    pub fn pull_count(&self) -> usize {
        self.state().pulls
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn push_batch(&self, ops: &[Operation]) -> Result<Ack, PushError> {
        let mut state = self.state();
        state.pushes += 1;
        if let Some(err) = state.push_faults.pop_front() {
            return Err(err);
        }
        if ops.len() > MAX_PUSH_BATCH {
            return Err(PushError::Capacity(format!(
                "batch of {} exceeds {MAX_PUSH_BATCH}",
                ops.len()
            )));
        }
        let fresh = ops
            .iter()
            .filter(|op| !state.ids.contains(&op.op_id.to_string()))
            .count();
        if let Some(max) = self.max_records {
            if state.records.len() + fresh > max {
                return Err(PushError::Capacity(format!("quota of {max} records reached")));
            }
        }

        let records = ops
            .iter()
            .map(RemoteRecord::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| PushError::Fatal(format!("cannot encode operation: {e}")))?;

        let mut ack = Ack::default();
        for (op, record) in ops.iter().zip(records) {
            if state.ids.insert(record.op_id.clone()) {
                state.records.push(record);
            }
            ack.accepted.push(op.op_id);
        }
        Ok(ack)
    }

    async fn pull(
        &self,
        key: &AggregateKey,
        since: Option<&Cursor>,
    ) -> Result<PullBatch, PullError> {
        let mut state = self.state();
        state.pulls += 1;
        if let Some(err) = state.pull_faults.pop_front() {
            return Err(err);
        }
        let start = match since {
            Some(c) => c
                .as_str()
                .parse::<usize>()
                .map_err(|_| PullError::Fatal(format!("bad cursor {c}")))?,
            None => 0,
        };

        let type_name = key.aggregate_type.as_str();
        let mut records = Vec::new();
        let mut position = start;
        while position < state.records.len() && records.len() < self.page_size {
            let record = &state.records[position];
            if record.aggregate_type == type_name && record.aggregate_id == key.aggregate_id {
                records.push(record.clone());
            }
            position += 1;
        }
        let has_more = state.records[position.min(state.records.len())..]
            .iter()
            .any(|r| r.aggregate_type == type_name && r.aggregate_id == key.aggregate_id);

        Ok(PullBatch {
            records,
            cursor: Cursor::new(position.to_string()),
            has_more,
        })
    }
}
