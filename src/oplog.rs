use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::op::{AggregateKey, AggregateType, DeviceId, OpId, OpKind, Operation};
use crate::project::Snapshot;

pub const SCHEMA_VERSION: i32 = 1;

/// Where an operation in the log was authored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Remote => "remote",
        }
    }
}

/// Outcome of appending one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    Inserted,
    /// The `op_id` was already in the log; nothing changed.
    Duplicate,
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt operation row {seq}: {reason}")]
    Corrupt { seq: i64, reason: String },
    #[error("operation log lock poisoned")]
    Poisoned,
    #[error("invalid state: {0}")]
    State(&'static str),
}

/// Append-only, locally persisted operation log with its cursor and snapshot
/// cache tables. One log belongs to one device.
pub struct OperationLog {
    conn: Mutex<Connection>,
}

impl OperationLog {
    /// Open (or create) a log at `path`. Path can be a file path or ":memory:".
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, LogError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Take ownership of an existing connection and make sure the schema exists.
    pub fn from_connection(conn: Connection) -> Result<Self, LogError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LogError> {
        self.conn.lock().map_err(|_| LogError::Poisoned)
    }

    /// Execute closure `f` inside a transaction and commit if `f` returns Ok.
    pub fn with_tx<R, F>(&self, f: F) -> Result<R, LogError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<R, LogError>,
    {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Return the device id bound to this log, binding `candidate` on first use.
    pub fn bind_device(&self, candidate: &DeviceId) -> Result<DeviceId, LogError> {
        self.with_tx(|tx| {
            if let Some(existing) = kv_get(tx, "device_id")? {
                return Ok(DeviceId::new(existing));
            }
            kv_set(tx, "device_id", candidate.as_str())?;
            Ok(candidate.clone())
        })
    }

    /// Append one operation. A repeated `op_id` is a no-op.
    pub fn append(&self, op: &Operation, origin: Origin) -> Result<Appended, LogError> {
        self.with_tx(|tx| {
            let appended = insert_op(tx, op, origin)?;
            if origin == Origin::Remote {
                observe_clock(tx, op.logical_clock)?;
            }
            Ok(appended)
        })
    }

    /// Append a batch of remote operations in one transaction and raise the
    /// observed logical clock. Returns the ids that were new to the log.
    pub fn append_remote_batch(&self, ops: &[Operation]) -> Result<Vec<OpId>, LogError> {
        self.with_tx(|tx| {
            let mut inserted = Vec::new();
            let mut max_clock = 0;
            for op in ops {
                if insert_op(tx, op, Origin::Remote)? == Appended::Inserted {
                    inserted.push(op.op_id);
                }
                max_clock = max_clock.max(op.logical_clock);
            }
            observe_clock(tx, max_clock)?;
            Ok(inserted)
        })
    }

    /// Stamp the next logical clock value, build the operation with it and
    /// append it as locally originated, all in one transaction.
    pub fn append_local<F>(&self, build: F) -> Result<Operation, LogError>
    where
        F: FnOnce(u64) -> Operation,
    {
        self.with_tx(|tx| {
            let clock = next_logical_clock(tx)?;
            let op = build(clock);
            if insert_op(tx, &op, Origin::Local)? == Appended::Duplicate {
                return Err(LogError::State("generated op_id already present"));
            }
            Ok(op)
        })
    }

    /// All operations of one aggregate in insertion order.
    pub fn all_ops(&self, key: &AggregateKey) -> Result<Vec<Operation>, LogError> {
        self.ops_since(key, 0)
    }

    /// Operations of one aggregate whose local sequence number is greater than `cursor`.
    pub fn ops_since(&self, key: &AggregateKey, cursor: i64) -> Result<Vec<Operation>, LogError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT seq, op_id, aggregate_type, aggregate_id, device_id, kind,
                    logical_clock, wall_clock_ms
FROM operations
WHERE aggregate_type=?1 AND aggregate_id=?2 AND seq>?3
ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(
            params![key.aggregate_type.as_str(), &key.aggregate_id, cursor],
            OpRow::from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.decode()?);
        }
        Ok(out)
    }

    /// Highest local sequence number recorded for an aggregate (0 if empty).
    pub fn last_seq(&self, key: &AggregateKey) -> Result<i64, LogError> {
        let conn = self.lock()?;
        let seq: Option<i64> = conn.query_row(
            "SELECT MAX(seq) FROM operations WHERE aggregate_type=?1 AND aggregate_id=?2",
            params![key.aggregate_type.as_str(), &key.aggregate_id],
            |r| r.get(0),
        )?;
        Ok(seq.unwrap_or(0))
    }

    /// Locally originated operations not yet acknowledged by the remote store.
    pub fn pending_ops(
        &self,
        key: &AggregateKey,
        limit: usize,
    ) -> Result<Vec<Operation>, LogError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT seq, op_id, aggregate_type, aggregate_id, device_id, kind,
                    logical_clock, wall_clock_ms
FROM operations
WHERE aggregate_type=?1 AND aggregate_id=?2 AND origin='local' AND push_status='pending'
ORDER BY seq ASC
LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![key.aggregate_type.as_str(), &key.aggregate_id, limit],
            OpRow::from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.decode()?);
        }
        Ok(out)
    }

    /// Mark operations as acknowledged by the remote store.
    pub fn mark_acked(&self, ids: &[OpId]) -> Result<(), LogError> {
        self.with_tx(|tx| {
            for id in ids {
                tx.execute(
                    "UPDATE operations SET push_status='acked' WHERE op_id=?1",
                    params![id.to_string()],
                )?;
            }
            Ok(())
        })
    }

    /// Aggregates that still hold unacknowledged local operations.
    pub fn dirty_aggregates(&self) -> Result<BTreeSet<AggregateKey>, LogError> {
        self.distinct_keys(
            "SELECT DISTINCT aggregate_type, aggregate_id FROM operations
WHERE origin='local' AND push_status='pending'",
        )
    }

    /// Every aggregate this device has operations or a pull cursor for.
    pub fn known_aggregates(&self) -> Result<BTreeSet<AggregateKey>, LogError> {
        self.distinct_keys(
            "SELECT aggregate_type, aggregate_id FROM operations
UNION SELECT aggregate_type, aggregate_id FROM remote_cursors",
        )
    }

    fn distinct_keys(&self, sql: &str) -> Result<BTreeSet<AggregateKey>, LogError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        let mut out = BTreeSet::new();
        for row in rows {
            let (t, id) = row?;
            let aggregate_type = AggregateType::parse(&t).ok_or(LogError::Corrupt {
                seq: 0,
                reason: format!("unknown aggregate type {t}"),
            })?;
            out.insert(AggregateKey::new(aggregate_type, id));
        }
        Ok(out)
    }

    /// Get or set the last remote cursor pulled for an aggregate.
    pub fn cursor(&self, key: &AggregateKey) -> Result<Option<String>, LogError> {
        let conn = self.lock()?;
        let cur: Option<String> = conn
            .query_row(
                "SELECT cursor FROM remote_cursors WHERE aggregate_type=?1 AND aggregate_id=?2",
                params![key.aggregate_type.as_str(), &key.aggregate_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(cur)
    }

    pub fn set_cursor(&self, key: &AggregateKey, cursor: &str) -> Result<(), LogError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO remote_cursors(aggregate_type, aggregate_id, cursor, updated_ms)
            VALUES(?1,?2,?3,?4)
            ON CONFLICT(aggregate_type, aggregate_id)
            DO UPDATE SET cursor=excluded.cursor, updated_ms=excluded.updated_ms",
            params![
                key.aggregate_type.as_str(),
                &key.aggregate_id,
                cursor,
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    /// Cached snapshot, if one was stored since the last append to this aggregate.
    pub fn cached_snapshot(&self, key: &AggregateKey) -> Result<Option<Snapshot>, LogError> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM snapshots WHERE aggregate_type=?1 AND aggregate_id=?2",
                params![key.aggregate_type.as_str(), &key.aggregate_id],
                |r| r.get(0),
            )
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(LogError::from))
            .transpose()
    }

    pub fn store_snapshot(&self, key: &AggregateKey, snapshot: &Snapshot) -> Result<(), LogError> {
        let body = serde_json::to_string(snapshot)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO snapshots(aggregate_type, aggregate_id, snapshot) VALUES(?1,?2,?3)
            ON CONFLICT(aggregate_type, aggregate_id) DO UPDATE SET snapshot=excluded.snapshot",
            params![key.aggregate_type.as_str(), &key.aggregate_id, body],
        )?;
        Ok(())
    }

    /// Return the current integer schema version stored in `sync_kv`.
    pub fn schema_version(&self) -> Result<i32, LogError> {
        let conn = self.lock()?;
        let ver = kv_get(&conn, "schema_version")?;
        Ok(ver.and_then(|s| s.parse::<i32>().ok()).unwrap_or(1))
    }

    /// Run migrations up to `target_version` transactionally.
    pub fn run_migrations(&self, target_version: i32) -> Result<(), LogError> {
        if !(1..=SCHEMA_VERSION).contains(&target_version) {
            return Err(LogError::State("invalid target_version"));
        }
        let current = self.schema_version()?;
        if current >= target_version {
            return Ok(());
        }
        self.with_tx(|tx| {
            debug!(from = current, to = target_version, "migrating operation log");
            kv_set(tx, "schema_version", &target_version.to_string())
        })
    }
}

/// Per-aggregate exclusion for read-project-cache sequences. Held only around
/// synchronous log work, never across network calls.
#[derive(Debug, Default)]
pub struct AggregateLocks {
    locks: Mutex<HashMap<AggregateKey, Arc<Mutex<()>>>>,
}

impl AggregateLocks {
    pub fn handle(&self, key: &AggregateKey) -> Result<Arc<Mutex<()>>, LogError> {
        let mut locks = self.locks.lock().map_err(|_| LogError::Poisoned)?;
        Ok(locks.entry(key.clone()).or_default().clone())
    }
}

/// Create required tables and indexes. Safe to call multiple times.
fn init_schema(conn: &Connection) -> Result<(), LogError> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS operations (
seq INTEGER PRIMARY KEY AUTOINCREMENT,
op_id TEXT NOT NULL UNIQUE,
aggregate_type TEXT NOT NULL,
aggregate_id TEXT NOT NULL,
device_id TEXT NOT NULL,
kind TEXT NOT NULL, -- JSON
logical_clock INTEGER NOT NULL,
wall_clock_ms INTEGER NOT NULL,
origin TEXT NOT NULL CHECK(origin IN ('local','remote')),
push_status TEXT NOT NULL DEFAULT 'pending' CHECK(push_status IN ('pending','acked'))
);

CREATE INDEX IF NOT EXISTS idx_operations_aggregate
ON operations(aggregate_type, aggregate_id, seq);

CREATE INDEX IF NOT EXISTS idx_operations_push
ON operations(origin, push_status, seq);

CREATE TABLE IF NOT EXISTS remote_cursors (
aggregate_type TEXT NOT NULL,
aggregate_id TEXT NOT NULL,
cursor TEXT NOT NULL,
updated_ms INTEGER NOT NULL,
PRIMARY KEY(aggregate_type, aggregate_id)
);

CREATE TABLE IF NOT EXISTS snapshots (
aggregate_type TEXT NOT NULL,
aggregate_id TEXT NOT NULL,
snapshot TEXT NOT NULL, -- JSON
PRIMARY KEY(aggregate_type, aggregate_id)
);

CREATE TABLE IF NOT EXISTS sync_kv (
k TEXT PRIMARY KEY,
v TEXT NOT NULL
);
"#,
    )?;
    conn.execute(
        "INSERT INTO sync_kv(k,v) VALUES('schema_version',?1)
ON CONFLICT(k) DO NOTHING",
        params![SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

fn kv_get(conn: &Connection, k: &str) -> Result<Option<String>, LogError> {
    Ok(conn
        .query_row("SELECT v FROM sync_kv WHERE k=?1", params![k], |r| r.get(0))
        .optional()?)
}

fn kv_set(conn: &Connection, k: &str, v: &str) -> Result<(), LogError> {
    conn.execute(
        "INSERT INTO sync_kv(k,v) VALUES(?1,?2)
ON CONFLICT(k) DO UPDATE SET v=excluded.v",
        params![k, v],
    )?;
    Ok(())
}

fn kv_get_u64(conn: &Connection, k: &str) -> Result<u64, LogError> {
    Ok(kv_get(conn, k)?
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0))
}

/// Lamport step: one past the greater of the last local stamp and the
/// highest clock observed from other devices.
fn next_logical_clock(conn: &Connection) -> Result<u64, LogError> {
    let last = kv_get_u64(conn, "clock_last")?;
    let observed = kv_get_u64(conn, "clock_observed")?;
    let next = last
        .max(observed)
        .checked_add(1)
        .ok_or(LogError::State("logical clock exhausted"))?;
    kv_set(conn, "clock_last", &next.to_string())?;
    Ok(next)
}

fn observe_clock(conn: &Connection, clock: u64) -> Result<(), LogError> {
    if clock > kv_get_u64(conn, "clock_observed")? {
        kv_set(conn, "clock_observed", &clock.to_string())?;
    }
    Ok(())
}

fn insert_op(conn: &Connection, op: &Operation, origin: Origin) -> Result<Appended, LogError> {
    let clock =
        i64::try_from(op.logical_clock).map_err(|_| LogError::State("logical clock overflow"))?;
    let push_status = match origin {
        Origin::Local => "pending",
        Origin::Remote => "acked",
    };
    let changed = conn.execute(
        "INSERT INTO operations
(op_id,aggregate_type,aggregate_id,device_id,kind,logical_clock,wall_clock_ms,origin,push_status)
VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
ON CONFLICT(op_id) DO NOTHING",
        params![
            op.op_id.to_string(),
            op.aggregate.aggregate_type.as_str(),
            &op.aggregate.aggregate_id,
            op.device_id.as_str(),
            serde_json::to_string(&op.kind)?,
            clock,
            op.wall_clock.timestamp_millis(),
            origin.as_str(),
            push_status,
        ],
    )?;
    if changed == 0 {
        trace!(op_id = %op.op_id, "duplicate append ignored");
        return Ok(Appended::Duplicate);
    }
    conn.execute(
        "DELETE FROM snapshots WHERE aggregate_type=?1 AND aggregate_id=?2",
        params![op.aggregate.aggregate_type.as_str(), &op.aggregate.aggregate_id],
    )?;
    Ok(Appended::Inserted)
}

struct OpRow {
    seq: i64,
    op_id: String,
    aggregate_type: String,
    aggregate_id: String,
    device_id: String,
    kind: String,
    logical_clock: i64,
    wall_clock_ms: i64,
}

impl OpRow {
    fn from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: r.get(0)?,
            op_id: r.get(1)?,
            aggregate_type: r.get(2)?,
            aggregate_id: r.get(3)?,
            device_id: r.get(4)?,
            kind: r.get(5)?,
            logical_clock: r.get(6)?,
            wall_clock_ms: r.get(7)?,
        })
    }

    fn decode(self) -> Result<Operation, LogError> {
        let seq = self.seq;
        let corrupt = |reason: String| LogError::Corrupt { seq, reason };
        let op_id = OpId::parse(&self.op_id).map_err(|e| corrupt(e.to_string()))?;
        let aggregate_type = AggregateType::parse(&self.aggregate_type)
            .ok_or_else(|| corrupt(format!("unknown aggregate type {}", self.aggregate_type)))?;
        let kind: OpKind = serde_json::from_str(&self.kind).map_err(|e| corrupt(e.to_string()))?;
        let logical_clock =
            u64::try_from(self.logical_clock).map_err(|e| corrupt(e.to_string()))?;
        let wall_clock: DateTime<Utc> = DateTime::from_timestamp_millis(self.wall_clock_ms)
            .ok_or_else(|| corrupt("wall clock out of range".into()))?;
        Ok(Operation {
            op_id,
            device_id: DeviceId::new(self.device_id),
            aggregate: AggregateKey::new(aggregate_type, self.aggregate_id),
            kind,
            logical_clock,
            wall_clock,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{RankSnapshot, RankTier};
    use chrono::TimeZone;

    fn xp(device: &str, clock: u64, amount: u64) -> Operation {
        Operation {
            op_id: OpId::new(),
            device_id: DeviceId::new(device),
            aggregate: AggregateKey::rank(),
            kind: OpKind::EarnXp { amount },
            logical_clock: clock,
            wall_clock: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn append_is_idempotent_on_op_id() {
        let log = OperationLog::open_in_memory().unwrap();
        let op = xp("a", 1, 10);
        assert_eq!(log.append(&op, Origin::Local).unwrap(), Appended::Inserted);
        assert_eq!(log.append(&op, Origin::Remote).unwrap(), Appended::Duplicate);
        assert_eq!(log.all_ops(&AggregateKey::rank()).unwrap(), vec![op]);
    }

    #[test]
    fn ops_since_filters_by_sequence_and_aggregate() {
        let log = OperationLog::open_in_memory().unwrap();
        let first = xp("a", 1, 10);
        log.append(&first, Origin::Local).unwrap();
        let cursor = log.last_seq(&AggregateKey::rank()).unwrap();
        let second = xp("a", 2, 20);
        log.append(&second, Origin::Local).unwrap();

        let mut other = xp("a", 3, 0);
        other.aggregate = AggregateKey::daily(chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
        other.kind = OpKind::AddSteps { delta: 5 };
        log.append(&other, Origin::Local).unwrap();

        assert_eq!(log.ops_since(&AggregateKey::rank(), cursor).unwrap(), vec![second]);
    }

    #[test]
    fn local_clock_passes_observed_remote_clock() {
        let log = OperationLog::open_in_memory().unwrap();
        let a = log.append_local(|clock| xp("me", clock, 1)).unwrap();
        assert_eq!(a.logical_clock, 1);

        log.append_remote_batch(&[xp("other", 41, 1)]).unwrap();
        let b = log.append_local(|clock| xp("me", clock, 1)).unwrap();
        assert_eq!(b.logical_clock, 42);
    }

    #[test]
    fn pending_ops_only_lists_unacked_local_ops() {
        let log = OperationLog::open_in_memory().unwrap();
        let local = log.append_local(|clock| xp("me", clock, 1)).unwrap();
        log.append_remote_batch(&[xp("other", 5, 1)]).unwrap();
        let key = AggregateKey::rank();

        assert_eq!(log.pending_ops(&key, 10).unwrap(), vec![local.clone()]);
        assert!(log.dirty_aggregates().unwrap().contains(&key));

        log.mark_acked(&[local.op_id]).unwrap();
        assert!(log.pending_ops(&key, 10).unwrap().is_empty());
        assert!(log.dirty_aggregates().unwrap().is_empty());
        assert!(log.known_aggregates().unwrap().contains(&key));
    }

    #[test]
    fn append_invalidates_cached_snapshot() {
        let log = OperationLog::open_in_memory().unwrap();
        let key = AggregateKey::rank();
        let snapshot = Snapshot::Rank(RankSnapshot {
            xp: 3,
            tier: RankTier::Bronze,
        });
        log.store_snapshot(&key, &snapshot).unwrap();
        assert_eq!(log.cached_snapshot(&key).unwrap(), Some(snapshot));

        log.append(&xp("a", 1, 1), Origin::Local).unwrap();
        assert_eq!(log.cached_snapshot(&key).unwrap(), None);
    }

    #[test]
    fn cursor_round_trips() {
        let log = OperationLog::open_in_memory().unwrap();
        let key = AggregateKey::shields();
        assert_eq!(log.cursor(&key).unwrap(), None);
        log.set_cursor(&key, "17").unwrap();
        log.set_cursor(&key, "18").unwrap();
        assert_eq!(log.cursor(&key).unwrap().as_deref(), Some("18"));
    }

    #[test]
    fn device_binding_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.db");
        {
            let log = OperationLog::open(&path).unwrap();
            assert_eq!(log.bind_device(&DeviceId::new("first")).unwrap().as_str(), "first");
            log.append_local(|clock| xp("first", clock, 7)).unwrap();
        }
        let log = OperationLog::open(&path).unwrap();
        assert_eq!(log.bind_device(&DeviceId::new("second")).unwrap().as_str(), "first");
        assert_eq!(log.all_ops(&AggregateKey::rank()).unwrap().len(), 1);
        let next = log.append_local(|clock| xp("first", clock, 1)).unwrap();
        assert_eq!(next.logical_clock, 2);
    }

    #[test]
    fn migrations_reject_unknown_versions() {
        let log = OperationLog::open_in_memory().unwrap();
        assert_eq!(log.schema_version().unwrap(), SCHEMA_VERSION);
        assert!(log.run_migrations(SCHEMA_VERSION).is_ok());
        assert!(matches!(
            log.run_migrations(SCHEMA_VERSION + 1),
            Err(LogError::State(_))
        ));
    }
}
