//! Sync coordinator: debounced pull -> reconcile -> push cycles on a
//! background task.
//!
//! ```text
//! Idle -> Debouncing -> Pulling -> Reconciling -> Pushing -> Idle
//!                          |                         |
//!                          +------> Error(kind) <----+
//! ```
//!
//! Local mutations reach the coordinator as [`SnapshotChanged`] events from the
//! gateway and mark their aggregate dirty. At most one cycle runs per
//! aggregate; a trigger that arrives while one is in flight re-marks the
//! aggregate dirty and is served by a single follow-up cycle.

use std::collections::{BTreeSet, HashMap};
use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::events::{ChangeSource, SnapshotChanged};
use crate::op::AggregateKey;
use crate::oplog::{LogError, OperationLog};
use crate::reconcile::Reconciler;
use crate::remote::{Cursor, PullError, PushError, RemoteStore, decode_batch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried with exponential backoff.
    Retryable,
    /// Remote quota or size limit. Pushes wait for the capacity retry window
    /// while pulls keep running.
    Capacity,
    /// Not retried until the app returns to the foreground or state changes locally.
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Debouncing,
    Pulling,
    Reconciling,
    Pushing,
    Error(ErrorKind),
}

/// Coarse status for the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
}

impl From<CoordinatorState> for SyncStatus {
    fn from(state: CoordinatorState) -> Self {
        match state {
            CoordinatorState::Idle => SyncStatus::Idle,
            CoordinatorState::Error(_) => SyncStatus::Error,
            CoordinatorState::Debouncing
            | CoordinatorState::Pulling
            | CoordinatorState::Reconciling
            | CoordinatorState::Pushing => SyncStatus::Syncing,
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("operation log: {0}")]
    Log(#[from] LogError),
    #[error(transparent)]
    Push(#[from] PushError),
    #[error(transparent)]
    Pull(#[from] PullError),
    #[error("flush did not finish within the grace period")]
    Timeout,
    #[error("coordinator stopped")]
    Stopped,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Push(PushError::Transient(_) | PushError::Rejected { .. })
            | SyncError::Pull(PullError::Transient(_))
            | SyncError::Timeout => ErrorKind::Retryable,
            SyncError::Push(PushError::Capacity(_)) | SyncError::Pull(PullError::Capacity(_)) => {
                ErrorKind::Capacity
            }
            SyncError::Push(PushError::Fatal(_))
            | SyncError::Pull(PullError::Fatal(_))
            | SyncError::Log(_)
            | SyncError::Stopped => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() != ErrorKind::Fatal
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub pulled: usize,
    pub appended: usize,
    pub pushed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// A cycle for the aggregate was already in flight; a follow-up is queued.
    Coalesced,
}

enum Trigger {
    Schedule,
    Foreground,
    Background(oneshot::Sender<Result<(), SyncError>>),
    Flush(oneshot::Sender<Result<(), SyncError>>),
    Shutdown,
}

struct Shared {
    log: Arc<OperationLog>,
    reconciler: Reconciler,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    state: watch::Sender<CoordinatorState>,
    status: watch::Sender<SyncStatus>,
    dirty: Mutex<BTreeSet<AggregateKey>>,
    tracked: Mutex<BTreeSet<AggregateKey>>,
    in_flight: Mutex<HashMap<AggregateKey, Arc<tokio::sync::Mutex<()>>>>,
    /// Set while the remote reports no capacity; pushes resume at this instant.
    push_resume_at: Mutex<Option<Instant>>,
    cycles: AtomicU64,
    triggers: mpsc::UnboundedSender<Trigger>,
}

/// Handle to the background sync task.
pub struct SyncCoordinator {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl SyncCoordinator {
    /// Start the coordinator on the current tokio runtime. Aggregates with
    /// unacknowledged local operations are scheduled right away, so a sync
    /// interrupted by termination resumes from the last acknowledged state.
    pub fn spawn(
        log: Arc<OperationLog>,
        reconciler: Reconciler,
        remote: Arc<dyn RemoteStore>,
        config: SyncConfig,
        events: broadcast::Receiver<SnapshotChanged>,
    ) -> Result<Self, LogError> {
        let (triggers, trigger_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(CoordinatorState::Idle);
        let (status, _) = watch::channel(SyncStatus::Idle);

        let tracked: BTreeSet<AggregateKey> = [
            AggregateKey::profile(),
            AggregateKey::streak(),
            AggregateKey::shields(),
            AggregateKey::rank(),
            AggregateKey::walks(),
            AggregateKey::challenges(),
        ]
        .into_iter()
        .chain(log.known_aggregates()?)
        .collect();
        let resume = log.dirty_aggregates()?;

        let shared = Arc::new(Shared {
            log,
            reconciler,
            remote,
            config,
            state,
            status,
            dirty: Mutex::new(BTreeSet::new()),
            tracked: Mutex::new(tracked),
            in_flight: Mutex::new(HashMap::new()),
            push_resume_at: Mutex::new(None),
            cycles: AtomicU64::new(0),
            triggers,
        });

        if !resume.is_empty() {
            info!(aggregates = resume.len(), "resuming sync for unacknowledged operations");
            for key in resume {
                shared.mark_dirty(key);
            }
            shared.schedule();
        }

        let task = tokio::spawn(run(shared.clone(), trigger_rx, events));
        Ok(Self {
            shared,
            task: Some(task),
        })
    }

    pub fn status(&self) -> SyncStatus {
        *self.shared.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.shared.status.subscribe()
    }

    pub fn state(&self) -> CoordinatorState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.shared.state.subscribe()
    }

    /// Number of sync cycles started so far.
    pub fn cycles_started(&self) -> u64 {
        self.shared.cycles.load(Ordering::Relaxed)
    }

    /// Pull this aggregate on every foreground and mark it dirty now.
    pub fn track(&self, key: AggregateKey) {
        if let Ok(mut tracked) = self.shared.tracked.lock() {
            tracked.insert(key.clone());
        }
        self.shared.mark_dirty(key);
        self.shared.schedule();
    }

    /// Run one cycle for `key` on the caller's task.
    pub async fn sync_now(&self, key: &AggregateKey) -> Result<CycleOutcome, SyncError> {
        let outcome = self.shared.sync_aggregate(key).await;
        if matches!(outcome, Ok(CycleOutcome::Coalesced) | Err(_)) {
            self.shared.schedule();
        }
        outcome
    }

    /// Run every pending cycle now, skipping the debounce window.
    pub async fn flush(&self) -> Result<(), SyncError> {
        self.request(Trigger::Flush).await
    }

    /// Resume after the app returns to the foreground: tracked aggregates are
    /// pulled and backoff or capacity waits are cut short.
    pub fn app_foregrounded(&self) {
        let _ = self.shared.triggers.send(Trigger::Foreground);
    }

    /// Best-effort immediate flush bounded by the background grace period.
    /// Local operations are never discarded if it does not finish.
    pub async fn app_backgrounded(&self) -> Result<(), SyncError> {
        self.request(Trigger::Background).await
    }

    async fn request<F>(&self, make: F) -> Result<(), SyncError>
    where
        F: FnOnce(oneshot::Sender<Result<(), SyncError>>) -> Trigger,
    {
        let (tx, rx) = oneshot::channel();
        self.shared
            .triggers
            .send(make(tx))
            .map_err(|_| SyncError::Stopped)?;
        rx.await.map_err(|_| SyncError::Stopped)?
    }

    /// Stop the background task. An in-flight cycle is abandoned, not rolled back.
    pub async fn shutdown(mut self) {
        let _ = self.shared.triggers.send(Trigger::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "sync task ended abnormally");
            }
        }
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.shared.triggers.send(Trigger::Shutdown);
        }
    }
}

impl Shared {
    fn set_state(&self, state: CoordinatorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "sync state");
        }
        self.status.send_if_modified(|status| {
            let next = SyncStatus::from(state);
            let changed = *status != next;
            *status = next;
            changed
        });
    }

    fn mark_dirty(&self, key: AggregateKey) {
        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.insert(key);
        }
    }

    fn take_dirty(&self) -> BTreeSet<AggregateKey> {
        self.dirty
            .lock()
            .map(|mut dirty| std::mem::take(&mut *dirty))
            .unwrap_or_default()
    }

    fn has_dirty(&self) -> bool {
        self.dirty.lock().map(|d| !d.is_empty()).unwrap_or(false)
    }

    fn schedule(&self) {
        let _ = self.triggers.send(Trigger::Schedule);
    }

    fn pause_pushes(&self) {
        if let Ok(mut resume_at) = self.push_resume_at.lock() {
            if resume_at.is_none() {
                let wait = self.config.capacity_retry();
                let retry_ms = wait.as_millis() as u64;
                warn!(retry_ms, "remote capacity exceeded, pushes paused");
                *resume_at = Some(Instant::now() + wait);
            }
        }
    }

    fn push_resume_at(&self) -> Option<Instant> {
        self.push_resume_at.lock().map(|r| *r).unwrap_or(None)
    }

    fn pushes_paused(&self) -> bool {
        self.push_resume_at().is_some()
    }

    /// Lift the pause once its window has passed. Returns whether it was lifted.
    fn resume_pushes_if_due(&self) -> bool {
        let Ok(mut resume_at) = self.push_resume_at.lock() else {
            return false;
        };
        match *resume_at {
            Some(at) if at <= Instant::now() => {
                *resume_at = None;
                info!("capacity retry window passed, resuming pushes");
                true
            }
            _ => false,
        }
    }

    fn clear_push_pause(&self) {
        if let Ok(mut resume_at) = self.push_resume_at.lock() {
            *resume_at = None;
        }
    }

    /// Queue every aggregate with unacknowledged operations.
    fn mark_unpushed(&self) {
        match self.log.dirty_aggregates() {
            Ok(keys) => keys.into_iter().for_each(|k| self.mark_dirty(k)),
            Err(err) => error!(error = %err, "cannot rescan dirty aggregates"),
        }
    }

    /// Mark everything worth pulling on resume: tracked aggregates plus any
    /// aggregate the log knows about or still needs to push.
    fn mark_all(&self) -> Result<(), LogError> {
        let mut keys = self.log.known_aggregates()?;
        keys.extend(self.log.dirty_aggregates()?);
        if let Ok(tracked) = self.tracked.lock() {
            keys.extend(tracked.iter().cloned());
        }
        for key in keys {
            self.mark_dirty(key);
        }
        Ok(())
    }

    fn cycle_lock(&self, key: &AggregateKey) -> Arc<tokio::sync::Mutex<()>> {
        match self.in_flight.lock() {
            Ok(mut locks) => locks.entry(key.clone()).or_default().clone(),
            // Poisoned map: hand out a fresh lock rather than stall sync.
            Err(_) => Arc::default(),
        }
    }

    /// Run cycles for every dirty aggregate. Failed aggregates stay dirty; the
    /// first error is returned after the rest have been attempted.
    async fn run_dirty(&self) -> Result<(), SyncError> {
        let keys = self.take_dirty();
        if keys.is_empty() {
            return Ok(());
        }
        debug!(aggregates = keys.len(), "starting sync pass");
        let mut first_err: Option<SyncError> = None;
        for key in keys {
            if let Err(err) = self.sync_aggregate(&key).await {
                warn!(%key, error = %err, "sync cycle failed");
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn sync_aggregate(&self, key: &AggregateKey) -> Result<CycleOutcome, SyncError> {
        let lock = self.cycle_lock(key);
        let Ok(_guard) = lock.try_lock() else {
            debug!(%key, "cycle in flight, queueing follow-up");
            self.mark_dirty(key.clone());
            return Ok(CycleOutcome::Coalesced);
        };
        self.cycles.fetch_add(1, Ordering::Relaxed);

        let result = self.cycle(key).await;
        match &result {
            Ok(report) => {
                debug!(
                    %key,
                    pulled = report.pulled,
                    appended = report.appended,
                    pushed = report.pushed,
                    "cycle complete"
                );
            }
            Err(err) => {
                if err.kind() == ErrorKind::Capacity {
                    self.pause_pushes();
                }
                self.mark_dirty(key.clone());
            }
        }
        result.map(CycleOutcome::Completed)
    }

    async fn cycle(&self, key: &AggregateKey) -> Result<CycleReport, SyncError> {
        let mut report = CycleReport::default();
        self.pull_and_reconcile(key, &mut report).await?;
        if self.pushes_paused() {
            // Picked up again from the log when the pause lifts.
            debug!(%key, "pushes paused, pull only");
            return Ok(report);
        }
        self.push_pending(key, &mut report).await?;
        Ok(report)
    }

    async fn pull_and_reconcile(
        &self,
        key: &AggregateKey,
        report: &mut CycleReport,
    ) -> Result<(), SyncError> {
        let mut cursor = self.log.cursor(key)?.map(Cursor::new);
        for _ in 0..self.config.pull_page_limit {
            self.set_state(CoordinatorState::Pulling);
            let batch = self.remote.pull(key, cursor.as_ref()).await?;

            self.set_state(CoordinatorState::Reconciling);
            let ops = decode_batch(key, &batch.records);
            let outcome = self.reconciler.reconcile(key, &ops)?;
            // Cursor advances only after the merge is durable.
            self.log.set_cursor(key, batch.cursor.as_str())?;
            report.pulled += batch.records.len();
            report.appended += outcome.appended.len();
            cursor = Some(batch.cursor);
            if !batch.has_more {
                return Ok(());
            }
        }
        debug!(%key, "pull page limit reached, continuing next cycle");
        self.mark_dirty(key.clone());
        Ok(())
    }

    async fn push_pending(
        &self,
        key: &AggregateKey,
        report: &mut CycleReport,
    ) -> Result<(), SyncError> {
        let mut rejections = 0u32;
        loop {
            let batch = self.log.pending_ops(key, self.config.push_batch_size())?;
            if batch.is_empty() {
                return Ok(());
            }
            self.set_state(CoordinatorState::Pushing);
            match self.remote.push_batch(&batch).await {
                Ok(ack) => {
                    self.log.mark_acked(&ack.accepted)?;
                    report.pushed += ack.accepted.len();
                    if ack.accepted.len() < batch.len() {
                        // Leave the rest queued for the next cycle.
                        warn!(
                            %key,
                            sent = batch.len(),
                            acked = ack.accepted.len(),
                            "partial push acknowledgement"
                        );
                        self.mark_dirty(key.clone());
                        return Ok(());
                    }
                }
                Err(PushError::Rejected { conflicting }) => {
                    rejections += 1;
                    if rejections > self.config.max_rejected_retries {
                        return Err(PushError::Rejected { conflicting }.into());
                    }
                    info!(
                        %key,
                        conflicting = conflicting.len(),
                        attempt = rejections,
                        "push rejected, re-merging"
                    );
                    self.pull_and_reconcile(key, report).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    mut triggers: mpsc::UnboundedReceiver<Trigger>,
    mut events: broadcast::Receiver<SnapshotChanged>,
) {
    let mut deadline: Option<Instant> = None;
    let mut attempt: u32 = 0;

    loop {
        let wake_at = match (deadline, shared.push_resume_at()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let wake = async move {
            match wake_at {
                Some(at) => sleep_until(at).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            trigger = triggers.recv() => match trigger {
                None | Some(Trigger::Shutdown) => break,
                Some(Trigger::Schedule) => {
                    if shared.has_dirty() {
                        debounce(&shared, &mut deadline);
                    }
                }
                Some(Trigger::Foreground) => {
                    shared.clear_push_pause();
                    if let Err(err) = shared.mark_all() {
                        error!(error = %err, "cannot list aggregates to resume");
                    }
                    attempt = 0;
                    deadline = None;
                    debounce(&shared, &mut deadline);
                }
                Some(Trigger::Flush(reply)) => {
                    deadline = None;
                    let result = shared.run_dirty().await;
                    after_pass(&shared, &result, &mut attempt, &mut deadline);
                    let _ = reply.send(result);
                }
                Some(Trigger::Background(reply)) => {
                    deadline = None;
                    let result = flush_before_suspend(&shared).await;
                    after_pass(&shared, &result, &mut attempt, &mut deadline);
                    let _ = reply.send(result);
                }
            },
            event = events.recv() => match event {
                Ok(SnapshotChanged { key, source: ChangeSource::Local, .. }) => {
                    shared.mark_dirty(key);
                    debounce(&shared, &mut deadline);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "snapshot events lagged, rescanning log");
                    shared.mark_unpushed();
                    debounce(&shared, &mut deadline);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = wake => {
                if shared.resume_pushes_if_due() {
                    shared.mark_unpushed();
                }
                deadline = None;
                let result = shared.run_dirty().await;
                after_pass(&shared, &result, &mut attempt, &mut deadline);
            }
        }
    }
    debug!("sync coordinator stopped");
}

/// Arm the coalescing window unless a cycle or retry is already scheduled.
fn debounce(shared: &Shared, deadline: &mut Option<Instant>) {
    if deadline.is_none() {
        *deadline = Some(Instant::now() + shared.config.debounce());
        shared.set_state(CoordinatorState::Debouncing);
    }
}

fn after_pass(
    shared: &Shared,
    result: &Result<(), SyncError>,
    attempt: &mut u32,
    deadline: &mut Option<Instant>,
) {
    match result {
        Ok(()) => {
            *attempt = 0;
            if shared.pushes_paused() {
                shared.set_state(CoordinatorState::Error(ErrorKind::Capacity));
            } else {
                shared.set_state(CoordinatorState::Idle);
            }
            if shared.has_dirty() {
                debounce(shared, deadline);
            }
        }
        Err(err) => {
            let kind = err.kind();
            shared.set_state(CoordinatorState::Error(kind));
            match kind {
                ErrorKind::Retryable => {
                    *attempt = attempt.saturating_add(1);
                    let wait = shared.config.backoff(*attempt);
                    info!(
                        attempt = *attempt,
                        backoff_ms = wait.as_millis() as u64,
                        "retrying sync"
                    );
                    *deadline = Some(Instant::now() + wait);
                }
                ErrorKind::Capacity => {
                    // The pause wakes the loop itself; pulls still run on the
                    // next local change or foreground.
                    *deadline = None;
                }
                ErrorKind::Fatal => {
                    error!(error = %err, "sync stopped until next foreground or local change");
                    *deadline = None;
                }
            }
        }
    }
}

async fn flush_before_suspend(shared: &Shared) -> Result<(), SyncError> {
    if let Err(err) = shared.mark_all() {
        warn!(error = %err, "cannot list aggregates before suspend");
    }
    let pending = shared
        .dirty
        .lock()
        .map(|d| d.clone())
        .unwrap_or_default();
    match timeout(shared.config.background_grace(), shared.run_dirty()).await {
        Ok(result) => result,
        Err(_) => {
            // Cancelled mid-cycle: whatever was not finished stays dirty.
            warn!("background flush cut short");
            for key in pending {
                shared.mark_dirty(key);
            }
            Err(SyncError::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_folds_fine_states() {
        assert_eq!(SyncStatus::from(CoordinatorState::Pushing), SyncStatus::Syncing);
        assert_eq!(SyncStatus::from(CoordinatorState::Debouncing), SyncStatus::Syncing);
        assert_eq!(
            SyncStatus::from(CoordinatorState::Error(ErrorKind::Capacity)),
            SyncStatus::Error
        );
        assert_eq!(SyncStatus::from(CoordinatorState::Idle), SyncStatus::Idle);
    }

    #[test]
    fn error_classification() {
        assert_eq!(
            SyncError::from(PushError::Transient("offline".into())).kind(),
            ErrorKind::Retryable
        );
        assert_eq!(
            SyncError::from(PushError::Rejected { conflicting: vec![] }).kind(),
            ErrorKind::Retryable
        );
        assert_eq!(
            SyncError::from(PullError::Capacity("quota".into())).kind(),
            ErrorKind::Capacity
        );
        assert!(!SyncError::from(LogError::Poisoned).is_retryable());
    }
}
