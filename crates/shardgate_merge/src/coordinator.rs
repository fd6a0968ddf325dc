//! Per-query merge session: fan-in of N sorted backend streams into one
//! ordered, limited result forwarded to the client.
//!
//! Lifecycle: `AwaitingFields → Draining → Completed | Failed`.
//!
//! Backend read threads call the `on_*` callbacks. Once every source has
//! described its columns, one drain job is submitted to the injected
//! [`WorkerPool`]; it owns the merge heap and is the only reader of the
//! source queues.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use shardgate_common::config::{FailurePolicy, MergeConfig};
use shardgate_common::error::{MergeError, ShardgateError, ShardgateResult};
use shardgate_common::executor::WorkerPool;
use shardgate_common::row::{FieldDescriptor, Row};
use shardgate_common::types::SourceId;

use crate::cursor::MergeCursor;
use crate::item::HeapItem;
use crate::limit::{Admit, LimitWindow};
use crate::order::RowComparator;
use crate::queue::BoundedRowQueue;
use crate::sink::{ConnectionReleaser, ResultSink};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Planner output describing one fanned-out query.
#[derive(Clone)]
pub struct MergePlan {
    pub sources: Vec<SourceId>,
    pub comparator: Arc<dyn RowComparator>,
    pub limit: LimitWindow,
    /// Logical schema reported to the client instead of the shard schema.
    pub schema: Option<String>,
    /// Logical table name (field `org_table`).
    pub table: Option<String>,
    /// Table alias as written in the query (field `table`).
    pub table_alias: Option<String>,
}

impl MergePlan {
    pub fn new(sources: Vec<SourceId>, comparator: Arc<dyn RowComparator>) -> Self {
        Self {
            sources,
            comparator,
            limit: LimitWindow::unbounded(),
            schema: None,
            table: None,
            table_alias: None,
        }
    }

    pub fn with_limit(mut self, limit: LimitWindow) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_origin(mut self, schema: &str, table: &str, alias: Option<&str>) -> Self {
        self.schema = Some(schema.to_string());
        self.table = Some(table.to_string());
        self.table_alias = Some(alias.unwrap_or(table).to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePhase {
    AwaitingFields,
    Draining,
    Completed,
    Failed,
}

impl MergePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, MergePhase::Completed | MergePhase::Failed)
    }
}

impl fmt::Display for MergePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergePhase::AwaitingFields => write!(f, "AWAITING_FIELDS"),
            MergePhase::Draining => write!(f, "DRAINING"),
            MergePhase::Completed => write!(f, "COMPLETED"),
            MergePhase::Failed => write!(f, "FAILED"),
        }
    }
}

/// Point-in-time snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeStats {
    pub session_id: u64,
    pub phase: MergePhase,
    pub rows_emitted: u64,
    pub rows_forwarded: u64,
    pub rows_discarded: u64,
    pub live_sources: usize,
    pub failed_sources: usize,
    pub peak_queue_len: usize,
}

struct SessionState {
    phase: MergePhase,
    awaiting: HashSet<SourceId>,
    fields: Option<Vec<FieldDescriptor>>,
    /// Set once the canonical fields reached the sink. Draining waits for it.
    fields_forwarded: bool,
    failed_sources: HashSet<SourceId>,
}

pub struct MergeSession {
    id: u64,
    plan: MergePlan,
    policy: FailurePolicy,
    queues: HashMap<SourceId, Arc<BoundedRowQueue>>,
    sink: Arc<dyn ResultSink>,
    releaser: Arc<dyn ConnectionReleaser>,
    pool: Arc<dyn WorkerPool>,
    state: Mutex<SessionState>,
    finished: Condvar,
    /// Serializes calls into the sink and orders them against `failed`.
    sink_gate: Mutex<()>,
    /// Error waiting for the sink. Whoever holds `sink_gate` next delivers it.
    pending_error: Mutex<Option<(u16, String)>>,
    released: Mutex<HashSet<SourceId>>,
    failed: AtomicBool,
    suppress: AtomicBool,
    rows_emitted: AtomicU64,
    rows_forwarded: AtomicU64,
    rows_discarded: AtomicU64,
    live_sources: AtomicUsize,
    self_ref: Weak<MergeSession>,
}

impl MergeSession {
    pub fn new(
        plan: MergePlan,
        config: &MergeConfig,
        sink: Arc<dyn ResultSink>,
        releaser: Arc<dyn ConnectionReleaser>,
        pool: Arc<dyn WorkerPool>,
    ) -> ShardgateResult<Arc<Self>> {
        if plan.sources.is_empty() {
            return Err(ShardgateError::internal_bug(
                "MERGE_NO_SOURCES",
                "merge session needs at least one source",
                "MergeSession::new",
            ));
        }
        let awaiting: HashSet<SourceId> = plan.sources.iter().copied().collect();
        if awaiting.len() != plan.sources.len() {
            return Err(ShardgateError::internal_bug(
                "MERGE_DUP_SOURCE",
                "duplicate source in merge plan",
                format!("sources={:?}", plan.sources),
            ));
        }
        let queues = plan
            .sources
            .iter()
            .map(|&s| (s, Arc::new(BoundedRowQueue::new(config.queue_capacity))))
            .collect();
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let live = plan.sources.len();
        tracing::debug!(session = id, sources = live, limit = ?plan.limit, "merge session created");

        Ok(Arc::new_cyclic(|self_ref| Self {
            id,
            plan,
            policy: config.failure_policy,
            queues,
            sink,
            releaser,
            pool,
            state: Mutex::new(SessionState {
                phase: MergePhase::AwaitingFields,
                awaiting,
                fields: None,
                fields_forwarded: false,
                failed_sources: HashSet::new(),
            }),
            finished: Condvar::new(),
            sink_gate: Mutex::new(()),
            pending_error: Mutex::new(None),
            released: Mutex::new(HashSet::new()),
            failed: AtomicBool::new(false),
            suppress: AtomicBool::new(false),
            rows_emitted: AtomicU64::new(0),
            rows_forwarded: AtomicU64::new(0),
            rows_discarded: AtomicU64::new(0),
            live_sources: AtomicUsize::new(live),
            self_ref: self_ref.clone(),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> MergePhase {
        self.state.lock().phase
    }

    // ── Producer-side callbacks ──

    /// A source described its result columns. The first description is
    /// forwarded (with logical origin names); later ones are only checked.
    /// The session lock is not held while the sink runs, so `abort` and
    /// `stats` stay responsive behind a slow client.
    pub fn on_fields_received(&self, source: SourceId, mut fields: Vec<FieldDescriptor>) {
        if self.failed.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock();
        if state.phase != MergePhase::AwaitingFields {
            tracing::warn!(session = self.id, %source, phase = %state.phase, "field description ignored");
            return;
        }
        if !state.awaiting.remove(&source) {
            tracing::warn!(session = self.id, %source, "unexpected or duplicate field description");
            return;
        }

        let mismatch = match state.fields.as_ref() {
            None => None,
            Some(canonical) if canonical.len() != fields.len() => Some(MergeError::SchemaMismatch {
                source_id: source,
                expected: canonical.len(),
                actual: fields.len(),
            }),
            Some(canonical) => {
                for (want, got) in canonical.iter().zip(&fields) {
                    if want.name != got.name {
                        tracing::warn!(
                            session = self.id, %source, expected = %want.name, actual = %got.name,
                            "column name differs between shards"
                        );
                    }
                }
                None
            }
        };
        if let Some(err) = mismatch {
            drop(state);
            self.fail(err);
            return;
        }

        let first = state.fields.is_none();
        if first {
            for f in &mut fields {
                f.rewrite_origin(
                    self.plan.schema.as_deref(),
                    self.plan.table_alias.as_deref(),
                    self.plan.table.as_deref(),
                );
            }
            state.fields = Some(fields.clone());
        }
        let mut start = self.enter_draining(&mut state);
        drop(state);

        if first {
            let forwarded = self.with_sink(|sink| {
                if self.failed.load(Ordering::Acquire) {
                    return Ok(false);
                }
                sink.forward_fields(&fields).map(|()| true)
            });
            match forwarded {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    self.fail(MergeError::Sink(e));
                    return;
                }
            }
            let mut state = self.state.lock();
            state.fields_forwarded = true;
            start = self.enter_draining(&mut state);
        }
        if start {
            self.start_drain();
        }
    }

    /// Enqueue one row from `source`. Blocks while that source's queue is
    /// full. Rows are dropped once the session failed or the LIMIT window
    /// is full. `Err(Interrupted)` tells the producer to stop reading.
    pub fn on_row(&self, source: SourceId, row: Row) -> Result<(), MergeError> {
        if self.failed.load(Ordering::Acquire) || self.suppress.load(Ordering::Acquire) {
            return Ok(());
        }
        match self.queues.get(&source) {
            Some(queue) => queue.put(HeapItem::row(source, row)),
            None => {
                tracing::warn!(session = self.id, %source, "row from unknown source dropped");
                Ok(())
            }
        }
    }

    pub fn on_source_exhausted(&self, source: SourceId) {
        let Some(queue) = self.queues.get(&source) else {
            tracing::warn!(session = self.id, %source, "EOF from unknown source ignored");
            return;
        };
        if queue.put(HeapItem::eof(source)).is_err() {
            tracing::debug!(session = self.id, %source, "EOF after session closed");
        }
    }

    /// A source reported an error instead of fields or rows.
    pub fn on_source_error(&self, source: SourceId, code: u16, message: &str) {
        let err = MergeError::Backend {
            source_id: source,
            code,
            message: message.to_string(),
        };
        if self.policy == FailurePolicy::Strict {
            self.fail(err);
            return;
        }

        let (all_failed, start) = {
            let mut state = self.state.lock();
            if state.phase.is_terminal() || !state.failed_sources.insert(source) {
                return;
            }
            tracing::warn!(session = self.id, error = %err, "source failed, continuing without it");
            state.awaiting.remove(&source);
            let all_failed = state.failed_sources.len() == self.plan.sources.len();
            let start = !all_failed && self.enter_draining(&mut state);
            (all_failed, start)
        };
        if all_failed {
            self.fail(MergeError::AllSourcesFailed(self.plan.sources.len()));
            return;
        }
        // Truncate the failed stream; the drain treats it as exhausted.
        self.on_source_exhausted(source);
        self.release_source(source, false);
        if start {
            self.start_drain();
        }
    }

    /// External cancellation (client disconnect, query timeout).
    pub fn abort(&self, reason: &str) {
        self.fail(MergeError::Cancelled(reason.to_string()));
    }

    // ── Drain ──

    fn enter_draining(&self, state: &mut SessionState) -> bool {
        if state.phase == MergePhase::AwaitingFields && state.awaiting.is_empty() && state.fields_forwarded {
            state.phase = MergePhase::Draining;
            tracing::debug!(session = self.id, "all sources described, draining");
            true
        } else {
            false
        }
    }

    fn start_drain(&self) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let name = format!("merge-{}", self.id);
        if let Err(e) = self.pool.execute(&name, Box::new(move || this.drain())) {
            self.fail(MergeError::Cancelled(format!("cannot start drain: {e}")));
        }
    }

    fn drain(&self) {
        let mut cursor = MergeCursor::new(self.plan.comparator.as_ref(), &self.plan.sources, &self.queues);
        match self.drain_rows(&mut cursor) {
            Ok(()) => self.complete(),
            // Queues are only closed by `fail`, which already reported.
            Err(MergeError::Interrupted) if self.failed.load(Ordering::Acquire) => {}
            Err(e) => self.fail(e),
        }
    }

    fn drain_rows(&self, cursor: &mut MergeCursor<'_>) -> Result<(), MergeError> {
        cursor.prime()?;
        let window = self.plan.limit;
        if window.is_full(0) {
            self.suppress.store(true, Ordering::Release);
        }

        while !self.suppress.load(Ordering::Acquire) {
            let Some(item) = cursor.next_row()? else {
                break;
            };
            self.live_sources.store(cursor.live_sources(), Ordering::Relaxed);
            let emitted = self.rows_emitted.fetch_add(1, Ordering::Relaxed) + 1;
            match window.admit(emitted) {
                Admit::Skip => {}
                Admit::Forward => {
                    if let Some(row) = item.into_row() {
                        self.forward_row(row)?;
                    }
                    if window.is_full(emitted) {
                        self.suppress.store(true, Ordering::Release);
                    }
                }
                Admit::Exhausted => {
                    self.rows_discarded.fetch_add(1, Ordering::Relaxed);
                    self.suppress.store(true, Ordering::Release);
                }
            }
        }

        if self.suppress.load(Ordering::Acquire) {
            let discarded = cursor.discard_remaining()?;
            self.rows_discarded.fetch_add(discarded, Ordering::Relaxed);
            tracing::debug!(session = self.id, discarded, "limit reached, drained remaining rows");
        }
        self.live_sources.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn forward_row(&self, row: Row) -> Result<(), MergeError> {
        self.with_sink(|sink| {
            if self.failed.load(Ordering::Acquire) {
                return Err(MergeError::Interrupted);
            }
            sink.forward_row(row).map_err(MergeError::Sink)
        })?;
        self.rows_forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Call into the sink under `sink_gate`, then deliver any error that a
    /// concurrent `fail` parked while the gate was held.
    fn with_sink<R>(&self, f: impl FnOnce(&dyn ResultSink) -> R) -> R {
        let result = {
            let _gate = self.sink_gate.lock();
            f(self.sink.as_ref())
        };
        self.flush_error();
        result
    }

    fn flush_error(&self) {
        loop {
            {
                let Some(_gate) = self.sink_gate.try_lock() else {
                    // The holder flushes after releasing the gate.
                    return;
                };
                if let Some((code, message)) = self.pending_error.lock().take() {
                    self.sink.forward_error(code, &message);
                }
            }
            // An error parked while we held the gate would otherwise be missed.
            if self.pending_error.lock().is_none() {
                return;
            }
        }
    }

    // ── Termination ──

    fn complete(&self) {
        {
            let mut state = self.state.lock();
            if state.phase != MergePhase::Draining {
                return;
            }
            state.phase = MergePhase::Completed;
        }
        // Late rows or duplicate EOFs must not block on a queue nobody reads.
        for queue in self.queues.values() {
            queue.close();
            queue.clear();
        }
        if let Err(e) = self.with_sink(|sink| sink.forward_end()) {
            tracing::warn!(session = self.id, error = %e, "client went away before end of results");
        }
        self.release_all(true);
        let stats = self.stats();
        tracing::debug!(
            session = self.id,
            emitted = stats.rows_emitted,
            forwarded = stats.rows_forwarded,
            discarded = stats.rows_discarded,
            "merge session completed"
        );
        shardgate_observability::record_merge_session("completed", stats.rows_emitted, stats.rows_forwarded);
        self.finished.notify_all();
    }

    /// Idempotent: the first failure wins and is reported once. Later
    /// failures (or a racing completion) are ignored. Never waits for a
    /// sink call in progress; its caller delivers the error afterwards.
    fn fail(&self, err: MergeError) {
        {
            let mut state = self.state.lock();
            if state.phase.is_terminal() {
                return;
            }
            state.phase = MergePhase::Failed;
            self.failed.store(true, Ordering::Release);
        }
        for queue in self.queues.values() {
            queue.close();
            queue.clear();
        }

        let err = ShardgateError::from(err);
        tracing::warn!(session = self.id, error = %err, "merge session failed");
        *self.pending_error.lock() = Some((err.mysql_errno(), err.to_string()));
        self.flush_error();
        self.release_all(false);
        shardgate_observability::record_merge_session(
            "failed",
            self.rows_emitted.load(Ordering::Relaxed),
            self.rows_forwarded.load(Ordering::Relaxed),
        );
        self.finished.notify_all();
    }

    fn release_source(&self, source: SourceId, reusable: bool) {
        if self.released.lock().insert(source) {
            self.releaser.release(source, reusable);
        }
    }

    fn release_all(&self, reusable: bool) {
        let mut released = self.released.lock();
        for &source in &self.plan.sources {
            if released.insert(source) {
                self.releaser.release(source, reusable);
            }
        }
    }

    /// Block until the session completes or fails, or `timeout` elapses.
    pub fn wait_terminal(&self, timeout: Duration) -> MergePhase {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.phase.is_terminal() {
            if self.finished.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.phase
    }

    pub fn stats(&self) -> MergeStats {
        let (phase, failed_sources) = {
            let state = self.state.lock();
            (state.phase, state.failed_sources.len())
        };
        MergeStats {
            session_id: self.id,
            phase,
            rows_emitted: self.rows_emitted.load(Ordering::Relaxed),
            rows_forwarded: self.rows_forwarded.load(Ordering::Relaxed),
            rows_discarded: self.rows_discarded.load(Ordering::Relaxed),
            live_sources: self.live_sources.load(Ordering::Relaxed),
            failed_sources,
            peak_queue_len: self.queues.values().map(|q| q.peak_len()).max().unwrap_or(0),
        }
    }
}

impl fmt::Debug for MergeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeSession")
            .field("id", &self.id)
            .field("sources", &self.plan.sources)
            .field("limit", &self.plan.limit)
            .finish_non_exhaustive()
    }
}
