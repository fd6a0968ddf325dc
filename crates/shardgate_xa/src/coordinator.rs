//! XA transaction coordinator.
//!
//! Owns the xid → transaction arena and drives each transaction through the
//! stage machine in [`crate::stage`]. Backend replies arrive through the
//! `on_connection_*` callbacks from whatever threads the connection layer
//! uses; each callback takes the transaction's lock, updates state and the
//! log, and sends any follow-up commands after the lock is released.
//!
//! Ordering per transaction:
//! 1. The stage is logged before any of its commands are sent.
//! 2. Each sub-state change is logged before the round can advance.
//! 3. A failed log write abandons the transaction: no further commands.
//!
//! With `purge_settled`, a committed or rolled-back transaction leaves the
//! arena and the log right after it settles. Late callbacks for it then
//! see `UnknownTransaction`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use shardgate_common::config::XaConfig;
use shardgate_common::error::{ShardgateError, ShardgateResult, XaError, ER_XAER_NOTA};
use shardgate_common::executor::{Job, WorkerPool};
use shardgate_common::shutdown::ShutdownSignal;
use shardgate_common::types::{ParticipantId, Xid};

use crate::backend::XaBackend;
use crate::log::TransactionLog;
use crate::record::ParticipantState;
use crate::recovery::RecoveryReport;
use crate::stage::{self, Branch, Env, Event, NotaCheck, Reply, StageKind, Step, TxnInner};
use crate::state::{Intent, TxStage, XaOutcome, XaSubState};

/// One distributed transaction in the arena.
pub struct XaTransaction {
    xid: Xid,
    inner: Mutex<TxnInner>,
    settled: Condvar,
}

/// Point-in-time view of an [`XaTransaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnSnapshot {
    pub xid: Xid,
    pub stage: TxStage,
    pub running: Option<StageKind>,
    pub outcome: Option<XaOutcome>,
    pub retries: u32,
    pub participants: Vec<ParticipantState>,
}

impl XaTransaction {
    fn new(xid: Xid, inner: TxnInner) -> Self {
        Self {
            xid,
            inner: Mutex::new(inner),
            settled: Condvar::new(),
        }
    }

    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    pub fn stage(&self) -> TxStage {
        self.inner.lock().stage
    }

    pub fn outcome(&self) -> Option<XaOutcome> {
        self.inner.lock().outcome.clone()
    }

    pub fn sub_state(&self, participant: ParticipantId) -> Option<XaSubState> {
        let inner = self.inner.lock();
        inner.branch_index(participant).map(|i| inner.branches[i].sub_state)
    }

    pub fn snapshot(&self) -> TxnSnapshot {
        let inner = self.inner.lock();
        TxnSnapshot {
            xid: self.xid.clone(),
            stage: inner.stage,
            running: inner.current,
            outcome: inner.outcome.clone(),
            retries: inner.retries,
            participants: inner
                .branches
                .iter()
                .map(|b| ParticipantState {
                    participant: b.participant,
                    sub_state: b.sub_state,
                })
                .collect(),
        }
    }

    /// Block until the transaction settles or `timeout` passes.
    pub fn wait_outcome(&self, timeout: Duration) -> Option<XaOutcome> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.outcome.is_none() {
            if self.settled.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        inner.outcome.clone()
    }
}

/// Counters since the coordinator started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XaCoordinatorStats {
    pub active: usize,
    pub committed: u64,
    pub rolled_back: u64,
    pub frozen: u64,
    pub parked: u64,
    pub log_failures: u64,
    /// Settled transactions removed from the arena and the log.
    pub purged: u64,
}

pub struct XaCoordinator {
    config: XaConfig,
    log: Arc<TransactionLog>,
    backend: Arc<dyn XaBackend>,
    pool: Arc<dyn WorkerPool>,
    txns: DashMap<Xid, Arc<XaTransaction>>,
    /// `{xid_prefix}.{boot millis}`; keeps xids unique across restarts.
    xid_base: String,
    next_seq: AtomicU64,
    shutdown: ShutdownSignal,
    self_ref: Weak<XaCoordinator>,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    frozen: AtomicU64,
    parked: AtomicU64,
    log_failures: AtomicU64,
    purged: AtomicU64,
}

fn is_fatal(err: &ShardgateError) -> bool {
    matches!(
        err,
        ShardgateError::Xa(XaError::LogFailure { .. })
            | ShardgateError::Storage(_)
            | ShardgateError::InternalBug { .. }
    )
}

impl XaCoordinator {
    pub fn new(
        config: XaConfig,
        log: Arc<TransactionLog>,
        backend: Arc<dyn XaBackend>,
        pool: Arc<dyn WorkerPool>,
    ) -> Arc<Self> {
        let boot_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let xid_base = format!("{}.{}", config.xid_prefix, boot_ms);
        Arc::new_cyclic(|self_ref| Self {
            config,
            log,
            backend,
            pool,
            txns: DashMap::new(),
            xid_base,
            next_seq: AtomicU64::new(1),
            shutdown: ShutdownSignal::new(),
            self_ref: self_ref.clone(),
            committed: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
            frozen: AtomicU64::new(0),
            parked: AtomicU64::new(0),
            log_failures: AtomicU64::new(0),
            purged: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &XaConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<TransactionLog> {
        &self.log
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Stop scheduling retries and wake any sleeping retry job.
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    // ── Client operations ──

    /// Start a transaction over `participants` with a generated xid.
    pub fn begin(&self, participants: &[ParticipantId], explicit: bool) -> ShardgateResult<Arc<XaTransaction>> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.begin_with_xid(Xid::generate(&self.xid_base, seq), participants, explicit)
    }

    pub fn begin_with_xid(
        &self,
        xid: Xid,
        participants: &[ParticipantId],
        explicit: bool,
    ) -> ShardgateResult<Arc<XaTransaction>> {
        let mut unique = participants.to_vec();
        unique.sort();
        unique.dedup();
        if participants.is_empty() || unique.len() != participants.len() {
            return Err(XaError::InvalidState {
                xid,
                stage: TxStage::Initialize.to_string(),
                op: "begin with an empty or duplicated participant list",
            }
            .into());
        }
        if self.txns.contains_key(&xid) || self.log.get(&xid).is_some() {
            return Err(XaError::InvalidState {
                xid,
                stage: TxStage::Initialize.to_string(),
                op: "begin a transaction id that is already in use",
            }
            .into());
        }

        self.log.begin(&xid, participants, explicit)?;
        let branches = participants
            .iter()
            .map(|&participant| Branch {
                participant,
                sub_state: XaSubState::Started,
                connected: true,
                awaiting: false,
            })
            .collect();
        let txn = Arc::new(XaTransaction::new(
            xid.clone(),
            TxnInner::new(TxStage::Initialize, explicit, branches),
        ));
        self.txns.insert(xid.clone(), Arc::clone(&txn));
        tracing::debug!(xid = %xid, participants = participants.len(), explicit, "transaction begun");
        Ok(txn)
    }

    /// Drive End → Prepare → Commit.
    pub fn commit(&self, xid: &Xid) -> ShardgateResult<()> {
        let txn = self.txn(xid)?;
        self.apply(&txn, |env, inner| {
            if let Some(XaOutcome::Frozen { code, message }) = &inner.outcome {
                return Err(XaError::Frozen {
                    xid: env.xid.clone(),
                    code: *code,
                    message: message.clone(),
                }
                .into());
            }
            if inner.stage != TxStage::Initialize || inner.current.is_some() {
                return Err(XaError::InvalidState {
                    xid: env.xid.clone(),
                    stage: inner.stage.to_string(),
                    op: "commit",
                }
                .into());
            }
            inner.intent = Some(Intent::Commit);
            stage::run_from(env, inner, StageKind::End)
        })
    }

    /// Drive End → Rollback, or Rollback for a transaction frozen by a
    /// failed End.
    pub fn rollback(&self, xid: &Xid) -> ShardgateResult<()> {
        let txn = self.txn(xid)?;
        self.apply(&txn, |env, inner| {
            if matches!(inner.outcome, Some(XaOutcome::Frozen { .. })) {
                inner.outcome = None;
                inner.intent = Some(Intent::Rollback);
                inner.from_end = true;
                return stage::run_from(env, inner, StageKind::Rollback);
            }
            if inner.stage != TxStage::Initialize || inner.current.is_some() {
                return Err(XaError::InvalidState {
                    xid: env.xid.clone(),
                    stage: inner.stage.to_string(),
                    op: "rollback",
                }
                .into());
            }
            inner.intent = Some(Intent::Rollback);
            stage::run_from(env, inner, StageKind::End)
        })
    }

    // ── Connection callbacks ──

    pub fn on_connection_ok(&self, xid: &Xid, participant: ParticipantId) -> ShardgateResult<()> {
        let txn = self.txn(xid)?;
        self.dispatch(&txn, participant, Event::Ok)
    }

    pub fn on_connection_error(
        &self,
        xid: &Xid,
        participant: ParticipantId,
        code: u16,
        message: &str,
    ) -> ShardgateResult<()> {
        let txn = self.txn(xid)?;
        // Verified outside the lock: the check parks and then queries.
        let nota = if code == ER_XAER_NOTA && self.verifies_nota(&txn, participant) {
            Some(self.check_recover_list(xid, participant))
        } else {
            None
        };
        let reply = Reply {
            code,
            message: message.to_string(),
            nota,
        };
        self.dispatch(&txn, participant, Event::Error(reply))
    }

    pub fn on_connection_close(&self, xid: &Xid, participant: ParticipantId) -> ShardgateResult<()> {
        let txn = self.txn(xid)?;
        self.dispatch(&txn, participant, Event::Close)
    }

    pub fn on_connect_error(&self, xid: &Xid, participant: ParticipantId) -> ShardgateResult<()> {
        let txn = self.txn(xid)?;
        self.dispatch(&txn, participant, Event::ConnectError)
    }

    // ── Recovery and housekeeping ──

    /// Rebuild every unfinished logged transaction and drive it towards a
    /// terminal stage. Connections are assumed lost.
    pub fn recover(&self) -> ShardgateResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        if self.config.purge_settled {
            // Settled before the crash but not yet purged.
            for record in self.log.all() {
                if !record.is_terminal() || self.txns.contains_key(&record.xid) {
                    continue;
                }
                match self.log.purge(&record.xid) {
                    Ok(true) => report.purged += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(xid = %record.xid, error = %e, "cannot purge settled record"),
                }
            }
        }
        for record in self.log.unfinished() {
            if self.txns.contains_key(&record.xid) {
                report.skipped += 1;
                continue;
            }
            // Commit is only logged once every branch prepared.
            let kind = match record.stage {
                TxStage::Commit | TxStage::CommitFail => StageKind::Commit,
                _ => StageKind::Rollback,
            };
            let branches = record
                .participants
                .iter()
                .map(|p| Branch {
                    participant: p.participant,
                    sub_state: p.sub_state,
                    connected: false,
                    awaiting: false,
                })
                .collect();
            let mut inner = TxnInner::new(record.stage, record.explicit, branches);
            inner.intent = Some(if kind == StageKind::Commit {
                Intent::Commit
            } else {
                Intent::Rollback
            });
            let txn = Arc::new(XaTransaction::new(record.xid.clone(), inner));
            self.txns.insert(record.xid.clone(), Arc::clone(&txn));
            tracing::info!(xid = %record.xid, stage = %record.stage, drive = %kind, "recovering transaction");

            match self.apply(&txn, |env, inner| stage::run_from(env, inner, kind)) {
                Ok(()) if kind == StageKind::Commit => report.committing.push(record.xid),
                Ok(()) => report.rolling_back.push(record.xid),
                Err(e) => {
                    let e = e.with_context(format!("recovering {} from {}", record.xid, record.stage));
                    tracing::error!(xid = %record.xid, error = %e, "recovery drive failed");
                    report.failed.push(record.xid);
                }
            }
        }
        tracing::info!(
            committing = report.committing.len(),
            rolling_back = report.rolling_back.len(),
            failed = report.failed.len(),
            purged = report.purged,
            "transaction recovery started"
        );
        Ok(report)
    }

    /// Re-drive a transaction parked as `CommitPending`/`RollbackPending`
    /// with a fresh retry budget. Returns false if it was not parked.
    pub fn redrive(&self, xid: &Xid) -> ShardgateResult<bool> {
        let txn = self.txn(xid)?;
        let mut started = false;
        self.apply(&txn, |env, inner| {
            if !inner.outcome.as_ref().is_some_and(XaOutcome::is_pending) {
                return Ok(Step::default());
            }
            let kind = match inner.stage {
                TxStage::Commit | TxStage::CommitFail => StageKind::Commit,
                _ => StageKind::Rollback,
            };
            inner.outcome = None;
            inner.retries = 0;
            started = true;
            tracing::info!(xid = %env.xid, drive = %kind, "re-driving parked transaction");
            stage::run_from(env, inner, kind)
        })?;
        Ok(started)
    }

    /// Drop a settled transaction from the arena and the log.
    pub fn forget(&self, xid: &Xid) -> ShardgateResult<bool> {
        if let Some(txn) = self.transaction(xid) {
            let inner = txn.inner.lock();
            if !inner.outcome.as_ref().is_some_and(XaOutcome::is_final) {
                return Err(XaError::InvalidState {
                    xid: xid.clone(),
                    stage: inner.stage.to_string(),
                    op: "forget",
                }
                .into());
            }
        }
        let purged = self.log.purge(xid)?;
        self.txns.remove(xid);
        Ok(purged)
    }

    pub fn transaction(&self, xid: &Xid) -> Option<Arc<XaTransaction>> {
        self.txns.get(xid).map(|e| Arc::clone(e.value()))
    }

    /// Transactions parked for the recovery sweeper, sorted by xid.
    pub fn pending(&self) -> Vec<Xid> {
        let mut out: Vec<Xid> = self
            .txns
            .iter()
            .filter(|e| e.value().outcome().is_some_and(|o| o.is_pending()))
            .map(|e| e.key().clone())
            .collect();
        out.sort();
        out
    }

    pub fn stats(&self) -> XaCoordinatorStats {
        XaCoordinatorStats {
            active: self.txns.len(),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            frozen: self.frozen.load(Ordering::Relaxed),
            parked: self.parked.load(Ordering::Relaxed),
            log_failures: self.log_failures.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
        }
    }

    // ── Internals ──

    fn txn(&self, xid: &Xid) -> ShardgateResult<Arc<XaTransaction>> {
        self.transaction(xid)
            .ok_or_else(|| XaError::UnknownTransaction(xid.clone()).into())
    }

    fn dispatch(&self, txn: &Arc<XaTransaction>, participant: ParticipantId, event: Event) -> ShardgateResult<()> {
        self.apply(txn, |env, inner| stage::on_event(env, inner, participant, event))
    }

    /// Run `f` under the transaction lock, then carry out the returned step.
    fn apply<F>(&self, txn: &Arc<XaTransaction>, f: F) -> ShardgateResult<()>
    where
        F: FnOnce(&Env<'_>, &mut TxnInner) -> ShardgateResult<Step>,
    {
        let step = {
            let mut inner = txn.inner.lock();
            if inner.fatal {
                return Err(XaError::LogFailure {
                    xid: txn.xid.clone(),
                    reason: "transaction abandoned after a log failure".into(),
                }
                .into());
            }
            let env = Env {
                xid: &txn.xid,
                backend: self.backend.as_ref(),
                log: &self.log,
                config: &self.config,
            };
            match f(&env, &mut inner) {
                Ok(step) => step,
                Err(e) => {
                    if is_fatal(&e) {
                        self.abandon(txn, &mut inner, &e);
                    }
                    return Err(e);
                }
            }
        };
        self.follow_up(txn, step)
    }

    fn abandon(&self, txn: &XaTransaction, inner: &mut TxnInner, err: &ShardgateError) {
        tracing::error!(xid = %txn.xid, stage = %inner.stage, error = %err, "abandoning transaction");
        inner.fatal = true;
        inner.current = None;
        inner.pending = 0;
        for b in &mut inner.branches {
            b.awaiting = false;
        }
        let outcome = XaOutcome::LogFailure(err.to_string());
        inner.outcome = Some(outcome.clone());
        self.note_outcome(txn, &outcome);
    }

    fn note_outcome(&self, txn: &XaTransaction, outcome: &XaOutcome) {
        let counter = match outcome {
            XaOutcome::Committed => &self.committed,
            XaOutcome::RolledBack => &self.rolled_back,
            XaOutcome::Frozen { .. } => &self.frozen,
            XaOutcome::CommitPending | XaOutcome::RollbackPending => &self.parked,
            XaOutcome::LogFailure(_) => &self.log_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        shardgate_observability::record_xa_outcome(outcome.as_str());
        txn.settled.notify_all();
    }

    /// Drop a settled transaction from the log, then from the arena. A failed
    /// purge leaves a terminal record that the next `recover` removes.
    fn retire(&self, txn: &XaTransaction) {
        match self.log.purge(&txn.xid) {
            Ok(_) => {
                self.purged.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::warn!(xid = %txn.xid, error = %e, "settled transaction left in the log"),
        }
        self.txns.remove(&txn.xid);
    }

    fn follow_up(&self, txn: &Arc<XaTransaction>, step: Step) -> ShardgateResult<()> {
        if let Some(outcome) = &step.settled {
            self.note_outcome(txn, outcome);
            if outcome.is_final() && self.config.purge_settled {
                self.retire(txn);
            }
        }
        for (participant, cmd) in step.commands {
            tracing::trace!(xid = %txn.xid, participant = %participant, cmd = %cmd, "sending");
            if let Err(e) = self.backend.exec_cmd(&txn.xid, participant, &cmd) {
                tracing::warn!(xid = %txn.xid, participant = %participant, error = %e, "command not sent");
                self.dispatch(txn, participant, Event::ConnectError)?;
            }
        }
        if let Some(kind) = step.retry {
            self.schedule_retry(txn, kind);
        }
        Ok(())
    }

    fn schedule_retry(&self, txn: &Arc<XaTransaction>, kind: StageKind) {
        let make_job = || -> Job {
            let weak = self.self_ref.clone();
            let xid = txn.xid.clone();
            let backoff = self.config.retry_backoff();
            let shutdown = self.shutdown.clone();
            Box::new(move || {
                if shutdown.wait_timeout(backoff) {
                    tracing::debug!(xid = %xid, "retry dropped on shutdown");
                    return;
                }
                let Some(coord) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = coord.resume(&xid, kind) {
                    tracing::warn!(xid = %xid, stage = %kind, error = %e, "stage retry failed");
                }
            })
        };
        let mut scheduled = self.pool.execute("xa-retry", make_job());
        if let Err(e) = &scheduled {
            // A transient refusal (e.g. thread spawn) gets one more try.
            if e.is_transient() && !self.shutdown.wait_timeout(Duration::from_millis(e.retry_after_ms())) {
                scheduled = self.pool.execute("xa-retry", make_job());
            }
        }
        if let Err(e) = scheduled {
            tracing::error!(xid = %txn.xid, error = %e, "cannot schedule retry, parking transaction");
            let outcome = kind.parked_outcome();
            {
                let mut inner = txn.inner.lock();
                inner.current = None;
                inner.outcome = Some(outcome.clone());
            }
            self.note_outcome(txn, &outcome);
        }
    }

    fn resume(&self, xid: &Xid, kind: StageKind) -> ShardgateResult<()> {
        let txn = self.txn(xid)?;
        self.apply(&txn, |env, inner| {
            let waiting = matches!(
                (inner.current, kind),
                (Some(StageKind::RollbackFail), StageKind::Rollback) | (Some(StageKind::CommitFail), StageKind::Commit)
            );
            if !waiting || inner.outcome.is_some() {
                return Ok(Step::default());
            }
            stage::run_from(env, inner, kind)
        })
    }

    fn verifies_nota(&self, txn: &XaTransaction, participant: ParticipantId) -> bool {
        let inner = txn.inner.lock();
        matches!(inner.current, Some(StageKind::Commit | StageKind::Rollback))
            && inner
                .branch_index(participant)
                .is_some_and(|i| inner.branches[i].awaiting)
    }

    /// Park, then ask the participant for its prepared xids. Only a readable
    /// list that lacks the xid counts as absent.
    fn check_recover_list(&self, xid: &Xid, participant: ParticipantId) -> NotaCheck {
        let delay = self.config.nota_recheck_delay();
        if !delay.is_zero() && self.shutdown.wait_timeout(delay) {
            return NotaCheck::Unknown;
        }
        let verdict = match self.backend.recover_xids(participant) {
            Ok(list) if list.iter().any(|x| x == xid.as_str()) => NotaCheck::Present,
            Ok(_) => NotaCheck::Absent,
            Err(e) => {
                tracing::warn!(xid = %xid, participant = %participant, error = %e, "XA RECOVER failed");
                NotaCheck::Unknown
            }
        };
        tracing::info!(xid = %xid, participant = %participant, verdict = ?verdict, "unknown-xid verification");
        verdict
    }
}
