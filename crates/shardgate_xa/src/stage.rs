//! Per-stage behaviour of the XA state machine.
//!
//! Each [`StageKind`] maps to a static [`StageOps`] table. The coordinator
//! holds a transaction's lock while it calls into these functions; they
//! mutate [`TxnInner`], write the transaction log, and return the commands
//! to send once the lock is released. Nothing in here performs network I/O
//! except opening replacement connections.
//!
//! A round ends when `pending` drops to zero; the stage's `next` then picks
//! the following stage from the branch states and `round_failed`.

use std::collections::HashMap;
use std::fmt;

use shardgate_common::config::XaConfig;
use shardgate_common::error::{ShardgateError, ShardgateResult, ER_UNKNOWN_ERROR, ER_XAER_NOTA, ER_XA_RMERR};
use shardgate_common::types::{ConnectionThreadId, ParticipantId, Xid};

use crate::backend::XaBackend;
use crate::log::TransactionLog;
use crate::state::{Intent, TxStage, XaOutcome, XaSubState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    End,
    Prepare,
    Commit,
    CommitFail,
    Rollback,
    RollbackFail,
}

impl StageKind {
    pub fn tx_stage(self) -> TxStage {
        match self {
            StageKind::End => TxStage::End,
            StageKind::Prepare => TxStage::Prepare,
            StageKind::Commit => TxStage::Commit,
            StageKind::CommitFail => TxStage::CommitFail,
            StageKind::Rollback => TxStage::Rollback,
            StageKind::RollbackFail => TxStage::RollbackFail,
        }
    }

    pub(crate) fn ops(self) -> &'static StageOps {
        match self {
            StageKind::End => &END,
            StageKind::Prepare => &PREPARE,
            StageKind::Commit => &COMMIT,
            StageKind::CommitFail => &COMMIT_FAIL,
            StageKind::Rollback => &ROLLBACK,
            StageKind::RollbackFail => &ROLLBACK_FAIL,
        }
    }

    /// Outcome left behind when a retry of this stage cannot be scheduled.
    pub(crate) fn parked_outcome(self) -> XaOutcome {
        match self {
            StageKind::Commit | StageKind::CommitFail => XaOutcome::CommitPending,
            _ => XaOutcome::RollbackPending,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tx_stage().as_str())
    }
}

/// What the coordinator needs while running stage functions for one xid.
pub(crate) struct Env<'a> {
    pub xid: &'a Xid,
    pub backend: &'a dyn XaBackend,
    pub log: &'a TransactionLog,
    pub config: &'a XaConfig,
}

#[derive(Debug, Clone)]
pub(crate) struct Branch {
    pub participant: ParticipantId,
    pub sub_state: XaSubState,
    pub connected: bool,
    /// A command for the current round is in flight.
    pub awaiting: bool,
}

#[derive(Debug)]
pub(crate) struct TxnInner {
    /// Last durably logged stage.
    pub stage: TxStage,
    /// Stage whose round is running, or waiting for a retry.
    pub current: Option<StageKind>,
    pub intent: Option<Intent>,
    pub explicit: bool,
    /// Rollback follows directly from End: nothing was prepared.
    pub from_end: bool,
    pub branches: Vec<Branch>,
    pub pending: usize,
    pub round_failed: bool,
    pub last_error: Option<(u16, String)>,
    pub stale_threads: HashMap<ParticipantId, ConnectionThreadId>,
    pub retries: u32,
    pub outcome: Option<XaOutcome>,
    /// A log write failed; the transaction accepts no further work.
    pub fatal: bool,
}

impl TxnInner {
    pub(crate) fn new(stage: TxStage, explicit: bool, branches: Vec<Branch>) -> Self {
        Self {
            stage,
            current: None,
            intent: None,
            explicit,
            from_end: false,
            branches,
            pending: 0,
            round_failed: false,
            last_error: None,
            stale_threads: HashMap::new(),
            retries: 0,
            outcome: None,
            fatal: false,
        }
    }

    pub(crate) fn branch_index(&self, participant: ParticipantId) -> Option<usize> {
        self.branches.iter().position(|b| b.participant == participant)
    }
}

/// Result of the side-channel `XA RECOVER` check after "unknown XID".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotaCheck {
    /// The recovery list was read and the xid is not on it.
    Absent,
    Present,
    /// The recovery list could not be read.
    Unknown,
}

#[derive(Debug, Clone)]
pub(crate) struct Reply {
    pub code: u16,
    pub message: String,
    pub nota: Option<NotaCheck>,
}

impl Reply {
    fn is_nota_absent(&self) -> bool {
        self.code == ER_XAER_NOTA && self.nota == Some(NotaCheck::Absent)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Event {
    Ok,
    Error(Reply),
    Close,
    ConnectError,
}

pub(crate) enum EnterAction {
    Send(String),
    /// Branch is already resolved for this stage.
    Skip,
    /// Branch failed without a command being sent.
    Fail,
}

pub(crate) enum Transition {
    Enter(StageKind),
    /// Re-enter the stage after the configured backoff.
    Retry(StageKind),
    Freeze,
    Finish(XaOutcome),
}

/// Work the coordinator performs after releasing the transaction lock.
#[derive(Debug, Default)]
pub(crate) struct Step {
    pub commands: Vec<(ParticipantId, String)>,
    pub retry: Option<StageKind>,
    pub settled: Option<XaOutcome>,
}

type TargetFn = fn(XaSubState) -> bool;
type HookFn = fn(&Env<'_>, &mut TxnInner) -> ShardgateResult<()>;
type EnterFn = fn(&Env<'_>, &mut TxnInner, usize) -> ShardgateResult<EnterAction>;
type ReplyFn = fn(&Env<'_>, &mut TxnInner, usize) -> ShardgateResult<bool>;
type ErrorFn = fn(&Env<'_>, &mut TxnInner, usize, &Reply) -> ShardgateResult<bool>;
type NextFn = fn(&Env<'_>, &mut TxnInner) -> Transition;

/// Dispatch table for one stage. Reply handlers return whether the branch
/// succeeded for this round.
pub(crate) struct StageOps {
    pub targets: TargetFn,
    pub on_stage: HookFn,
    pub on_enter: EnterFn,
    pub on_ok: ReplyFn,
    pub on_error: ErrorFn,
    pub on_close: ReplyFn,
    pub on_connect_error: ReplyFn,
    pub next: NextFn,
}

static END: StageOps = StageOps {
    targets: end_targets,
    on_stage: no_hook,
    on_enter: end_enter,
    on_ok: end_ok,
    on_error: branch_failed,
    on_close: conn_quit,
    on_connect_error: conn_quit,
    next: end_next,
};

static PREPARE: StageOps = StageOps {
    targets: prepare_targets,
    on_stage: no_hook,
    on_enter: prepare_enter,
    on_ok: prepare_ok,
    on_error: branch_failed,
    on_close: prepare_lost,
    on_connect_error: prepare_lost,
    next: prepare_next,
};

static COMMIT: StageOps = StageOps {
    targets: commit_targets,
    on_stage: no_hook,
    on_enter: commit_enter,
    on_ok: commit_ok,
    on_error: commit_error,
    on_close: commit_lost,
    on_connect_error: commit_lost,
    next: commit_next,
};

static COMMIT_FAIL: StageOps = StageOps {
    targets: no_targets,
    on_stage: commit_fail_stage,
    on_enter: no_enter,
    on_ok: no_reply,
    on_error: no_error,
    on_close: no_reply,
    on_connect_error: no_reply,
    next: commit_fail_next,
};

static ROLLBACK: StageOps = StageOps {
    targets: rollback_targets,
    on_stage: no_hook,
    on_enter: rollback_enter,
    on_ok: rollback_ok,
    on_error: rollback_error,
    on_close: rollback_lost,
    on_connect_error: rollback_lost,
    next: rollback_next,
};

static ROLLBACK_FAIL: StageOps = StageOps {
    targets: no_targets,
    on_stage: rollback_fail_stage,
    on_enter: no_enter,
    on_ok: no_reply,
    on_error: no_error,
    on_close: no_reply,
    on_connect_error: no_reply,
    next: rollback_fail_next,
};

// ── Shared helpers ──

fn no_hook(_: &Env<'_>, _: &mut TxnInner) -> ShardgateResult<()> {
    Ok(())
}

fn no_targets(_: XaSubState) -> bool {
    false
}

/// Error replies that need no bookkeeping beyond failing the round.
fn branch_failed(_: &Env<'_>, _: &mut TxnInner, _: usize, _: &Reply) -> ShardgateResult<bool> {
    Ok(false)
}

fn no_branch(env: &Env<'_>) -> ShardgateError {
    ShardgateError::internal_bug(
        "XA-STAGE-001",
        "branch event dispatched to a stage without branches",
        format!("xid={}", env.xid),
    )
}

fn no_enter(env: &Env<'_>, _: &mut TxnInner, _: usize) -> ShardgateResult<EnterAction> {
    Err(no_branch(env))
}

fn no_reply(env: &Env<'_>, _: &mut TxnInner, _: usize) -> ShardgateResult<bool> {
    Err(no_branch(env))
}

fn no_error(env: &Env<'_>, _: &mut TxnInner, _: usize, _: &Reply) -> ShardgateResult<bool> {
    Err(no_branch(env))
}

/// Log first, then update memory.
fn set_sub_state(env: &Env<'_>, inner: &mut TxnInner, idx: usize, state: XaSubState) -> ShardgateResult<()> {
    let branch = &mut inner.branches[idx];
    env.log.record(env.xid, branch.participant, state)?;
    branch.sub_state = state;
    Ok(())
}

fn set_if_changed(env: &Env<'_>, inner: &mut TxnInner, idx: usize, state: XaSubState) -> ShardgateResult<()> {
    if inner.branches[idx].sub_state == state {
        return Ok(());
    }
    set_sub_state(env, inner, idx, state)
}

fn command(verb: &str, env: &Env<'_>, inner: &TxnInner, idx: usize) -> EnterAction {
    EnterAction::Send(format!("XA {verb} {}", env.xid.branch(inner.branches[idx].participant)))
}

/// Replace a branch's connection. A replacement that reports the thread id
/// of the connection it replaces is a zombie session and counts as failed.
fn reconnect(env: &Env<'_>, inner: &mut TxnInner, idx: usize) -> bool {
    let participant = inner.branches[idx].participant;
    if let Some(old) = env.backend.connection_thread(env.xid, participant) {
        inner.stale_threads.insert(participant, old);
    }
    match env.backend.fresh_connection(env.xid, participant) {
        Ok(thread) if inner.stale_threads.get(&participant) == Some(&thread) => {
            tracing::warn!(
                xid = %env.xid,
                participant = %participant,
                thread = %thread,
                "replacement connection reused the stale thread"
            );
            env.backend.close_connection(env.xid, participant, "stale connection thread");
            inner.branches[idx].connected = false;
            false
        }
        Ok(thread) => {
            tracing::debug!(xid = %env.xid, participant = %participant, thread = %thread, "branch reconnected");
            inner.branches[idx].connected = true;
            true
        }
        Err(e) => {
            tracing::warn!(xid = %env.xid, participant = %participant, error = %e, "reconnect failed");
            inner.branches[idx].connected = false;
            inner.last_error = Some((ER_XA_RMERR, e));
            false
        }
    }
}

fn capture_stale_threads(env: &Env<'_>, inner: &mut TxnInner, stuck: fn(XaSubState) -> bool) {
    for b in inner.branches.iter().filter(|b| stuck(b.sub_state)) {
        if let Some(thread) = env.backend.connection_thread(env.xid, b.participant) {
            inner.stale_threads.insert(b.participant, thread);
        }
    }
}

// ── End ──

fn end_targets(s: XaSubState) -> bool {
    s == XaSubState::Started
}

fn end_ok(env: &Env<'_>, inner: &mut TxnInner, idx: usize) -> ShardgateResult<bool> {
    set_sub_state(env, inner, idx, XaSubState::Ended)?;
    Ok(true)
}

fn end_enter(env: &Env<'_>, inner: &mut TxnInner, idx: usize) -> ShardgateResult<EnterAction> {
    if !inner.branches[idx].connected {
        set_sub_state(env, inner, idx, XaSubState::ConnQuit)?;
        return Ok(EnterAction::Fail);
    }
    Ok(command("END", env, inner, idx))
}

/// The backend discards an unprepared branch when its session ends.
fn conn_quit(env: &Env<'_>, inner: &mut TxnInner, idx: usize) -> ShardgateResult<bool> {
    set_sub_state(env, inner, idx, XaSubState::ConnQuit)?;
    Ok(false)
}

fn end_next(_: &Env<'_>, inner: &mut TxnInner) -> Transition {
    if inner.round_failed {
        if inner.explicit {
            return Transition::Freeze;
        }
        inner.from_end = true;
        return Transition::Enter(StageKind::Rollback);
    }
    match inner.intent {
        Some(Intent::Commit) => Transition::Enter(StageKind::Prepare),
        _ => {
            inner.from_end = true;
            Transition::Enter(StageKind::Rollback)
        }
    }
}

// ── Prepare ──

fn prepare_targets(s: XaSubState) -> bool {
    s == XaSubState::Ended
}

fn prepare_ok(env: &Env<'_>, inner: &mut TxnInner, idx: usize) -> ShardgateResult<bool> {
    set_sub_state(env, inner, idx, XaSubState::Prepared)?;
    Ok(true)
}

fn prepare_enter(env: &Env<'_>, inner: &mut TxnInner, idx: usize) -> ShardgateResult<EnterAction> {
    if !inner.branches[idx].connected {
        set_sub_state(env, inner, idx, XaSubState::ConnQuit)?;
        return Ok(EnterAction::Fail);
    }
    Ok(command("PREPARE", env, inner, idx))
}

fn prepare_lost(env: &Env<'_>, inner: &mut TxnInner, idx: usize) -> ShardgateResult<bool> {
    set_sub_state(env, inner, idx, XaSubState::PrepareUnconnected)?;
    Ok(false)
}

fn prepare_next(_: &Env<'_>, inner: &mut TxnInner) -> Transition {
    if inner.round_failed {
        inner.from_end = false;
        Transition::Enter(StageKind::Rollback)
    } else {
        Transition::Enter(StageKind::Commit)
    }
}

// ── Commit ──

fn commit_targets(s: XaSubState) -> bool {
    matches!(s, XaSubState::Prepared | XaSubState::CommitFailed)
}

fn commit_enter(env: &Env<'_>, inner: &mut TxnInner, idx: usize) -> ShardgateResult<EnterAction> {
    let (state, connected) = (inner.branches[idx].sub_state, inner.branches[idx].connected);
    if (state == XaSubState::CommitFailed || !connected) && !reconnect(env, inner, idx) {
        set_if_changed(env, inner, idx, XaSubState::CommitFailed)?;
        return Ok(EnterAction::Fail);
    }
    Ok(command("COMMIT", env, inner, idx))
}

fn commit_ok(env: &Env<'_>, inner: &mut TxnInner, idx: usize) -> ShardgateResult<bool> {
    set_sub_state(env, inner, idx, XaSubState::Committed)?;
    Ok(true)
}

fn commit_error(env: &Env<'_>, inner: &mut TxnInner, idx: usize, reply: &Reply) -> ShardgateResult<bool> {
    if reply.is_nota_absent() {
        // No longer prepared on the backend: an earlier commit landed.
        set_sub_state(env, inner, idx, XaSubState::Committed)?;
        return Ok(true);
    }
    set_if_changed(env, inner, idx, XaSubState::CommitFailed)?;
    Ok(false)
}

fn commit_lost(env: &Env<'_>, inner: &mut TxnInner, idx: usize) -> ShardgateResult<bool> {
    set_if_changed(env, inner, idx, XaSubState::CommitFailed)?;
    Ok(false)
}

fn commit_next(_: &Env<'_>, inner: &mut TxnInner) -> Transition {
    if inner.branches.iter().all(|b| b.sub_state == XaSubState::Committed) {
        Transition::Finish(XaOutcome::Committed)
    } else {
        Transition::Enter(StageKind::CommitFail)
    }
}

fn commit_fail_stage(env: &Env<'_>, inner: &mut TxnInner) -> ShardgateResult<()> {
    capture_stale_threads(env, inner, |s| s != XaSubState::Committed);
    Ok(())
}

fn commit_fail_next(env: &Env<'_>, inner: &mut TxnInner) -> Transition {
    if inner.retries < env.config.commit_retry_limit {
        inner.retries += 1;
        Transition::Retry(StageKind::Commit)
    } else {
        Transition::Finish(XaOutcome::CommitPending)
    }
}

// ── Rollback ──

fn rollback_targets(s: XaSubState) -> bool {
    !s.is_rollback_resolved()
}

fn rollback_enter(env: &Env<'_>, inner: &mut TxnInner, idx: usize) -> ShardgateResult<EnterAction> {
    let (state, connected) = (inner.branches[idx].sub_state, inner.branches[idx].connected);
    let needs_fresh = matches!(state, XaSubState::PrepareUnconnected | XaSubState::RollbackFailed)
        || (!connected && !inner.from_end);

    if !needs_fresh && !connected {
        set_sub_state(env, inner, idx, XaSubState::ConnQuit)?;
        return Ok(EnterAction::Skip);
    }
    if needs_fresh && !reconnect(env, inner, idx) {
        set_if_changed(env, inner, idx, XaSubState::RollbackFailed)?;
        return Ok(EnterAction::Fail);
    }
    Ok(command("ROLLBACK", env, inner, idx))
}

fn rollback_ok(env: &Env<'_>, inner: &mut TxnInner, idx: usize) -> ShardgateResult<bool> {
    set_sub_state(env, inner, idx, XaSubState::RolledBack)?;
    let participant = inner.branches[idx].participant;
    inner.stale_threads.remove(&participant);
    Ok(true)
}

fn rollback_error(env: &Env<'_>, inner: &mut TxnInner, idx: usize, reply: &Reply) -> ShardgateResult<bool> {
    if reply.is_nota_absent() {
        return rollback_ok(env, inner, idx);
    }
    if reply.code != ER_XAER_NOTA && inner.from_end {
        // Nothing was prepared: dropping the session discards the branch.
        let participant = inner.branches[idx].participant;
        env.backend.close_connection(env.xid, participant, "rollback failed before prepare");
        inner.branches[idx].connected = false;
        return rollback_ok(env, inner, idx);
    }
    set_if_changed(env, inner, idx, XaSubState::RollbackFailed)?;
    Ok(false)
}

fn rollback_lost(env: &Env<'_>, inner: &mut TxnInner, idx: usize) -> ShardgateResult<bool> {
    if inner.from_end {
        set_sub_state(env, inner, idx, XaSubState::ConnQuit)?;
        return Ok(true);
    }
    set_if_changed(env, inner, idx, XaSubState::RollbackFailed)?;
    Ok(false)
}

fn rollback_next(_: &Env<'_>, inner: &mut TxnInner) -> Transition {
    if inner.branches.iter().all(|b| b.sub_state.is_rollback_resolved()) {
        Transition::Finish(XaOutcome::RolledBack)
    } else {
        Transition::Enter(StageKind::RollbackFail)
    }
}

fn rollback_fail_stage(env: &Env<'_>, inner: &mut TxnInner) -> ShardgateResult<()> {
    inner.from_end = false;
    capture_stale_threads(env, inner, |s| !s.is_rollback_resolved());
    let stuck: Vec<String> = inner
        .branches
        .iter()
        .filter(|b| !b.sub_state.is_rollback_resolved())
        .map(|b| b.participant.to_string())
        .collect();
    tracing::warn!(xid = %env.xid, stuck = ?stuck, retries = inner.retries, "rollback incomplete");
    Ok(())
}

fn rollback_fail_next(env: &Env<'_>, inner: &mut TxnInner) -> Transition {
    if inner.retries < env.config.rollback_retry_limit {
        inner.retries += 1;
        Transition::Retry(StageKind::Rollback)
    } else {
        Transition::Finish(XaOutcome::RollbackPending)
    }
}

// ── Driving ──

fn log_stage(env: &Env<'_>, inner: &mut TxnInner, stage: TxStage) -> ShardgateResult<()> {
    if !inner.stage.can_advance_to(stage) {
        return Err(ShardgateError::internal_bug(
            "XA-STAGE-002",
            format!("illegal stage transition {} -> {}", inner.stage, stage),
            format!("xid={}", env.xid),
        ));
    }
    env.log.record_stage(env.xid, stage)?;
    inner.stage = stage;
    Ok(())
}

fn enter(env: &Env<'_>, inner: &mut TxnInner, kind: StageKind, step: &mut Step) -> ShardgateResult<()> {
    log_stage(env, inner, kind.tx_stage())?;
    shardgate_observability::record_xa_stage(kind.tx_stage().as_str());
    inner.current = Some(kind);
    inner.pending = 0;
    inner.round_failed = false;

    let ops = kind.ops();
    (ops.on_stage)(env, inner)?;
    for idx in 0..inner.branches.len() {
        if !(ops.targets)(inner.branches[idx].sub_state) {
            continue;
        }
        match (ops.on_enter)(env, inner, idx)? {
            EnterAction::Send(cmd) => {
                inner.branches[idx].awaiting = true;
                inner.pending += 1;
                step.commands.push((inner.branches[idx].participant, cmd));
            }
            EnterAction::Skip => {}
            EnterAction::Fail => inner.round_failed = true,
        }
    }
    tracing::debug!(xid = %env.xid, stage = %kind, pending = inner.pending, "stage entered");
    Ok(())
}

fn settle(env: &Env<'_>, inner: &mut TxnInner, outcome: XaOutcome, step: &mut Step) -> ShardgateResult<()> {
    match outcome {
        XaOutcome::Committed => log_stage(env, inner, TxStage::Committed)?,
        XaOutcome::RolledBack => log_stage(env, inner, TxStage::RolledBack)?,
        _ => {}
    }
    inner.current = None;
    tracing::info!(xid = %env.xid, outcome = %outcome, stage = %inner.stage, "transaction settled");
    inner.outcome = Some(outcome.clone());
    step.settled = Some(outcome);
    Ok(())
}

/// Run `next` for the round that just finished and keep entering stages
/// until one has commands in flight or the transaction settles.
fn finish_round(env: &Env<'_>, inner: &mut TxnInner, mut kind: StageKind, step: &mut Step) -> ShardgateResult<()> {
    loop {
        let next = match (kind.ops().next)(env, inner) {
            Transition::Enter(next) => next,
            Transition::Retry(next) => {
                tracing::info!(xid = %env.xid, stage = %next, attempt = inner.retries, "scheduling stage retry");
                step.retry = Some(next);
                return Ok(());
            }
            Transition::Freeze => {
                let (code, message) = inner
                    .last_error
                    .clone()
                    .unwrap_or((ER_UNKNOWN_ERROR, "XA END failed".to_string()));
                return settle(env, inner, XaOutcome::Frozen { code, message }, step);
            }
            Transition::Finish(outcome) => return settle(env, inner, outcome, step),
        };
        enter(env, inner, next, step)?;
        if inner.pending > 0 {
            return Ok(());
        }
        kind = next;
    }
}

/// Enter `kind` and drive forward as far as possible without replies.
pub(crate) fn run_from(env: &Env<'_>, inner: &mut TxnInner, kind: StageKind) -> ShardgateResult<Step> {
    let mut step = Step::default();
    enter(env, inner, kind, &mut step)?;
    if inner.pending == 0 {
        finish_round(env, inner, kind, &mut step)?;
    }
    Ok(step)
}

/// Apply one participant event to the running round.
pub(crate) fn on_event(
    env: &Env<'_>,
    inner: &mut TxnInner,
    participant: ParticipantId,
    event: Event,
) -> ShardgateResult<Step> {
    let mut step = Step::default();
    let Some(idx) = inner.branch_index(participant) else {
        tracing::warn!(xid = %env.xid, participant = %participant, "event for unknown participant");
        return Ok(step);
    };
    let lost = matches!(event, Event::Close | Event::ConnectError);
    if lost {
        inner.branches[idx].connected = false;
    }
    let kind = match inner.current {
        Some(kind) if inner.branches[idx].awaiting => kind,
        _ => {
            tracing::debug!(xid = %env.xid, participant = %participant, event = ?event, "event outside a round ignored");
            return Ok(step);
        }
    };

    let ops = kind.ops();
    let ok = match &event {
        Event::Ok => (ops.on_ok)(env, inner, idx)?,
        Event::Error(reply) => {
            tracing::warn!(
                xid = %env.xid,
                participant = %participant,
                stage = %kind,
                code = reply.code,
                message = %reply.message,
                "branch command failed"
            );
            inner.last_error = Some((reply.code, reply.message.clone()));
            (ops.on_error)(env, inner, idx, reply)?
        }
        Event::Close => {
            inner.last_error = Some((ER_XA_RMERR, format!("connection to {participant} closed")));
            (ops.on_close)(env, inner, idx)?
        }
        Event::ConnectError => {
            inner.last_error = Some((ER_XA_RMERR, format!("cannot reach {participant}")));
            (ops.on_connect_error)(env, inner, idx)?
        }
    };
    inner.branches[idx].awaiting = false;
    inner.pending = inner.pending.saturating_sub(1);
    if !ok {
        inner.round_failed = true;
    }
    if inner.pending == 0 {
        finish_round(env, inner, kind, &mut step)?;
    }
    Ok(step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::store::MemLogStore;

    struct NullBackend;

    impl XaBackend for NullBackend {
        fn exec_cmd(&self, _: &Xid, _: ParticipantId, _: &str) -> Result<(), String> {
            Ok(())
        }
        fn fresh_connection(&self, _: &Xid, _: ParticipantId) -> Result<ConnectionThreadId, String> {
            Err("no backend".into())
        }
        fn connection_thread(&self, _: &Xid, _: ParticipantId) -> Option<ConnectionThreadId> {
            None
        }
        fn close_connection(&self, _: &Xid, _: ParticipantId, _: &str) {}
        fn recover_xids(&self, _: ParticipantId) -> Result<Vec<String>, String> {
            Ok(Vec::new())
        }
    }

    fn make_inner(log: &TransactionLog, xid: &Xid, explicit: bool) -> TxnInner {
        let ps = [ParticipantId(1), ParticipantId(2)];
        log.begin(xid, &ps, explicit).unwrap();
        let branches = ps
            .iter()
            .map(|&participant| Branch {
                participant,
                sub_state: XaSubState::Started,
                connected: true,
                awaiting: false,
            })
            .collect();
        TxnInner::new(TxStage::Initialize, explicit, branches)
    }

    #[test]
    fn test_end_sends_one_command_per_branch() {
        let log = TransactionLog::open(Arc::new(MemLogStore::new())).unwrap();
        let xid = Xid::new("sg.1");
        let config = XaConfig::default();
        let env = Env {
            xid: &xid,
            backend: &NullBackend,
            log: &log,
            config: &config,
        };
        let mut inner = make_inner(&log, &xid, false);
        inner.intent = Some(Intent::Commit);

        let step = run_from(&env, &mut inner, StageKind::End).unwrap();
        assert_eq!(inner.pending, 2);
        assert_eq!(step.commands[0], (ParticipantId(1), "XA END 'sg.1','1'".to_string()));
        assert_eq!(log.get(&xid).unwrap().stage, TxStage::End);
    }

    #[test]
    fn test_explicit_end_failure_freezes() {
        let log = TransactionLog::open(Arc::new(MemLogStore::new())).unwrap();
        let xid = Xid::new("sg.2");
        let config = XaConfig::default();
        let env = Env {
            xid: &xid,
            backend: &NullBackend,
            log: &log,
            config: &config,
        };
        let mut inner = make_inner(&log, &xid, true);
        inner.intent = Some(Intent::Commit);
        run_from(&env, &mut inner, StageKind::End).unwrap();

        on_event(&env, &mut inner, ParticipantId(1), Event::Ok).unwrap();
        let reply = Reply {
            code: 1399,
            message: "XAER_RMFAIL".into(),
            nota: None,
        };
        let step = on_event(&env, &mut inner, ParticipantId(2), Event::Error(reply)).unwrap();
        assert!(step.commands.is_empty());
        assert!(matches!(step.settled, Some(XaOutcome::Frozen { code: 1399, .. })));
        assert_eq!(inner.stage, TxStage::End);
        assert_eq!(inner.current, None);
    }

    #[test]
    fn test_stray_reply_is_ignored() {
        let log = TransactionLog::open(Arc::new(MemLogStore::new())).unwrap();
        let xid = Xid::new("sg.3");
        let config = XaConfig::default();
        let env = Env {
            xid: &xid,
            backend: &NullBackend,
            log: &log,
            config: &config,
        };
        let mut inner = make_inner(&log, &xid, false);
        let step = on_event(&env, &mut inner, ParticipantId(1), Event::Ok).unwrap();
        assert!(step.commands.is_empty() && step.settled.is_none());
        on_event(&env, &mut inner, ParticipantId(2), Event::Close).unwrap();
        assert!(!inner.branches[1].connected);
        assert_eq!(inner.branches[1].sub_state, XaSubState::Started);
    }

    #[test]
    fn test_disconnected_branch_quits_during_implicit_end() {
        let log = TransactionLog::open(Arc::new(MemLogStore::new())).unwrap();
        let xid = Xid::new("sg.4");
        let config = XaConfig::default();
        let env = Env {
            xid: &xid,
            backend: &NullBackend,
            log: &log,
            config: &config,
        };
        let mut inner = make_inner(&log, &xid, false);
        inner.intent = Some(Intent::Commit);
        inner.branches[0].connected = false;

        let step = run_from(&env, &mut inner, StageKind::End).unwrap();
        assert_eq!(step.commands.len(), 1);
        assert_eq!(inner.branches[0].sub_state, XaSubState::ConnQuit);

        // End round fails, so the implicit transaction rolls back; the
        // quit branch needs no command.
        let step = on_event(&env, &mut inner, ParticipantId(2), Event::Ok).unwrap();
        assert_eq!(inner.current, Some(StageKind::Rollback));
        assert!(inner.from_end);
        assert_eq!(step.commands, vec![(ParticipantId(2), "XA ROLLBACK 'sg.4','2'".to_string())]);
    }
}
