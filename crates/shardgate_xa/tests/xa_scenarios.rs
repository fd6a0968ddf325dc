//! XA coordinator scenarios.
//!
//! - X1: happy path, six durable participant records in order
//! - X2: End failure in an implicit transaction, unknown-XID verified absent
//! - X3: unknown-XID still present triggers one RollbackFail retry round
//! - X4: log fault on a stage write stops all further commands
//! - X5: log fault on a participant write abandons the transaction
//! - X6: mixed ok/error replies never produce an illegal transition
//! - X7: explicit transaction frozen by End, then rolled back by the client
//! - X8: lost prepare connection with a zombie thread, parked, then swept
//! - X9: crash after Commit/Prepare was logged, recovered from the file log
//! - X10: unknown-XID during Commit verified absent counts as committed
//! - X11: a command that cannot be sent is handled as a connect error
//! - X12: argument and state validation
//! - X13: a re-drive still in flight keeps its sweep counter
//! - X14: a re-drive refused by the log is abandoned at once
//! - X15: settled transactions leave the arena and the file log

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use shardgate_common::config::{RecoveryConfig, SyncMode, XaConfig};
use shardgate_common::error::{ShardgateError, StorageError, XaError, ER_XAER_NOTA};
use shardgate_common::executor::InlinePool;
use shardgate_common::types::{ConnectionThreadId, ParticipantId, Xid};
use shardgate_xa::{
    FileLogStore, LogStore, MemLogStore, RecoverySweeper, StageKind, TransactionLog, TxStage,
    XaBackend, XaCoordinator, XaOutcome, XaSubState,
};

const P1: ParticipantId = ParticipantId(1);
const P2: ParticipantId = ParticipantId(2);

// ═══════════════════════════════════════════════════════════════════════════
// Fixtures
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct MockBackend {
    sent: Mutex<Vec<(ParticipantId, String)>>,
    /// Server thread of each participant's current connection.
    threads: Mutex<HashMap<ParticipantId, u64>>,
    next_thread: AtomicU64,
    /// `XA RECOVER` answers; participants not listed report an empty list.
    recover_lists: Mutex<HashMap<ParticipantId, Result<Vec<String>, String>>>,
    recover_calls: AtomicUsize,
    /// Replacement connections for these land on the old server thread.
    zombie: Mutex<HashSet<ParticipantId>>,
    fail_exec: Mutex<HashSet<ParticipantId>>,
    fresh_calls: AtomicUsize,
    closed: Mutex<Vec<ParticipantId>>,
}

impl MockBackend {
    fn connected(participants: &[(ParticipantId, u64)]) -> Arc<Self> {
        let backend = Self::default();
        backend.next_thread.store(1000, Ordering::SeqCst);
        backend.threads.lock().extend(participants.iter().copied());
        Arc::new(backend)
    }

    fn sent_since(&self, from: usize) -> Vec<(ParticipantId, String)> {
        self.sent.lock()[from..].to_vec()
    }

    fn sent_len(&self) -> usize {
        self.sent.lock().len()
    }

    fn count(&self, verb: &str) -> usize {
        let prefix = format!("XA {verb} ");
        self.sent.lock().iter().filter(|(_, c)| c.starts_with(&prefix)).count()
    }
}

impl XaBackend for MockBackend {
    fn exec_cmd(&self, _xid: &Xid, participant: ParticipantId, command: &str) -> Result<(), String> {
        if self.fail_exec.lock().contains(&participant) {
            return Err("broken pipe".into());
        }
        self.sent.lock().push((participant, command.to_string()));
        Ok(())
    }

    fn fresh_connection(&self, _xid: &Xid, participant: ParticipantId) -> Result<ConnectionThreadId, String> {
        self.fresh_calls.fetch_add(1, Ordering::SeqCst);
        let mut threads = self.threads.lock();
        let thread = match threads.get(&participant) {
            Some(&old) if self.zombie.lock().contains(&participant) => old,
            _ => self.next_thread.fetch_add(1, Ordering::SeqCst),
        };
        threads.insert(participant, thread);
        Ok(ConnectionThreadId(thread))
    }

    fn connection_thread(&self, _xid: &Xid, participant: ParticipantId) -> Option<ConnectionThreadId> {
        self.threads.lock().get(&participant).map(|&t| ConnectionThreadId(t))
    }

    fn close_connection(&self, _xid: &Xid, participant: ParticipantId, _reason: &str) {
        self.closed.lock().push(participant);
    }

    fn recover_xids(&self, participant: ParticipantId) -> Result<Vec<String>, String> {
        self.recover_calls.fetch_add(1, Ordering::SeqCst);
        self.recover_lists
            .lock()
            .get(&participant)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Counts puts per key family and can refuse them.
#[derive(Default)]
struct RecordingStore {
    inner: MemLogStore,
    stage_puts: AtomicUsize,
    participant_puts: AtomicUsize,
    /// Refuse coordinator-key puts once this many succeeded.
    fail_stage_after: Option<usize>,
    fail_participant_puts: bool,
    /// Refuse every put while set.
    refuse_all: AtomicBool,
}

impl LogStore for RecordingStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if self.refuse_all.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("read-only filesystem".into()));
        }
        if key.starts_with("c/") {
            if self.fail_stage_after == Some(self.stage_puts.load(Ordering::SeqCst)) {
                return Err(StorageError::Unavailable("disk full".into()));
            }
            self.stage_puts.fetch_add(1, Ordering::SeqCst);
        } else {
            if self.fail_participant_puts {
                return Err(StorageError::Unavailable("disk full".into()));
            }
            self.participant_puts.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.put(key, value)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key)
    }

    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        self.inner.scan()
    }
}

fn fast_config() -> XaConfig {
    XaConfig {
        nota_recheck_delay_ms: 0,
        retry_backoff_ms: 0,
        ..XaConfig::default()
    }
}

fn make_coordinator(store: Arc<dyn LogStore>, backend: Arc<MockBackend>, config: XaConfig) -> Arc<XaCoordinator> {
    let log = Arc::new(TransactionLog::open(store).unwrap());
    XaCoordinator::new(config, log, backend, Arc::new(InlinePool))
}

fn ack_all(coord: &XaCoordinator, xid: &Xid, cmds: &[(ParticipantId, String)]) {
    for (p, _) in cmds {
        coord.on_connection_ok(xid, *p).unwrap();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// X1: happy path
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_happy_path_commits_with_six_participant_records() {
    let store = Arc::new(RecordingStore::default());
    let backend = MockBackend::connected(&[(P1, 11), (P2, 12)]);
    let coord = make_coordinator(store.clone(), backend.clone(), fast_config());
    let txn = coord.begin(&[P1, P2], false).unwrap();
    let xid = txn.xid().clone();
    let log = coord.log().clone();

    coord.commit(&xid).unwrap();
    let ends = backend.sent_since(0);
    assert_eq!(ends.len(), 2);
    assert!(ends.iter().all(|(_, c)| c.starts_with("XA END ")));
    assert_eq!(log.get(&xid).unwrap().stage, TxStage::End);

    let mut seen = Vec::new();
    let mut from = 0;
    for (stage, verb, expect) in [
        (TxStage::End, "END", XaSubState::Ended),
        (TxStage::Prepare, "PREPARE", XaSubState::Prepared),
        (TxStage::Commit, "COMMIT", XaSubState::Committed),
    ] {
        let cmds = backend.sent_since(from);
        from = backend.sent_len();
        assert_eq!(cmds.len(), 2, "stage {stage}");
        assert!(cmds.iter().all(|(_, c)| c.starts_with(&format!("XA {verb} "))));
        ack_all(&coord, &xid, &cmds);
        let rec = log.get(&xid).unwrap();
        assert_eq!(rec.sub_state(P1), Some(expect));
        assert_eq!(rec.sub_state(P2), Some(expect));
        seen.push(expect);
    }

    assert!(seen.windows(2).all(|w| w[0].progress() < w[1].progress()));
    assert_eq!(store.participant_puts.load(Ordering::SeqCst), 6);
    // begin, End, Prepare, Commit, Committed
    assert_eq!(store.stage_puts.load(Ordering::SeqCst), 5);
    assert_eq!(txn.wait_outcome(Duration::from_secs(1)), Some(XaOutcome::Committed));
    // Settled transactions are purged from the log and the arena.
    assert!(log.get(&xid).is_none());
    assert!(coord.transaction(&xid).is_none());
    assert_eq!(coord.stats().committed, 1);
    assert_eq!(coord.stats().purged, 1);
}

// ═══════════════════════════════════════════════════════════════════════════
// X2 / X3: unknown-XID verification during Rollback
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_implicit_end_failure_rolls_back_and_verifies_unknown_xid() {
    let backend = MockBackend::connected(&[(P1, 11), (P2, 12)]);
    let coord = make_coordinator(Arc::new(MemLogStore::new()), backend.clone(), fast_config());
    let txn = coord.begin(&[P1, P2], false).unwrap();
    let xid = txn.xid().clone();

    coord.commit(&xid).unwrap();
    coord.on_connection_ok(&xid, P1).unwrap();
    coord
        .on_connection_error(&xid, P2, 1399, "XAER_RMFAIL: not in a transaction")
        .unwrap();

    assert_eq!(txn.stage(), TxStage::Rollback);
    assert_eq!(backend.count("ROLLBACK"), 2);

    coord
        .on_connection_error(&xid, P1, ER_XAER_NOTA, "XAER_NOTA: Unknown XID")
        .unwrap();
    assert_eq!(backend.recover_calls.load(Ordering::SeqCst), 1);
    assert_eq!(txn.sub_state(P1), Some(XaSubState::RolledBack));

    coord.on_connection_ok(&xid, P2).unwrap();
    assert_eq!(txn.outcome(), Some(XaOutcome::RolledBack));
    assert_eq!(txn.snapshot().retries, 0);
    assert_eq!(backend.count("ROLLBACK"), 2, "no extra rollback round");
    assert!(coord.log().get(&xid).is_none());
}

#[test]
fn test_unknown_xid_still_listed_retries_only_stuck_participant() {
    let backend = MockBackend::connected(&[(P1, 11), (P2, 12)]);
    let coord = make_coordinator(Arc::new(MemLogStore::new()), backend.clone(), fast_config());
    let txn = coord.begin(&[P1, P2], false).unwrap();
    let xid = txn.xid().clone();
    backend
        .recover_lists
        .lock()
        .insert(P1, Ok(vec![xid.as_str().to_string()]));

    coord.commit(&xid).unwrap();
    ack_all(&coord, &xid, &backend.sent_since(0));
    // Prepare fails on P2, so the rollback does not come from End.
    coord.on_connection_ok(&xid, P1).unwrap();
    coord.on_connection_error(&xid, P2, 1105, "disk error").unwrap();
    assert_eq!(txn.stage(), TxStage::Rollback);

    coord.on_connection_error(&xid, P1, ER_XAER_NOTA, "XAER_NOTA").unwrap();
    assert_eq!(txn.sub_state(P1), Some(XaSubState::RollbackFailed));
    let before = backend.sent_len();
    coord.on_connection_ok(&xid, P2).unwrap();

    // RollbackFail → Rollback again over a fresh connection, P1 only.
    let retry = backend.sent_since(before);
    assert_eq!(retry.len(), 1);
    assert_eq!(retry[0].0, P1);
    assert!(retry[0].1.starts_with("XA ROLLBACK "));
    assert_eq!(backend.fresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(txn.snapshot().retries, 1);

    backend.recover_lists.lock().clear();
    coord.on_connection_ok(&xid, P1).unwrap();
    assert_eq!(txn.outcome(), Some(XaOutcome::RolledBack));
}

// ═══════════════════════════════════════════════════════════════════════════
// X4 / X5: durability before action
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_stage_log_fault_prevents_prepare_commands() {
    // begin + End succeed, the Prepare stage write fails.
    let store = Arc::new(RecordingStore {
        fail_stage_after: Some(2),
        ..RecordingStore::default()
    });
    let backend = MockBackend::connected(&[(P1, 11), (P2, 12)]);
    let coord = make_coordinator(store, backend.clone(), fast_config());
    let txn = coord.begin(&[P1, P2], false).unwrap();
    let xid = txn.xid().clone();

    coord.commit(&xid).unwrap();
    coord.on_connection_ok(&xid, P1).unwrap();
    let err = coord.on_connection_ok(&xid, P2).unwrap_err();
    assert!(matches!(err, ShardgateError::Xa(XaError::LogFailure { .. })), "{err}");

    assert_eq!(backend.count("PREPARE"), 0);
    assert_eq!(backend.sent_len(), 2);
    assert!(matches!(txn.outcome(), Some(XaOutcome::LogFailure(_))));
    assert_eq!(txn.stage(), TxStage::End);

    // Nothing more is accepted for this xid.
    assert!(coord.on_connection_ok(&xid, P1).is_err());
    assert!(coord.rollback(&xid).is_err());
    assert_eq!(backend.sent_len(), 2);
    assert_eq!(coord.stats().log_failures, 1);
}

#[test]
fn test_participant_log_fault_abandons_transaction() {
    let store = Arc::new(RecordingStore {
        fail_participant_puts: true,
        ..RecordingStore::default()
    });
    let backend = MockBackend::connected(&[(P1, 11), (P2, 12)]);
    let coord = make_coordinator(store, backend.clone(), fast_config());
    let txn = coord.begin(&[P1, P2], false).unwrap();
    let xid = txn.xid().clone();

    coord.commit(&xid).unwrap();
    assert!(coord.on_connection_ok(&xid, P1).is_err());
    assert!(coord.on_connection_ok(&xid, P2).is_err());
    assert_eq!(txn.sub_state(P1), Some(XaSubState::Started));
    assert_eq!(backend.count("PREPARE") + backend.count("ROLLBACK"), 0);
}

// ═══════════════════════════════════════════════════════════════════════════
// X6: monotonicity under mixed replies
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_mixed_replies_reach_a_settled_outcome_legally() {
    for seed in 0u64..64 {
        let backend = MockBackend::connected(&[(P1, 11), (P2, 12)]);
        let config = XaConfig {
            rollback_retry_limit: 2,
            commit_retry_limit: 2,
            purge_settled: false,
            ..fast_config()
        };
        let coord = make_coordinator(Arc::new(MemLogStore::new()), backend.clone(), config);
        let txn = coord.begin(&[P1, P2], false).unwrap();
        let xid = txn.xid().clone();
        coord.commit(&xid).unwrap();

        let mut bits = seed;
        let mut from = 0;
        let mut prev = txn.stage();
        for _ in 0..100 {
            if txn.outcome().is_some() {
                break;
            }
            let cmds = backend.sent_since(from);
            from = backend.sent_len();
            assert!(!cmds.is_empty(), "seed {seed}: stalled in {}", txn.stage());
            for (p, _) in cmds {
                let fail = bits & 1 == 1;
                bits >>= 1;
                if fail {
                    coord.on_connection_error(&xid, p, 1105, "boom").unwrap();
                } else {
                    coord.on_connection_ok(&xid, p).unwrap();
                }
                let snap = txn.snapshot();
                if snap.running == Some(StageKind::Commit) {
                    assert!(
                        snap.participants.iter().all(|s| s.sub_state.progress() >= XaSubState::Prepared.progress()),
                        "seed {seed}: commit entered before every branch prepared"
                    );
                }
                let stage = snap.stage;
                assert!(
                    stage == prev || prev.can_advance_to(stage) || stage.can_advance_to(prev),
                    "seed {seed}: {prev} -> {stage}"
                );
                prev = stage;
            }
        }
        let outcome = txn.outcome().expect("settled");
        if seed == 0 {
            assert_eq!(outcome, XaOutcome::Committed);
        }
        assert!(outcome.is_final() || outcome.is_pending(), "seed {seed}: {outcome}");
        if outcome == XaOutcome::Committed {
            assert_eq!(backend.count("ROLLBACK"), 0, "seed {seed}");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// X7: explicit transaction frozen by End
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_explicit_end_failure_freezes_until_client_rollback() {
    let backend = MockBackend::connected(&[(P1, 11), (P2, 12)]);
    let config = XaConfig {
        purge_settled: false,
        ..fast_config()
    };
    let coord = make_coordinator(Arc::new(MemLogStore::new()), backend.clone(), config);
    let txn = coord.begin(&[P1, P2], true).unwrap();
    let xid = txn.xid().clone();

    coord.commit(&xid).unwrap();
    coord.on_connection_ok(&xid, P1).unwrap();
    coord
        .on_connection_error(&xid, P2, 1399, "XAER_RMFAIL: in an active transaction")
        .unwrap();

    assert!(matches!(txn.outcome(), Some(XaOutcome::Frozen { code: 1399, .. })));
    assert_eq!(backend.count("ROLLBACK"), 0);
    let err = coord.commit(&xid).unwrap_err();
    assert_eq!(err.mysql_errno(), 1399);

    coord.rollback(&xid).unwrap();
    assert_eq!(backend.count("ROLLBACK"), 2);
    ack_all(&coord, &xid, &backend.sent_since(2));
    assert_eq!(txn.outcome(), Some(XaOutcome::RolledBack));
    assert_eq!(coord.stats().frozen, 1);
    assert_eq!(coord.log().get(&xid).unwrap().stage, TxStage::RolledBack);

    assert!(coord.forget(&xid).unwrap());
    assert!(coord.transaction(&xid).is_none());
    assert!(coord.log().get(&xid).is_none());
}

// ═══════════════════════════════════════════════════════════════════════════
// X8: zombie connection, parked rollback, sweeper
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_zombie_reconnect_parks_then_sweeper_resolves() {
    let backend = MockBackend::connected(&[(P1, 11), (P2, 12)]);
    backend.zombie.lock().insert(P2);
    let config = XaConfig {
        rollback_retry_limit: 1,
        ..fast_config()
    };
    let coord = make_coordinator(Arc::new(MemLogStore::new()), backend.clone(), config);
    let txn = coord.begin(&[P1, P2], false).unwrap();
    let xid = txn.xid().clone();

    coord.commit(&xid).unwrap();
    ack_all(&coord, &xid, &backend.sent_since(0));
    coord.on_connection_ok(&xid, P1).unwrap();
    coord.on_connection_close(&xid, P2).unwrap();
    assert_eq!(txn.sub_state(P2), Some(XaSubState::PrepareUnconnected));

    // Rollback: P1 over its live connection; P2's replacement lands on
    // the old thread twice (first round plus one retry) and is rejected.
    assert_eq!(backend.count("ROLLBACK"), 1);
    coord.on_connection_ok(&xid, P1).unwrap();
    assert_eq!(txn.outcome(), Some(XaOutcome::RollbackPending));
    assert_eq!(txn.sub_state(P2), Some(XaSubState::RollbackFailed));
    assert_eq!(backend.fresh_calls.load(Ordering::SeqCst), 2);
    assert_eq!(backend.closed.lock().as_slice(), &[P2, P2]);
    assert_eq!(coord.pending(), vec![xid.clone()]);
    assert_eq!(coord.log().get(&xid).unwrap().stage, TxStage::RollbackFail);

    backend.zombie.lock().clear();
    let sweeper = RecoverySweeper::new(coord.clone(), &RecoveryConfig::default());
    assert_eq!(sweeper.sweep(), 1);
    let cmds = backend.sent_since(backend.sent_len() - 1);
    assert_eq!(cmds[0].0, P2);
    coord.on_connection_ok(&xid, P2).unwrap();
    assert_eq!(txn.outcome(), Some(XaOutcome::RolledBack));

    sweeper.sweep();
    let m = sweeper.metrics();
    assert_eq!(m.sweeps_run, 2);
    assert_eq!(m.redriven, 1);
    assert_eq!(m.resolved, 1);
    assert_eq!(m.currently_pending, 0);
}

#[test]
fn test_sweeper_gives_up_after_max_attempts() {
    let backend = MockBackend::connected(&[(P1, 11)]);
    backend.zombie.lock().insert(P1);
    let config = XaConfig {
        rollback_retry_limit: 0,
        ..fast_config()
    };
    let coord = make_coordinator(Arc::new(MemLogStore::new()), backend.clone(), config);
    let txn = coord.begin(&[P1], false).unwrap();
    let xid = txn.xid().clone();

    coord.commit(&xid).unwrap();
    coord.on_connection_ok(&xid, P1).unwrap();
    coord.on_connection_close(&xid, P1).unwrap();
    assert_eq!(txn.outcome(), Some(XaOutcome::RollbackPending));

    let sweeper = RecoverySweeper::new(
        coord.clone(),
        &RecoveryConfig {
            sweep_interval_ms: 10,
            max_sweep_attempts: 2,
        },
    );
    assert_eq!(sweeper.sweep(), 1);
    assert_eq!(sweeper.sweep(), 1);
    assert_eq!(sweeper.sweep(), 0);
    assert_eq!(sweeper.metrics().abandoned, 1);
    assert_eq!(txn.outcome(), Some(XaOutcome::RollbackPending));
}

#[test]
fn test_sweeper_thread_stops_on_handle_drop() {
    let backend = MockBackend::connected(&[]);
    let coord = make_coordinator(Arc::new(MemLogStore::new()), backend, fast_config());
    let sweeper = RecoverySweeper::new(
        coord,
        &RecoveryConfig {
            sweep_interval_ms: 5,
            max_sweep_attempts: 1,
        },
    );
    let handle = sweeper.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    drop(handle);
    let runs = sweeper.metrics().sweeps_run;
    assert!(runs >= 1);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(sweeper.metrics().sweeps_run, runs);
}

// ═══════════════════════════════════════════════════════════════════════════
// X9: crash recovery from the file log
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_recovery_replays_commit_and_rolls_back_unprepared() {
    let dir = tempfile::tempdir().unwrap();
    let open_store =
        || -> Arc<dyn LogStore> { Arc::new(FileLogStore::open_dir(dir.path(), SyncMode::None, 64).unwrap()) };

    let (committing, preparing) = {
        let backend = MockBackend::connected(&[(P1, 11), (P2, 12)]);
        let coord = make_coordinator(open_store(), backend.clone(), fast_config());

        let a = coord.begin(&[P1, P2], false).unwrap().xid().clone();
        coord.commit(&a).unwrap();
        ack_all(&coord, &a, &backend.sent_since(0));
        ack_all(&coord, &a, &backend.sent_since(2));
        assert_eq!(coord.log().get(&a).unwrap().stage, TxStage::Commit);

        let b = coord.begin(&[P1, P2], false).unwrap().xid().clone();
        let from = backend.sent_len();
        coord.commit(&b).unwrap();
        ack_all(&coord, &b, &backend.sent_since(from));
        assert_eq!(coord.log().get(&b).unwrap().stage, TxStage::Prepare);
        (a, b)
        // coordinator dropped here: simulated crash
    };

    let backend = MockBackend::connected(&[]);
    let coord = make_coordinator(open_store(), backend.clone(), fast_config());
    let report = coord.recover().unwrap();
    assert_eq!(report.committing, vec![committing.clone()]);
    assert_eq!(report.rolling_back, vec![preparing.clone()]);
    assert!(report.failed.is_empty());
    let a = coord.transaction(&committing).unwrap();
    let b = coord.transaction(&preparing).unwrap();

    assert_eq!(backend.fresh_calls.load(Ordering::SeqCst), 4);
    assert_eq!(backend.count("COMMIT"), 2);
    assert_eq!(backend.count("ROLLBACK"), 2);
    for (p, cmd) in backend.sent_since(0) {
        if cmd.starts_with("XA COMMIT") {
            coord.on_connection_ok(&committing, p).unwrap();
        } else {
            coord.on_connection_ok(&preparing, p).unwrap();
        }
    }
    assert_eq!(a.outcome(), Some(XaOutcome::Committed));
    assert_eq!(b.outcome(), Some(XaOutcome::RolledBack));
    assert!(coord.log().is_empty());
    assert!(coord.transaction(&committing).is_none());

    // A second recovery pass finds nothing left to do.
    assert_eq!(coord.recover().unwrap().total(), 0);
}

// ═══════════════════════════════════════════════════════════════════════════
// X10 / X11
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_unknown_xid_on_commit_verified_absent_is_committed() {
    let backend = MockBackend::connected(&[(P1, 11), (P2, 12)]);
    let coord = make_coordinator(Arc::new(MemLogStore::new()), backend.clone(), fast_config());
    let txn = coord.begin(&[P1, P2], false).unwrap();
    let xid = txn.xid().clone();

    coord.commit(&xid).unwrap();
    ack_all(&coord, &xid, &backend.sent_since(0));
    ack_all(&coord, &xid, &backend.sent_since(2));
    coord.on_connection_ok(&xid, P1).unwrap();
    coord.on_connection_error(&xid, P2, ER_XAER_NOTA, "XAER_NOTA").unwrap();

    assert_eq!(backend.recover_calls.load(Ordering::SeqCst), 1);
    assert_eq!(txn.outcome(), Some(XaOutcome::Committed));
}

#[test]
fn test_unsendable_command_counts_as_connect_error() {
    let backend = MockBackend::connected(&[(P1, 11), (P2, 12)]);
    backend.fail_exec.lock().insert(P2);
    let coord = make_coordinator(Arc::new(MemLogStore::new()), backend.clone(), fast_config());
    let txn = coord.begin(&[P1, P2], false).unwrap();
    let xid = txn.xid().clone();

    coord.commit(&xid).unwrap();
    assert_eq!(txn.sub_state(P2), Some(XaSubState::ConnQuit));
    coord.on_connection_ok(&xid, P1).unwrap();

    // Only P1 still has a branch to roll back.
    let rollbacks = backend.sent_since(1);
    assert_eq!(rollbacks.len(), 1);
    assert_eq!(rollbacks[0].0, P1);
    coord.on_connection_ok(&xid, P1).unwrap();
    assert_eq!(txn.outcome(), Some(XaOutcome::RolledBack));
}

// ═══════════════════════════════════════════════════════════════════════════
// X12: validation
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_begin_and_callbacks_validate_arguments() {
    let backend = MockBackend::connected(&[(P1, 11)]);
    let coord = make_coordinator(Arc::new(MemLogStore::new()), backend.clone(), fast_config());

    assert!(coord.begin(&[], false).is_err());
    assert!(coord.begin(&[P1, P1], false).is_err());

    let xid = Xid::new("fixed.1");
    coord.begin_with_xid(xid.clone(), &[P1], false).unwrap();
    assert!(coord.begin_with_xid(xid.clone(), &[P1], false).is_err());

    let unknown = Xid::new("nope");
    let err = coord.on_connection_ok(&unknown, P1).unwrap_err();
    assert!(matches!(err, ShardgateError::Xa(XaError::UnknownTransaction(_))));

    // A reply with nothing in flight changes nothing.
    coord.on_connection_ok(&xid, P1).unwrap();
    assert_eq!(coord.transaction(&xid).unwrap().stage(), TxStage::Initialize);

    coord.rollback(&xid).unwrap();
    assert!(coord.commit(&xid).is_err(), "commit after rollback started");
    assert!(coord.forget(&xid).is_err(), "forget before settling");
}

// ═══════════════════════════════════════════════════════════════════════════
// X13 / X14: sweeper bookkeeping
// ═══════════════════════════════════════════════════════════════════════════

/// One participant whose replacement connection is a zombie, so the
/// rollback parks without sending anything.
fn parked_rollback(store: Arc<dyn LogStore>) -> (Arc<MockBackend>, Arc<XaCoordinator>, Xid) {
    let backend = MockBackend::connected(&[(P1, 11)]);
    backend.zombie.lock().insert(P1);
    let config = XaConfig {
        rollback_retry_limit: 0,
        ..fast_config()
    };
    let coord = make_coordinator(store, backend.clone(), config);
    let xid = coord.begin(&[P1], false).unwrap().xid().clone();
    coord.commit(&xid).unwrap();
    coord.on_connection_ok(&xid, P1).unwrap();
    coord.on_connection_close(&xid, P1).unwrap();
    assert_eq!(coord.pending(), vec![xid.clone()]);
    (backend, coord, xid)
}

#[test]
fn test_sweep_keeps_counter_while_redrive_in_flight() {
    let (backend, coord, xid) = parked_rollback(Arc::new(MemLogStore::new()));
    let txn = coord.transaction(&xid).unwrap();
    assert_eq!(backend.count("ROLLBACK"), 0);
    backend.zombie.lock().clear();

    let sweeper = RecoverySweeper::new(
        coord.clone(),
        &RecoveryConfig {
            sweep_interval_ms: 10,
            max_sweep_attempts: 1,
        },
    );
    assert_eq!(sweeper.sweep(), 1);
    assert_eq!(backend.count("ROLLBACK"), 1);
    assert_eq!(txn.outcome(), None, "rollback awaiting its reply");

    // Not parked, not settled: nothing to count as resolved.
    assert_eq!(sweeper.sweep(), 0);
    assert_eq!(sweeper.metrics().resolved, 0);
    assert_eq!(sweeper.metrics().abandoned, 1);

    // The re-driven rollback loses its connection and parks again.
    coord.on_connection_close(&xid, P1).unwrap();
    assert_eq!(txn.outcome(), Some(XaOutcome::RollbackPending));
    assert_eq!(sweeper.sweep(), 0, "attempt budget already spent");

    let m = sweeper.metrics();
    assert_eq!(m.redriven, 1);
    assert_eq!(m.resolved, 0);
    assert_eq!(m.abandoned, 1);
    assert_eq!(m.currently_pending, 1);
    assert_eq!(backend.count("ROLLBACK"), 1);
}

#[test]
fn test_sweep_abandons_redrive_refused_by_log() {
    let store = Arc::new(RecordingStore::default());
    let (backend, coord, xid) = parked_rollback(store.clone());
    backend.zombie.lock().clear();
    store.refuse_all.store(true, Ordering::SeqCst);

    let sweeper = RecoverySweeper::new(
        coord.clone(),
        &RecoveryConfig {
            sweep_interval_ms: 10,
            max_sweep_attempts: 5,
        },
    );
    assert_eq!(sweeper.sweep(), 0);
    let m = sweeper.metrics();
    assert_eq!(m.failures, 1);
    assert_eq!(m.abandoned, 1, "log failures are not retried");
    let txn = coord.transaction(&xid).unwrap();
    assert!(matches!(txn.outcome(), Some(XaOutcome::LogFailure(_))));

    assert_eq!(sweeper.sweep(), 0);
    let m = sweeper.metrics();
    assert_eq!(m.failures, 1);
    assert_eq!(m.resolved, 0);
    assert_eq!(m.abandoned, 1);
    assert_eq!(backend.count("ROLLBACK"), 0);
}

// ═══════════════════════════════════════════════════════════════════════════
// X15: settled transactions are purged
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_settled_transactions_do_not_accumulate() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileLogStore::open_dir(dir.path(), SyncMode::None, 16).unwrap());
    let backend = MockBackend::connected(&[(P1, 11), (P2, 12)]);
    let coord = make_coordinator(store.clone(), backend.clone(), fast_config());

    for _ in 0..100 {
        let xid = coord.begin(&[P1, P2], false).unwrap().xid().clone();
        let mut from = backend.sent_len();
        coord.commit(&xid).unwrap();
        // End, Prepare, Commit
        for _ in 0..3 {
            let cmds = backend.sent_since(from);
            from = backend.sent_len();
            ack_all(&coord, &xid, &cmds);
        }
        assert!(coord.transaction(&xid).is_none());
    }

    let stats = coord.stats();
    assert_eq!(stats.committed, 100);
    assert_eq!(stats.purged, 100);
    assert_eq!(stats.active, 0);
    assert!(coord.log().is_empty());
    assert_eq!(store.stats().live_keys, 0);
    assert!(store.stats().compactions > 0);
    drop(coord);
    drop(store);

    let reopened = FileLogStore::open_dir(dir.path(), SyncMode::None, 16).unwrap();
    assert_eq!(reopened.stats().live_keys, 0);
}

#[test]
fn test_recover_purges_records_settled_before_restart() {
    let dir = tempfile::tempdir().unwrap();
    let open_store =
        || -> Arc<dyn LogStore> { Arc::new(FileLogStore::open_dir(dir.path(), SyncMode::None, 64).unwrap()) };

    let xid = {
        let backend = MockBackend::connected(&[(P1, 11)]);
        let config = XaConfig {
            purge_settled: false,
            ..fast_config()
        };
        let coord = make_coordinator(open_store(), backend.clone(), config);
        let xid = coord.begin(&[P1], false).unwrap().xid().clone();
        coord.rollback(&xid).unwrap();
        // End, then Rollback
        ack_all(&coord, &xid, &backend.sent_since(0));
        ack_all(&coord, &xid, &backend.sent_since(1));
        assert_eq!(coord.log().get(&xid).unwrap().stage, TxStage::RolledBack);
        xid
    };

    let backend = MockBackend::connected(&[]);
    let coord = make_coordinator(open_store(), backend.clone(), fast_config());
    let report = coord.recover().unwrap();
    assert_eq!(report.purged, 1);
    assert_eq!(report.total(), 0);
    assert!(coord.log().get(&xid).is_none());
    assert_eq!(backend.sent_len(), 0);
}
