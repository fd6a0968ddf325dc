//! Startup recovery report and the background sweeper for parked
//! transactions.
//!
//! A transaction whose commit or rollback retries run out is parked as
//! `CommitPending`/`RollbackPending`: its durable record stays non-terminal
//! and the backend may still hold locks for it. The sweeper re-drives every
//! parked transaction on an interval until it settles, giving up (and
//! alerting) after `max_sweep_attempts`.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use shardgate_common::config::RecoveryConfig;
use shardgate_common::shutdown::ShutdownSignal;
use shardgate_common::types::Xid;

use crate::coordinator::XaCoordinator;

/// What [`XaCoordinator::recover`] found in the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Re-driven through Commit.
    pub committing: Vec<Xid>,
    /// Re-driven through Rollback.
    pub rolling_back: Vec<Xid>,
    /// Already live in the arena.
    pub skipped: usize,
    /// Could not be driven (log failure).
    pub failed: Vec<Xid>,
    /// Terminal records left over from before the restart, now purged.
    pub purged: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.committing.len() + self.rolling_back.len() + self.failed.len()
    }
}

/// Metrics for the recovery sweeper.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweeperMetrics {
    pub sweeps_run: u64,
    /// Parked transactions handed back to the coordinator.
    pub redriven: u64,
    /// Previously parked transactions found settled.
    pub resolved: u64,
    pub failures: u64,
    /// Transactions past `max_sweep_attempts`, left for an operator.
    pub abandoned: usize,
    pub currently_pending: usize,
    pub last_sweep_us: u64,
}

pub struct RecoverySweeper {
    coordinator: Arc<XaCoordinator>,
    interval: Duration,
    max_attempts: u32,
    /// Sweeps spent per parked xid.
    attempts: Mutex<HashMap<Xid, u32>>,
    metrics: RwLock<SweeperMetrics>,
}

impl RecoverySweeper {
    pub fn new(coordinator: Arc<XaCoordinator>, config: &RecoveryConfig) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            interval: Duration::from_millis(config.sweep_interval_ms.max(1)),
            max_attempts: config.max_sweep_attempts,
            attempts: Mutex::new(HashMap::new()),
            metrics: RwLock::new(SweeperMetrics::default()),
        })
    }

    /// Run one sweep. Returns the number of transactions re-driven.
    pub fn sweep(&self) -> usize {
        let start = Instant::now();
        let pending = self.coordinator.pending();
        let mut redriven = 0;
        let mut failures = 0;

        let mut attempts = self.attempts.lock();
        // A tracked xid that is no longer parked is either settled, gone
        // (forgotten or purged) or still being re-driven. Only the first two
        // release its counter.
        let before = attempts.len();
        attempts.retain(|xid, _| {
            if pending.contains(xid) {
                return true;
            }
            match self.coordinator.transaction(xid) {
                None => false,
                Some(txn) => !txn.outcome().is_some_and(|o| o.is_final()),
            }
        });
        let resolved = (before - attempts.len()) as u64;

        for xid in &pending {
            let tried = attempts.entry(xid.clone()).or_insert(0);
            if *tried >= self.max_attempts {
                continue;
            }
            *tried += 1;
            match self.coordinator.redrive(xid) {
                Ok(true) => {
                    redriven += 1;
                    tracing::info!(xid = %xid, attempt = *tried, "parked transaction re-driven");
                }
                Ok(false) => {}
                Err(e) if e.is_retryable() || e.is_transient() => {
                    failures += 1;
                    tracing::warn!(xid = %xid, attempt = *tried, error = %e, "re-drive failed, will retry");
                }
                Err(e) => {
                    failures += 1;
                    *tried = self.max_attempts;
                    tracing::error!(xid = %xid, error = %e, "re-drive failed permanently");
                }
            }
            if *tried >= self.max_attempts {
                tracing::error!(
                    xid = %xid,
                    attempts = *tried,
                    "parked transaction exceeded max sweep attempts, manual intervention required"
                );
            }
        }
        let abandoned = attempts.values().filter(|&&n| n >= self.max_attempts).count();
        drop(attempts);

        let still_pending = self.coordinator.pending().len();
        {
            let mut m = self.metrics.write();
            m.sweeps_run += 1;
            m.redriven += redriven as u64;
            m.resolved += resolved;
            m.failures += failures;
            m.abandoned = abandoned;
            m.currently_pending = still_pending;
            m.last_sweep_us = start.elapsed().as_micros() as u64;
        }
        shardgate_observability::record_recovery_sweep(resolved, still_pending);
        redriven
    }

    pub fn metrics(&self) -> SweeperMetrics {
        self.metrics.read().clone()
    }

    /// Start the sweep loop on a named thread. It stops when the
    /// coordinator shuts down or the handle is stopped or dropped.
    pub fn start(self: &Arc<Self>) -> std::io::Result<SweeperHandle> {
        let sweeper = Arc::clone(self);
        let stop = ShutdownSignal::new();
        let coordinator_stop = self.coordinator.shutdown_signal();
        let thread_stop = stop.clone();
        let interval = self.interval;
        let handle = std::thread::Builder::new()
            .name("shardgate-recovery-sweeper".into())
            .spawn(move || {
                tracing::info!(interval_ms = interval.as_millis() as u64, "recovery sweeper started");
                while !thread_stop.wait_timeout(interval) && !coordinator_stop.is_shutdown() {
                    sweeper.sweep();
                }
                tracing::info!("recovery sweeper stopped");
            })?;
        Ok(SweeperHandle {
            stop,
            handle: Some(handle),
        })
    }
}

pub struct SweeperHandle {
    stop: ShutdownSignal,
    handle: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn stop(&mut self) {
        self.stop.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
