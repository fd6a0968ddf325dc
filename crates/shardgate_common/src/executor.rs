//! Worker capability injected into the merge and XA coordinators.
//!
//! Coordinators never spawn threads directly. Production code passes
//! [`ThreadPerTask`]; tests pass [`InlinePool`] to run every job on the
//! calling thread and get a deterministic interleaving.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ShardgateError, ShardgateResult};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait WorkerPool: Send + Sync {
    /// Run `job` on some worker. `name` labels the worker thread.
    fn execute(&self, name: &str, job: Job) -> ShardgateResult<()>;
}

/// Spawns one named OS thread per job.
#[derive(Debug, Default)]
pub struct ThreadPerTask {
    spawned: AtomicU64,
}

impl ThreadPerTask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }
}

impl WorkerPool for ThreadPerTask {
    fn execute(&self, name: &str, job: Job) -> ShardgateResult<()> {
        std::thread::Builder::new()
            .name(format!("shardgate-{name}"))
            .spawn(job)
            .map_err(|e| ShardgateError::transient(format!("spawn {name}: {e}"), 10))?;
        self.spawned.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Runs each job to completion before `execute` returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlinePool;

impl WorkerPool for InlinePool {
    fn execute(&self, _name: &str, job: Job) -> ShardgateResult<()> {
        job();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_inline_runs_before_return() {
        let (tx, rx) = mpsc::channel();
        InlinePool.execute("t", Box::new(move || tx.send(7).unwrap())).unwrap();
        assert_eq!(rx.try_recv().unwrap(), 7);
    }

    #[test]
    fn test_thread_per_task_names_thread() {
        let pool = ThreadPerTask::new();
        let (tx, rx) = mpsc::channel();
        pool.execute(
            "merge-1",
            Box::new(move || {
                let name = std::thread::current().name().map(str::to_string);
                tx.send(name).unwrap();
            }),
        )
        .unwrap();
        let name = rx.recv().unwrap();
        assert_eq!(name.as_deref(), Some("shardgate-merge-1"));
        assert_eq!(pool.spawned(), 1);
    }
}
