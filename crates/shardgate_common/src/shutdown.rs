//! Cooperative stop flag for background loops (recovery sweeper, retry timers).
//!
//! `wait_timeout` replaces a plain `thread::sleep` so that a stop request
//! wakes the sleeper at once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every waiter.
    pub fn shutdown(&self) {
        let mut stopped = self.inner.stopped.lock();
        *stopped = true;
        self.inner.cv.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.stopped.lock()
    }

    /// Block for up to `duration`. Returns `true` if shutdown was requested,
    /// in which case the caller should exit its loop.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stopped = self.inner.stopped.lock();
        // The flag lives under the same mutex as the condvar, so a shutdown
        // between the check and the wait cannot be missed.
        while !*stopped {
            if self.inner.cv.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}
