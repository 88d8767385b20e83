use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct Shared {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

/// One-shot cancellation signal shared between a timer handle and its
/// job.
///
/// [`TimerHandle::close`](crate::TimerHandle::close) signals the token
/// after detaching the timer; a job that wants to observe cancellation
/// polls [`is_cancelled`](CancelToken::is_cancelled) or blocks on
/// [`wait`](CancelToken::wait). Jobs that never look at the token are
/// never preempted.
///
/// Clones share the same signal.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        let _guard = self.shared.lock.lock();
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Block until the token is cancelled.
    pub fn wait(&self) {
        let mut guard = self.shared.lock.lock();
        while !self.shared.cancelled.load(Ordering::Acquire) {
            self.shared.cond.wait(&mut guard);
        }
    }

    /// Block until cancelled or `timeout` elapses. Returns `true` if
    /// the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.shared.lock.lock();
        while !self.shared.cancelled.load(Ordering::Acquire) {
            if self.shared.cond.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.shared.cancelled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
