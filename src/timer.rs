use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapWeak;

use crate::bucket::{Bucket, DeleteOutcome};
use crate::cancel::CancelToken;
use crate::job::{Job, Schedule};
use crate::list::NONE;

/// What a timer does when it expires.
///
/// The payload is plain data; the firing logic lives in the wheel. A
/// recurring payload deliberately does not capture the timer, so the
/// only references to a timer are its bucket entry and its handle.
pub(crate) enum Payload {
    /// A schedule whose first `next` returned `None`. Never fires.
    Inert,
    OneShot {
        job: Arc<dyn Job>,
    },
    Recurring {
        schedule: Arc<dyn Schedule>,
        job: Arc<dyn Job>,
    },
}

/// A single pending expiration.
///
/// Owned by whichever bucket currently lists it; the handle and the
/// firing thread hold the other references. The bucket back-pointer is
/// weak: buckets live as long as their wheel, and a timer must not keep
/// a dead wheel's ring alive.
pub(crate) struct Timer {
    /// Expiry time in Unix milliseconds.
    expiration: AtomicI64,

    payload: Payload,

    /// The bucket whose list currently holds this timer.
    ///
    /// Updated and read concurrently through `TimerHandle::close` and
    /// `Bucket::flush`.
    bucket: ArcSwapWeak<Bucket>,

    /// Key of this timer's entry in the bucket's list, [`NONE`] when
    /// detached. Only meaningful while the bucket's structural lock or
    /// flush lock is held.
    node: AtomicUsize,

    token: CancelToken,
}

impl Timer {
    pub fn new(expiration: i64, payload: Payload, token: CancelToken) -> Self {
        Self {
            expiration: AtomicI64::new(expiration),
            payload,
            bucket: ArcSwapWeak::new(Weak::new()),
            node: AtomicUsize::new(NONE),
            token,
        }
    }

    pub fn inert(token: CancelToken) -> Self {
        Self::new(0, Payload::Inert, token)
    }

    #[inline(always)]
    pub fn expiration(&self) -> i64 {
        self.expiration.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set_expiration(&self, expiration: i64) {
        self.expiration.store(expiration, Ordering::Release);
    }

    pub fn bucket(&self) -> Option<Arc<Bucket>> {
        self.bucket.load().upgrade()
    }

    pub fn set_bucket(&self, bucket: Option<&Arc<Bucket>>) {
        match bucket {
            Some(b) => self.bucket.store(Arc::downgrade(b)),
            None => self.bucket.store(Weak::new()),
        }
    }

    pub fn bucket_is(&self, bucket: &Arc<Bucket>) -> bool {
        self.bucket()
            .is_some_and(|current| Arc::ptr_eq(&current, bucket))
    }

    #[inline(always)]
    pub fn node(&self) -> usize {
        self.node.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set_node(&self, key: usize) {
        self.node.store(key, Ordering::Release);
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

/// Cancellable reference to a submitted timer.
///
/// Returned by every scheduling call. Dropping the handle does not
/// cancel the timer; only [`close`](TimerHandle::close) does. Clones
/// refer to the same timer.
#[derive(Clone)]
pub struct TimerHandle {
    pub(crate) timer: Arc<Timer>,
}

impl TimerHandle {
    pub(crate) fn new(timer: Arc<Timer>) -> Self {
        Self { timer }
    }

    /// Prevent the timer from firing, then signal its cancel token.
    ///
    /// Idempotent. If the job has already started on its own thread,
    /// `close` does not wait for it; a caller that needs to know the
    /// job finished must coordinate with the job itself (the token is
    /// visible from both sides).
    pub fn close(&self) {
        // A delete may fail when the wheel's flush has moved the timer
        // to another bucket in the meantime. Re-load and retry until
        // the bucket is gone or the delete lands.
        while let Some(bucket) = self.timer.bucket() {
            if matches!(Bucket::delete(&bucket, &self.timer), DeleteOutcome::Deleted) {
                break;
            }
        }
        self.timer.token.cancel();
    }

    /// The cancellation token shared with the timer's job.
    pub fn token(&self) -> &CancelToken {
        &self.timer.token
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("expiration", &self.timer.expiration())
            .finish()
    }
}
