use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

use crate::list::{List, NONE};
use crate::timer::Timer;

/// Result of a cancellation attempt against one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeleteOutcome {
    /// The timer is no longer in this wheel (removed now, or already
    /// popped by a flush and not re-enqueued).
    Deleted,
    /// The timer moved to a different bucket while we were acquiring
    /// the locks; the caller must re-load the back-pointer and retry.
    Retry,
}

/// Holds every timer belonging to a single tick slot.
///
/// Two mutexes, always acquired flush-lock first. The structural lock
/// guards the list itself and is held only for pointer surgery; the
/// flush lock additionally covers the re-submit walk so cancellation
/// cannot interleave with re-bucketing.
pub(crate) struct Bucket {
    /// Absolute due time in Unix ms, `-1` while not queued.
    expiration: AtomicI64,
    timers: Mutex<List<Arc<Timer>>>,
    flush_lock: Mutex<()>,
}

impl Bucket {
    pub fn new() -> Self {
        Self {
            expiration: AtomicI64::new(-1),
            timers: Mutex::new(List::new()),
            flush_lock: Mutex::new(()),
        }
    }

    #[inline(always)]
    pub fn expiration(&self) -> i64 {
        self.expiration.load(Ordering::Acquire)
    }

    /// Set the due time, returning `true` iff the value changed.
    ///
    /// The wheel offers the bucket to the delay queue only on a change,
    /// which bounds enqueueing to once per bucket cycle: after a flush
    /// resets the expiration to `-1`, the first insert of the next
    /// cycle flips it and wins the offer, every later insert in the
    /// same cycle passes the same value and loses.
    #[inline(always)]
    pub fn set_expiration(&self, expiration: i64) -> bool {
        self.expiration.swap(expiration, Ordering::AcqRel) != expiration
    }

    /// Append `timer` to the list and wire up its back-references.
    /// Only called by the wheel's `add`.
    pub fn insert(this: &Arc<Bucket>, timer: &Arc<Timer>) {
        let mut timers = this.timers.lock();
        let key = timers.insert(timer.clone());
        timer.set_bucket(Some(this));
        timer.set_node(key);
    }

    /// Remove `timer` from the wheel. Only called by the handle's
    /// `close`.
    pub fn delete(this: &Arc<Bucket>, timer: &Arc<Timer>) -> DeleteOutcome {
        let _flush = this.flush_lock.lock();
        let mut timers = this.timers.lock();

        if !timer.bucket_is(this) {
            // A flush re-submitted the timer into some other bucket
            // between the caller's back-pointer load and our lock
            // acquisition. The caller retries against the new bucket.
            return DeleteOutcome::Retry;
        }

        let key = timer.node();
        if key == NONE {
            // Popped by a flush and not re-enqueued (a one-shot about
            // to fire, or an exhausted schedule). Nothing left to
            // unlink.
            return DeleteOutcome::Deleted;
        }

        let _ = timers.remove(key);
        timer.set_bucket(None);
        timer.set_node(NONE);
        DeleteOutcome::Deleted
    }

    /// Detach the whole list and hand every timer to `submit`.
    ///
    /// The structural lock is dropped before the walk so inserts into
    /// the fresh list proceed in parallel; the flush lock stays held so
    /// a concurrent `delete` observes either the old state or the fully
    /// re-submitted one, never the middle.
    pub fn flush(&self, mut submit: impl FnMut(Arc<Timer>)) {
        let _flush = self.flush_lock.lock();

        let detached = {
            let mut timers = self.timers.lock();
            self.set_expiration(-1);
            timers.detach()
        };

        for timer in detached.drain() {
            // Clear the node first: a delete arriving after the walk
            // finds either a repositioned timer or the already-gone
            // state, never a stale key into the detached storage.
            timer.set_node(NONE);
            submit(timer);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.timers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;

    fn timer_at(expiration: i64) -> Arc<Timer> {
        Arc::new(Timer::new(
            expiration,
            crate::timer::Payload::Inert,
            CancelToken::new(),
        ))
    }

    // ==================== Construction ====================

    #[test]
    fn test_new_bucket() {
        let b = Bucket::new();
        assert_eq!(b.expiration(), -1);
        assert_eq!(b.len(), 0);
    }

    // ==================== Expiration Gate ====================

    #[test]
    fn test_set_expiration_reports_change() {
        let b = Bucket::new();
        assert!(b.set_expiration(100));
        assert!(!b.set_expiration(100));
        assert!(b.set_expiration(200));
        assert_eq!(b.expiration(), 200);
    }

    // ==================== Insert ====================

    #[test]
    fn test_insert_wires_back_references() {
        let b = Arc::new(Bucket::new());

        let n = 129;
        let timers: Vec<_> = (0..n).map(|i| timer_at(i)).collect();
        for t in &timers {
            Bucket::insert(&b, t);
        }

        assert_eq!(b.len(), n as usize);
        for t in &timers {
            assert!(t.bucket_is(&b));
            assert_ne!(t.node(), NONE);
        }
    }

    // ==================== Delete ====================

    #[test]
    fn test_delete_unlinks() {
        let b = Arc::new(Bucket::new());
        let t = timer_at(10);
        Bucket::insert(&b, &t);

        assert_eq!(Bucket::delete(&b, &t), DeleteOutcome::Deleted);
        assert_eq!(b.len(), 0);
        assert!(t.bucket().is_none());
        assert_eq!(t.node(), NONE);
    }

    #[test]
    fn test_delete_after_flush_moved_timer() {
        let b1 = Arc::new(Bucket::new());
        let b2 = Arc::new(Bucket::new());
        let t = timer_at(10);
        Bucket::insert(&b1, &t);

        // Flush re-submits into another bucket, as the wheel does when
        // a long-range timer migrates down a level.
        b1.flush(|moved| Bucket::insert(&b2, &moved));

        assert_eq!(Bucket::delete(&b1, &t), DeleteOutcome::Retry);
        assert_eq!(Bucket::delete(&b2, &t), DeleteOutcome::Deleted);
        assert_eq!(b2.len(), 0);
        assert!(t.bucket().is_none());
    }

    #[test]
    fn test_delete_already_gone() {
        let b = Arc::new(Bucket::new());
        let t = timer_at(10);
        Bucket::insert(&b, &t);

        // Flush without re-submit: the one-shot fire path.
        b.flush(|_| {});

        assert_eq!(t.node(), NONE);
        assert_eq!(Bucket::delete(&b, &t), DeleteOutcome::Deleted);
    }

    // ==================== Flush ====================

    #[test]
    fn test_flush_detaches_list() {
        let b = Arc::new(Bucket::new());
        Bucket::insert(&b, &timer_at(1));
        Bucket::insert(&b, &timer_at(2));
        b.set_expiration(100);

        let mut flushed = 0;
        b.flush(|_| flushed += 1);

        assert_eq!(flushed, 2);
        assert_eq!(b.len(), 0);
        assert_eq!(b.expiration(), -1);
    }

    #[test]
    fn test_flush_clears_nodes() {
        let b = Arc::new(Bucket::new());
        let t = timer_at(10);
        Bucket::insert(&b, &t);

        b.flush(|flushed| assert_eq!(flushed.node(), NONE));
    }

    #[test]
    fn test_flush_with_reinsert_restores() {
        let b = Arc::new(Bucket::new());

        let n = 17;
        for i in 0..n {
            Bucket::insert(&b, &timer_at(i));
        }
        assert_eq!(b.len(), n as usize);

        let target = b.clone();
        b.flush(move |t| Bucket::insert(&target, &t));

        assert_eq!(b.len(), n as usize);
    }

    #[test]
    fn test_concurrent_delete_and_flush() {
        use crate::timer::TimerHandle;

        // Whatever the interleaving, after a close racing a flush the
        // timer must sit in no list with a cleared back-pointer.
        for _ in 0..200 {
            let b1 = Arc::new(Bucket::new());
            let b2 = Arc::new(Bucket::new());
            let t = timer_at(10);
            Bucket::insert(&b1, &t);

            let flusher = {
                let b1 = b1.clone();
                let b2 = b2.clone();
                std::thread::spawn(move || {
                    let target = b2.clone();
                    b1.flush(move |moved| Bucket::insert(&target, &moved));
                })
            };
            let closer = {
                let handle = TimerHandle::new(t.clone());
                std::thread::spawn(move || handle.close())
            };

            flusher.join().unwrap();
            closer.join().unwrap();

            assert_eq!(b1.len() + b2.len(), 0);
            assert!(t.bucket().is_none());
            assert_eq!(t.node(), NONE);
        }
    }

    #[test]
    fn test_flush_hundred_thousand() {
        let b = Arc::new(Bucket::new());

        let n = 100_000;
        for i in 0..n {
            Bucket::insert(&b, &timer_at(i));
        }

        b.flush(|_| {});
        assert_eq!(b.len(), 0);

        for i in 0..n {
            Bucket::insert(&b, &timer_at(i));
        }
        let target = b.clone();
        b.flush(move |t| Bucket::insert(&target, &t));
        assert_eq!(b.len(), n as usize);
    }
}
