use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;

use arc_swap::ArcSwapOption;

use crate::bucket::Bucket;
use crate::clock::{UtcOffset, ZonedTime, ms_to_time, time_to_ms, truncate};
use crate::queue::DelayQueue;
use crate::timer::{Payload, Timer};

/// One level of the hierarchy: a ring of `size` buckets, each covering
/// `tick` milliseconds, plus a lazily built next-coarser wheel for
/// expirations beyond `span = tick * size`.
///
/// All levels share one delay queue; only the root level consumes it.
pub(crate) struct Wheel {
    /// Span of one bucket, in ms.
    tick: i64,
    /// Number of buckets in the ring.
    size: i64,
    /// `tick * size`, the range this level covers directly.
    span: i64,
    /// Current time floored to a multiple of `tick`. Non-decreasing.
    current: AtomicI64,
    buckets: Box<[Arc<Bucket>]>,
    queue: Arc<DelayQueue<Arc<Bucket>>>,
    timezone: UtcOffset,

    /// The next-coarser wheel. Built at most once, on the first timer
    /// that overshoots `span`; never torn down while the root lives.
    overflow: ArcSwapOption<Wheel>,
}

impl Wheel {
    pub fn new(
        tick: i64,
        size: i64,
        start: i64,
        queue: Arc<DelayQueue<Arc<Bucket>>>,
        timezone: UtcOffset,
    ) -> Arc<Self> {
        Arc::new(Self {
            tick,
            size,
            span: tick * size,
            current: AtomicI64::new(truncate(start, tick)),
            buckets: (0..size).map(|_| Arc::new(Bucket::new())).collect(),
            queue,
            timezone,
            overflow: ArcSwapOption::from(None),
        })
    }

    /// Insert `timer` into this level or some coarser one. Returns
    /// `false` when the timer is already expired and must fire instead.
    pub fn add(&self, timer: &Arc<Timer>) -> bool {
        let current = self.current.load(Ordering::Acquire);
        let expiration = timer.expiration();

        if expiration < current + self.tick {
            // Within the current tick: expired.
            false
        } else if expiration < current + self.span {
            let virtual_id = expiration / self.tick;
            let bucket = &self.buckets[(virtual_id % self.size) as usize];
            Bucket::insert(bucket, timer);

            // Enqueue only when the due time moved, i.e. this insert
            // opened a fresh bucket cycle.
            if bucket.set_expiration(virtual_id * self.tick) {
                self.queue.offer(bucket.expiration(), bucket.clone());
            }
            true
        } else {
            self.next_level(current).add(timer)
        }
    }

    /// The next-coarser wheel, created on first demand. Concurrent
    /// callers race on a compare-and-swap; losers adopt the winner.
    fn next_level(&self, current: i64) -> Arc<Wheel> {
        if let Some(overflow) = self.overflow.load_full() {
            return overflow;
        }

        let candidate = Wheel::new(
            self.span,
            self.size,
            current,
            self.queue.clone(),
            self.timezone,
        );
        let prev = self
            .overflow
            .compare_and_swap(std::ptr::null::<Wheel>(), Some(candidate.clone()));
        match &*prev {
            Some(winner) => winner.clone(),
            None => candidate,
        }
    }

    /// Push the clock forward to `expiration`, cascading into coarser
    /// levels so they never lag more than one of their own ticks.
    pub fn advance(&self, expiration: i64) {
        let current = self.current.load(Ordering::Acquire);
        if expiration >= current + self.tick {
            let current = truncate(expiration, self.tick);
            self.current.store(current, Ordering::Release);

            if let Some(overflow) = self.overflow.load_full() {
                overflow.advance(current);
            }
        }
    }

    /// Delay-queue consumer: called on the root wheel for each bucket
    /// that comes due. Flushed timers re-enter from the top, so a
    /// long-range timer migrates one level down per pass until it
    /// lands, then fires.
    pub fn process(this: &Arc<Wheel>, bucket: &Arc<Bucket>) {
        this.advance(bucket.expiration());
        bucket.flush(|timer| Wheel::submit(this, timer));
    }

    /// Insert the timer, or fire it when it is already expired.
    pub fn submit(this: &Arc<Wheel>, timer: Arc<Timer>) {
        if !this.add(&timer) {
            Wheel::fire(this, timer);
        }
    }

    /// Run the expired timer's payload in its own thread.
    fn fire(this: &Arc<Wheel>, timer: Arc<Timer>) {
        timer.set_bucket(None);
        let root = this.clone();
        thread::spawn(move || match timer.payload() {
            Payload::Inert => {}
            Payload::OneShot { job } => {
                let _ = job.run(timer.token());
            }
            Payload::Recurring { schedule, job } => {
                // Line up the next cycle before running the job so a
                // slow job does not push the schedule back. The next
                // time is derived from the scheduled expiration, not
                // from when this thread actually got to run.
                let scheduled = ms_to_time(timer.expiration());
                if let Some(next) = schedule.next(ZonedTime::new(scheduled, root.timezone)) {
                    timer.set_expiration(time_to_ms(next));
                    Wheel::submit(&root, timer.clone());
                }
                let _ = job.run(timer.token());
            }
        });
    }

    pub fn timezone(&self) -> UtcOffset {
        self.timezone
    }

    #[cfg(test)]
    pub fn tick(&self) -> i64 {
        self.tick
    }

    #[cfg(test)]
    pub fn span(&self) -> i64 {
        self.span
    }

    #[cfg(test)]
    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn overflow_wheel(&self) -> Option<Arc<Wheel>> {
        self.overflow.load_full()
    }

    /// Number of timers held directly by this level's buckets.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;

    fn wheel_at(tick: i64, size: i64, start: i64) -> Arc<Wheel> {
        let queue = Arc::new(DelayQueue::new());
        Wheel::new(tick, size, start, queue, UtcOffset::UTC)
    }

    fn timer_at(expiration: i64) -> Arc<Timer> {
        Arc::new(Timer::new(expiration, Payload::Inert, CancelToken::new()))
    }

    // ==================== Construction ====================

    #[test]
    fn test_new_truncates_start() {
        let w = wheel_at(5, 3, 1003);
        assert_eq!(w.current(), 1000);
        assert_eq!(w.span(), 15);
        assert!(w.overflow_wheel().is_none());
    }

    // ==================== Add Classification ====================

    #[test]
    fn test_add_levels() {
        let w = wheel_at(5, 3, 1000);

        // Within the current tick: expired.
        assert!(!w.add(&timer_at(1001)));
        assert!(w.overflow_wheel().is_none());

        // Within this wheel's span.
        assert!(w.add(&timer_at(1010)));
        assert_eq!(w.pending(), 1);
        assert!(w.overflow_wheel().is_none());

        // One level up.
        assert!(w.add(&timer_at(1016)));
        let o1 = w.overflow_wheel().unwrap();
        assert_eq!(o1.tick(), w.span());
        assert_eq!(o1.pending(), 1);
        assert!(o1.overflow_wheel().is_none());

        // Two levels up.
        assert!(w.add(&timer_at(1046)));
        let o2 = o1.overflow_wheel().unwrap();
        assert_eq!(o2.tick(), o1.span());
        assert_eq!(o2.pending(), 1);
    }

    #[test]
    fn test_add_at_exact_span_boundary() {
        let w = wheel_at(5, 3, 1000);

        // current + span is the first instant this level cannot hold.
        assert!(w.add(&timer_at(1015)));
        assert_eq!(w.pending(), 0);
        assert_eq!(w.overflow_wheel().unwrap().pending(), 1);
    }

    #[test]
    fn test_add_just_inside_span() {
        let w = wheel_at(5, 3, 1000);
        assert!(w.add(&timer_at(1014)));
        assert_eq!(w.pending(), 1);
        assert!(w.overflow_wheel().is_none());
    }

    #[test]
    fn test_add_wires_bucket_expiration() {
        let w = wheel_at(5, 3, 1000);
        let t = timer_at(1012);
        assert!(w.add(&t));

        let b = t.bucket().unwrap();
        assert_eq!(b.expiration(), 1010);
    }

    #[test]
    fn test_add_same_slot_enqueues_once() {
        let queue = Arc::new(DelayQueue::new());
        let w = Wheel::new(5, 3, 1000, queue.clone(), UtcOffset::UTC);

        assert!(w.add(&timer_at(1010)));
        assert!(w.add(&timer_at(1012)));
        assert!(w.add(&timer_at(1014)));

        assert_eq!(w.pending(), 3);
        assert_eq!(queue.len(), 1);
    }

    // ==================== Advance ====================

    #[test]
    fn test_advance_below_tick_is_noop() {
        let w = wheel_at(5, 3, 1000);
        w.advance(1004);
        assert_eq!(w.current(), 1000);
    }

    #[test]
    fn test_advance_truncates() {
        let w = wheel_at(5, 3, 1000);
        w.advance(1007);
        assert_eq!(w.current(), 1005);
    }

    #[test]
    fn test_advance_cascades_into_overflow() {
        let w = wheel_at(5, 3, 1000);
        assert!(w.add(&timer_at(1046)));

        let o1 = w.overflow_wheel().unwrap();
        let o2 = o1.overflow_wheel().unwrap();
        assert_eq!(o1.current(), 990);
        assert_eq!(o2.current(), 990);

        w.advance(1046);
        assert_eq!(w.current(), 1045);
        assert_eq!(o1.current(), 1035);
        assert_eq!(o2.current(), 1035);

        // Coarser levels never lag more than one of their own ticks.
        assert!(o1.current() >= w.current() - o1.tick());
    }

    // ==================== Flush Migration ====================

    #[test]
    fn test_flushed_timer_migrates_down() {
        let w = wheel_at(5, 3, 1000);
        let t = timer_at(1016);
        assert!(w.add(&t));

        let o1 = w.overflow_wheel().unwrap();
        assert_eq!(o1.pending(), 1);

        // The overflow bucket comes due; its flush re-enters from the
        // root, where the timer now fits directly.
        let b = t.bucket().unwrap();
        w.advance(b.expiration());
        b.flush(|moved| {
            assert!(w.add(&moved));
        });

        assert_eq!(o1.pending(), 0);
        assert_eq!(w.pending(), 1);
        assert!(!Arc::ptr_eq(&t.bucket().unwrap(), &b));
    }
}
