use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::debug;
use thiserror::Error;

use crate::bucket::Bucket;
use crate::cancel::CancelToken;
use crate::clock::{UtcOffset, ZonedTime, duration_to_ms, now_ms, time_to_ms};
use crate::job::{Job, Schedule};
use crate::queue::DelayQueue;
use crate::timer::{Payload, Timer, TimerHandle};
use crate::wheel::Wheel;

pub const DEFAULT_TICK: Duration = Duration::from_millis(1);
pub const DEFAULT_SIZE: usize = 32;

const MIN_TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WheelError {
    #[error("tick must be at least 1ms, got {0:?}")]
    TickTooSmall(Duration),
    #[error("size must be at least 1")]
    ZeroSize,
}

/// Configures and builds a [`TimeWheel`].
#[derive(Debug, Clone)]
pub struct Builder {
    tick: Duration,
    size: usize,
    timezone: UtcOffset,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            tick: DEFAULT_TICK,
            size: DEFAULT_SIZE,
            timezone: UtcOffset::UTC,
        }
    }

    /// Span of one bucket. Must be at least 1ms; sub-millisecond
    /// precision is truncated.
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Ring length of every level. Must be at least 1.
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Zone offset handed to [`Schedule::next`] along with the
    /// reference instant. Defaults to UTC.
    pub fn timezone(mut self, timezone: UtcOffset) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn build(self) -> Result<TimeWheel, WheelError> {
        if self.tick < MIN_TICK {
            return Err(WheelError::TickTooSmall(self.tick));
        }
        if self.size < 1 {
            return Err(WheelError::ZeroSize);
        }
        Ok(TimeWheel::from_parts(
            duration_to_ms(self.tick),
            self.size as i64,
            self.timezone,
        ))
    }
}

/// Hierarchical timing wheel.
///
/// Holds the root level of the hierarchy and the delay queue shared by
/// every level. One worker thread (started by [`start`](Self::start))
/// drives the clock; expired jobs each run on their own thread.
pub struct TimeWheel {
    root: Arc<Wheel>,
    queue: Arc<DelayQueue<Arc<Bucket>>>,
}

impl Default for TimeWheel {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl TimeWheel {
    /// A wheel with the given tick and ring size. Fails on a tick under
    /// 1ms or a zero size.
    pub fn new(tick: Duration, size: usize) -> Result<Self, WheelError> {
        Builder::new().tick(tick).size(size).build()
    }

    /// A wheel with a 1ms tick and 32 buckets per level.
    pub fn with_defaults() -> Self {
        Self::from_parts(1, DEFAULT_SIZE as i64, UtcOffset::UTC)
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    fn from_parts(tick_ms: i64, size: i64, timezone: UtcOffset) -> Self {
        let queue = Arc::new(DelayQueue::new());
        let root = Wheel::new(tick_ms, size, now_ms(), queue.clone(), timezone);
        Self { root, queue }
    }

    /// Start the worker that drives expirations. No-op when already
    /// started.
    pub fn start(&self) {
        let root = self.root.clone();
        self.queue.start(move |bucket| Wheel::process(&root, &bucket));
        debug!("time wheel started");
    }

    /// Stop driving expirations.
    ///
    /// Jobs already running on their own threads are not waited for.
    /// Timers submitted after `stop` are accepted but never fire.
    pub fn stop(&self) {
        self.queue.stop();
        debug!("time wheel stopped");
    }

    /// Block until the worker has exited after a [`stop`](Self::stop).
    pub fn wait(&self) {
        self.queue.wait();
    }

    /// Run `job` at the appointed wall-clock time, on its own thread.
    /// An instant at or before now fires immediately.
    pub fn time_func(&self, at: SystemTime, job: impl Job) -> TimerHandle {
        self.submit_one_shot(time_to_ms(at), Arc::new(job))
    }

    /// Run `job` once `delay` has elapsed, on its own thread.
    pub fn after_func(&self, delay: Duration, job: impl Job) -> TimerHandle {
        self.submit_one_shot(time_to_ms(SystemTime::now() + delay), Arc::new(job))
    }

    fn submit_one_shot(&self, expiration: i64, job: Arc<dyn Job>) -> TimerHandle {
        let timer = Arc::new(Timer::new(
            expiration,
            Payload::OneShot { job },
            CancelToken::new(),
        ));
        Wheel::submit(&self.root, timer.clone());
        TimerHandle::new(timer)
    }

    /// Run `job` according to the execution plan of `schedule`.
    ///
    /// `schedule.next` is asked for the first time up front; `None`
    /// yields an inert handle that never fires. Afterwards the next
    /// occurrence is lined up each time the timer expires, before the
    /// job runs, using the scheduled instant as the reference.
    ///
    /// There is a short window around each firing in which the timer
    /// sits in no bucket; a `close` landing in that window stops the
    /// chain but not the job run already in flight. A caller that must
    /// cancel reliably mid-sequence closes the handle and synchronises
    /// with the job through the token.
    pub fn schedule(&self, schedule: impl Schedule, job: impl Job) -> TimerHandle {
        let token = CancelToken::new();
        let schedule: Arc<dyn Schedule> = Arc::new(schedule);

        let Some(first) = schedule.next(ZonedTime::now(self.root.timezone())) else {
            return TimerHandle::new(Arc::new(Timer::inert(token)));
        };

        let timer = Arc::new(Timer::new(
            time_to_ms(first),
            Payload::Recurring {
                schedule,
                job: Arc::new(job),
            },
            token,
        ));
        Wheel::submit(&self.root, timer.clone());
        TimerHandle::new(timer)
    }

    #[cfg(test)]
    pub(crate) fn root(&self) -> &Arc<Wheel> {
        &self.root
    }
}
