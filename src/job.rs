use std::time::SystemTime;

use crate::cancel::CancelToken;
use crate::clock::ZonedTime;

/// Error type returned by jobs. The scheduler discards it; a caller who
/// cares about job failures must channel them out of the job itself.
pub type JobError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type JobResult = Result<(), JobError>;

/// A unit of work executed when a timer expires.
///
/// Each run happens on its own thread. The token is the one signalled
/// by the timer handle's `close`; long-running jobs that want to stop
/// early observe it, everything else may ignore it.
pub trait Job: Send + Sync + 'static {
    fn run(&self, token: &CancelToken) -> JobResult;
}

impl<F> Job for F
where
    F: Fn(&CancelToken) -> JobResult + Send + Sync + 'static,
{
    fn run(&self, token: &CancelToken) -> JobResult {
        self(token)
    }
}

/// The execution plan of a recurring timer.
pub trait Schedule: Send + Sync + 'static {
    /// Next execution time after the given (previous) time, or `None`
    /// when nothing further is scheduled.
    fn next(&self, prev: ZonedTime) -> Option<SystemTime>;
}

impl<F> Schedule for F
where
    F: Fn(ZonedTime) -> Option<SystemTime> + Send + Sync + 'static,
{
    fn next(&self, prev: ZonedTime) -> Option<SystemTime> {
        self(prev)
    }
}
