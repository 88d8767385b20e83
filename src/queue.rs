use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::clock::now_ms;

/// Computes how long the consumer must still sleep before the given
/// deadline is due. Zero means due now.
type Delayer = Box<dyn Fn(i64) -> Duration + Send + Sync>;

struct Item<T> {
    deadline: i64,
    value: T,
}

// BinaryHeap is a max-heap; order by reversed deadline for
// earliest-first popping.
impl<T> PartialEq for Item<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl<T> Eq for Item<T> {}

impl<T> PartialOrd for Item<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Item<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

struct Inner<T> {
    heap: Mutex<BinaryHeap<Item<T>>>,
    available: Condvar,
    stopped: AtomicBool,
    delayer: Delayer,
}

/// Unbounded earliest-deadline priority queue with a blocking consumer.
///
/// `offer` may be called from any thread at any time, including after
/// `stop` (such items are simply never delivered). A single worker
/// thread sleeps until the head item is due, pops it, and hands it to
/// the consumer; items are delivered in non-decreasing deadline order
/// and never before their deadline.
pub(crate) struct DelayQueue<T> {
    inner: Arc<Inner<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> DelayQueue<T> {
    pub fn new() -> Self {
        Self::with_delayer(|deadline| {
            Duration::from_millis((deadline - now_ms()).max(0) as u64)
        })
    }

    pub fn with_delayer(delayer: impl Fn(i64) -> Duration + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                heap: Mutex::new(BinaryHeap::new()),
                available: Condvar::new(),
                stopped: AtomicBool::new(false),
                delayer: Box::new(delayer),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Insert `value` keyed by `deadline`.
    pub fn offer(&self, deadline: i64, value: T) {
        let mut heap = self.inner.heap.lock();
        let new_head = heap.peek().is_none_or(|head| deadline < head.deadline);
        heap.push(Item { deadline, value });
        drop(heap);

        if new_head {
            // The worker may be sleeping toward a later deadline;
            // re-evaluate against the new head.
            self.inner.available.notify_one();
        }
    }

    /// Spawn the consumer thread. No-op if already started.
    pub fn start(&self, consumer: impl Fn(T) + Send + 'static) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let inner = self.inner.clone();
        *worker = Some(std::thread::spawn(move || {
            debug!("delay queue consumer started");
            loop {
                let mut heap = inner.heap.lock();
                if inner.stopped.load(Ordering::Acquire) {
                    break;
                }
                match heap.peek() {
                    None => {
                        inner.available.wait(&mut heap);
                    }
                    Some(head) => {
                        let delay = (inner.delayer)(head.deadline);
                        if delay.is_zero() {
                            let item = match heap.pop() {
                                Some(item) => item,
                                None => continue,
                            };
                            drop(heap);
                            trace!("deadline {} due", item.deadline);
                            consumer(item.value);
                        } else {
                            let _ = inner.available.wait_for(&mut heap, delay);
                        }
                    }
                }
            }
            debug!("delay queue consumer stopped");
        }));
    }

    /// Signal the consumer to exit. Does not wait for it; pending items
    /// are left in the queue and never delivered.
    pub fn stop(&self) {
        let guard = self.inner.heap.lock();
        self.inner.stopped.store(true, Ordering::Release);
        drop(guard);
        self.inner.available.notify_all();
    }

    /// Block until the consumer thread has exited. Returns immediately
    /// if it was never started.
    pub fn wait(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.heap.lock().len()
    }
}
