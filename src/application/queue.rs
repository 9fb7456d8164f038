//! Priority queue between the gateway and the worker threads.
//!
//! Jobs leave in `(priority desc, sequence asc)` order: the highest priority
//! first, and among equal priorities the one enqueued first.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::num::NonZeroUsize;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use depthcast_api_types::JobConfig;
use metrics::{counter, gauge};
use thiserror::Error;

use crate::domain::FingerprintKey;
use crate::util::lock::{condvar_wait, condvar_wait_timeout, mutex_lock};

use super::gateway::DEFAULT_PENDING_TTL;

const SOURCE: &str = "application::queue";
pub(crate) const METRIC_QUEUE_DEPTH: &str = "depthcast_queue_depth";
pub(crate) const METRIC_QUEUE_REJECTED_TOTAL: &str = "depthcast_queue_rejected_total";

/// A job admitted by the gateway, waiting for a worker.
#[derive(Debug, Clone)]
pub struct PendingJob {
    pub job: JobConfig,
    pub key: FingerprintKey,
    pub priority: i32,
    pub enqueued_at: Instant,
    /// Lifetime of the pending marker; the worker renews it for this long.
    pub marker_ttl: Duration,
}

impl PendingJob {
    pub fn new(job: JobConfig, key: FingerprintKey) -> Self {
        Self {
            priority: job.priority,
            job,
            key,
            enqueued_at: Instant::now(),
            marker_ttl: DEFAULT_PENDING_TTL,
        }
    }

    pub fn with_marker_ttl(mut self, ttl: Duration) -> Self {
        self.marker_ttl = ttl;
        self
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("render queue is full ({capacity} jobs waiting)")]
    Full { capacity: usize },
    #[error("render queue is closed")]
    Closed,
}

impl QueueError {
    fn reason(self) -> &'static str {
        match self {
            Self::Full { .. } => "full",
            Self::Closed => "closed",
        }
    }
}

/// Dispatch order: `Greater` means `a` leaves the queue before `b`.
fn dispatch_order(a: &QueuedJob, b: &QueuedJob) -> Ordering {
    a.job
        .priority
        .cmp(&b.job.priority)
        .then_with(|| b.sequence.cmp(&a.sequence))
}

struct QueuedJob {
    sequence: u64,
    job: PendingJob,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        dispatch_order(self, other)
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedJob>,
    next_sequence: u64,
    closed: bool,
}

/// Blocking multi-producer, multi-consumer priority queue.
pub struct PriorityQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: Option<NonZeroUsize>,
}

impl PriorityQueue {
    /// `capacity` of `None` means unbounded.
    pub fn new(capacity: Option<NonZeroUsize>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            capacity,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn capacity(&self) -> Option<NonZeroUsize> {
        self.capacity
    }

    pub fn push(&self, job: PendingJob) -> Result<(), QueueError> {
        let depth = {
            let mut state = mutex_lock(&self.state, SOURCE, "push");
            let rejection = if state.closed {
                Some(QueueError::Closed)
            } else {
                self.capacity
                    .filter(|capacity| state.heap.len() >= capacity.get())
                    .map(|capacity| QueueError::Full {
                        capacity: capacity.get(),
                    })
            };
            if let Some(error) = rejection {
                counter!(METRIC_QUEUE_REJECTED_TOTAL, "reason" => error.reason()).increment(1);
                return Err(error);
            }

            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.heap.push(QueuedJob { sequence, job });
            state.heap.len()
        };

        gauge!(METRIC_QUEUE_DEPTH).set(depth as f64);
        self.available.notify_one();
        Ok(())
    }

    /// Block until a job is available. Returns `None` once the queue is closed.
    pub fn pop(&self) -> Option<PendingJob> {
        let mut state = mutex_lock(&self.state, SOURCE, "pop");
        loop {
            if state.closed {
                return None;
            }
            if let Some(queued) = state.heap.pop() {
                gauge!(METRIC_QUEUE_DEPTH).set(state.heap.len() as f64);
                return Some(queued.job);
            }
            state = condvar_wait(&self.available, state, SOURCE, "pop.wait");
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<PendingJob> {
        let deadline = Instant::now() + timeout;
        let mut state = mutex_lock(&self.state, SOURCE, "pop_timeout");
        loop {
            if state.closed {
                return None;
            }
            if let Some(queued) = state.heap.pop() {
                gauge!(METRIC_QUEUE_DEPTH).set(state.heap.len() as f64);
                return Some(queued.job);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = condvar_wait_timeout(
                &self.available,
                state,
                remaining,
                SOURCE,
                "pop_timeout.wait",
            );
            state = guard;
        }
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "len").heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        mutex_lock(&self.state, SOURCE, "is_closed").closed
    }

    /// Stop accepting jobs and wake every blocked consumer.
    ///
    /// Jobs still waiting are dropped and their count returned; their pending
    /// markers run out on their own TTL.
    pub fn close(&self) -> usize {
        let dropped = {
            let mut state = mutex_lock(&self.state, SOURCE, "close");
            state.closed = true;
            let dropped = state.heap.len();
            state.heap.clear();
            dropped
        };
        gauge!(METRIC_QUEUE_DEPTH).set(0.0);
        self.available.notify_all();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn job(image: &str, priority: i32) -> PendingJob {
        let config = JobConfig::for_image(image).with_priority(priority);
        let key = crate::domain::fingerprint(&config);
        PendingJob::new(config, key)
    }

    fn drain(queue: &PriorityQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.pop_timeout(Duration::ZERO))
            .map(|pending| pending.job.input.image)
            .collect()
    }

    #[test]
    fn higher_priority_leaves_first() {
        let queue = PriorityQueue::unbounded();
        queue.push(job("b.png", 1)).expect("push b");
        queue.push(job("a.png", 5)).expect("push a");

        assert_eq!(drain(&queue), vec!["a.png", "b.png"]);
    }

    #[test]
    fn equal_priorities_are_fifo() {
        let queue = PriorityQueue::unbounded();
        for name in ["1.png", "2.png", "3.png"] {
            queue.push(job(name, 0)).expect("push");
        }
        queue.push(job("urgent.png", 3)).expect("push urgent");
        queue.push(job("4.png", 0)).expect("push");

        assert_eq!(
            drain(&queue),
            vec!["urgent.png", "1.png", "2.png", "3.png", "4.png"]
        );
    }

    #[test]
    fn negative_priorities_sort_last() {
        let queue = PriorityQueue::unbounded();
        queue.push(job("low.png", -2)).expect("push");
        queue.push(job("default.png", 0)).expect("push");
        assert_eq!(drain(&queue), vec!["default.png", "low.png"]);
    }

    #[test]
    fn full_queue_rejects_with_capacity() {
        let queue = PriorityQueue::new(NonZeroUsize::new(2));
        queue.push(job("1.png", 0)).expect("push");
        queue.push(job("2.png", 0)).expect("push");

        assert_eq!(
            queue.push(job("3.png", 9)),
            Err(QueueError::Full { capacity: 2 })
        );
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn pop_blocks_until_push() {
        let queue = Arc::new(PriorityQueue::unbounded());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop().map(|pending| pending.job.input.image))
        };

        thread::sleep(Duration::from_millis(50));
        queue.push(job("late.png", 0)).expect("push");

        let popped = consumer.join().expect("consumer thread");
        assert_eq!(popped.as_deref(), Some("late.png"));
    }

    #[test]
    fn close_wakes_consumers_and_drops_jobs() {
        let queue = Arc::new(PriorityQueue::unbounded());
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.pop().is_none())
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.close(), 0);
        for consumer in consumers {
            assert!(consumer.join().expect("consumer thread"));
        }

        let queue = PriorityQueue::unbounded();
        queue.push(job("stale.png", 0)).expect("push");
        assert_eq!(queue.close(), 1);
        assert!(queue.pop().is_none());
        assert_eq!(queue.push(job("after.png", 0)).err(), Some(QueueError::Closed));
    }

    #[test]
    fn pop_timeout_returns_none_when_idle() {
        let queue = PriorityQueue::unbounded();
        let started = Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
