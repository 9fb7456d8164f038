//! Fixed pool of render threads.
//!
//! Each worker loops `pop -> render -> put_terminal` until the queue closes.
//! Exactly one terminal write happens per popped job, including when the
//! renderer panics.
//!
//! The job's pending marker is renewed when the job is claimed and then every
//! half `marker_ttl` while it renders, so neither a long queue wait nor a
//! long render lets the marker lapse and admit a duplicate.

use std::any::Any;
use std::io;
use std::num::NonZeroUsize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tracing::{debug, error, info, warn};

use crate::cache::ResultStore;
use crate::domain::Outcome;

use super::queue::{PendingJob, PriorityQueue};
use super::renderer::{RenderError, Renderer};

pub(crate) const METRIC_RENDER_TOTAL: &str = "depthcast_render_total";
pub(crate) const METRIC_RENDER_MS: &str = "depthcast_render_ms";
pub(crate) const METRIC_QUEUE_WAIT_MS: &str = "depthcast_queue_wait_ms";

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// Shared handles every worker thread needs.
#[derive(Clone)]
struct WorkerContext {
    queue: Arc<PriorityQueue>,
    store: Arc<dyn ResultStore>,
    renderer: Arc<dyn Renderer>,
}

pub struct WorkerPool {
    queue: Arc<PriorityQueue>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` threads named `render-worker-<n>`.
    pub fn spawn(
        workers: NonZeroUsize,
        queue: Arc<PriorityQueue>,
        store: Arc<dyn ResultStore>,
        renderer: Arc<dyn Renderer>,
    ) -> io::Result<Self> {
        let context = WorkerContext {
            queue: Arc::clone(&queue),
            store,
            renderer,
        };

        let mut pool = Self {
            queue,
            handles: Vec::with_capacity(workers.get()),
        };
        for worker in 0..workers.get() {
            let context = context.clone();
            // On failure the partially built pool is dropped, which closes the
            // queue and joins the threads already running.
            let handle = thread::Builder::new()
                .name(format!("render-worker-{worker}"))
                .spawn(move || run_worker(worker, context))?;
            pool.handles.push(handle);
        }

        info!(
            target = "application::worker",
            op = "spawn",
            workers = workers.get(),
            "Render workers started"
        );
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Close the queue and wait for every worker to finish its current job.
    ///
    /// Returns the number of queued jobs that were dropped.
    pub fn shutdown(mut self) -> usize {
        self.stop()
    }

    fn stop(&mut self) -> usize {
        let dropped = self.queue.close();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!(
                    target = "application::worker",
                    op = "shutdown",
                    result = "join_error",
                    "Render worker terminated abnormally"
                );
            }
        }
        if dropped > 0 {
            warn!(
                target = "application::worker",
                op = "shutdown",
                dropped,
                "Dropped queued render jobs during shutdown"
            );
        }
        dropped
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.stop();
        }
    }
}

fn run_worker(worker: usize, context: WorkerContext) {
    while let Some(pending) = context.queue.pop() {
        process_job(
            worker,
            pending,
            context.store.as_ref(),
            context.renderer.as_ref(),
        );
    }
}

/// Render one job and record its terminal outcome.
pub(crate) fn process_job(
    worker: usize,
    pending: PendingJob,
    store: &dyn ResultStore,
    renderer: &dyn Renderer,
) {
    let waited = pending.enqueued_at.elapsed();
    histogram!(METRIC_QUEUE_WAIT_MS).record(waited.as_secs_f64() * 1000.0);

    if !store.refresh_pending(&pending.key, pending.marker_ttl) {
        debug!(
            target = "application::worker",
            op = "claim",
            worker,
            fingerprint = %pending.key.short(),
            queue_wait_ms = waited.as_millis() as u64,
            "Pending marker already gone at claim"
        );
    }

    let started_at = Instant::now();
    let rendered = thread::scope(|scope| {
        let (done, stop) = mpsc::channel::<()>();
        let renewer = thread::Builder::new()
            .name(format!("render-worker-{worker}-renew"))
            .spawn_scoped(scope, || renew_marker(&pending, store, stop));
        if let Err(err) = renewer {
            warn!(
                target = "application::worker",
                op = "renew",
                result = "spawn_error",
                worker,
                error = %err,
                "Rendering without pending marker renewal"
            );
        }
        let rendered = catch_unwind(AssertUnwindSafe(|| renderer.render(&pending.job)));
        drop(done);
        rendered
    });
    let elapsed = started_at.elapsed();

    let outcome = match rendered {
        Ok(Ok(bytes)) => {
            info!(
                target = "application::worker",
                op = "render",
                result = "success",
                worker,
                fingerprint = %pending.key.short(),
                priority = pending.priority,
                queue_wait_ms = waited.as_millis() as u64,
                elapsed_ms = elapsed.as_millis() as u64,
                output_bytes = bytes.len(),
                "Render finished"
            );
            Outcome::success(bytes)
        }
        Ok(Err(err)) => {
            warn!(
                target = "application::worker",
                op = "render",
                result = "failure",
                worker,
                fingerprint = %pending.key.short(),
                priority = pending.priority,
                elapsed_ms = elapsed.as_millis() as u64,
                error_kind = err.kind(),
                error = %err,
                "Render failed"
            );
            Outcome::failure(err.to_string())
        }
        Err(payload) => {
            let err = RenderError::Panicked(panic_message(payload.as_ref()));
            error!(
                target = "application::worker",
                op = "render",
                result = "panic",
                worker,
                fingerprint = %pending.key.short(),
                elapsed_ms = elapsed.as_millis() as u64,
                error = %err,
                "Renderer panicked"
            );
            Outcome::failure(err.to_string())
        }
    };

    let result = if outcome.is_success() { "success" } else { "failure" };
    counter!(METRIC_RENDER_TOTAL, "result" => result).increment(1);
    histogram!(METRIC_RENDER_MS, "result" => result).record(elapsed.as_secs_f64() * 1000.0);

    store.put_terminal(
        &pending.key,
        outcome,
        Duration::from_secs(pending.job.expire),
    );
}

/// Renew the pending marker every half TTL until `stop` disconnects or the
/// marker is gone.
fn renew_marker(pending: &PendingJob, store: &dyn ResultStore, stop: mpsc::Receiver<()>) {
    let interval = (pending.marker_ttl / 2).max(MIN_RENEW_INTERVAL);
    while let Err(RecvTimeoutError::Timeout) = stop.recv_timeout(interval) {
        if !store.refresh_pending(&pending.key, pending.marker_ttl) {
            return;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use depthcast_api_types::JobConfig;

    use super::*;
    use crate::cache::MemoryResultStore;
    use crate::domain::{ResultState, fingerprint};

    fn pending(image: &str, priority: i32) -> PendingJob {
        let job = JobConfig::for_image(image).with_priority(priority);
        let key = fingerprint(&job);
        PendingJob::new(job, key)
    }

    fn wait_for_terminal(store: &dyn ResultStore, pending: &PendingJob) -> ResultState {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match store.get(&pending.key) {
                Some(state) if state.is_terminal() => return state,
                _ if Instant::now() > deadline => panic!("no terminal state recorded"),
                _ => thread::sleep(Duration::from_millis(5)),
            }
        }
    }

    #[test]
    fn success_and_failure_are_recorded() {
        let store = MemoryResultStore::new(1024);
        let ok = |_: &JobConfig| -> Result<Bytes, RenderError> { Ok(Bytes::from_static(b"mp4")) };
        let bad = |_: &JobConfig| -> Result<Bytes, RenderError> { Err(RenderError::rejected("bad depth")) };

        let first = pending("a.png", 0);
        process_job(0, first.clone(), &store, &ok);
        assert!(matches!(store.get(&first.key), Some(ResultState::Success(_))));

        let second = pending("b.png", 0);
        process_job(0, second.clone(), &store, &bad);
        match store.get(&second.key) {
            Some(ResultState::Failure(failure)) => assert!(failure.message.contains("bad depth")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn panicking_renderer_becomes_failure() {
        let store = MemoryResultStore::new(1024);
        let exploding = |_: &JobConfig| -> Result<Bytes, RenderError> { panic!("gpu lost") };

        let job = pending("a.png", 0);
        process_job(0, job.clone(), &store, &exploding);

        match store.get(&job.key) {
            Some(ResultState::Failure(failure)) => {
                assert!(failure.message.contains("gpu lost"), "{}", failure.message)
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn marker_outlives_its_ttl_while_rendering() {
        let store = Arc::new(MemoryResultStore::new(1024));
        let job = pending("slow.png", 0).with_marker_ttl(Duration::from_millis(100));
        assert!(store.put_pending(&job.key, job.marker_ttl));

        let seen_pending = Arc::new(AtomicUsize::new(0));
        let renderer = {
            let store = Arc::clone(&store);
            let seen_pending = Arc::clone(&seen_pending);
            let key = job.key;
            move |_: &JobConfig| -> Result<Bytes, RenderError> {
                for _ in 0..8 {
                    thread::sleep(Duration::from_millis(50));
                    if matches!(store.get(&key), Some(ResultState::Pending)) {
                        seen_pending.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Ok(Bytes::from_static(b"mp4"))
            }
        };

        process_job(0, job.clone(), store.as_ref(), &renderer);

        assert_eq!(seen_pending.load(Ordering::SeqCst), 8);
        assert!(matches!(store.get(&job.key), Some(ResultState::Success(_))));
        // The marker is not resurrected once the job is done.
        assert!(!store.refresh_pending(&job.key, job.marker_ttl));
    }

    #[test]
    fn claim_renews_a_marker_aged_in_the_queue() {
        let store = Arc::new(MemoryResultStore::new(1024));
        let job = pending("queued.png", 0).with_marker_ttl(Duration::from_secs(30));
        assert!(store.put_pending(&job.key, Duration::from_millis(80)));
        thread::sleep(Duration::from_millis(40));

        let observed = Arc::new(Mutex::new(None));
        let renderer = {
            let store = Arc::clone(&store);
            let observed = Arc::clone(&observed);
            let key = job.key;
            move |_: &JobConfig| -> Result<Bytes, RenderError> {
                // Past the original 80ms but well inside one renewal interval.
                thread::sleep(Duration::from_millis(80));
                *observed.lock().expect("observed lock") = store.get(&key);
                Ok(Bytes::from_static(b"mp4"))
            }
        };
        process_job(0, job, store.as_ref(), &renderer);

        assert!(matches!(
            *observed.lock().expect("observed lock"),
            Some(ResultState::Pending)
        ));
    }

    #[test]
    fn pool_processes_in_priority_order() {
        let queue = Arc::new(PriorityQueue::unbounded());
        let store: Arc<dyn ResultStore> = Arc::new(MemoryResultStore::new(1 << 20));
        let order = Arc::new(Mutex::new(Vec::new()));

        // Queue everything before the single worker starts.
        let jobs = [pending("low.png", 1), pending("high.png", 5), pending("mid.png", 3)];
        for job in &jobs {
            queue.push(job.clone()).expect("push");
        }

        let seen = Arc::clone(&order);
        let renderer = move |job: &JobConfig| -> Result<Bytes, RenderError> {
            seen.lock().expect("order lock").push(job.input.image.clone());
            Ok(Bytes::from_static(b"ok"))
        };
        let pool = WorkerPool::spawn(
            NonZeroUsize::MIN,
            Arc::clone(&queue),
            Arc::clone(&store),
            Arc::new(renderer),
        )
        .expect("spawn pool");

        for job in &jobs {
            wait_for_terminal(store.as_ref(), job);
        }
        assert_eq!(pool.shutdown(), 0);
        assert_eq!(
            *order.lock().expect("order lock"),
            vec!["high.png", "mid.png", "low.png"]
        );
    }

    #[test]
    fn parallelism_matches_worker_count() {
        let queue = Arc::new(PriorityQueue::unbounded());
        let store: Arc<dyn ResultStore> = Arc::new(MemoryResultStore::new(1 << 20));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let renderer = {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            move |_: &JobConfig| -> Result<Bytes, RenderError> {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(40));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(Bytes::from_static(b"ok"))
            }
        };
        let pool = WorkerPool::spawn(
            NonZeroUsize::new(2).expect("non-zero"),
            Arc::clone(&queue),
            Arc::clone(&store),
            Arc::new(renderer),
        )
        .expect("spawn pool");
        assert_eq!(pool.size(), 2);

        let jobs: Vec<PendingJob> = (0..6).map(|i| pending(&format!("{i}.png"), 0)).collect();
        for job in &jobs {
            queue.push(job.clone()).expect("push");
        }
        for job in &jobs {
            wait_for_terminal(store.as_ref(), job);
        }
        pool.shutdown();

        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn shutdown_reports_dropped_jobs() {
        let queue = Arc::new(PriorityQueue::unbounded());
        let store: Arc<dyn ResultStore> = Arc::new(MemoryResultStore::new(1024));
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().expect("gate lock");

        let renderer = {
            let gate = Arc::clone(&gate);
            move |_: &JobConfig| -> Result<Bytes, RenderError> {
                let _open = gate.lock().map_err(|_| RenderError::rejected("gate poisoned"))?;
                Ok(Bytes::from_static(b"ok"))
            }
        };
        let pool = WorkerPool::spawn(
            NonZeroUsize::MIN,
            Arc::clone(&queue),
            Arc::clone(&store),
            Arc::new(renderer),
        )
        .expect("spawn pool");

        let in_flight = pending("first.png", 0);
        queue.push(in_flight.clone()).expect("push");
        while !queue.is_empty() {
            thread::sleep(Duration::from_millis(5));
        }
        queue.push(pending("second.png", 0)).expect("push");

        let shutdown = thread::spawn(move || pool.shutdown());
        thread::sleep(Duration::from_millis(50));
        drop(held);

        assert_eq!(shutdown.join().expect("shutdown thread"), 1);
        // The job already claimed still ran to completion.
        assert!(matches!(store.get(&in_flight.key), Some(ResultState::Success(_))));
    }
}
