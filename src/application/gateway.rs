//! Client-facing entry point of the broker.
//!
//! A request moves through `lookup -> (admit) -> poll` until it observes a
//! terminal state or runs out of time:
//!
//! 1. fingerprint the job
//! 2. `Success` ends the request with the artifact
//! 3. `Failure` recorded after the request started ends it with the error;
//!    the entry stays so every request already waiting sees the same error
//! 4. `Failure` older than the request is stale: the request retries by
//!    swapping it for a pending marker, exactly like an absent entry
//! 5. absent: try to become the admitter via `put_pending`; the admitter
//!    enqueues the job, and a rejected enqueue rolls the marker back
//! 6. otherwise sleep one poll interval and look again
//!
//! Concurrent requests for one fingerprint share a single enqueue and all
//! observe the same terminal outcome. Giving up on a request never cancels
//! the render; its result still lands in the cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use depthcast_api_types::{JobConfig, VideoFormat};
use metrics::{counter, histogram};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::cache::ResultStore;
use crate::domain::{FingerprintKey, ResultState, fingerprint};

use super::queue::{PendingJob, PriorityQueue, QueueError};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(30);

pub(crate) const METRIC_CACHE_HIT_TOTAL: &str = "depthcast_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS_TOTAL: &str = "depthcast_cache_miss_total";
pub(crate) const METRIC_ADMISSION_TOTAL: &str = "depthcast_admission_total";
pub(crate) const METRIC_GATEWAY_TIMEOUT_TOTAL: &str = "depthcast_gateway_timeout_total";
pub(crate) const METRIC_GATEWAY_REQUEST_MS: &str = "depthcast_gateway_request_ms";

/// Timing knobs for the polling protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayPolicy {
    pub poll_interval: Duration,
    /// Budget for one request, measured from its first lookup.
    pub timeout: Duration,
    /// Lifetime of a pending marker; frees waiters if a worker dies mid-job.
    pub pending_ttl: Duration,
}

impl Default for GatewayPolicy {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            pending_ttl: DEFAULT_PENDING_TTL,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayResponse {
    Rendered {
        key: FingerprintKey,
        bytes: Bytes,
        format: VideoFormat,
        took: Duration,
        /// The artifact was already there on the very first lookup.
        cached: bool,
    },
    Failed {
        key: FingerprintKey,
        message: String,
        took: Duration,
    },
    TimedOut {
        key: FingerprintKey,
        took: Duration,
    },
    Rejected {
        key: FingerprintKey,
        error: QueueError,
        took: Duration,
    },
}

impl GatewayResponse {
    pub fn key(&self) -> FingerprintKey {
        match self {
            Self::Rendered { key, .. }
            | Self::Failed { key, .. }
            | Self::TimedOut { key, .. }
            | Self::Rejected { key, .. } => *key,
        }
    }

    pub fn took(&self) -> Duration {
        match self {
            Self::Rendered { took, .. }
            | Self::Failed { took, .. }
            | Self::TimedOut { took, .. }
            | Self::Rejected { took, .. } => *took,
        }
    }

    pub fn result_label(&self) -> &'static str {
        match self {
            Self::Rendered { cached: true, .. } => "cached",
            Self::Rendered { cached: false, .. } => "rendered",
            Self::Failed { .. } => "failed",
            Self::TimedOut { .. } => "timed_out",
            Self::Rejected { .. } => "rejected",
        }
    }
}

#[derive(Clone)]
pub struct RequestGateway {
    store: Arc<dyn ResultStore>,
    queue: Arc<PriorityQueue>,
    policy: GatewayPolicy,
}

impl RequestGateway {
    pub fn new(
        store: Arc<dyn ResultStore>,
        queue: Arc<PriorityQueue>,
        policy: GatewayPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    pub fn policy(&self) -> GatewayPolicy {
        self.policy
    }

    /// Serve one job through the polling protocol.
    pub async fn submit(&self, job: JobConfig) -> GatewayResponse {
        let started_at = Instant::now();
        let started_wall = OffsetDateTime::now_utc();
        let key = fingerprint(&job);
        let format = job.render.format;
        let mut first_check = true;

        let response = loop {
            match self.lookup(key).await {
                Some(ResultState::Success(artifact)) => {
                    break GatewayResponse::Rendered {
                        key,
                        bytes: artifact.bytes,
                        format,
                        took: started_at.elapsed(),
                        cached: first_check,
                    };
                }
                Some(ResultState::Failure(failure)) if failure.produced_at >= started_wall => {
                    break GatewayResponse::Failed {
                        key,
                        message: failure.message,
                        took: started_at.elapsed(),
                    };
                }
                Some(ResultState::Failure(_)) => {
                    if let Err(error) = self.admit(&job, key, Some(started_wall)) {
                        break GatewayResponse::Rejected {
                            key,
                            error,
                            took: started_at.elapsed(),
                        };
                    }
                }
                Some(ResultState::Pending) => {}
                None => {
                    if let Err(error) = self.admit(&job, key, None) {
                        break GatewayResponse::Rejected {
                            key,
                            error,
                            took: started_at.elapsed(),
                        };
                    }
                }
            }

            if first_check {
                counter!(METRIC_CACHE_MISS_TOTAL).increment(1);
                first_check = false;
            }

            let elapsed = started_at.elapsed();
            if elapsed >= self.policy.timeout {
                counter!(METRIC_GATEWAY_TIMEOUT_TOTAL).increment(1);
                break GatewayResponse::TimedOut { key, took: elapsed };
            }
            let remaining = self.policy.timeout - elapsed;
            tokio::time::sleep(self.policy.poll_interval.min(remaining)).await;
        };

        if matches!(response, GatewayResponse::Rendered { cached: true, .. }) {
            counter!(METRIC_CACHE_HIT_TOTAL).increment(1);
        }
        let label = response.result_label();
        histogram!(METRIC_GATEWAY_REQUEST_MS, "result" => label)
            .record(response.took().as_secs_f64() * 1000.0);

        match &response {
            GatewayResponse::Failed { message, .. } => warn!(
                target = "application::gateway",
                op = "submit",
                result = label,
                fingerprint = %key.short(),
                priority = job.priority,
                elapsed_ms = response.took().as_millis() as u64,
                error = %message,
                "Render request failed"
            ),
            GatewayResponse::Rejected { error, .. } => warn!(
                target = "application::gateway",
                op = "submit",
                result = label,
                fingerprint = %key.short(),
                priority = job.priority,
                elapsed_ms = response.took().as_millis() as u64,
                error = %error,
                "Render request rejected"
            ),
            _ => info!(
                target = "application::gateway",
                op = "submit",
                result = label,
                fingerprint = %key.short(),
                priority = job.priority,
                elapsed_ms = response.took().as_millis() as u64,
                "Render request served"
            ),
        }

        response
    }

    /// Become the admitter for `key` if nobody else is, and enqueue the job.
    ///
    /// With `retry_before`, a failure recorded before that instant is
    /// replaced instead of blocking admission.
    fn admit(
        &self,
        job: &JobConfig,
        key: FingerprintKey,
        retry_before: Option<OffsetDateTime>,
    ) -> Result<(), QueueError> {
        let ttl = self.policy.pending_ttl;
        let admitted = match retry_before {
            Some(cutoff) => self.store.put_pending_over_failure(&key, cutoff, ttl),
            None => self.store.put_pending(&key, ttl),
        };
        if !admitted {
            return Ok(());
        }

        let pending = PendingJob::new(job.clone(), key).with_marker_ttl(ttl);
        if let Err(error) = self.queue.push(pending) {
            self.store.remove(&key);
            return Err(error);
        }

        counter!(METRIC_ADMISSION_TOTAL).increment(1);
        debug!(
            target = "application::gateway",
            op = "admit",
            fingerprint = %key.short(),
            priority = job.priority,
            queue_depth = self.queue.len(),
            "Job admitted"
        );
        Ok(())
    }

    /// Store lookups may touch the filesystem, so they run off the async workers.
    async fn lookup(&self, key: FingerprintKey) -> Option<ResultState> {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.get(&key)).await {
            Ok(state) => state,
            Err(err) => {
                warn!(
                    target = "application::gateway",
                    op = "lookup",
                    result = "join_error",
                    fingerprint = %key.short(),
                    error = %err,
                    "Result lookup task failed; treating as miss"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::cache::MemoryResultStore;
    use crate::domain::Outcome;

    fn fast_policy() -> GatewayPolicy {
        GatewayPolicy {
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(300),
            pending_ttl: Duration::from_secs(5),
        }
    }

    fn gateway_with(queue: PriorityQueue) -> RequestGateway {
        RequestGateway::new(
            Arc::new(MemoryResultStore::new(1 << 20)),
            Arc::new(queue),
            fast_policy(),
        )
    }

    #[tokio::test]
    async fn cached_result_is_served_on_first_check() {
        let gateway = gateway_with(PriorityQueue::unbounded());
        let job = JobConfig::for_image("a.png");
        gateway.store().put_terminal(
            &fingerprint(&job),
            Outcome::success(b"cached-video".to_vec()),
            Duration::from_secs(60),
        );

        match gateway.submit(job).await {
            GatewayResponse::Rendered { bytes, cached, .. } => {
                assert!(cached);
                assert_eq!(&bytes[..], b"cached-video");
            }
            other => panic!("expected rendered, got {other:?}"),
        }
        assert!(gateway.queue().is_empty());
    }

    #[tokio::test]
    async fn failure_landing_while_waiting_is_returned_and_kept() {
        let gateway = gateway_with(PriorityQueue::unbounded());
        let job = JobConfig::for_image("a.png");
        let key = fingerprint(&job);

        let store = Arc::clone(gateway.store());
        let worker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.put_terminal(&key, Outcome::failure("bad input"), Duration::from_secs(60));
        });

        match gateway.submit(job).await {
            GatewayResponse::Failed { message, .. } => assert_eq!(message, "bad input"),
            other => panic!("expected failure, got {other:?}"),
        }
        worker.await.expect("worker task");
        assert!(matches!(
            gateway.store().get(&key),
            Some(ResultState::Failure(_))
        ));
    }

    #[tokio::test]
    async fn failure_from_before_the_request_is_retried() {
        let gateway = gateway_with(PriorityQueue::unbounded());
        let job = JobConfig::for_image("a.png");
        let key = fingerprint(&job);
        gateway
            .store()
            .put_terminal(&key, Outcome::failure("bad input"), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let response = gateway.submit(job).await;
        assert!(matches!(response, GatewayResponse::TimedOut { .. }));
        assert_eq!(gateway.queue().len(), 1);
        assert_eq!(gateway.store().get(&key), Some(ResultState::Pending));
    }

    #[tokio::test]
    async fn unserved_job_times_out_and_stays_pending() {
        let gateway = gateway_with(PriorityQueue::unbounded());
        let job = JobConfig::for_image("a.png");
        let key = fingerprint(&job);

        let started = Instant::now();
        let response = gateway.submit(job).await;
        let elapsed = started.elapsed();

        assert!(matches!(response, GatewayResponse::TimedOut { .. }));
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(300 + 200));
        assert_eq!(gateway.queue().len(), 1);
        assert_eq!(gateway.store().get(&key), Some(ResultState::Pending));
    }

    #[tokio::test]
    async fn full_queue_rolls_back_the_marker() {
        let gateway = gateway_with(PriorityQueue::new(NonZeroUsize::new(1)));
        let filler = JobConfig::for_image("filler.png");
        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), gateway.submit(filler)).await;
        assert!(abandoned.is_err());

        let job = JobConfig::for_image("a.png");
        let key = fingerprint(&job);
        match gateway.submit(job).await {
            GatewayResponse::Rejected { error, .. } => {
                assert_eq!(error, QueueError::Full { capacity: 1 })
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(gateway.store().get(&key).is_none());
    }

    #[tokio::test]
    async fn concurrent_identical_requests_enqueue_once() {
        let gateway = gateway_with(PriorityQueue::unbounded());
        let requests: Vec<_> = (0..8)
            .map(|priority| {
                let gateway = gateway.clone();
                let job = JobConfig::for_image("same.png").with_priority(priority);
                tokio::spawn(async move { gateway.submit(job).await })
            })
            .collect();

        for request in requests {
            let response = request.await.expect("request task");
            assert!(matches!(response, GatewayResponse::TimedOut { .. }));
        }
        assert_eq!(gateway.queue().len(), 1);
    }
}
