mod support;

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use depthcast::application::{
    GatewayPolicy, GatewayResponse, PendingJob, PriorityQueue, RenderError, RequestGateway,
};
use depthcast::cache::{MemoryResultStore, ResultStore};
use depthcast::domain::{Outcome, fingerprint};
use depthcast_api_types::JobConfig;
use metrics_util::debugging::DebuggingRecorder;
use serial_test::serial;

use support::{Broker, fast_policy};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn broker_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // Render success, render failure, cache hit and miss
    let renderer = |job: &JobConfig| -> Result<Bytes, RenderError> {
        if job.input.image == "broken.png" {
            Err(RenderError::rejected("bad depth map"))
        } else {
            Ok(Bytes::from_static(b"video"))
        }
    };
    let broker = Broker::start(1, fast_policy(), Arc::new(renderer));
    let ok = JobConfig::for_image("ok.png");
    assert!(matches!(
        broker.gateway.submit(ok.clone()).await,
        GatewayResponse::Rendered { cached: false, .. }
    ));
    assert!(matches!(
        broker.gateway.submit(ok).await,
        GatewayResponse::Rendered { cached: true, .. }
    ));
    assert!(matches!(
        broker
            .gateway
            .submit(JobConfig::for_image("broken.png"))
            .await,
        GatewayResponse::Failed { .. }
    ));

    // Timeout with nobody draining the queue
    let idle_store: Arc<dyn ResultStore> = Arc::new(MemoryResultStore::new(1 << 20));
    let idle_queue = Arc::new(PriorityQueue::new(NonZeroUsize::new(1)));
    let idle = RequestGateway::new(
        Arc::clone(&idle_store),
        Arc::clone(&idle_queue),
        GatewayPolicy {
            timeout: Duration::from_millis(50),
            ..fast_policy()
        },
    );
    assert!(matches!(
        idle.submit(JobConfig::for_image("stuck.png")).await,
        GatewayResponse::TimedOut { .. }
    ));

    // Queue rejection
    let overflow = JobConfig::for_image("overflow.png");
    let key = fingerprint(&overflow);
    assert!(idle_queue.push(PendingJob::new(overflow, key)).is_err());

    // Byte-budget eviction
    let tiny = MemoryResultStore::new(8);
    let first = fingerprint(&JobConfig::for_image("first.png"));
    let second = fingerprint(&JobConfig::for_image("second.png"));
    tiny.put_terminal(&first, Outcome::success(vec![0u8; 6]), Duration::from_secs(60));
    tiny.put_terminal(&second, Outcome::success(vec![0u8; 6]), Duration::from_secs(60));
    assert!(tiny.get(&first).is_none());

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "depthcast_cache_hit_total",
        "depthcast_cache_miss_total",
        "depthcast_cache_evict_total",
        "depthcast_admission_total",
        "depthcast_queue_depth",
        "depthcast_queue_rejected_total",
        "depthcast_queue_wait_ms",
        "depthcast_render_total",
        "depthcast_render_ms",
        "depthcast_gateway_timeout_total",
        "depthcast_gateway_request_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
