mod support;

use std::sync::Arc;

use bytes::Bytes;
use depthcast::application::{GatewayResponse, RenderError};
use depthcast::cache::{ResultStore, StoreConfig};
use depthcast_api_types::JobConfig;
use tempfile::TempDir;

use support::{Broker, CountingRenderer, fast_policy};

fn open(dir: &TempDir) -> Arc<dyn ResultStore> {
    StoreConfig {
        capacity_bytes: 1 << 20,
        directory: Some(dir.path().to_path_buf()),
    }
    .open()
    .expect("open disk store")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rendered_videos_survive_a_restart() {
    let dir = TempDir::new().expect("temp dir");
    let job = JobConfig::for_image("persisted.png");

    let first_run = CountingRenderer::default();
    {
        let broker = Broker::with_store(
            1,
            None,
            fast_policy(),
            open(&dir),
            Arc::new(first_run.clone()),
        );
        match broker.gateway.submit(job.clone()).await {
            GatewayResponse::Rendered { cached, .. } => assert!(!cached),
            other => panic!("expected a rendered video, got {other:?}"),
        }
        broker.pool.shutdown();
    }
    assert_eq!(first_run.calls(), 1);

    let second_run = CountingRenderer::default();
    let broker = Broker::with_store(
        1,
        None,
        fast_policy(),
        open(&dir),
        Arc::new(second_run.clone()),
    );
    assert_eq!(broker.store.stats().entries, 1);
    match broker.gateway.submit(job).await {
        GatewayResponse::Rendered { bytes, cached, .. } => {
            assert!(cached);
            assert_eq!(&bytes[..], b"video:persisted.png");
        }
        other => panic!("expected a cached video, got {other:?}"),
    }
    assert_eq!(second_run.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failures_are_not_replayed_after_a_restart() {
    let dir = TempDir::new().expect("temp dir");
    let failing =
        |_: &JobConfig| -> Result<Bytes, RenderError> { Err(RenderError::rejected("no depth")) };
    let job = JobConfig::for_image("broken.png");

    {
        let broker = Broker::with_store(1, None, fast_policy(), open(&dir), Arc::new(failing));
        assert!(matches!(
            broker.gateway.submit(job.clone()).await,
            GatewayResponse::Failed { .. }
        ));
        broker.pool.shutdown();
    }

    let renderer = CountingRenderer::default();
    let broker = Broker::with_store(
        1,
        None,
        fast_policy(),
        open(&dir),
        Arc::new(renderer.clone()),
    );
    match broker.gateway.submit(job).await {
        GatewayResponse::Rendered { cached, .. } => assert!(!cached),
        other => panic!("expected a fresh render, got {other:?}"),
    }
    assert_eq!(renderer.calls(), 1);
}
