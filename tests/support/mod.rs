//! Shared harness for the broker integration tests.
#![allow(dead_code)]

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use depthcast::application::{
    GatewayPolicy, PriorityQueue, RenderError, Renderer, RequestGateway, WorkerPool,
};
use depthcast::cache::{MemoryResultStore, ResultStore};
use depthcast_api_types::JobConfig;

pub struct Broker {
    pub gateway: RequestGateway,
    pub store: Arc<dyn ResultStore>,
    pub queue: Arc<PriorityQueue>,
    pub pool: WorkerPool,
}

impl Broker {
    pub fn start(workers: usize, policy: GatewayPolicy, renderer: Arc<dyn Renderer>) -> Self {
        let store: Arc<dyn ResultStore> = Arc::new(MemoryResultStore::new(64 << 20));
        Self::with_store(workers, None, policy, store, renderer)
    }

    pub fn with_store(
        workers: usize,
        queue_capacity: Option<usize>,
        policy: GatewayPolicy,
        store: Arc<dyn ResultStore>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        let queue = Arc::new(PriorityQueue::new(
            queue_capacity.and_then(NonZeroUsize::new),
        ));
        let pool = WorkerPool::spawn(
            NonZeroUsize::new(workers).expect("at least one worker"),
            Arc::clone(&queue),
            Arc::clone(&store),
            renderer,
        )
        .expect("spawn worker pool");
        let gateway = RequestGateway::new(Arc::clone(&store), Arc::clone(&queue), policy);
        Self {
            gateway,
            store,
            queue,
            pool,
        }
    }
}

pub fn fast_policy() -> GatewayPolicy {
    GatewayPolicy {
        poll_interval: Duration::from_millis(10),
        timeout: Duration::from_secs(5),
        pending_ttl: Duration::from_secs(5),
    }
}

/// Renderer that sleeps, counts its calls and echoes the image name back.
#[derive(Clone, Default)]
pub struct CountingRenderer {
    pub calls: Arc<AtomicUsize>,
    pub delay: Duration,
}

impl CountingRenderer {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            delay,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Renderer for CountingRenderer {
    fn render(&self, job: &JobConfig) -> Result<Bytes, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Ok(Bytes::from(format!("video:{}", job.input.image)))
    }
}
