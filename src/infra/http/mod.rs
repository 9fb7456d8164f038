mod health;
mod middleware;
mod render;

use std::num::NonZeroUsize;
use std::sync::Arc;

use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use tokio::sync::Semaphore;

use crate::application::RequestGateway;

pub use middleware::RequestContext;

/// Shared state behind every route.
#[derive(Clone)]
pub struct HttpState {
    pub gateway: RequestGateway,
    pub workers: usize,
    pub inflight: InflightLimit,
}

impl HttpState {
    pub fn new(gateway: RequestGateway, workers: usize, max_inflight: NonZeroUsize) -> Self {
        Self {
            gateway,
            workers,
            inflight: InflightLimit::new(max_inflight),
        }
    }
}

/// Upper bound on render requests being served at once.
#[derive(Clone)]
pub struct InflightLimit {
    permits: Arc<Semaphore>,
    max: usize,
}

impl InflightLimit {
    pub fn new(max: NonZeroUsize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max.get())),
            max: max.get(),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn in_use(&self) -> usize {
        self.max - self.permits.available_permits()
    }
}

pub fn build_router(state: HttpState) -> Router {
    let render_routes = Router::new()
        .route("/render", post(render::render_job))
        .route_layer(from_fn_with_state(state.clone(), middleware::limit_inflight));

    Router::new()
        .merge(render_routes)
        .route("/health", get(health::health))
        .with_state(state)
        .layer(from_fn(middleware::log_responses))
        .layer(from_fn(middleware::set_request_context))
}
