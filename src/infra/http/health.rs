use axum::{Json, extract::State};
use serde::Serialize;

use super::HttpState;

#[derive(Debug, Serialize)]
pub(super) struct HealthReport {
    status: &'static str,
    workers: usize,
    queue_depth: usize,
    queue_capacity: Option<usize>,
    inflight_requests: usize,
    cache_entries: usize,
    cache_pending: usize,
    cache_used_bytes: u64,
    cache_capacity_bytes: u64,
}

pub(super) async fn health(State(state): State<HttpState>) -> Json<HealthReport> {
    let queue = state.gateway.queue();
    let stats = state.gateway.store().stats();
    let status = if queue.is_closed() { "draining" } else { "ok" };

    Json(HealthReport {
        status,
        workers: state.workers,
        queue_depth: queue.len(),
        queue_capacity: queue.capacity().map(|capacity| capacity.get()),
        inflight_requests: state.inflight.in_use(),
        cache_entries: stats.entries,
        cache_pending: stats.pending,
        cache_used_bytes: stats.used_bytes,
        cache_capacity_bytes: stats.capacity_bytes,
    })
}
