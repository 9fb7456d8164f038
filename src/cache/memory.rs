//! In-process result store.

use std::sync::Mutex;
use std::time::Duration;

use metrics::counter;
use time::OffsetDateTime;
use tracing::debug;

use crate::domain::{FingerprintKey, Outcome, ResultState};
use crate::util::lock::mutex_lock;

use super::index::{Evicted, EvictionCause, ExpiringIndex, Slot};
use super::store::{METRIC_CACHE_EVICT_TOTAL, ResultStore, StoreStats, expiry_after};

const SOURCE: &str = "cache::memory";

/// Keeps every entry in memory behind one mutex.
pub struct MemoryResultStore {
    index: Mutex<ExpiringIndex<Outcome>>,
}

impl MemoryResultStore {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            index: Mutex::new(ExpiringIndex::new(capacity_bytes)),
        }
    }
}

impl ResultStore for MemoryResultStore {
    fn get(&self, key: &FingerprintKey) -> Option<ResultState> {
        let now = OffsetDateTime::now_utc();
        let (state, evicted) = {
            let mut index = mutex_lock(&self.index, SOURCE, "get");
            let state = index.get(key, now).map(|slot| match slot {
                Slot::Pending => ResultState::Pending,
                Slot::Terminal(outcome) => ResultState::from(outcome.clone()),
            });
            (state, index.take_evicted())
        };
        record_evictions(&evicted);
        state
    }

    fn put_pending(&self, key: &FingerprintKey, ttl: Duration) -> bool {
        let now = OffsetDateTime::now_utc();
        let (admitted, evicted) = {
            let mut index = mutex_lock(&self.index, SOURCE, "put_pending");
            let admitted = index.insert_pending(*key, expiry_after(now, ttl), now);
            (admitted, index.take_evicted())
        };
        record_evictions(&evicted);
        admitted
    }

    fn put_pending_over_failure(
        &self,
        key: &FingerprintKey,
        failed_before: OffsetDateTime,
        ttl: Duration,
    ) -> bool {
        let now = OffsetDateTime::now_utc();
        let (admitted, evicted) = {
            let mut index = mutex_lock(&self.index, SOURCE, "put_pending_over_failure");
            let (admitted, _) =
                index.replace_with_pending(*key, expiry_after(now, ttl), now, |outcome| {
                    matches!(
                        outcome,
                        Outcome::Failure(failure) if failure.produced_at < failed_before
                    )
                });
            (admitted, index.take_evicted())
        };
        record_evictions(&evicted);
        admitted
    }

    fn refresh_pending(&self, key: &FingerprintKey, ttl: Duration) -> bool {
        let now = OffsetDateTime::now_utc();
        let (refreshed, evicted) = {
            let mut index = mutex_lock(&self.index, SOURCE, "refresh_pending");
            let refreshed = index.extend_pending(key, expiry_after(now, ttl), now);
            (refreshed, index.take_evicted())
        };
        record_evictions(&evicted);
        refreshed
    }

    fn put_terminal(&self, key: &FingerprintKey, outcome: Outcome, ttl: Duration) {
        let now = OffsetDateTime::now_utc();
        let size = outcome.size_bytes();
        let evicted = {
            let mut index = mutex_lock(&self.index, SOURCE, "put_terminal");
            index.insert_terminal(*key, outcome, size, expiry_after(now, ttl), now);
            index.take_evicted()
        };
        record_evictions(&evicted);
    }

    fn remove(&self, key: &FingerprintKey) {
        mutex_lock(&self.index, SOURCE, "remove").remove(key);
    }

    fn stats(&self) -> StoreStats {
        let index = mutex_lock(&self.index, SOURCE, "stats");
        StoreStats {
            entries: index.len(),
            pending: index.pending_len(),
            used_bytes: index.used_bytes(),
            capacity_bytes: index.capacity_bytes(),
        }
    }
}

fn record_evictions<T>(evicted: &[Evicted<T>]) {
    for entry in evicted {
        if entry.cause == EvictionCause::Replaced {
            continue;
        }
        counter!(METRIC_CACHE_EVICT_TOTAL, "cause" => entry.cause.as_str()).increment(1);
        debug!(
            target = "cache::memory",
            op = "evict",
            fingerprint = %entry.key.short(),
            cause = entry.cause.as_str(),
            "Dropped result entry"
        );
    }
}
