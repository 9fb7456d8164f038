//! The result store contract shared by the gateway and the worker pool.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::{FingerprintKey, Outcome, ResultState};

pub(crate) const METRIC_CACHE_EVICT_TOTAL: &str = "depthcast_cache_evict_total";
pub(crate) const METRIC_CACHE_CORRUPT_TOTAL: &str = "depthcast_cache_corrupt_total";

/// Size-bounded, expiring map from fingerprint to [`ResultState`].
///
/// Every operation is safe under arbitrary interleaving of worker threads and
/// gateway tasks. Implementations fail open: an entry that cannot be read
/// back is reported as absent rather than as an error.
pub trait ResultStore: Send + Sync {
    /// Current state for `key`, or `None` on miss or expiry.
    fn get(&self, key: &FingerprintKey) -> Option<ResultState>;

    /// Insert a pending marker if no live entry exists.
    ///
    /// Returns `true` when this caller became the admitter. The check and the
    /// insert happen under one lock.
    fn put_pending(&self, key: &FingerprintKey, ttl: Duration) -> bool;

    /// Like [`put_pending`](Self::put_pending), but a failure recorded before
    /// `failed_before` counts as absent and is replaced by the marker.
    ///
    /// Failures recorded at or after `failed_before` stay in place for the
    /// requests that were already waiting on them.
    fn put_pending_over_failure(
        &self,
        key: &FingerprintKey,
        failed_before: OffsetDateTime,
        ttl: Duration,
    ) -> bool;

    /// Keep the pending marker for `key` alive for at least another `ttl`.
    ///
    /// Returns `false` when `key` no longer holds a pending marker; nothing
    /// is inserted in that case.
    fn refresh_pending(&self, key: &FingerprintKey, ttl: Duration) -> bool;

    /// Record the terminal outcome for `key`, replacing whatever was there.
    fn put_terminal(&self, key: &FingerprintKey, outcome: Outcome, ttl: Duration);

    fn remove(&self, key: &FingerprintKey);

    fn stats(&self) -> StoreStats;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub entries: usize,
    pub pending: usize,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
}

/// Raised while opening a store; runtime failures degrade to misses instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to prepare cache directory `{path}`: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Absolute expiry `ttl` from `now`, saturating far in the future.
pub(crate) fn expiry_after(now: OffsetDateTime, ttl: Duration) -> OffsetDateTime {
    time::Duration::try_from(ttl)
        .ok()
        .and_then(|ttl| now.checked_add(ttl))
        .unwrap_or_else(|| time::PrimitiveDateTime::MAX.assume_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_saturates_on_overflow() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            expiry_after(now, Duration::from_secs(30)),
            now + time::Duration::seconds(30)
        );
        assert_eq!(
            expiry_after(now, Duration::MAX),
            time::PrimitiveDateTime::MAX.assume_utc()
        );
    }
}
