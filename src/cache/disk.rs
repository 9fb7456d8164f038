//! Result store persisted under a cache directory.
//!
//! Each terminal entry is a pair of files sharing one stem,
//! `<fingerprint>-<token>`:
//!
//! - `<stem>.bin` holds the artifact bytes (successes only)
//! - `<stem>.json` holds [`EntryMeta`] with absolute timestamps
//!
//! The token makes every write land in fresh files, so releasing an old
//! entry can never delete the files of its replacement. The metadata file is
//! written last and marks the entry as committed. Pending markers are never
//! persisted; after a restart, in-flight jobs are simply gone.

use std::collections::HashSet;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{FingerprintKey, Outcome, RenderArtifact, RenderFailure, ResultState};
use crate::util::lock::mutex_lock;

use super::index::{Evicted, EvictionCause, ExpiringIndex, Slot};
use super::store::{
    METRIC_CACHE_CORRUPT_TOTAL, METRIC_CACHE_EVICT_TOTAL, ResultStore, StoreError, StoreStats,
    expiry_after,
};

const SOURCE: &str = "cache::disk";
const META_EXTENSION: &str = "json";
const ARTIFACT_EXTENSION: &str = "bin";
const META_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum StoredState {
    Success { size_bytes: u64 },
    Failure { message: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    version: u32,
    fingerprint: String,
    #[serde(with = "time::serde::timestamp")]
    produced_at: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    expires_at: OffsetDateTime,
    #[serde(flatten)]
    state: StoredState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DiskPayload {
    Artifact {
        stem: String,
        produced_at: OffsetDateTime,
    },
    Failure {
        stem: String,
        failure: RenderFailure,
    },
    /// Persisting failed; served from memory until it leaves the index.
    Detached(Outcome),
}

impl DiskPayload {
    fn stem(&self) -> Option<&str> {
        match self {
            Self::Artifact { stem, .. } | Self::Failure { stem, .. } => Some(stem),
            Self::Detached(_) => None,
        }
    }

    fn failed_before(&self, cutoff: OffsetDateTime) -> bool {
        match self {
            Self::Failure { failure, .. }
            | Self::Detached(Outcome::Failure(failure)) => failure.produced_at < cutoff,
            Self::Artifact { .. } | Self::Detached(Outcome::Success(_)) => false,
        }
    }
}

struct LoadedEntry {
    key: FingerprintKey,
    payload: DiskPayload,
    size: u64,
    produced_at: OffsetDateTime,
    expires_at: OffsetDateTime,
}

enum ScanResult {
    Live(LoadedEntry),
    Expired,
    Corrupt(String),
}

#[derive(Debug, Default)]
struct ScanReport {
    loaded: usize,
    expired: usize,
    corrupt: usize,
    stray: usize,
}

pub struct DiskResultStore {
    root: PathBuf,
    index: Mutex<ExpiringIndex<DiskPayload>>,
}

impl DiskResultStore {
    /// Open (creating if needed) the store at `root`, loading every live entry
    /// and deleting expired, corrupt or orphaned files.
    pub fn open(root: impl AsRef<Path>, capacity_bytes: u64) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        let directory_error = |source| StoreError::Directory {
            path: root.clone(),
            source,
        };
        fs::create_dir_all(&root).map_err(directory_error)?;

        let now = OffsetDateTime::now_utc();
        let mut report = ScanReport::default();
        let mut live = Vec::new();
        let mut others = Vec::new();

        for entry in fs::read_dir(&root).map_err(directory_error)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(err) => {
                    warn!(
                        target = "cache::disk",
                        op = "open",
                        result = "dir_entry_error",
                        error = %err,
                        "Skipping unreadable cache directory entry"
                    );
                    continue;
                }
            };
            if path.extension().and_then(|ext| ext.to_str()) != Some(META_EXTENSION) {
                others.push(path);
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                others.push(path);
                continue;
            };

            match scan_entry(&root, stem, now) {
                ScanResult::Live(entry) => live.push(entry),
                ScanResult::Expired => {
                    report.expired += 1;
                    remove_files(&root, stem);
                }
                ScanResult::Corrupt(reason) => {
                    report.corrupt += 1;
                    counter!(METRIC_CACHE_CORRUPT_TOTAL).increment(1);
                    warn!(
                        target = "cache::disk",
                        op = "open",
                        result = "corrupt_entry",
                        stem,
                        reason = %reason,
                        "Discarding unreadable cache entry"
                    );
                    remove_files(&root, stem);
                }
            }
        }

        // Oldest first, so recency order matches production order.
        live.sort_by_key(|entry| entry.produced_at);
        let live_stems: HashSet<String> = live
            .iter()
            .filter_map(|entry| entry.payload.stem().map(str::to_owned))
            .collect();

        for path in others {
            let keep = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .is_some_and(|stem| live_stems.contains(stem))
                && path.extension().and_then(|ext| ext.to_str()) == Some(ARTIFACT_EXTENSION);
            if !keep && path.is_file() {
                report.stray += 1;
                remove_file_quietly(&path);
            }
        }

        let mut index = ExpiringIndex::new(capacity_bytes);
        for entry in live {
            report.loaded += 1;
            index.insert_terminal(entry.key, entry.payload, entry.size, entry.expires_at, now);
        }
        let evicted = index.take_evicted();

        let store = Self {
            root,
            index: Mutex::new(index),
        };
        report.loaded = report.loaded.saturating_sub(evicted.len());
        store.release(evicted);

        info!(
            target = "cache::disk",
            op = "open",
            root = %store.root.display(),
            loaded = report.loaded,
            expired = report.expired,
            corrupt = report.corrupt,
            stray = report.stray,
            "Scanned result cache directory"
        );
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn persist(
        &self,
        key: &FingerprintKey,
        outcome: &Outcome,
        expires_at: OffsetDateTime,
    ) -> io::Result<DiskPayload> {
        let stem = format!("{}-{}", key.to_hex(), Uuid::new_v4().simple());
        let artifact_path = stem_path(&self.root, &stem, ARTIFACT_EXTENSION);

        let (state, payload) = match outcome {
            Outcome::Success(artifact) => {
                write_atomic(&self.root, &artifact_path, &artifact.bytes)?;
                (
                    StoredState::Success {
                        size_bytes: artifact.bytes.len() as u64,
                    },
                    DiskPayload::Artifact {
                        stem: stem.clone(),
                        produced_at: artifact.produced_at,
                    },
                )
            }
            Outcome::Failure(failure) => (
                StoredState::Failure {
                    message: failure.message.clone(),
                },
                DiskPayload::Failure {
                    stem: stem.clone(),
                    failure: failure.clone(),
                },
            ),
        };

        let meta = EntryMeta {
            version: META_VERSION,
            fingerprint: key.to_hex(),
            produced_at: outcome.produced_at(),
            expires_at,
            state,
        };
        let committed = serde_json::to_vec_pretty(&meta)
            .map_err(io::Error::other)
            .and_then(|encoded| {
                write_atomic(
                    &self.root,
                    &stem_path(&self.root, &stem, META_EXTENSION),
                    &encoded,
                )
            });
        if let Err(err) = committed {
            remove_file_quietly(&artifact_path);
            return Err(err);
        }
        Ok(payload)
    }

    fn read_artifact(
        &self,
        key: &FingerprintKey,
        stem: &str,
        produced_at: OffsetDateTime,
    ) -> Option<ResultState> {
        let path = stem_path(&self.root, stem, ARTIFACT_EXTENSION);
        match fs::read(&path) {
            Ok(bytes) => Some(ResultState::Success(RenderArtifact {
                bytes: Bytes::from(bytes),
                produced_at,
            })),
            Err(err) => {
                counter!(METRIC_CACHE_CORRUPT_TOTAL).increment(1);
                warn!(
                    target = "cache::disk",
                    op = "get",
                    result = "artifact_unreadable",
                    fingerprint = %key.short(),
                    path = %path.display(),
                    error = %err,
                    "Cached artifact unreadable; treating as miss"
                );
                let dropped = mutex_lock(&self.index, SOURCE, "get.drop_corrupt").remove_if(
                    key,
                    |payload| payload.stem() == Some(stem),
                );
                if dropped.is_some() {
                    remove_files(&self.root, stem);
                }
                None
            }
        }
    }

    fn release(&self, evicted: Vec<Evicted<DiskPayload>>) {
        for entry in evicted {
            if entry.cause != EvictionCause::Replaced {
                counter!(METRIC_CACHE_EVICT_TOTAL, "cause" => entry.cause.as_str()).increment(1);
            }
            debug!(
                target = "cache::disk",
                op = "evict",
                fingerprint = %entry.key.short(),
                cause = entry.cause.as_str(),
                "Dropped result entry"
            );
            if let Some(stem) = entry.payload.as_ref().and_then(DiskPayload::stem) {
                remove_files(&self.root, stem);
            }
        }
    }
}

impl ResultStore for DiskResultStore {
    fn get(&self, key: &FingerprintKey) -> Option<ResultState> {
        let now = OffsetDateTime::now_utc();
        let (slot, evicted) = {
            let mut index = mutex_lock(&self.index, SOURCE, "get");
            let slot = index.get(key, now).cloned();
            (slot, index.take_evicted())
        };
        self.release(evicted);

        match slot? {
            Slot::Pending => Some(ResultState::Pending),
            Slot::Terminal(DiskPayload::Artifact { stem, produced_at }) => {
                self.read_artifact(key, &stem, produced_at)
            }
            Slot::Terminal(DiskPayload::Failure { failure, .. }) => {
                Some(ResultState::Failure(failure))
            }
            Slot::Terminal(DiskPayload::Detached(outcome)) => Some(outcome.into()),
        }
    }

    fn put_pending(&self, key: &FingerprintKey, ttl: Duration) -> bool {
        let now = OffsetDateTime::now_utc();
        let (admitted, evicted) = {
            let mut index = mutex_lock(&self.index, SOURCE, "put_pending");
            let admitted = index.insert_pending(*key, expiry_after(now, ttl), now);
            (admitted, index.take_evicted())
        };
        self.release(evicted);
        admitted
    }

    fn put_pending_over_failure(
        &self,
        key: &FingerprintKey,
        failed_before: OffsetDateTime,
        ttl: Duration,
    ) -> bool {
        let now = OffsetDateTime::now_utc();
        let (admitted, replaced, evicted) = {
            let mut index = mutex_lock(&self.index, SOURCE, "put_pending_over_failure");
            let (admitted, replaced) =
                index.replace_with_pending(*key, expiry_after(now, ttl), now, |payload| {
                    payload.failed_before(failed_before)
                });
            (admitted, replaced, index.take_evicted())
        };
        if let Some(stem) = replaced.as_ref().and_then(DiskPayload::stem) {
            remove_files(&self.root, stem);
        }
        self.release(evicted);
        admitted
    }

    fn refresh_pending(&self, key: &FingerprintKey, ttl: Duration) -> bool {
        let now = OffsetDateTime::now_utc();
        let (refreshed, evicted) = {
            let mut index = mutex_lock(&self.index, SOURCE, "refresh_pending");
            let refreshed = index.extend_pending(key, expiry_after(now, ttl), now);
            (refreshed, index.take_evicted())
        };
        self.release(evicted);
        refreshed
    }

    fn put_terminal(&self, key: &FingerprintKey, outcome: Outcome, ttl: Duration) {
        let now = OffsetDateTime::now_utc();
        let expires_at = expiry_after(now, ttl);
        let size = outcome.size_bytes();

        let payload = match self.persist(key, &outcome, expires_at) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    target = "cache::disk",
                    op = "put_terminal",
                    result = "persist_failed",
                    fingerprint = %key.short(),
                    error = %err,
                    "Failed to persist result; keeping it in memory"
                );
                DiskPayload::Detached(outcome)
            }
        };

        let evicted = {
            let mut index = mutex_lock(&self.index, SOURCE, "put_terminal");
            index.insert_terminal(*key, payload, size, expires_at, now);
            index.take_evicted()
        };
        self.release(evicted);
    }

    fn remove(&self, key: &FingerprintKey) {
        let removed = mutex_lock(&self.index, SOURCE, "remove").remove(key);
        if let Some(stem) = removed.as_ref().and_then(DiskPayload::stem) {
            remove_files(&self.root, stem);
        }
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

fn scan_entry(root: &Path, stem: &str, now: OffsetDateTime) -> ScanResult {
    let raw = match fs::read(stem_path(root, stem, META_EXTENSION)) {
        Ok(raw) => raw,
        Err(err) => return ScanResult::Corrupt(format!("metadata unreadable: {err}")),
    };
    let meta: EntryMeta = match serde_json::from_slice(&raw) {
        Ok(meta) => meta,
        Err(err) => return ScanResult::Corrupt(format!("metadata malformed: {err}")),
    };
    if meta.version != META_VERSION {
        return ScanResult::Corrupt(format!("unsupported metadata version {}", meta.version));
    }
    let key: FingerprintKey = match meta.fingerprint.parse() {
        Ok(key) => key,
        Err(err) => return ScanResult::Corrupt(err.to_string()),
    };
    if !stem.starts_with(&meta.fingerprint) {
        return ScanResult::Corrupt("file name does not match fingerprint".to_string());
    }
    if meta.expires_at <= now {
        return ScanResult::Expired;
    }

    let (payload, size) = match meta.state {
        StoredState::Success { size_bytes } => {
            let artifact = stem_path(root, stem, ARTIFACT_EXTENSION);
            match fs::metadata(&artifact) {
                Ok(found) if found.len() == size_bytes => {}
                Ok(found) => {
                    return ScanResult::Corrupt(format!(
                        "artifact is {} bytes, expected {size_bytes}",
                        found.len()
                    ));
                }
                Err(err) => return ScanResult::Corrupt(format!("artifact missing: {err}")),
            }
            (
                DiskPayload::Artifact {
                    stem: stem.to_string(),
                    produced_at: meta.produced_at,
                },
                size_bytes,
            )
        }
        StoredState::Failure { message } => {
            let size = message.len() as u64;
            (
                DiskPayload::Failure {
                    stem: stem.to_string(),
                    failure: RenderFailure {
                        message,
                        produced_at: meta.produced_at,
                    },
                },
                size,
            )
        }
    };

    ScanResult::Live(LoadedEntry {
        key,
        payload,
        size,
        produced_at: meta.produced_at,
        expires_at: meta.expires_at,
    })
}

fn stem_path(root: &Path, stem: &str, extension: &str) -> PathBuf {
    root.join(format!("{stem}.{extension}"))
}

fn write_atomic(dir: &Path, target: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(target).map_err(|err| err.error)?;
    Ok(())
}

fn remove_files(root: &Path, stem: &str) {
    remove_file_quietly(&stem_path(root, stem, META_EXTENSION));
    remove_file_quietly(&stem_path(root, stem, ARTIFACT_EXTENSION));
}

fn remove_file_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            warn!(
                target = "cache::disk",
                op = "remove_file",
                result = "io_error",
                path = %path.display(),
                error = %err,
                "Failed to delete cache file"
            );
        }
    }
}
