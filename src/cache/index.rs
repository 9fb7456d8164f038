//! Byte-bounded LRU index with absolute expiry.
//!
//! Shared bookkeeping for every [`ResultStore`](super::ResultStore)
//! implementation. The index tracks recency, expiry and size; what a
//! terminal entry actually carries is up to the store (`T`).
//!
//! Entries that leave the index because they expired or were evicted for
//! space are parked in an eviction buffer so the owning store can release
//! whatever backs them (files on disk, for example) after dropping its lock.

use lru::LruCache;
use time::OffsetDateTime;

use crate::domain::FingerprintKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Slot<T> {
    Pending,
    Terminal(T),
}

#[derive(Debug)]
struct Entry<T> {
    slot: Slot<T>,
    size: u64,
    expires_at: OffsetDateTime,
}

impl<T> Entry<T> {
    fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }
}

/// Why an entry left the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EvictionCause {
    Expired,
    Capacity,
    Replaced,
}

impl EvictionCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Capacity => "capacity",
            Self::Replaced => "replaced",
        }
    }
}

#[derive(Debug)]
pub(crate) struct Evicted<T> {
    pub key: FingerprintKey,
    pub payload: Option<T>,
    pub cause: EvictionCause,
}

pub(crate) struct ExpiringIndex<T> {
    entries: LruCache<FingerprintKey, Entry<T>>,
    used_bytes: u64,
    capacity_bytes: u64,
    evicted: Vec<Evicted<T>>,
}

impl<T> ExpiringIndex<T> {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            used_bytes: 0,
            capacity_bytes,
            evicted: Vec::new(),
        }
    }

    /// Look up `key`, dropping it first if it has expired. Promotes the entry.
    pub fn get(&mut self, key: &FingerprintKey, now: OffsetDateTime) -> Option<&Slot<T>> {
        self.expire_key(key, now);
        self.entries.get(key).map(|entry| &entry.slot)
    }

    /// Insert a pending marker unless a live entry already exists.
    pub fn insert_pending(
        &mut self,
        key: FingerprintKey,
        expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> bool {
        self.expire_key(&key, now);
        if self.entries.contains(&key) {
            return false;
        }
        self.entries.put(
            key,
            Entry {
                slot: Slot::Pending,
                size: 0,
                expires_at,
            },
        );
        true
    }

    /// Like [`insert_pending`](Self::insert_pending), but a terminal entry
    /// accepted by `stale` is taken out first and handed back.
    pub fn replace_with_pending(
        &mut self,
        key: FingerprintKey,
        expires_at: OffsetDateTime,
        now: OffsetDateTime,
        stale: impl FnOnce(&T) -> bool,
    ) -> (bool, Option<T>) {
        self.expire_key(&key, now);
        let replaced = self.remove_if(&key, stale);
        (self.insert_pending(key, expires_at, now), replaced)
    }

    /// Push a live pending marker's expiry out to `expires_at` (never
    /// earlier). Returns `false` when `key` holds no pending marker.
    pub fn extend_pending(
        &mut self,
        key: &FingerprintKey,
        expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> bool {
        self.expire_key(key, now);
        match self.entries.peek_mut(key) {
            Some(entry) if matches!(entry.slot, Slot::Pending) => {
                entry.expires_at = entry.expires_at.max(expires_at);
                true
            }
            _ => false,
        }
    }

    /// Insert or replace a terminal entry, then bring the index back under
    /// capacity. A replaced terminal payload lands in the eviction buffer. An
    /// entry larger than the whole capacity is still kept once every other
    /// terminal entry has been evicted.
    pub fn insert_terminal(
        &mut self,
        key: FingerprintKey,
        payload: T,
        size: u64,
        expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) {
        if let Some(previous) = self.entries.pop(&key) {
            self.used_bytes = self.used_bytes.saturating_sub(previous.size);
            if let Slot::Terminal(replaced) = previous.slot {
                self.evicted.push(Evicted {
                    key,
                    payload: Some(replaced),
                    cause: EvictionCause::Replaced,
                });
            }
        }
        self.entries.put(
            key,
            Entry {
                slot: Slot::Terminal(payload),
                size,
                expires_at,
            },
        );
        self.used_bytes = self.used_bytes.saturating_add(size);
        self.enforce_capacity(&key, now);
    }

    /// Remove `key` and hand back its terminal payload, if any.
    pub fn remove(&mut self, key: &FingerprintKey) -> Option<T> {
        let entry = self.entries.pop(key)?;
        self.used_bytes = self.used_bytes.saturating_sub(entry.size);
        match entry.slot {
            Slot::Pending => None,
            Slot::Terminal(payload) => Some(payload),
        }
    }

    /// Remove `key` only while its terminal payload still satisfies `matches`.
    pub fn remove_if(
        &mut self,
        key: &FingerprintKey,
        matches: impl FnOnce(&T) -> bool,
    ) -> Option<T> {
        let current = match self.entries.peek(key).map(|entry| &entry.slot) {
            Some(Slot::Terminal(payload)) => matches(payload),
            _ => false,
        };
        if current { self.remove(key) } else { None }
    }

    /// Drop every expired entry.
    pub fn purge_expired(&mut self, now: OffsetDateTime) {
        let expired: Vec<FingerprintKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            self.evict(key, EvictionCause::Expired);
        }
    }

    pub fn take_evicted(&mut self) -> Vec<Evicted<T>> {
        std::mem::take(&mut self.evicted)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn pending_len(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, entry)| matches!(entry.slot, Slot::Pending))
            .count()
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    fn expire_key(&mut self, key: &FingerprintKey, now: OffsetDateTime) {
        let expired = self
            .entries
            .peek(key)
            .is_some_and(|entry| entry.is_expired(now));
        if expired {
            self.evict(*key, EvictionCause::Expired);
        }
    }

    fn enforce_capacity(&mut self, keep: &FingerprintKey, now: OffsetDateTime) {
        if self.used_bytes <= self.capacity_bytes {
            return;
        }

        self.purge_expired(now);

        while self.used_bytes > self.capacity_bytes {
            // Iteration runs from most to least recently used.
            let victim = self
                .entries
                .iter()
                .rev()
                .find(|(key, entry)| *key != keep && matches!(entry.slot, Slot::Terminal(_)))
                .map(|(key, _)| *key);
            match victim {
                Some(key) => self.evict(key, EvictionCause::Capacity),
                None => break,
            }
        }
    }

    fn evict(&mut self, key: FingerprintKey, cause: EvictionCause) {
        let Some(entry) = self.entries.pop(&key) else {
            return;
        };
        self.used_bytes = self.used_bytes.saturating_sub(entry.size);
        let payload = match entry.slot {
            Slot::Pending => None,
            Slot::Terminal(payload) => Some(payload),
        };
        self.evicted.push(Evicted {
            key,
            payload,
            cause,
        });
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;

    fn key(byte: u8) -> FingerprintKey {
        FingerprintKey::from_bytes([byte; 32])
    }

    fn later(now: OffsetDateTime) -> OffsetDateTime {
        now + Duration::hours(1)
    }

    #[test]
    fn pending_insert_is_exclusive() {
        let now = OffsetDateTime::now_utc();
        let mut index: ExpiringIndex<&str> = ExpiringIndex::new(100);

        assert!(index.insert_pending(key(1), later(now), now));
        assert!(!index.insert_pending(key(1), later(now), now));
        assert_eq!(index.pending_len(), 1);
    }

    #[test]
    fn expired_pending_can_be_readmitted() {
        let now = OffsetDateTime::now_utc();
        let mut index: ExpiringIndex<&str> = ExpiringIndex::new(100);

        assert!(index.insert_pending(key(1), now + Duration::seconds(1), now));
        let after = now + Duration::seconds(2);
        assert!(index.get(&key(1), after).is_none());
        assert!(index.insert_pending(key(1), later(after), after));

        let evicted = index.take_evicted();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].cause, EvictionCause::Expired);
        assert!(evicted[0].payload.is_none());
    }

    #[test]
    fn terminal_overwrites_pending_and_tracks_bytes() {
        let now = OffsetDateTime::now_utc();
        let mut index = ExpiringIndex::new(100);

        index.insert_pending(key(1), later(now), now);
        index.insert_terminal(key(1), "done", 40, later(now), now);

        assert_eq!(index.get(&key(1), now), Some(&Slot::Terminal("done")));
        assert_eq!(index.used_bytes(), 40);
        assert_eq!(index.pending_len(), 0);

        index.insert_terminal(key(1), "again", 10, later(now), now);
        assert_eq!(index.used_bytes(), 10);

        let evicted = index.take_evicted();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].cause, EvictionCause::Replaced);
        assert_eq!(evicted[0].payload, Some("done"));
    }

    #[test]
    fn evicts_least_recently_used_terminal_first() {
        let now = OffsetDateTime::now_utc();
        let mut index = ExpiringIndex::new(100);

        index.insert_terminal(key(1), "one", 40, later(now), now);
        index.insert_terminal(key(2), "two", 40, later(now), now);
        // Touch the first so the second becomes the eviction candidate.
        assert!(index.get(&key(1), now).is_some());
        index.insert_terminal(key(3), "three", 40, later(now), now);

        assert!(index.get(&key(1), now).is_some());
        assert!(index.get(&key(2), now).is_none());
        assert!(index.get(&key(3), now).is_some());
        assert_eq!(index.used_bytes(), 80);

        let evicted = index.take_evicted();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, key(2));
        assert_eq!(evicted[0].cause, EvictionCause::Capacity);
        assert_eq!(evicted[0].payload, Some("two"));
    }

    #[test]
    fn expired_entries_go_before_live_ones() {
        let now = OffsetDateTime::now_utc();
        let mut index = ExpiringIndex::new(100);

        index.insert_terminal(key(1), "live", 40, later(now), now);
        index.insert_terminal(key(2), "stale", 40, now + Duration::seconds(1), now);

        let after = now + Duration::seconds(5);
        index.insert_terminal(key(3), "new", 40, later(after), after);

        assert!(index.get(&key(1), after).is_some());
        assert!(index.get(&key(3), after).is_some());
        let causes: Vec<EvictionCause> = index.take_evicted().iter().map(|e| e.cause).collect();
        assert_eq!(causes, vec![EvictionCause::Expired]);
    }

    #[test]
    fn pending_markers_survive_capacity_pressure() {
        let now = OffsetDateTime::now_utc();
        let mut index = ExpiringIndex::new(10);

        index.insert_pending(key(1), later(now), now);
        index.insert_terminal(key(2), "big", 50, later(now), now);

        assert_eq!(index.get(&key(1), now), Some(&Slot::Pending));
        // Oversized entry is kept because nothing else can make room.
        assert!(index.get(&key(2), now).is_some());
        assert_eq!(index.used_bytes(), 50);
    }

    #[test]
    fn replace_with_pending_only_swaps_stale_terminals() {
        let now = OffsetDateTime::now_utc();
        let mut index = ExpiringIndex::new(100);
        index.insert_terminal(key(1), 7u32, 4, later(now), now);

        let (admitted, replaced) =
            index.replace_with_pending(key(1), later(now), now, |value| *value == 8);
        assert!(!admitted);
        assert_eq!(replaced, None);

        let (admitted, replaced) =
            index.replace_with_pending(key(1), later(now), now, |value| *value == 7);
        assert!(admitted);
        assert_eq!(replaced, Some(7));
        assert_eq!(index.pending_len(), 1);
        assert_eq!(index.used_bytes(), 0);

        let (admitted, _) = index.replace_with_pending(key(1), later(now), now, |_| true);
        assert!(!admitted);
    }

    #[test]
    fn extend_pending_only_touches_live_markers() {
        let mut index = ExpiringIndex::new(100);
        let now = OffsetDateTime::now_utc();
        index.insert_pending(key(1), now + Duration::seconds(1), now);
        index.insert_terminal(key(2), "done", 4, later(now), now);

        assert!(index.extend_pending(&key(1), now + Duration::seconds(60), now));
        assert!(!index.extend_pending(&key(2), now + Duration::seconds(60), now));
        assert!(!index.extend_pending(&key(3), now + Duration::seconds(60), now));

        let after = now + Duration::seconds(30);
        assert_eq!(index.get(&key(1), after), Some(&Slot::Pending));
        assert!(!index.extend_pending(&key(1), now, after + Duration::seconds(31)));
    }

    #[test]
    fn remove_if_checks_payload() {
        let now = OffsetDateTime::now_utc();
        let mut index = ExpiringIndex::new(100);
        index.insert_terminal(key(1), 7u32, 1, later(now), now);

        assert_eq!(index.remove_if(&key(1), |value| *value == 8), None);
        assert_eq!(index.remove_if(&key(1), |value| *value == 7), Some(7));
        assert_eq!(index.len(), 0);
        assert_eq!(index.used_bytes(), 0);
    }
}
