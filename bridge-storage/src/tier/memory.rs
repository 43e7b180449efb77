//! In-process cache tier.
//!
//! A concurrent map with per-entry expiry and an optional capacity bound.
//! When full, the least recently touched entry among a small sample is
//! evicted, which approximates LRU without a global list.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bridge_core::{Entry, Key, TierKind, TierResult};
use chrono::Utc;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

use super::{supersedes, PutOutcome, TierAdapter, TierStats};

/// Number of entries inspected when choosing an eviction victim.
const EVICTION_SAMPLE: usize = 32;

#[derive(Debug)]
struct Slot {
    entry: Entry,
    last_access: AtomicU64,
}

/// Concurrent in-memory tier.
///
/// Reports [`TierKind::LocalCache`] unless built with [`MemoryTier::with_kind`],
/// which lets a memory map stand in for any backend family.
#[derive(Debug)]
pub struct MemoryTier {
    kind: TierKind,
    map: DashMap<Key, Slot>,
    capacity: Option<usize>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTier {
    pub fn new() -> Self {
        Self {
            kind: TierKind::LocalCache,
            map: DashMap::new(),
            capacity: None,
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity.max(1));
        self
    }

    pub fn with_kind(mut self, kind: TierKind) -> Self {
        self.kind = kind;
        self
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Raw stored entry, expired or not. For inspection in tests and tools.
    pub fn peek(&self, key: &Key) -> Option<Entry> {
        self.map.get(key).map(|slot| slot.entry.clone())
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn evict_one(&self) {
        let victim = self
            .map
            .iter()
            .take(EVICTION_SAMPLE)
            .min_by_key(|slot| {
                if slot.entry.is_expired() {
                    0
                } else {
                    slot.last_access.load(Ordering::Relaxed).saturating_add(1)
                }
            })
            .map(|slot| slot.key().clone());

        if let Some(key) = victim {
            if self.map.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %key, "Evicted entry from memory tier");
            }
        }
    }
}

#[async_trait]
impl TierAdapter for MemoryTier {
    fn kind(&self) -> TierKind {
        self.kind
    }

    async fn get(&self, key: &Key) -> TierResult<Option<Entry>> {
        let found = match self.map.get(key) {
            Some(slot) if !slot.entry.is_expired() => {
                slot.last_access.store(self.tick(), Ordering::Relaxed);
                Some(slot.entry.clone())
            }
            _ => None,
        };
        match found {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put(&self, entry: &Entry) -> TierResult<PutOutcome> {
        if let Some(capacity) = self.capacity {
            if !self.map.contains_key(&entry.key) && self.map.len() >= capacity {
                self.evict_one();
            }
        }

        let stamp = self.tick();
        match self.map.entry(entry.key.clone()) {
            MapEntry::Occupied(mut occupied) => {
                let outcome = supersedes(Some(&occupied.get().entry), entry);
                if outcome.is_applied() {
                    occupied.insert(Slot {
                        entry: entry.clone(),
                        last_access: AtomicU64::new(stamp),
                    });
                }
                Ok(outcome)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Slot {
                    entry: entry.clone(),
                    last_access: AtomicU64::new(stamp),
                });
                Ok(PutOutcome::Applied)
            }
        }
    }

    async fn delete(&self, key: &Key) -> TierResult<()> {
        self.map.remove(key);
        Ok(())
    }

    async fn healthy(&self) -> bool {
        true
    }

    async fn scan(&self, prefix: &[u8], limit: usize) -> TierResult<Vec<Entry>> {
        let mut entries: Vec<Entry> = self
            .map
            .iter()
            .filter(|slot| slot.key().starts_with(prefix))
            .filter(|slot| !slot.entry.is_expired() && !slot.entry.tombstone)
            .map(|slot| slot.entry.clone())
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn purge_expired(&self) -> TierResult<Vec<Key>> {
        let now = Utc::now();
        let expired: Vec<Key> = self
            .map
            .iter()
            .filter(|slot| slot.entry.is_expired_at(now))
            .map(|slot| slot.key().clone())
            .collect();
        Ok(expired
            .into_iter()
            .filter(|key| {
                self.map
                    .remove_if(key, |_, slot| slot.entry.is_expired_at(now))
                    .is_some()
            })
            .collect())
    }

    async fn stats(&self) -> TierStats {
        let memory_bytes = self
            .map
            .iter()
            .map(|slot| slot.entry.size_bytes() as u64)
            .sum();
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.map.len() as u64,
            memory_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
