//! Tier adapters.
//!
//! Every backend (in-process cache, remote cache, relational store,
//! document store, read-only snapshot) is driven through the same
//! [`TierAdapter`] contract so the coordinator never branches on backend.
//!
//! # Contract
//!
//! - `put` is last-writer-wins by version: a put whose version is not
//!   strictly newer than the live stored version is answered with
//!   [`PutOutcome::Superseded`], which is not an error.
//! - Expired entries are never returned and count as absent for `put`.
//! - Failures are [`TierError::Transient`]/[`TierError::Timeout`]
//!   (retryable) or [`TierError::Permanent`] (never retried).
//! - Every operation is idempotent.

use async_trait::async_trait;
use bridge_core::{Entry, Key, TierError, TierKind, TierResult, Version};

pub mod faulty;
#[cfg(feature = "lmdb")]
pub mod lmdb;
pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongo;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;
pub mod snapshot;

pub use faulty::FaultInjectingTier;
#[cfg(feature = "lmdb")]
pub use lmdb::LmdbTier;
pub use memory::MemoryTier;
#[cfg(feature = "mongodb")]
pub use mongo::MongoTier;
#[cfg(feature = "postgres")]
pub use postgres::PostgresTier;
#[cfg(feature = "redis")]
pub use redis::RedisTier;
pub use snapshot::SnapshotTier;

/// Result of a version-checked put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Applied,
    /// The tier already holds `current`, which is equal or newer.
    Superseded { current: Version },
}

impl PutOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, PutOutcome::Applied)
    }
}

/// Statistics reported by a tier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    /// Number of entries currently held, when the backend can tell cheaply.
    pub entry_count: u64,
    /// Approximate payload bytes held.
    pub memory_bytes: u64,
    /// Entries dropped to stay within capacity.
    pub evictions: u64,
}

impl TierStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Uniform contract over one storage tier.
#[async_trait]
pub trait TierAdapter: Send + Sync {
    /// Backend family, checked against the configured tier kind.
    fn kind(&self) -> TierKind;

    async fn get(&self, key: &Key) -> TierResult<Option<Entry>>;

    async fn put(&self, entry: &Entry) -> TierResult<PutOutcome>;

    /// Remove the key regardless of version. Deleting an absent key succeeds.
    async fn delete(&self, key: &Key) -> TierResult<()>;

    /// Whether a live, non-tombstone entry exists.
    async fn exists(&self, key: &Key) -> TierResult<bool> {
        Ok(self.get(key).await?.is_some_and(|e| !e.tombstone))
    }

    /// Cheap liveness probe. Must not fail loudly.
    async fn healthy(&self) -> bool;

    /// Live entries whose key starts with `prefix`, in key order.
    async fn scan(&self, _prefix: &[u8], _limit: usize) -> TierResult<Vec<Entry>> {
        Err(TierError::permanent(format!(
            "prefix scan not supported by {} tiers",
            self.kind()
        )))
    }

    /// Drop expired entries the backend does not expire by itself.
    /// Returns the keys that went.
    async fn purge_expired(&self) -> TierResult<Vec<Key>> {
        Ok(Vec::new())
    }

    async fn stats(&self) -> TierStats {
        TierStats::default()
    }
}

/// Whether `incoming` may replace a tier's `existing` entry.
///
/// Shared by adapters that compare versions in process.
pub(crate) fn supersedes(existing: Option<&Entry>, incoming: &Entry) -> PutOutcome {
    match existing {
        Some(current) if !current.is_expired() && current.version >= incoming.version => {
            PutOutcome::Superseded {
                current: current.version,
            }
        }
        _ => PutOutcome::Applied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};

    fn entry(v: u64) -> Entry {
        Entry::new(Key::from("k"), b"v".to_vec(), Version::new(v))
    }

    #[test]
    fn test_supersedes_rejects_equal_and_older() {
        let existing = entry(5);
        assert_eq!(
            supersedes(Some(&existing), &entry(5)),
            PutOutcome::Superseded {
                current: Version::new(5)
            }
        );
        assert!(!supersedes(Some(&existing), &entry(4)).is_applied());
        assert!(supersedes(Some(&existing), &entry(6)).is_applied());
        assert!(supersedes(None, &entry(1)).is_applied());
    }

    #[test]
    fn test_expired_entry_never_blocks() {
        let expired = entry(9).with_expiry(Some(Utc::now() - TimeDelta::seconds(1)));
        assert!(supersedes(Some(&expired), &entry(2)).is_applied());
    }

    #[test]
    fn test_tombstone_never_overwrites_real_value() {
        let real = entry(3);
        let tomb = Entry::tombstone(Key::from("k"), std::time::Duration::from_secs(5));
        assert!(!supersedes(Some(&real), &tomb).is_applied());
        assert!(supersedes(Some(&tomb), &real).is_applied());
    }

    #[test]
    fn test_hit_rate() {
        let stats = TierStats {
            hits: 3,
            misses: 1,
            ..TierStats::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(TierStats::default().hit_rate(), 0.0);
    }
}
