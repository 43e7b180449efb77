//! LMDB-backed local cache tier.
//!
//! Uses the heed crate (Rust bindings for LMDB) for a memory-mapped cache
//! that survives process restarts. Values are stored in the binary entry
//! envelope from `bridge_core::codec`, so version and expiry live next to
//! the payload.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The tier uses:
//! - Read transactions for `get`, `exists` and `scan`
//! - A single write transaction per `put` so the version check and the
//!   write are atomic
//! - Statistics are tracked with atomic counters

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bridge_core::{decode_entry, encode_entry, Entry, Key, TierError, TierKind, TierResult};
use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use super::{supersedes, PutOutcome, TierAdapter, TierStats};

/// Error type for LMDB tier operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbTierError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbTierError> for TierError {
    fn from(e: LmdbTierError) -> Self {
        match e {
            LmdbTierError::Transaction(_) => TierError::transient(e.to_string()),
            _ => TierError::permanent(e.to_string()),
        }
    }
}

fn txn_error(e: heed::Error) -> LmdbTierError {
    LmdbTierError::Transaction(e.to_string())
}

/// Persistent local cache tier.
pub struct LmdbTier {
    env: Env,
    db: Database<Bytes, Bytes>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LmdbTier {
    /// Open (or create) the cache in `path`, sized to `max_size_mb`.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbTierError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment directory is owned by this tier and is not
        // opened twice within the process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbTierError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbTierError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_error)?;

        tracing::info!(path = %path.as_ref().display(), max_size_mb, "Opened LMDB tier");

        Ok(Self {
            env,
            db,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    fn read(&self, key: &Key) -> Result<Option<Entry>, LmdbTierError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let raw = self.db.get(&rtxn, key.as_bytes()).map_err(txn_error)?;
        Ok(raw.and_then(|bytes| decode_or_warn(key, bytes)))
    }
}

fn decode_or_warn(key: &Key, bytes: &[u8]) -> Option<Entry> {
    match decode_entry(key.clone(), bytes) {
        Ok(entry) => Some(entry),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Skipping corrupt LMDB entry");
            None
        }
    }
}

#[async_trait]
impl TierAdapter for LmdbTier {
    fn kind(&self) -> TierKind {
        TierKind::LocalCache
    }

    async fn get(&self, key: &Key) -> TierResult<Option<Entry>> {
        let found = self.read(key)?.filter(|e| !e.is_expired());
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    async fn put(&self, entry: &Entry) -> TierResult<PutOutcome> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;

        let existing = self
            .db
            .get(&wtxn, entry.key.as_bytes())
            .map_err(txn_error)?
            .and_then(|bytes| decode_or_warn(&entry.key, bytes));

        let outcome = supersedes(existing.as_ref(), entry);
        if outcome.is_applied() {
            self.db
                .put(&mut wtxn, entry.key.as_bytes(), &encode_entry(entry))
                .map_err(|e| match e {
                    heed::Error::Mdb(heed::MdbError::MapFull) => {
                        TierError::permanent("LMDB map is full")
                    }
                    other => TierError::from(txn_error(other)),
                })?;
            wtxn.commit().map_err(txn_error)?;
        } else {
            wtxn.abort();
        }
        Ok(outcome)
    }

    async fn delete(&self, key: &Key) -> TierResult<()> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.db
            .delete(&mut wtxn, key.as_bytes())
            .map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        Ok(())
    }

    async fn healthy(&self) -> bool {
        self.env.read_txn().is_ok()
    }

    async fn scan(&self, prefix: &[u8], limit: usize) -> TierResult<Vec<Entry>> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let iter = self.db.iter(&rtxn).map_err(txn_error)?;

        let now = Utc::now();
        let mut entries = Vec::new();
        for result in iter {
            let (raw_key, bytes) = match result {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            if raw_key < prefix {
                continue;
            }
            if !raw_key.starts_with(prefix) || entries.len() >= limit {
                break;
            }
            let key = Key::from(raw_key);
            if let Some(entry) = decode_or_warn(&key, bytes) {
                if !entry.tombstone && !entry.is_expired_at(now) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    async fn purge_expired(&self) -> TierResult<Vec<Key>> {
        let now = Utc::now();
        let expired: Vec<Vec<u8>> = {
            let rtxn = self.env.read_txn().map_err(txn_error)?;
            let iter = self.db.iter(&rtxn).map_err(txn_error)?;
            iter.filter_map(Result::ok)
                .filter(|(raw_key, bytes)| {
                    decode_entry(Key::from(*raw_key), bytes)
                        .map(|e| e.is_expired_at(now))
                        .unwrap_or(true)
                })
                .map(|(raw_key, _)| raw_key.to_vec())
                .collect()
        };

        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let mut deleted = Vec::with_capacity(expired.len());
        for key in expired {
            if self.db.delete(&mut wtxn, &key).unwrap_or(false) {
                deleted.push(Key::from(key));
            }
        }
        wtxn.commit().map_err(txn_error)?;
        Ok(deleted)
    }

    async fn stats(&self) -> TierStats {
        let entry_count = self
            .env
            .read_txn()
            .ok()
            .and_then(|rtxn| self.db.len(&rtxn).ok())
            .unwrap_or(0);
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count,
            memory_bytes: 0,
            evictions: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::Version;
    use chrono::TimeDelta;
    use tempfile::TempDir;

    fn create_test_tier() -> (LmdbTier, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let tier = LmdbTier::open(temp_dir.path(), 10).expect("tier creation should succeed");
        (tier, temp_dir)
    }

    fn entry(key: &str, v: u64) -> Entry {
        Entry::new(Key::from(key), format!("{key}@{v}").into_bytes(), Version::new(v))
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (tier, _dir) = create_test_tier();
        assert!(tier.put(&entry("a", 1)).await.unwrap().is_applied());

        let got = tier.get(&Key::from("a")).await.unwrap().unwrap();
        assert_eq!(got.value, b"a@1");
        assert_eq!(got.version, Version::new(1));

        tier.delete(&Key::from("a")).await.unwrap();
        assert!(tier.get(&Key::from("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_version_check_is_enforced() {
        let (tier, _dir) = create_test_tier();
        tier.put(&entry("a", 7)).await.unwrap();
        assert_eq!(
            tier.put(&entry("a", 7)).await.unwrap(),
            PutOutcome::Superseded {
                current: Version::new(7)
            }
        );
        assert!(tier.put(&entry("a", 8)).await.unwrap().is_applied());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let tier = LmdbTier::open(temp_dir.path(), 10).unwrap();
            tier.put(&entry("persist", 3)).await.unwrap();
        }
        let tier = LmdbTier::open(temp_dir.path(), 10).unwrap();
        let got = tier.get(&Key::from("persist")).await.unwrap().unwrap();
        assert_eq!(got.version, Version::new(3));
    }

    #[tokio::test]
    async fn test_expired_entries_hidden_and_purged() {
        let (tier, _dir) = create_test_tier();
        let stale = entry("old", 1).with_expiry(Some(Utc::now() - TimeDelta::seconds(5)));
        tier.put(&stale).await.unwrap();
        tier.put(&entry("new", 1)).await.unwrap();

        assert!(tier.get(&Key::from("old")).await.unwrap().is_none());
        assert_eq!(tier.purge_expired().await.unwrap().len(), 1);
        assert_eq!(tier.stats().await.entry_count, 1);
    }

    #[tokio::test]
    async fn test_scan_by_prefix() {
        let (tier, _dir) = create_test_tier();
        for key in ["a:1", "u:2", "u:1", "v:1"] {
            tier.put(&entry(key, 1)).await.unwrap();
        }
        let found = tier.scan(b"u:", 10).await.unwrap();
        let keys: Vec<String> = found.iter().map(|e| e.key.to_string()).collect();
        assert_eq!(keys, vec!["u:1", "u:2"]);
    }
}
