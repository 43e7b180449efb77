//! Per-key bookkeeping: committed versions, deletion markers and writer locks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bridge_core::{Key, Version};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Copy)]
struct Record {
    version: Version,
    deleted: bool,
    recorded_at: Instant,
}

/// Last version this instance knows was committed or deleted, per key.
///
/// Promotions, repairs and write-back drains consult it so that a slow
/// background copy never resurrects a deleted key or regresses a newer one.
/// Records are forgotten after `retention`.
#[derive(Debug)]
pub struct VersionTable {
    records: DashMap<Key, Record>,
    retention: Duration,
}

impl VersionTable {
    pub fn new(retention: Duration) -> Self {
        Self {
            records: DashMap::new(),
            retention,
        }
    }

    pub fn record_commit(&self, key: &Key, version: Version) {
        self.record(key, version, false);
    }

    pub fn record_delete(&self, key: &Key, version: Version) {
        self.record(key, version, true);
    }

    fn record(&self, key: &Key, version: Version, deleted: bool) {
        let now = Instant::now();
        self.records
            .entry(key.clone())
            .and_modify(|rec| {
                if version > rec.version || (version == rec.version && deleted) {
                    *rec = Record {
                        version,
                        deleted,
                        recorded_at: now,
                    };
                }
            })
            .or_insert(Record {
                version,
                deleted,
                recorded_at: now,
            });
    }

    /// Whether a background copy of `version` may still be applied.
    pub fn permits(&self, key: &Key, version: Version) -> bool {
        match self.records.get(key) {
            None => true,
            Some(rec) => version > rec.version || (!rec.deleted && version == rec.version),
        }
    }

    /// Highest version recorded for `key`, committed or deleted.
    pub fn latest(&self, key: &Key) -> Option<Version> {
        self.records.get(key).map(|rec| rec.version)
    }

    pub fn is_deleted(&self, key: &Key) -> bool {
        self.records.get(key).is_some_and(|rec| rec.deleted)
    }

    /// Whether a commit is recorded and no later delete.
    pub fn is_live(&self, key: &Key) -> bool {
        self.records.get(key).is_some_and(|rec| !rec.deleted)
    }

    /// Drop records older than the retention window. Returns how many went.
    pub fn sweep(&self) -> usize {
        let before = self.records.len();
        let retention = self.retention;
        self.records
            .retain(|_, rec| rec.recorded_at.elapsed() < retention);
        before.saturating_sub(self.records.len())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Async mutex per key. Entries disappear once nobody holds or awaits them.
#[derive(Debug, Default, Clone)]
pub struct KeyLocks {
    locks: Arc<DashMap<Key, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &Key) -> KeyGuard {
        let lock = self.locks.entry(key.clone()).or_default().clone();
        let guard = lock.clone().lock_owned().await;
        KeyGuard {
            key: key.clone(),
            lock,
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Keys with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive hold on one key. Owned so it can move into a spawned task.
#[derive(Debug)]
pub struct KeyGuard {
    key: Key,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<Key, Arc<Mutex<()>>>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // One reference in the map, one here: nobody else is waiting.
        self.locks
            .remove_if(&self.key, |_, lock| Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_delete_marker_blocks_equal_and_older() {
        let table = VersionTable::new(Duration::from_secs(60));
        let key = Key::from("k");
        assert!(table.permits(&key, Version::new(1)));

        table.record_commit(&key, Version::new(5));
        assert!(table.permits(&key, Version::new(5)));
        assert!(!table.permits(&key, Version::new(4)));

        table.record_delete(&key, Version::new(5));
        assert!(!table.permits(&key, Version::new(5)));
        assert!(table.permits(&key, Version::new(6)));
        assert!(table.is_deleted(&key));
    }

    #[test]
    fn test_older_record_does_not_regress() {
        let table = VersionTable::new(Duration::from_secs(60));
        let key = Key::from("k");
        table.record_delete(&key, Version::new(9));
        table.record_commit(&key, Version::new(3));
        assert_eq!(table.latest(&key), Some(Version::new(9)));
        assert!(table.is_deleted(&key));
        table.record_commit(&key, Version::new(10));
        assert!(!table.is_deleted(&key));
    }

    #[test]
    fn test_sweep_drops_expired_records() {
        let table = VersionTable::new(Duration::ZERO);
        table.record_commit(&Key::from("a"), Version::new(1));
        table.record_delete(&Key::from("b"), Version::new(1));
        assert_eq!(table.sweep(), 2);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_key_lock_serializes_same_key() {
        let locks = KeyLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = Arc::clone(&inside);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&Key::from("hot")).await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _a = locks.lock(&Key::from("a")).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&Key::from("b"))).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
