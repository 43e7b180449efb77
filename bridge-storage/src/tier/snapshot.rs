//! Read-only file tier.
//!
//! Loads a JSON or YAML document mapping string keys to values and serves
//! it as a tier. Each value is handed out as its JSON encoding. Every entry
//! carries the file's modification time as its version, so a refreshed
//! snapshot supersedes copies promoted from an older one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use bridge_core::{
    Entry, JsonSerializer, Key, Serializer, TierError, TierKind, TierResult, Version,
    YamlSerializer,
};
use chrono::{DateTime, Utc};

use super::{TierAdapter, TierStats};

#[derive(Debug, Default)]
struct Snapshot {
    entries: BTreeMap<Key, Vec<u8>>,
    version: Version,
}

#[derive(Debug)]
pub struct SnapshotTier {
    path: PathBuf,
    snapshot: RwLock<Snapshot>,
}

impl SnapshotTier {
    pub fn open(path: impl Into<PathBuf>) -> TierResult<Self> {
        let path = path.into();
        let snapshot = load(&path)?;
        tracing::info!(
            path = %path.display(),
            entries = snapshot.entries.len(),
            "Loaded snapshot tier"
        );
        Ok(Self {
            path,
            snapshot: RwLock::new(snapshot),
        })
    }

    /// Reload the file from disk. Returns the number of entries loaded.
    pub fn refresh(&self) -> TierResult<usize> {
        let fresh = load(&self.path)?;
        let count = fresh.entries.len();
        let mut guard = self
            .snapshot
            .write()
            .map_err(|_| TierError::permanent("snapshot lock poisoned"))?;
        *guard = fresh;
        Ok(count)
    }

    fn read_only(&self) -> TierError {
        TierError::permanent(format!("{} is a read-only snapshot", self.path.display()))
    }

    fn lookup(&self, key: &Key) -> TierResult<Option<Entry>> {
        let guard = self
            .snapshot
            .read()
            .map_err(|_| TierError::permanent("snapshot lock poisoned"))?;
        Ok(guard
            .entries
            .get(key)
            .map(|value| Entry::new(key.clone(), value.clone(), guard.version)))
    }
}

fn load(path: &Path) -> TierResult<Snapshot> {
    let raw = std::fs::read(path)
        .map_err(|e| TierError::permanent(format!("reading {}: {}", path.display(), e)))?;

    let parsed: BTreeMap<String, serde_json::Value> =
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => YamlSerializer.decode(&raw),
            _ => JsonSerializer.decode(&raw),
        }
        .map_err(|e| TierError::permanent(format!("{}: {}", path.display(), e)))?;

    let modified: DateTime<Utc> = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let version = Version::new(u64::try_from(modified.timestamp_micros()).unwrap_or(1).max(1));

    let mut entries = BTreeMap::new();
    for (key, value) in parsed {
        let bytes = JsonSerializer
            .encode(&value)
            .map_err(|e| TierError::permanent(e.to_string()))?;
        entries.insert(Key::from(key), bytes);
    }
    Ok(Snapshot { entries, version })
}

#[async_trait]
impl TierAdapter for SnapshotTier {
    fn kind(&self) -> TierKind {
        TierKind::File
    }

    async fn get(&self, key: &Key) -> TierResult<Option<Entry>> {
        self.lookup(key)
    }

    async fn put(&self, _entry: &Entry) -> TierResult<super::PutOutcome> {
        Err(self.read_only())
    }

    async fn delete(&self, _key: &Key) -> TierResult<()> {
        Err(self.read_only())
    }

    async fn healthy(&self) -> bool {
        self.path.exists()
    }

    async fn scan(&self, prefix: &[u8], limit: usize) -> TierResult<Vec<Entry>> {
        let guard = self
            .snapshot
            .read()
            .map_err(|_| TierError::permanent("snapshot lock poisoned"))?;
        Ok(guard
            .entries
            .range::<[u8], _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| Entry::new(k.clone(), v.clone(), guard.version))
            .collect())
    }

    async fn stats(&self) -> TierStats {
        let entry_count = self
            .snapshot
            .read()
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0);
        TierStats {
            entry_count,
            ..TierStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_json_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "seed.json", r#"{"u:1": {"n": "a"}, "u:2": 7, "x": "y"}"#);
        let tier = SnapshotTier::open(&path).unwrap();

        let got = tier.get(&Key::from("u:1")).await.unwrap().unwrap();
        assert_eq!(got.value, br#"{"n":"a"}"#);
        assert!(got.version > Version::ZERO);
        assert!(tier.get(&Key::from("nope")).await.unwrap().is_none());

        let scanned = tier.scan(b"u:", 10).await.unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[1].value, b"7");
    }

    #[tokio::test]
    async fn test_yaml_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "seed.yaml", "greeting: hello\ncount: 3\n");
        let tier = SnapshotTier::open(&path).unwrap();
        let got = tier.get(&Key::from("greeting")).await.unwrap().unwrap();
        assert_eq!(got.value, br#""hello""#);
    }

    #[tokio::test]
    async fn test_writes_are_permanent_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "seed.json", "{}");
        let tier = SnapshotTier::open(&path).unwrap();
        let entry = Entry::new(Key::from("k"), vec![], Version::new(1));
        assert!(!tier.put(&entry).await.unwrap_err().is_retryable());
        assert!(!tier.delete(&Key::from("k")).await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_refresh_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "seed.json", r#"{"a": 1}"#);
        let tier = SnapshotTier::open(&path).unwrap();
        std::fs::write(&path, r#"{"a": 1, "b": 2}"#).unwrap();
        assert_eq!(tier.refresh().unwrap(), 2);
        assert!(tier.get(&Key::from("b")).await.unwrap().is_some());
    }

    #[test]
    fn test_missing_file_is_permanent() {
        let err = SnapshotTier::open("/definitely/not/here.json").unwrap_err();
        assert!(!err.is_retryable());
    }
}
