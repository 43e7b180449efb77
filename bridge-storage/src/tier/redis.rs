//! Redis remote cache tier.
//!
//! Each entry is a Redis hash under `<namespace>:<key bytes>` with fields
//! `v` (version), `d` (payload), `t` (tombstone flag) and `e` (expiry in
//! epoch microseconds). Puts run as a Lua script so the version comparison
//! and the write are atomic on the server; expiry is delegated to `PEXPIRE`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bridge_core::{ConnectionSpec, Entry, Key, TierError, TierKind, TierResult, Version};
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};

use super::{PutOutcome, TierAdapter, TierStats};

const PUT_SCRIPT: &str = r#"
local cur = redis.call('HGET', KEYS[1], 'v')
if cur and tonumber(cur) >= tonumber(ARGV[1]) then
  return {0, cur}
end
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'v', ARGV[1], 'd', ARGV[2], 't', ARGV[3])
if ARGV[4] ~= '' then
  redis.call('HSET', KEYS[1], 'e', ARGV[4])
end
if tonumber(ARGV[5]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[5])
end
return {1, ARGV[1]}
"#;

/// Classify a client error as retryable or not.
pub(crate) fn classify(e: RedisError) -> TierError {
    if e.is_io_error()
        || e.is_timeout()
        || e.is_connection_dropped()
        || e.is_connection_refusal()
        || matches!(
            e.kind(),
            redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain
        )
    {
        TierError::transient(format!("redis: {}", e))
    } else {
        TierError::permanent(format!("redis: {}", e))
    }
}

pub struct RedisTier {
    conn: ConnectionManager,
    namespace: Vec<u8>,
    put_script: Script,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RedisTier {
    /// Connect using the URL built from `spec`. Entries live under
    /// `<table>:` so several bridges can share one server.
    pub async fn connect(spec: &ConnectionSpec) -> TierResult<Self> {
        let client = Client::open(spec.redis_url()).map_err(classify)?;
        let conn = ConnectionManager::new(client).await.map_err(classify)?;
        tracing::info!(target = %spec.redacted(), "Connected Redis tier");
        Ok(Self::from_connection(conn, spec.table()))
    }

    pub fn from_connection(conn: ConnectionManager, namespace: &str) -> Self {
        let mut ns = namespace.as_bytes().to_vec();
        ns.push(b':');
        Self {
            conn,
            namespace: ns,
            put_script: Script::new(PUT_SCRIPT),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn redis_key(&self, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.namespace.len() + key.len());
        out.extend_from_slice(&self.namespace);
        out.extend_from_slice(key);
        out
    }

    /// `KEYS` pattern matching every entry under `prefix`.
    fn glob_for(&self, prefix: &[u8]) -> Vec<u8> {
        let mut pattern = Vec::with_capacity(self.namespace.len() + prefix.len() + 1);
        for byte in self.namespace.iter().chain(prefix.iter()) {
            if matches!(byte, b'*' | b'?' | b'[' | b']' | b'\\') {
                pattern.push(b'\\');
            }
            pattern.push(*byte);
        }
        pattern.push(b'*');
        pattern
    }
}

/// Rebuild an entry from its hash fields. `None` for an empty hash.
fn entry_from_fields(key: Key, fields: HashMap<String, Vec<u8>>) -> TierResult<Option<Entry>> {
    if fields.is_empty() {
        return Ok(None);
    }
    let number = |name: &str| -> TierResult<Option<i64>> {
        match fields.get(name) {
            None => Ok(None),
            Some(raw) => String::from_utf8_lossy(raw)
                .parse::<i64>()
                .map(Some)
                .map_err(|e| TierError::permanent(format!("redis field {name}: {e}"))),
        }
    };
    let version = number("v")?
        .map(Version::from_i64)
        .ok_or_else(|| TierError::permanent("redis entry missing version"))?;
    let expires_at = number("e")?.and_then(DateTime::<Utc>::from_timestamp_micros);
    let tombstone = fields.get("t").map(|t| t.as_slice() == b"1").unwrap_or(false);
    let value = fields.get("d").cloned().unwrap_or_default();

    Ok(Some(Entry {
        key,
        value,
        version,
        expires_at,
        origin: None,
        tombstone,
    }))
}

#[async_trait]
impl TierAdapter for RedisTier {
    fn kind(&self) -> TierKind {
        TierKind::RemoteCache
    }

    async fn get(&self, key: &Key) -> TierResult<Option<Entry>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, Vec<u8>> = conn
            .hgetall(self.redis_key(key.as_bytes()))
            .await
            .map_err(classify)?;
        let found = entry_from_fields(key.clone(), fields)?.filter(|e| !e.is_expired());
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    async fn put(&self, entry: &Entry) -> TierResult<PutOutcome> {
        let ttl_ms = match entry.remaining_ttl() {
            Some(ttl) if ttl.is_zero() => return Ok(PutOutcome::Applied),
            Some(ttl) => ttl.as_millis().max(1) as u64,
            None => 0,
        };
        let expiry = entry
            .expires_at
            .map(|at| at.timestamp_micros().to_string())
            .unwrap_or_default();

        let mut conn = self.conn.clone();
        let (applied, version): (i64, String) = self
            .put_script
            .key(self.redis_key(entry.key.as_bytes()))
            .arg(entry.version.get())
            .arg(entry.value.as_slice())
            .arg(if entry.tombstone { "1" } else { "0" })
            .arg(expiry)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;

        if applied == 1 {
            Ok(PutOutcome::Applied)
        } else {
            let current = version
                .parse::<u64>()
                .map(Version::new)
                .map_err(|e| TierError::permanent(format!("redis version: {e}")))?;
            Ok(PutOutcome::Superseded { current })
        }
    }

    async fn delete(&self, key: &Key) -> TierResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(self.redis_key(key.as_bytes()))
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn exists(&self, key: &Key) -> TierResult<bool> {
        let mut conn = self.conn.clone();
        let flag: Option<String> = conn
            .hget(self.redis_key(key.as_bytes()), "t")
            .await
            .map_err(classify)?;
        Ok(flag.as_deref() == Some("0"))
    }

    async fn healthy(&self) -> bool {
        let mut conn = self.conn.clone();
        let pong: Result<String, RedisError> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }

    async fn scan(&self, prefix: &[u8], limit: usize) -> TierResult<Vec<Entry>> {
        let mut conn = self.conn.clone();
        let mut keys: Vec<Vec<u8>> = conn.keys(self.glob_for(prefix)).await.map_err(classify)?;
        keys.sort();

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.hgetall(key);
        }
        let rows: Vec<HashMap<String, Vec<u8>>> =
            pipe.query_async(&mut conn).await.map_err(classify)?;

        let now = Utc::now();
        let mut entries = Vec::new();
        for (raw, fields) in keys.into_iter().zip(rows) {
            let key = Key::new(raw[self.namespace.len()..].to_vec());
            if let Some(entry) = entry_from_fields(key, fields)? {
                if !entry.tombstone && !entry.is_expired_at(now) {
                    entries.push(entry);
                }
            }
            if entries.len() >= limit {
                break;
            }
        }
        Ok(entries)
    }

    async fn stats(&self) -> TierStats {
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ..TierStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_from_fields() {
        let mut fields = HashMap::new();
        fields.insert("v".to_string(), b"42".to_vec());
        fields.insert("d".to_string(), br#"{"n":"a"}"#.to_vec());
        fields.insert("t".to_string(), b"0".to_vec());
        fields.insert("e".to_string(), b"1700000000000000".to_vec());

        let entry = entry_from_fields(Key::from("u:1"), fields).unwrap().unwrap();
        assert_eq!(entry.version, Version::new(42));
        assert_eq!(entry.value, br#"{"n":"a"}"#);
        assert!(!entry.tombstone);
        assert_eq!(entry.expires_at.unwrap().timestamp_micros(), 1_700_000_000_000_000);
    }

    #[test]
    fn test_empty_hash_is_absent() {
        assert!(entry_from_fields(Key::from("k"), HashMap::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_missing_version_is_permanent() {
        let mut fields = HashMap::new();
        fields.insert("d".to_string(), b"x".to_vec());
        let err = entry_from_fields(Key::from("k"), fields).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_io_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(classify(RedisError::from(io)).is_retryable());

        let typed = RedisError::from((redis::ErrorKind::TypeError, "wrong type"));
        assert!(!classify(typed).is_retryable());
    }
}
