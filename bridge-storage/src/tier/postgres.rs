//! PostgreSQL relational store tier.
//!
//! Entries live in one table keyed by the raw key bytes. The version check
//! is part of the upsert itself (`ON CONFLICT ... WHERE`), so concurrent
//! writers from any number of instances cannot regress a row.

use async_trait::async_trait;
use bridge_core::{
    prefix_successor, ConnectionSpec, Entry, Key, TierError, TierKind, TierResult, Version,
};
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::{NoTls, Row};

use super::{PutOutcome, TierAdapter};

/// Classify a driver error. Connection, transaction-rollback, resource and
/// operator-intervention classes are retryable; constraint and syntax
/// errors are not.
pub(crate) fn classify(e: tokio_postgres::Error) -> TierError {
    match e.code() {
        Some(state) => {
            let code = state.code();
            if ["08", "40", "53", "57"].iter().any(|class| code.starts_with(class)) {
                TierError::transient(format!("postgres {}: {}", code, e))
            } else {
                TierError::permanent(format!("postgres {}: {}", code, e))
            }
        }
        None => TierError::transient(format!("postgres: {}", e)),
    }
}

fn pool_error(e: deadpool_postgres::PoolError) -> TierError {
    TierError::transient(format!("postgres pool: {}", e))
}

/// Accept `name` or `schema.name` made of ASCII identifier characters.
fn validate_table_name(name: &str) -> TierResult<()> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            && part.len() <= 63
    };
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() <= 2 && parts.iter().all(|p| valid_part(p)) {
        Ok(())
    } else {
        Err(TierError::permanent(format!(
            "invalid table name {:?}",
            name
        )))
    }
}

/// SQL text for one table, built once at connect time.
struct Statements {
    create: String,
    get: String,
    upsert: String,
    current_version: String,
    delete: String,
    exists: String,
    scan_bounded: String,
    scan_open: String,
    purge: String,
}

impl Statements {
    fn for_table(t: &str) -> Self {
        let live = "(expires_at IS NULL OR expires_at > now())";
        Self {
            create: format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    key BYTEA PRIMARY KEY,
                    value BYTEA NOT NULL,
                    version BIGINT NOT NULL,
                    expires_at TIMESTAMPTZ,
                    tombstone BOOLEAN NOT NULL DEFAULT FALSE,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )"
            ),
            get: format!(
                "SELECT key, value, version, expires_at, tombstone FROM {t} WHERE key = $1 AND {live}"
            ),
            upsert: format!(
                "INSERT INTO {t} (key, value, version, expires_at, tombstone, updated_at)
                 VALUES ($1, $2, $3, $4, $5, now())
                 ON CONFLICT (key) DO UPDATE SET
                    value = EXCLUDED.value,
                    version = EXCLUDED.version,
                    expires_at = EXCLUDED.expires_at,
                    tombstone = EXCLUDED.tombstone,
                    updated_at = now()
                 WHERE {t}.version < EXCLUDED.version
                    OR ({t}.expires_at IS NOT NULL AND {t}.expires_at <= now())"
            ),
            current_version: format!("SELECT version FROM {t} WHERE key = $1"),
            delete: format!("DELETE FROM {t} WHERE key = $1"),
            exists: format!(
                "SELECT EXISTS(SELECT 1 FROM {t} WHERE key = $1 AND NOT tombstone AND {live})"
            ),
            scan_bounded: format!(
                "SELECT key, value, version, expires_at, tombstone FROM {t}
                 WHERE key >= $1 AND key < $2 AND NOT tombstone AND {live}
                 ORDER BY key LIMIT $3"
            ),
            scan_open: format!(
                "SELECT key, value, version, expires_at, tombstone FROM {t}
                 WHERE key >= $1 AND NOT tombstone AND {live}
                 ORDER BY key LIMIT $2"
            ),
            purge: format!("DELETE FROM {t} WHERE expires_at IS NOT NULL AND expires_at <= now() RETURNING key"),
        }
    }
}

fn entry_from_row(row: &Row) -> TierResult<Entry> {
    let key: Vec<u8> = row.try_get(0).map_err(classify)?;
    let value: Vec<u8> = row.try_get(1).map_err(classify)?;
    let version: i64 = row.try_get(2).map_err(classify)?;
    let expires_at: Option<DateTime<Utc>> = row.try_get(3).map_err(classify)?;
    let tombstone: bool = row.try_get(4).map_err(classify)?;
    Ok(Entry {
        key: Key::new(key),
        value,
        version: Version::from_i64(version),
        expires_at,
        origin: None,
        tombstone,
    })
}

pub struct PostgresTier {
    pool: Pool,
    table: String,
    sql: Statements,
}

impl PostgresTier {
    /// Create the pool and make sure the entry table exists.
    pub async fn connect(spec: &ConnectionSpec) -> TierResult<Self> {
        let mut cfg = Config::new();
        match &spec.url {
            Some(url) => cfg.url = Some(url.clone()),
            None => {
                cfg.host = Some(spec.host().to_string());
                cfg.port = Some(spec.postgres_port());
                cfg.dbname = Some(spec.database().to_string());
                cfg.user = spec.username.clone();
                cfg.password = spec.password.clone();
            }
        }
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        if let Some(size) = spec.pool_size {
            cfg.pool = Some(PoolConfig::new(size));
        }

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| TierError::permanent(format!("failed to create pool: {}", e)))?;

        let tier = Self::with_pool(pool, spec.table())?;
        tier.ensure_table().await?;
        tracing::info!(target = %spec.redacted(), table = %tier.table, "Connected PostgreSQL tier");
        Ok(tier)
    }

    pub fn with_pool(pool: Pool, table: &str) -> TierResult<Self> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            sql: Statements::for_table(table),
        })
    }

    pub async fn ensure_table(&self) -> TierResult<()> {
        let client = self.pool.get().await.map_err(pool_error)?;
        client
            .batch_execute(&self.sql.create)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

#[async_trait]
impl TierAdapter for PostgresTier {
    fn kind(&self) -> TierKind {
        TierKind::Relational
    }

    async fn get(&self, key: &Key) -> TierResult<Option<Entry>> {
        let client = self.pool.get().await.map_err(pool_error)?;
        let row = client
            .query_opt(&self.sql.get, &[&key.as_bytes()])
            .await
            .map_err(classify)?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn put(&self, entry: &Entry) -> TierResult<PutOutcome> {
        let client = self.pool.get().await.map_err(pool_error)?;
        let affected = client
            .execute(
                &self.sql.upsert,
                &[
                    &entry.key.as_bytes(),
                    &entry.value.as_slice(),
                    &entry.version.as_i64(),
                    &entry.expires_at,
                    &entry.tombstone,
                ],
            )
            .await
            .map_err(classify)?;

        if affected > 0 {
            return Ok(PutOutcome::Applied);
        }
        let row = client
            .query_opt(&self.sql.current_version, &[&entry.key.as_bytes()])
            .await
            .map_err(classify)?;
        let current = match row {
            Some(row) => Version::from_i64(row.try_get(0).map_err(classify)?),
            None => entry.version,
        };
        Ok(PutOutcome::Superseded { current })
    }

    async fn delete(&self, key: &Key) -> TierResult<()> {
        let client = self.pool.get().await.map_err(pool_error)?;
        client
            .execute(&self.sql.delete, &[&key.as_bytes()])
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn exists(&self, key: &Key) -> TierResult<bool> {
        let client = self.pool.get().await.map_err(pool_error)?;
        let row = client
            .query_one(&self.sql.exists, &[&key.as_bytes()])
            .await
            .map_err(classify)?;
        row.try_get(0).map_err(classify)
    }

    async fn healthy(&self) -> bool {
        match self.pool.get().await {
            Ok(client) => client.simple_query("SELECT 1").await.is_ok(),
            Err(_) => false,
        }
    }

    async fn scan(&self, prefix: &[u8], limit: usize) -> TierResult<Vec<Entry>> {
        let client = self.pool.get().await.map_err(pool_error)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match prefix_successor(prefix) {
            Some(upper) => {
                client
                    .query(&self.sql.scan_bounded, &[&prefix, &upper.as_slice(), &limit])
                    .await
            }
            None => client.query(&self.sql.scan_open, &[&prefix, &limit]).await,
        }
        .map_err(classify)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn purge_expired(&self) -> TierResult<Vec<Key>> {
        let client = self.pool.get().await.map_err(pool_error)?;
        let rows = client.query(&self.sql.purge, &[]).await.map_err(classify)?;
        rows.iter()
            .map(|row| row.try_get::<_, Vec<u8>>(0).map(Key::from).map_err(classify))
            .collect()
    }
}
