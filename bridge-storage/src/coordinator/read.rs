//! Read path.

use std::sync::Arc;
use std::time::Duration;

use bridge_core::{BridgeError, BridgeResult, Entry, Key, TierError, Version};
use chrono::{DateTime, Utc};

use super::options::{CallOptions, ReadConsistency};
use super::promotion::schedule_promotion;
use super::state::{OpTracker, ReadState};
use super::Shared;
use crate::metrics::CoordinatorMetrics;

/// Which part of the chain answered a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// A cache tier ahead of the store.
    Cache,
    /// The system of record.
    Store,
    /// A read-only tier after the store, used because the store failed.
    Fallback,
}

/// A value read through the bridge, with where and when it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeRead<T> {
    key: Key,
    value: T,
    version: Version,
    tier: String,
    source: ReadSource,
    expires_at: Option<DateTime<Utc>>,
    read_at: DateTime<Utc>,
}

impl BridgeRead<Vec<u8>> {
    pub(crate) fn from_entry(entry: Entry, tier: &str, source: ReadSource) -> Self {
        Self {
            key: entry.key,
            value: entry.value,
            version: entry.version,
            tier: tier.to_string(),
            source,
            expires_at: entry.expires_at,
            read_at: Utc::now(),
        }
    }
}

impl<T> BridgeRead<T> {
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Name of the tier that served the value.
    pub fn tier(&self) -> &str {
        &self.tier
    }

    pub fn source(&self) -> ReadSource {
        self.source
    }

    pub fn was_cache_hit(&self) -> bool {
        self.source == ReadSource::Cache
    }

    /// Served by a fallback while the system of record was unreachable.
    pub fn is_stale(&self) -> bool {
        self.source == ReadSource::Fallback
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn read_at(&self) -> DateTime<Utc> {
        self.read_at
    }

    /// Time left before the served copy expires.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn map<U, F>(self, f: F) -> BridgeRead<U>
    where
        F: FnOnce(T) -> U,
    {
        BridgeRead {
            key: self.key,
            value: f(self.value),
            version: self.version,
            tier: self.tier,
            source: self.source,
            expires_at: self.expires_at,
            read_at: self.read_at,
        }
    }

    /// Fallible [`BridgeRead::map`].
    pub fn try_map<U, E, F>(self, f: F) -> Result<BridgeRead<U>, E>
    where
        F: FnOnce(T) -> Result<U, E>,
    {
        let value = f(self.value)?;
        Ok(BridgeRead {
            key: self.key,
            value,
            version: self.version,
            tier: self.tier,
            source: self.source,
            expires_at: self.expires_at,
            read_at: self.read_at,
        })
    }
}

impl<T> AsRef<T> for BridgeRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}

pub(super) async fn read(
    shared: &Arc<Shared>,
    key: &Key,
    options: &CallOptions,
) -> BridgeResult<Option<BridgeRead<Vec<u8>>>> {
    CoordinatorMetrics::incr(&shared.metrics.reads);
    let mut op = OpTracker::new("get", key, ReadState::Started);
    op.advance(ReadState::TierConsult)?;

    let chain = &shared.chain;
    let store_index = chain.store_index();
    let timeout = shared.settings.timeout_for(options);
    let first = match options.consistency {
        ReadConsistency::Cached => 0,
        ReadConsistency::Authoritative => store_index,
    };

    // Writable caches that missed or failed, in chain order.
    let mut missed: Vec<usize> = Vec::new();
    let mut store_error: Option<TierError> = None;
    let mut hit: Option<(usize, Entry)> = None;

    for (index, tier) in chain.read_path() {
        if index < first {
            continue;
        }
        let is_cache = index < store_index;
        match shared.call(index, timeout, tier.adapter().get(key)).await {
            Ok(Some(entry)) if entry.tombstone => {
                if is_cache && !shared.versions.is_live(key) {
                    tracing::trace!(tier = tier.name(), key = %key, "Negative cache hit");
                    op.advance(ReadState::Miss)?;
                    op.advance(ReadState::Completed)?;
                    CoordinatorMetrics::incr(&shared.metrics.misses);
                    return Ok(None);
                }
                // A newer commit is known; the tombstone is stale.
                if is_cache && tier.descriptor().accepts_writes() {
                    missed.push(index);
                }
            }
            Ok(Some(entry)) => {
                hit = Some((index, entry));
                break;
            }
            Ok(None) => {
                if is_cache && tier.descriptor().accepts_writes() {
                    missed.push(index);
                }
            }
            Err(e) if is_cache => {
                tracing::debug!(tier = tier.name(), key = %key, error = %e, "Cache tier failed on read; treating as miss");
                if tier.descriptor().accepts_writes() {
                    missed.push(index);
                }
            }
            Err(e) => {
                tracing::warn!(tier = tier.name(), key = %key, error = %e, "System of record failed on read");
                store_error = Some(e);
            }
        }
    }

    if let Some((index, entry)) = hit {
        op.advance(ReadState::Hit)?;
        let tier_name = chain
            .tier(index)
            .map(|t| t.name().to_string())
            .unwrap_or_default();
        let source = if index < store_index {
            CoordinatorMetrics::incr(&shared.metrics.cache_hits);
            ReadSource::Cache
        } else {
            CoordinatorMetrics::incr(&shared.metrics.store_hits);
            ReadSource::Store
        };

        if !missed.is_empty() {
            schedule_promotion(shared, entry.clone(), missed, timeout);
            op.advance(ReadState::PromotionScheduled)?;
        }
        op.advance(ReadState::Completed)?;
        tracing::trace!(tier = %tier_name, key = %key, version = %entry.version, "Read hit");
        return Ok(Some(BridgeRead::from_entry(entry, &tier_name, source)));
    }

    if let Some(error) = store_error {
        if options.consistency == ReadConsistency::Cached {
            if let Some(read) = read_fallbacks(shared, key, timeout).await {
                op.advance(ReadState::Hit)?;
                op.advance(ReadState::Completed)?;
                return Ok(Some(read));
            }
        }
        op.advance(ReadState::Failed)?;
        return Err(BridgeError::unavailable(format!(
            "system of record failed and no tier had {key}: {error}"
        )));
    }

    op.advance(ReadState::Miss)?;
    CoordinatorMetrics::incr(&shared.metrics.misses);
    if let Some(ttl) = shared.settings.negative_cache_ttl {
        if !missed.is_empty() && options.consistency == ReadConsistency::Cached {
            schedule_promotion(shared, Entry::tombstone(key.clone(), ttl), missed, timeout);
            op.advance(ReadState::PromotionScheduled)?;
        }
    }
    op.advance(ReadState::Completed)?;
    Ok(None)
}

/// Consult read-only tiers after the store. Values found there are stale
/// by definition and are not promoted.
async fn read_fallbacks(
    shared: &Shared,
    key: &Key,
    timeout: Duration,
) -> Option<BridgeRead<Vec<u8>>> {
    for (index, tier) in shared.chain.fallbacks() {
        match shared.call(index, timeout, tier.adapter().get(key)).await {
            Ok(Some(entry)) if !entry.tombstone => {
                CoordinatorMetrics::incr(&shared.metrics.fallback_hits);
                tracing::info!(tier = tier.name(), key = %key, "Served stale read from fallback tier");
                return Some(BridgeRead::from_entry(entry, tier.name(), ReadSource::Fallback));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(tier = tier.name(), key = %key, error = %e, "Fallback tier failed");
            }
        }
    }
    None
}

pub(super) async fn list(
    shared: &Shared,
    prefix: &[u8],
    limit: usize,
) -> BridgeResult<Vec<BridgeRead<Vec<u8>>>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let store = shared.chain.store_tier();
    let entries = shared
        .call(
            shared.chain.store_index(),
            shared.settings.call_timeout,
            store.adapter().scan(prefix, limit),
        )
        .await
        .map_err(BridgeError::from_store)?;
    Ok(entries
        .into_iter()
        .filter(|e| !e.tombstone && !e.is_expired())
        .take(limit)
        .map(|e| BridgeRead::from_entry(e, store.name(), ReadSource::Store))
        .collect())
}
