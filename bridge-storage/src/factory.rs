//! Build a running bridge from a [`BridgeConfig`].
//!
//! Each tier kind maps to one adapter:
//!
//! | kind           | adapter                                      |
//! |----------------|----------------------------------------------|
//! | `local-cache`  | [`MemoryTier`], or [`LmdbTier`] with a path  |
//! | `remote-cache` | [`RedisTier`]                                |
//! | `relational`   | [`PostgresTier`]                             |
//! | `document`     | [`MongoTier`]                                |
//! | `file`         | [`SnapshotTier`]                             |
//!
//! Backends compiled out by feature flags fail with
//! [`ConfigError::BackendNotSupported`].

use std::sync::Arc;
use std::time::Duration;

use bridge_core::{BridgeConfig, BridgeError, BridgeResult, ConfigError, TierConfig, TierKind};

use crate::chain::TierChain;
use crate::coordinator::{Coordinator, CoordinatorSettings};
use crate::invalidation::InvalidationBus;
use crate::tier::{MemoryTier, SnapshotTier, TierAdapter};

#[cfg(any(feature = "redis", feature = "postgres", feature = "mongodb"))]
use std::future::Future;

#[cfg(any(feature = "redis", feature = "postgres", feature = "mongodb"))]
use bridge_core::TierResult;

#[cfg(any(feature = "redis", feature = "postgres", feature = "mongodb"))]
use crate::retry::call_with_timeout;

#[cfg(feature = "lmdb")]
use crate::tier::LmdbTier;
#[cfg(feature = "mongodb")]
use crate::tier::MongoTier;
#[cfg(feature = "postgres")]
use crate::tier::PostgresTier;
#[cfg(feature = "redis")]
use crate::tier::RedisTier;

/// Validate `config` and open an adapter for every tier.
pub async fn build_chain(config: &BridgeConfig) -> BridgeResult<TierChain> {
    config.validate()?;
    let connect_timeout = config.connection_timeout();

    let mut builder = TierChain::builder().write_back_enabled(config.write_back_enabled);
    for tier in &config.tiers {
        let adapter = open_tier(tier, connect_timeout).await?;
        tracing::info!(tier = %tier.name, kind = %tier.kind, order = tier.order, "Opened tier");
        builder = builder.tier(tier.descriptor(), adapter);
    }
    Ok(builder.build()?)
}

/// Build the chain, attach the shared invalidation bus when a remote cache
/// is configured, and start the coordinator.
pub async fn connect(config: &BridgeConfig) -> BridgeResult<Coordinator> {
    let chain = build_chain(config).await?;
    let mut builder = Coordinator::builder(chain).settings(CoordinatorSettings::from_config(config));
    if let Some(bus) = open_bus(config).await? {
        builder = builder.invalidation_bus(bus);
    }
    builder.start().await
}

async fn open_tier(tier: &TierConfig, connect_timeout: Duration) -> BridgeResult<Arc<dyn TierAdapter>> {
    match tier.kind {
        TierKind::LocalCache => open_local(tier),
        TierKind::RemoteCache => open_remote(tier, connect_timeout).await,
        TierKind::Relational => open_relational(tier, connect_timeout).await,
        TierKind::Document => open_document(tier, connect_timeout).await,
        TierKind::File => {
            let path = tier.path.as_ref().ok_or_else(|| ConfigError::MissingRequired {
                field: format!("tiers.{}.path", tier.name),
            })?;
            let snapshot = SnapshotTier::open(path).map_err(BridgeError::from_store)?;
            Ok(Arc::new(snapshot))
        }
    }
}

fn open_local(tier: &TierConfig) -> BridgeResult<Arc<dyn TierAdapter>> {
    match &tier.path {
        Some(path) => open_lmdb(tier, path),
        None => {
            let memory = match tier.capacity {
                Some(capacity) => MemoryTier::new().with_capacity(capacity),
                None => MemoryTier::new(),
            };
            Ok(Arc::new(memory))
        }
    }
}

#[cfg(feature = "lmdb")]
fn open_lmdb(tier: &TierConfig, path: &std::path::Path) -> BridgeResult<Arc<dyn TierAdapter>> {
    let lmdb = LmdbTier::open(path, tier.map_size_mb())
        .map_err(|e| BridgeError::from_store(e.into()))?;
    Ok(Arc::new(lmdb))
}

#[cfg(not(feature = "lmdb"))]
fn open_lmdb(tier: &TierConfig, _path: &std::path::Path) -> BridgeResult<Arc<dyn TierAdapter>> {
    Err(not_compiled(tier, "lmdb"))
}

#[cfg(feature = "redis")]
async fn open_remote(tier: &TierConfig, timeout: Duration) -> BridgeResult<Arc<dyn TierAdapter>> {
    let redis = connecting(tier, timeout, RedisTier::connect(&tier.connection)).await?;
    Ok(Arc::new(redis))
}

#[cfg(not(feature = "redis"))]
async fn open_remote(tier: &TierConfig, _timeout: Duration) -> BridgeResult<Arc<dyn TierAdapter>> {
    Err(not_compiled(tier, "redis"))
}

#[cfg(feature = "postgres")]
async fn open_relational(tier: &TierConfig, timeout: Duration) -> BridgeResult<Arc<dyn TierAdapter>> {
    let postgres = connecting(tier, timeout, PostgresTier::connect(&tier.connection)).await?;
    Ok(Arc::new(postgres))
}

#[cfg(not(feature = "postgres"))]
async fn open_relational(tier: &TierConfig, _timeout: Duration) -> BridgeResult<Arc<dyn TierAdapter>> {
    Err(not_compiled(tier, "postgres"))
}

#[cfg(feature = "mongodb")]
async fn open_document(tier: &TierConfig, timeout: Duration) -> BridgeResult<Arc<dyn TierAdapter>> {
    let mongo = connecting(tier, timeout, MongoTier::connect(&tier.connection)).await?;
    Ok(Arc::new(mongo))
}

#[cfg(not(feature = "mongodb"))]
async fn open_document(tier: &TierConfig, _timeout: Duration) -> BridgeResult<Arc<dyn TierAdapter>> {
    Err(not_compiled(tier, "mongodb"))
}

#[cfg(feature = "redis")]
async fn open_bus(config: &BridgeConfig) -> BridgeResult<Option<Arc<dyn InvalidationBus>>> {
    use crate::invalidation::RedisInvalidationBus;

    let Some(remote) = config.tiers.iter().find(|t| t.kind == TierKind::RemoteCache) else {
        return Ok(None);
    };
    let bus = connecting(
        remote,
        config.connection_timeout(),
        RedisInvalidationBus::connect(&remote.connection, config.invalidation_channel.clone()),
    )
    .await?;
    Ok(Some(Arc::new(bus)))
}

#[cfg(not(feature = "redis"))]
async fn open_bus(_config: &BridgeConfig) -> BridgeResult<Option<Arc<dyn InvalidationBus>>> {
    Ok(None)
}

/// Bound a backend connect by the configured timeout.
#[cfg(any(feature = "redis", feature = "postgres", feature = "mongodb"))]
async fn connecting<T>(
    tier: &TierConfig,
    timeout: Duration,
    fut: impl Future<Output = TierResult<T>>,
) -> BridgeResult<T> {
    call_with_timeout(timeout, fut).await.map_err(|e| {
        tracing::error!(tier = %tier.name, target = %tier.connection.redacted(), error = %e, "Tier connect failed");
        BridgeError::from_store(e)
    })
}

#[cfg(not(all(feature = "lmdb", feature = "redis", feature = "postgres", feature = "mongodb")))]
fn not_compiled(tier: &TierConfig, feature: &str) -> BridgeError {
    ConfigError::BackendNotSupported {
        backend: format!("{} (tier {}, enable the `{feature}` feature)", tier.kind, tier.name),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::WriteMode;

    #[tokio::test]
    async fn test_build_chain_rejects_invalid_config() {
        // No store tier.
        let err = build_chain(&BridgeConfig::new(vec![TierConfig::new(
            "local",
            TierKind::LocalCache,
            0,
        )]))
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[tokio::test]
    async fn test_file_tier_requires_path() {
        let tier = TierConfig::new("snap", TierKind::File, 3).with_write_mode(WriteMode::Disabled);
        let err = open_tier(&tier, Duration::from_secs(1)).await.err().unwrap();
        assert!(matches!(
            err,
            BridgeError::Config(ConfigError::MissingRequired { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_tier_without_path_is_in_memory() {
        let tier = TierConfig::new("local", TierKind::LocalCache, 0).with_capacity(4);
        let adapter = open_tier(&tier, Duration::from_secs(1)).await.unwrap();
        assert_eq!(adapter.kind(), TierKind::LocalCache);
        assert!(adapter.healthy().await);
    }

    #[cfg(feature = "lmdb")]
    #[tokio::test]
    async fn test_local_tier_with_path_uses_lmdb() {
        let dir = tempfile::tempdir().unwrap();
        let tier = TierConfig::new("local", TierKind::LocalCache, 0).with_path(dir.path());
        let adapter = open_tier(&tier, Duration::from_secs(1)).await.unwrap();
        assert_eq!(adapter.kind(), TierKind::LocalCache);
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    async fn test_unreachable_backend_is_unavailable() {
        use bridge_core::ConnectionSpec;

        let tier = TierConfig::new("remote", TierKind::RemoteCache, 1)
            .with_connection(ConnectionSpec::from_url("redis://127.0.0.1:1/"));
        let err = open_tier(&tier, Duration::from_millis(500)).await.err().unwrap();
        assert!(matches!(
            err,
            BridgeError::Unavailable { .. } | BridgeError::Failure { .. }
        ));
    }
}
