//! Per-call options and coordinator-wide settings.

use std::time::Duration;

use bridge_core::{BridgeConfig, Version};

use crate::retry::RetryPolicy;

/// How far a read may trust cache tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadConsistency {
    /// Serve from the fastest tier holding the key.
    #[default]
    Cached,
    /// Skip cache tiers and read the system of record.
    Authoritative,
}

/// Precondition for a write, checked against the system of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteCondition {
    #[default]
    Unconditional,
    /// The store must still hold exactly this version.
    Expecting(Version),
    /// The store must not hold the key.
    ExpectingAbsent,
}

/// Optional overrides for a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallOptions {
    /// Bound for each adapter call instead of `connectionTimeoutMillis`.
    pub timeout: Option<Duration>,
    /// Expiry for the written entry. Cache tiers still cap it to their TTL.
    pub ttl: Option<Duration>,
    pub consistency: ReadConsistency,
    pub condition: WriteCondition,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn authoritative(mut self) -> Self {
        self.consistency = ReadConsistency::Authoritative;
        self
    }

    pub fn expecting(mut self, version: Version) -> Self {
        self.condition = WriteCondition::Expecting(version);
        self
    }

    pub fn expecting_absent(mut self) -> Self {
        self.condition = WriteCondition::ExpectingAbsent;
        self
    }
}

/// Minimum time a version or deletion marker is remembered.
pub const DEFAULT_VERSION_RETENTION: Duration = Duration::from_secs(300);

/// How often expired entries are purged and version records swept.
pub const DEFAULT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

/// Runtime settings of a coordinator, resolved from [`BridgeConfig`].
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub instance_id: String,
    pub call_timeout: Duration,
    pub negative_cache_ttl: Option<Duration>,
    pub write_back_capacity: usize,
    pub write_back_workers: usize,
    pub retry: RetryPolicy,
    pub max_value_bytes: usize,
    pub invalidate_on_write: bool,
    /// Zero disables the health monitor.
    pub health_check_interval: Duration,
    pub unhealthy_threshold: u32,
    pub resubscribe_delay: Duration,
    pub version_retention: Duration,
    /// Zero disables housekeeping.
    pub housekeeping_interval: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        let longest_ttl = config
            .tiers
            .iter()
            .filter_map(|t| t.ttl_seconds)
            .max()
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);
        Self {
            instance_id: config.resolved_instance_id(),
            call_timeout: config.connection_timeout(),
            negative_cache_ttl: config.negative_cache_ttl(),
            write_back_capacity: config.write_back_queue_capacity,
            write_back_workers: config.write_back_workers,
            retry: RetryPolicy::new(config.max_retry_attempts, config.retry.clone()),
            max_value_bytes: config.max_value_bytes,
            invalidate_on_write: config.invalidate_on_write,
            health_check_interval: config.health_check_interval(),
            unhealthy_threshold: config.unhealthy_threshold,
            resubscribe_delay: config.resubscribe_delay(),
            version_retention: longest_ttl.max(DEFAULT_VERSION_RETENTION),
            housekeeping_interval: DEFAULT_HOUSEKEEPING_INTERVAL,
        }
    }

    /// Adapter call bound for a call, honoring its override.
    pub fn timeout_for(&self, options: &CallOptions) -> Duration {
        options.timeout.unwrap_or(self.call_timeout)
    }
}
