//! Bridge configuration.
//!
//! Configuration is read from JSON or YAML with camelCase field names and
//! validated once at startup. The tier chain is never rebuilt afterwards.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ============================================================================
// DEFAULTS
// ============================================================================

pub const DEFAULT_CONNECTION_TIMEOUT_MILLIS: u64 = 2_000;
pub const DEFAULT_WRITE_BACK_QUEUE_CAPACITY: usize = 1_024;
pub const DEFAULT_WRITE_BACK_WORKERS: usize = 4;
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_INITIAL_BACKOFF_MILLIS: u64 = 50;
pub const DEFAULT_MAX_BACKOFF_MILLIS: u64 = 5_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MILLIS: u64 = 5_000;
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;
pub const DEFAULT_RESUBSCRIBE_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_MAX_VALUE_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_INVALIDATION_CHANNEL: &str = "bridge:invalidate";
pub const DEFAULT_LMDB_MAP_SIZE_MB: usize = 256;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_REDIS_PORT: u16 = 6379;
pub const DEFAULT_POSTGRES_PORT: u16 = 5432;
pub const DEFAULT_MONGO_PORT: u16 = 27017;
pub const DEFAULT_DATABASE: &str = "bridge";
pub const DEFAULT_TABLE: &str = "bridge_entries";

// ============================================================================
// TIER DESCRIPTORS
// ============================================================================

/// Backend family of a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TierKind {
    /// In-process cache (memory, or LMDB when a path is given).
    LocalCache,
    /// Cache shared by every instance, e.g. Redis.
    RemoteCache,
    Relational,
    Document,
    /// Read-only JSON or YAML snapshot on disk.
    File,
}

impl TierKind {
    pub fn default_role(self) -> TierRole {
        match self {
            TierKind::Relational | TierKind::Document => TierRole::Store,
            TierKind::LocalCache | TierKind::RemoteCache | TierKind::File => TierRole::Cache,
        }
    }

    /// Whether the backend family can hold writes at all.
    pub fn accepts_writes(self) -> bool {
        !matches!(self, TierKind::File)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TierKind::LocalCache => "local-cache",
            TierKind::RemoteCache => "remote-cache",
            TierKind::Relational => "relational",
            TierKind::Document => "document",
            TierKind::File => "file",
        }
    }
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a tier holds copies or is the system of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierRole {
    Cache,
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Written synchronously before the caller is acknowledged.
    Through,
    /// Queued and applied asynchronously after acknowledgement.
    Back,
    #[serde(rename = "none")]
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    Through,
    #[serde(rename = "none")]
    Disabled,
}

/// Validated description of one tier in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierDescriptor {
    pub name: String,
    pub kind: TierKind,
    pub role: TierRole,
    pub order: u32,
    /// TTL applied to copies written into this tier.
    pub ttl: Option<Duration>,
    pub write_mode: WriteMode,
    pub read_mode: ReadMode,
}

impl TierDescriptor {
    pub fn new(name: impl Into<String>, kind: TierKind, order: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            role: kind.default_role(),
            order,
            ttl: None,
            write_mode: if kind.accepts_writes() {
                WriteMode::Through
            } else {
                WriteMode::Disabled
            },
            read_mode: ReadMode::Through,
        }
    }

    pub fn with_role(mut self, role: TierRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    pub fn with_read_mode(mut self, mode: ReadMode) -> Self {
        self.read_mode = mode;
        self
    }

    pub fn is_store(&self) -> bool {
        self.role == TierRole::Store
    }

    pub fn reads_through(&self) -> bool {
        self.read_mode == ReadMode::Through
    }

    pub fn accepts_writes(&self) -> bool {
        self.write_mode != WriteMode::Disabled
    }
}

/// Check the chain-level rules every tier list must satisfy.
///
/// `write_back_enabled` is the explicit opt-in required before any tier may
/// use [`WriteMode::Back`].
pub fn validate_descriptors(
    tiers: &[TierDescriptor],
    write_back_enabled: bool,
) -> Result<(), ConfigError> {
    if tiers.is_empty() {
        return Err(ConfigError::MissingRequired {
            field: "tiers".to_string(),
        });
    }

    let mut names = HashSet::new();
    let mut orders = HashSet::new();
    for tier in tiers {
        if tier.name.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "tiers[].name".to_string(),
            });
        }
        if !names.insert(tier.name.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "tiers[].name".to_string(),
                value: tier.name.clone(),
                reason: "tier names must be unique".to_string(),
            });
        }
        if !orders.insert(tier.order) {
            return Err(ConfigError::InvalidValue {
                field: format!("tiers.{}.order", tier.name),
                value: tier.order.to_string(),
                reason: "tier orders must be strictly increasing".to_string(),
            });
        }
        if !tier.kind.accepts_writes() && tier.accepts_writes() {
            return Err(ConfigError::IncompatibleOptions {
                option_a: format!("tiers.{}.kind={}", tier.name, tier.kind),
                option_b: "writeMode other than none".to_string(),
            });
        }
        if tier.ttl == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                field: format!("tiers.{}.ttlSeconds", tier.name),
                value: "0".to_string(),
                reason: "must be positive when set".to_string(),
            });
        }
    }

    let mut sorted: Vec<&TierDescriptor> = tiers.iter().collect();
    sorted.sort_by_key(|t| t.order);

    let stores: Vec<&&TierDescriptor> = sorted.iter().filter(|t| t.is_store()).collect();
    let store = match stores.as_slice() {
        [store] => **store,
        [] => {
            return Err(ConfigError::MissingRequired {
                field: "tiers[role=store]".to_string(),
            })
        }
        _ => {
            return Err(ConfigError::InvalidValue {
                field: "tiers[].role".to_string(),
                value: stores.len().to_string(),
                reason: "exactly one tier must be the system of record".to_string(),
            })
        }
    };

    if !store.accepts_writes() || !store.reads_through() {
        return Err(ConfigError::InvalidValue {
            field: format!("tiers.{}", store.name),
            value: format!("{:?}/{:?}", store.write_mode, store.read_mode),
            reason: "the store tier must be readable and writable".to_string(),
        });
    }
    if !store.kind.accepts_writes() {
        return Err(ConfigError::IncompatibleOptions {
            option_a: format!("tiers.{}.role=store", store.name),
            option_b: format!("kind={}", store.kind),
        });
    }

    // A read-only tier ahead of the store would keep serving values that
    // writes and deletes never reach.
    if let Some(stale) = sorted
        .iter()
        .find(|t| t.order < store.order && t.reads_through() && !t.accepts_writes())
    {
        return Err(ConfigError::InvalidValue {
            field: format!("tiers.{}.writeMode", stale.name),
            value: format!("{:?}", stale.write_mode),
            reason: "read-only tiers must be ordered after the store".to_string(),
        });
    }

    for fallback in sorted.iter().filter(|t| t.order > store.order) {
        if fallback.accepts_writes() {
            return Err(ConfigError::InvalidValue {
                field: format!("tiers.{}.writeMode", fallback.name),
                value: format!("{:?}", fallback.write_mode),
                reason: "tiers after the store are read-only fallbacks".to_string(),
            });
        }
    }

    if let Some(first_back) = sorted.iter().find(|t| t.write_mode == WriteMode::Back) {
        if !write_back_enabled {
            return Err(ConfigError::IncompatibleOptions {
                option_a: format!("tiers.{}.writeMode=back", first_back.name),
                option_b: "writeBackEnabled=false".to_string(),
            });
        }
        let has_faster_through = sorted
            .iter()
            .any(|t| t.order < first_back.order && t.write_mode == WriteMode::Through);
        if !has_faster_through {
            return Err(ConfigError::InvalidValue {
                field: format!("tiers.{}.writeMode", first_back.name),
                value: "back".to_string(),
                reason: "write-back needs a faster write-through tier to acknowledge"
                    .to_string(),
            });
        }
    }

    Ok(())
}

// ============================================================================
// CONNECTION
// ============================================================================

/// How to reach a backend.
///
/// Either a full `url` or its parts. Missing parts fall back to local
/// defaults for the backend family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSpec {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Table (relational) or collection (document) holding entries.
    pub table: Option<String>,
    pub pool_size: Option<usize>,
}

impl ConnectionSpec {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    pub fn database(&self) -> &str {
        self.database.as_deref().unwrap_or(DEFAULT_DATABASE)
    }

    pub fn table(&self) -> &str {
        self.table.as_deref().unwrap_or(DEFAULT_TABLE)
    }

    fn credentials(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{}:{}@", user, pass),
            (Some(user), None) => format!("{}@", user),
            (None, Some(pass)) => format!(":{}@", pass),
            (None, None) => String::new(),
        }
    }

    pub fn redis_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let db = self
            .database
            .as_deref()
            .and_then(|d| d.parse::<u32>().ok())
            .map(|d| format!("/{}", d))
            .unwrap_or_default();
        format!(
            "redis://{}{}:{}{}",
            self.credentials(),
            self.host(),
            self.port.unwrap_or(DEFAULT_REDIS_PORT),
            db
        )
    }

    pub fn mongo_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        format!(
            "mongodb://{}{}:{}",
            self.credentials(),
            self.host(),
            self.port.unwrap_or(DEFAULT_MONGO_PORT)
        )
    }

    pub fn postgres_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_POSTGRES_PORT)
    }

    /// Connection target with the password elided, safe for logs.
    pub fn redacted(&self) -> String {
        match &self.url {
            Some(url) => match url.rfind('@') {
                Some(at) => {
                    let scheme_end = url.find("://").map(|i| i + 3).unwrap_or(0);
                    format!("{}***{}", &url[..scheme_end], &url[at..])
                }
                None => url.clone(),
            },
            None => format!(
                "{}:{}/{}",
                self.host(),
                self.port.map(|p| p.to_string()).unwrap_or_default(),
                self.database()
            ),
        }
    }
}

// ============================================================================
// TIER CONFIG
// ============================================================================

/// One tier as written in a configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierConfig {
    pub name: String,
    pub kind: TierKind,
    pub order: u32,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    /// Defaults to `through`, or `none` for file tiers.
    #[serde(default)]
    pub write_mode: Option<WriteMode>,
    #[serde(default = "default_read_mode")]
    pub read_mode: ReadMode,
    /// Defaults to `store` for relational and document tiers.
    #[serde(default)]
    pub role: Option<TierRole>,
    /// Maximum entries held by a local cache.
    #[serde(default)]
    pub capacity: Option<usize>,
    /// LMDB directory for a persistent local cache, or the snapshot file.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub map_size_mb: Option<usize>,
    #[serde(default)]
    pub connection: ConnectionSpec,
}

fn default_read_mode() -> ReadMode {
    ReadMode::Through
}

impl TierConfig {
    pub fn new(name: impl Into<String>, kind: TierKind, order: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            order,
            ttl_seconds: None,
            write_mode: None,
            read_mode: ReadMode::Through,
            role: None,
            capacity: None,
            path: None,
            map_size_mb: None,
            connection: ConnectionSpec::default(),
        }
    }

    pub fn with_ttl_seconds(mut self, ttl: u64) -> Self {
        self.ttl_seconds = Some(ttl);
        self
    }

    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = Some(mode);
        self
    }

    pub fn with_read_mode(mut self, mode: ReadMode) -> Self {
        self.read_mode = mode;
        self
    }

    pub fn with_role(mut self, role: TierRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_connection(mut self, connection: ConnectionSpec) -> Self {
        self.connection = connection;
        self
    }

    pub fn descriptor(&self) -> TierDescriptor {
        let mut descriptor = TierDescriptor::new(self.name.clone(), self.kind, self.order)
            .with_read_mode(self.read_mode);
        if let Some(mode) = self.write_mode {
            descriptor = descriptor.with_write_mode(mode);
        }
        if let Some(role) = self.role {
            descriptor = descriptor.with_role(role);
        }
        descriptor.ttl = self.ttl_seconds.map(Duration::from_secs);
        descriptor
    }

    pub fn map_size_mb(&self) -> usize {
        self.map_size_mb.unwrap_or(DEFAULT_LMDB_MAP_SIZE_MB)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: format!("tiers.{}.capacity", self.name),
                value: "0".to_string(),
                reason: "must be positive when set".to_string(),
            });
        }
        if self.kind == TierKind::File && self.path.is_none() {
            return Err(ConfigError::MissingRequired {
                field: format!("tiers.{}.path", self.name),
            });
        }
        if self.capacity.is_some() && self.kind != TierKind::LocalCache {
            return Err(ConfigError::IncompatibleOptions {
                option_a: format!("tiers.{}.capacity", self.name),
                option_b: format!("kind={}", self.kind),
            });
        }
        Ok(())
    }
}

// ============================================================================
// RETRY
// ============================================================================

/// Backoff schedule shared by repairs and write-back drains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub initial_backoff_millis: u64,
    pub max_backoff_millis: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_millis: DEFAULT_INITIAL_BACKOFF_MILLIS,
            max_backoff_millis: DEFAULT_MAX_BACKOFF_MILLIS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_millis)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_millis)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_backoff_millis as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff_millis as f64);
        Duration::from_millis(capped as u64)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.backoff_multiplier >= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "retry.backoffMultiplier".to_string(),
                value: self.backoff_multiplier.to_string(),
                reason: "must be at least 1.0".to_string(),
            });
        }
        if self.initial_backoff_millis > self.max_backoff_millis {
            return Err(ConfigError::InvalidValue {
                field: "retry.initialBackoffMillis".to_string(),
                value: self.initial_backoff_millis.to_string(),
                reason: "must not exceed maxBackoffMillis".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// BRIDGE CONFIG
// ============================================================================

/// Top-level bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub tiers: Vec<TierConfig>,
    /// When set, confirmed misses are cached as tombstones for this long.
    pub negative_cache_ttl_seconds: Option<u64>,
    pub write_back_queue_capacity: usize,
    pub max_retry_attempts: u32,
    pub connection_timeout_millis: u64,
    /// Identity used to ignore our own invalidation messages.
    pub instance_id: Option<String>,
    pub write_back_enabled: bool,
    pub write_back_workers: usize,
    pub retry: RetryConfig,
    pub max_value_bytes: usize,
    pub invalidation_channel: String,
    /// Also publish invalidations for committed writes, not only deletes.
    pub invalidate_on_write: bool,
    /// Probe period for the health monitor. 0 disables the monitor.
    pub health_check_interval_millis: u64,
    pub unhealthy_threshold: u32,
    pub resubscribe_delay_millis: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tiers: Vec::new(),
            negative_cache_ttl_seconds: None,
            write_back_queue_capacity: DEFAULT_WRITE_BACK_QUEUE_CAPACITY,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            connection_timeout_millis: DEFAULT_CONNECTION_TIMEOUT_MILLIS,
            instance_id: None,
            write_back_enabled: false,
            write_back_workers: DEFAULT_WRITE_BACK_WORKERS,
            retry: RetryConfig::default(),
            max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
            invalidation_channel: DEFAULT_INVALIDATION_CHANNEL.to_string(),
            invalidate_on_write: false,
            health_check_interval_millis: DEFAULT_HEALTH_CHECK_INTERVAL_MILLIS,
            unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
            resubscribe_delay_millis: DEFAULT_RESUBSCRIBE_DELAY_MILLIS,
        }
    }
}

impl BridgeConfig {
    pub fn new(tiers: Vec<TierConfig>) -> Self {
        Self {
            tiers,
            ..Self::default()
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(s).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&raw),
            other => Err(ConfigError::InvalidValue {
                field: "path".to_string(),
                value: other.unwrap_or("").to_string(),
                reason: "expected a .json, .yaml or .yml file".to_string(),
            }),
        }
    }

    /// Tier descriptors in consultation order.
    pub fn descriptors(&self) -> Vec<TierDescriptor> {
        let mut descriptors: Vec<TierDescriptor> =
            self.tiers.iter().map(TierConfig::descriptor).collect();
        descriptors.sort_by_key(|d| d.order);
        descriptors
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_millis)
    }

    pub fn negative_cache_ttl(&self) -> Option<Duration> {
        self.negative_cache_ttl_seconds
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_millis)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_millis)
    }

    /// Configured instance id, or a fresh one.
    pub fn resolved_instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_timeout_millis == 0 {
            return Err(ConfigError::InvalidValue {
                field: "connectionTimeoutMillis".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.max_retry_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "maxRetryAttempts".to_string(),
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }
        if self.write_back_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "writeBackQueueCapacity".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.write_back_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "writeBackWorkers".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.write_back_workers > self.write_back_queue_capacity {
            return Err(ConfigError::IncompatibleOptions {
                option_a: format!("writeBackWorkers={}", self.write_back_workers),
                option_b: format!("writeBackQueueCapacity={}", self.write_back_queue_capacity),
            });
        }
        if self.max_value_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "maxValueBytes".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.unhealthy_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "unhealthyThreshold".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.invalidation_channel.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "invalidationChannel".to_string(),
            });
        }
        self.retry.validate()?;
        for tier in &self.tiers {
            tier.validate()?;
        }
        validate_descriptors(&self.descriptors(), self.write_back_enabled)
    }
}

// =============================================================================
// TESTS
// =============================================================================
