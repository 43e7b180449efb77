//! Multi-tier coordinator.
//!
//! Executes reads, writes and deletes against a [`TierChain`]: promotes
//! values into faster tiers after misses, writes through (or back) in tier
//! order, repairs cache tiers that failed transiently, and keeps peers
//! coherent over the invalidation bus.
//!
//! # Coherence
//!
//! Every entry carries a [`Version`]. Tiers keep the newest version they
//! have seen (last-writer-wins by version, not by arrival), so retried,
//! delayed or duplicated copies never regress a tier. Writers to one key
//! are serialized by a per-key lock; readers never lock.
//!
//! # Example
//!
//! ```ignore
//! let chain = bridge_storage::factory::build_chain(&config).await?;
//! let bridge = Coordinator::builder(chain)
//!     .settings(CoordinatorSettings::from_config(&config))
//!     .start()
//!     .await?;
//!
//! bridge.put("u:1", br#"{"n":"a"}"#.to_vec()).await?;
//! assert!(bridge.get("u:1").await?.is_some());
//! bridge.shutdown().await;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bridge_core::{
    BridgeError, BridgeEvent, BridgeResult, HealthReport, InvalidationMessage,
    InvalidationReason, Key, TierResult, Version,
};
use futures_util::Stream;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::chain::TierChain;
use crate::events::EventBus;
use crate::health::{health_monitor_task, probe_chain, HealthTracker, MonitorConfig};
use crate::invalidation::{invalidation_listener, InvalidationBus};
use crate::metrics::{CoordinatorMetrics, CoordinatorMetricsSnapshot};
use crate::retry::call_with_timeout;
use crate::tier::TierStats;
use crate::write_back::WriteBackQueue;

mod delete;
mod housekeeping;
pub mod options;
mod promotion;
pub mod read;
pub mod state;
pub mod versions;
pub mod write;

pub use options::{CallOptions, CoordinatorSettings, ReadConsistency, WriteCondition};
pub use read::{BridgeRead, ReadSource};
pub use state::{OpState, OpTracker, ReadState, WriteState};
pub use write::{Durability, WriteAck};

use state::WriteState as W;
use versions::{KeyLocks, VersionTable};

/// State shared by the coordinator handle and its background tasks.
pub(crate) struct Shared {
    pub(crate) chain: Arc<TierChain>,
    pub(crate) settings: CoordinatorSettings,
    pub(crate) versions: Arc<VersionTable>,
    pub(crate) locks: KeyLocks,
    pub(crate) events: EventBus,
    pub(crate) metrics: Arc<CoordinatorMetrics>,
    pub(crate) health: Arc<HealthTracker>,
    pub(crate) bus: Option<Arc<dyn InvalidationBus>>,
    pub(crate) write_back: WriteBackQueue,
    shutdown_tx: watch::Sender<bool>,
}

impl Shared {
    /// Run one adapter call under `timeout` and record its health.
    pub(crate) async fn call<T, F>(&self, index: usize, timeout: Duration, fut: F) -> TierResult<T>
    where
        F: Future<Output = TierResult<T>>,
    {
        self.health
            .observe(index, call_with_timeout(timeout, fut).await)
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Drop `key` from every writable cache, best effort.
    pub(crate) async fn evict_caches(&self, key: &Key) {
        let timeout = self.settings.call_timeout;
        for (index, tier) in self.chain.writable_caches() {
            if let Err(e) = self.call(index, timeout, tier.adapter().delete(key)).await {
                tracing::warn!(tier = tier.name(), key = %key, error = %e, "Cache eviction failed");
            }
        }
    }

    pub(crate) async fn publish(&self, key: &Key, version: Version, reason: InvalidationReason) {
        let Some(bus) = &self.bus else {
            return;
        };
        let message =
            InvalidationMessage::new(key.clone(), self.settings.instance_id.clone(), version, reason);
        match bus.publish(&message).await {
            Ok(()) => CoordinatorMetrics::incr(&self.metrics.invalidations_published),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Invalidation publish failed; peers stay stale until TTL")
            }
        }
    }

    /// Evict a key a peer invalidated from our in-process tiers.
    pub(crate) async fn apply_invalidation(&self, message: InvalidationMessage) {
        if message.is_from(&self.settings.instance_id) {
            return;
        }
        CoordinatorMetrics::incr(&self.metrics.invalidations_received);
        match message.reason {
            InvalidationReason::Write => self.versions.record_commit(&message.key, message.version),
            InvalidationReason::Delete => self.versions.record_delete(&message.key, message.version),
            // The copy aged out; no version to remember.
            InvalidationReason::Expire => {}
        }

        let timeout = self.settings.call_timeout;
        for (index, tier) in self.chain.local_tiers() {
            if let Err(e) = self.call(index, timeout, tier.adapter().delete(&message.key)).await {
                tracing::debug!(tier = tier.name(), key = %message.key, error = %e, "Local eviction failed");
            }
        }
        tracing::debug!(
            key = %message.key,
            origin = %message.origin,
            reason = ?message.reason,
            "Applied peer invalidation"
        );
    }
}

/// Handle to a running coordinator. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("instance_id", &self.shared.settings.instance_id)
            .field("chain", &self.shared.chain)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn builder(chain: TierChain) -> CoordinatorBuilder {
        CoordinatorBuilder {
            chain,
            settings: CoordinatorSettings::default(),
            bus: None,
            events: None,
        }
    }

    pub async fn get(&self, key: impl Into<Key>) -> BridgeResult<Option<Vec<u8>>> {
        self.get_with(key, CallOptions::default()).await
    }

    pub async fn get_with(
        &self,
        key: impl Into<Key>,
        options: CallOptions,
    ) -> BridgeResult<Option<Vec<u8>>> {
        Ok(self.read(key, options).await?.map(BridgeRead::into_value))
    }

    /// Read a value together with its version and the tier that served it.
    pub async fn read(
        &self,
        key: impl Into<Key>,
        options: CallOptions,
    ) -> BridgeResult<Option<BridgeRead<Vec<u8>>>> {
        let key = key.into();
        key.validate()
            .map_err(|e| BridgeError::failure(e.to_string()))?;
        read::read(&self.shared, &key, &options).await
    }

    pub async fn exists(&self, key: impl Into<Key>) -> BridgeResult<bool> {
        Ok(self.read(key, CallOptions::default()).await?.is_some())
    }

    pub async fn put(&self, key: impl Into<Key>, value: impl Into<Vec<u8>>) -> BridgeResult<WriteAck> {
        self.put_with(key, value, CallOptions::default()).await
    }

    /// Write a value.
    ///
    /// Dropping the returned future before the key lock is acquired cancels
    /// the write. Once adapter calls start they run to completion in a
    /// background task even if the caller goes away.
    pub async fn put_with(
        &self,
        key: impl Into<Key>,
        value: impl Into<Vec<u8>>,
        options: CallOptions,
    ) -> BridgeResult<WriteAck> {
        let key = key.into();
        let value = value.into();
        let op = write::begin(&self.shared, &key, value.len())?;

        let guard = self.shared.locks.lock(&key).await;
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            let _guard = guard;
            write::put(&shared, op, key, value, options).await
        });
        task.await
            .map_err(|e| BridgeError::failure(format!("write task failed: {e}")))?
    }

    pub async fn delete(&self, key: impl Into<Key>) -> BridgeResult<()> {
        self.delete_with(key, CallOptions::default()).await
    }

    /// Delete a key: store first, then caches, then peers.
    ///
    /// Cancellation behaves as for [`Coordinator::put_with`].
    pub async fn delete_with(&self, key: impl Into<Key>, options: CallOptions) -> BridgeResult<()> {
        let key = key.into();
        let mut op = OpTracker::new("delete", &key, W::Started);
        op.advance(W::Validating)?;
        if let Err(e) = key.validate() {
            op.fail(W::Failed);
            return Err(BridgeError::failure(e.to_string()));
        }

        let guard = self.shared.locks.lock(&key).await;
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            let _guard = guard;
            delete::delete(&shared, op, key, options).await
        });
        task.await
            .map_err(|e| BridgeError::failure(format!("delete task failed: {e}")))?
    }

    /// Live entries under `prefix` from the system of record, in key order.
    pub async fn list(&self, prefix: &[u8], limit: usize) -> BridgeResult<Vec<BridgeRead<Vec<u8>>>> {
        read::list(&self.shared, prefix, limit).await
    }

    pub fn events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.shared.events.subscribe()
    }

    pub fn event_stream(&self) -> impl Stream<Item = BridgeEvent> + Send + 'static {
        self.shared.events.stream()
    }

    pub fn metrics(&self) -> CoordinatorMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn chain(&self) -> &TierChain {
        &self.shared.chain
    }

    pub fn instance_id(&self) -> &str {
        &self.shared.settings.instance_id
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.shared.settings
    }

    /// Probe every tier now.
    pub async fn health(&self) -> HealthReport {
        probe_chain(
            &self.shared.chain,
            &self.shared.health,
            self.shared.settings.call_timeout,
        )
        .await
    }

    pub async fn tier_stats(&self) -> Vec<(String, TierStats)> {
        let mut stats = Vec::with_capacity(self.shared.chain.len());
        for tier in self.shared.chain.ordered_tiers() {
            stats.push((tier.name().to_string(), tier.adapter().stats().await));
        }
        stats
    }

    /// Stop background tasks and flush the write-back queue.
    pub async fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        self.shared.write_back.shutdown().await;
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Coordinator task panicked");
            }
        }
        tracing::info!(instance_id = %self.shared.settings.instance_id, "Coordinator stopped");
    }
}

pub struct CoordinatorBuilder {
    chain: TierChain,
    settings: CoordinatorSettings,
    bus: Option<Arc<dyn InvalidationBus>>,
    events: Option<EventBus>,
}

impl CoordinatorBuilder {
    pub fn settings(mut self, settings: CoordinatorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.settings.instance_id = id.into();
        self
    }

    pub fn invalidation_bus(mut self, bus: Arc<dyn InvalidationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Share an event bus, e.g. between coordinators observed together.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Start background tasks and return the running coordinator.
    pub async fn start(self) -> BridgeResult<Coordinator> {
        let settings = self.settings;
        if settings.max_value_bytes == 0 {
            return Err(BridgeError::Config(bridge_core::ConfigError::InvalidValue {
                field: "maxValueBytes".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            }));
        }

        let chain = Arc::new(self.chain);
        let events = self.events.unwrap_or_default();
        let health = Arc::new(HealthTracker::new(
            &chain,
            settings.unhealthy_threshold,
            events.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            chain: Arc::clone(&chain),
            versions: Arc::new(VersionTable::new(settings.version_retention)),
            locks: KeyLocks::new(),
            events,
            metrics: Arc::new(CoordinatorMetrics::new()),
            health: Arc::clone(&health),
            bus: self.bus.clone(),
            write_back: WriteBackQueue::new(),
            shutdown_tx,
            settings,
        });

        let mut tasks = Vec::new();

        if chain.has_write_back() {
            shared
                .write_back
                .start(
                    Arc::clone(&shared),
                    shared.settings.write_back_capacity,
                    shared.settings.write_back_workers,
                )
                .await;
        }

        if let Some(bus) = self.bus {
            // Subscribe before returning so no message published after
            // start() is missed.
            let initial = match bus.subscribe().await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    tracing::warn!(error = %e, "Invalidation bus unavailable at startup; retrying in background");
                    None
                }
            };
            tasks.push(tokio::spawn(invalidation_listener(
                Arc::clone(&shared),
                bus,
                initial,
                shared.shutdown_signal(),
            )));
        }

        if !shared.settings.health_check_interval.is_zero() {
            tasks.push(tokio::spawn(health_monitor_task(
                Arc::clone(&chain),
                health,
                MonitorConfig {
                    interval: shared.settings.health_check_interval,
                    probe_timeout: shared.settings.call_timeout,
                },
                shared.shutdown_signal(),
            )));
        }

        if !shared.settings.housekeeping_interval.is_zero() {
            tasks.push(tokio::spawn(housekeeping::housekeeping_task(
                Arc::clone(&shared),
                shared.shutdown_signal(),
            )));
        }

        tracing::info!(
            instance_id = %shared.settings.instance_id,
            tiers = chain.len(),
            store = chain.store_tier().name(),
            write_back = chain.has_write_back(),
            "Coordinator started"
        );

        Ok(Coordinator {
            shared,
            tasks: Arc::new(Mutex::new(tasks)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidation::LocalInvalidationBus;
    use crate::retry::RetryPolicy;
    use crate::tier::{FaultInjectingTier, MemoryTier, TierAdapter};
    use bridge_core::{RetryConfig, TierDescriptor, TierKind, WriteMode};

    struct Tiers {
        local: Arc<FaultInjectingTier>,
        remote: Arc<FaultInjectingTier>,
        store: Arc<FaultInjectingTier>,
        raw_local: Arc<MemoryTier>,
        raw_remote: Arc<MemoryTier>,
        raw_store: Arc<MemoryTier>,
    }

    fn wrap(inner: &Arc<MemoryTier>) -> Arc<FaultInjectingTier> {
        Arc::new(FaultInjectingTier::new(
            Arc::clone(inner) as Arc<dyn TierAdapter>
        ))
    }

    impl Tiers {
        fn new() -> Self {
            let raw_remote = Arc::new(MemoryTier::new().with_kind(TierKind::RemoteCache));
            let raw_store = Arc::new(MemoryTier::new().with_kind(TierKind::Relational));
            Self::sharing(&raw_remote, &raw_store)
        }

        /// A fresh local tier over a shared remote cache and store.
        fn sharing(raw_remote: &Arc<MemoryTier>, raw_store: &Arc<MemoryTier>) -> Self {
            let raw_local = Arc::new(MemoryTier::new());
            Self {
                local: wrap(&raw_local),
                remote: wrap(raw_remote),
                store: wrap(raw_store),
                raw_local,
                raw_remote: Arc::clone(raw_remote),
                raw_store: Arc::clone(raw_store),
            }
        }

        fn chain(&self, store_mode: WriteMode) -> TierChain {
            TierChain::builder()
                .tier(
                    TierDescriptor::new("local", TierKind::LocalCache, 0),
                    Arc::clone(&self.local) as Arc<dyn TierAdapter>,
                )
                .tier(
                    TierDescriptor::new("remote", TierKind::RemoteCache, 1),
                    Arc::clone(&self.remote) as Arc<dyn TierAdapter>,
                )
                .tier(
                    TierDescriptor::new("pg", TierKind::Relational, 2).with_write_mode(store_mode),
                    Arc::clone(&self.store) as Arc<dyn TierAdapter>,
                )
                .write_back_enabled(store_mode == WriteMode::Back)
                .build()
                .unwrap()
        }
    }

    fn settings() -> CoordinatorSettings {
        CoordinatorSettings {
            retry: RetryPolicy::new(
                3,
                RetryConfig {
                    initial_backoff_millis: 1,
                    max_backoff_millis: 5,
                    backoff_multiplier: 2.0,
                },
            ),
            call_timeout: Duration::from_millis(500),
            health_check_interval: Duration::ZERO,
            ..CoordinatorSettings::default()
        }
    }

    async fn start(tiers: &Tiers) -> Coordinator {
        Coordinator::builder(tiers.chain(WriteMode::Through))
            .settings(settings())
            .start()
            .await
            .unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    async fn next_event(
        rx: &mut broadcast::Receiver<BridgeEvent>,
        pred: impl Fn(&BridgeEvent) -> bool,
    ) -> BridgeEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    fn key(s: &str) -> Key {
        Key::from(s)
    }

    #[tokio::test]
    async fn test_put_writes_through_every_tier() {
        let tiers = Tiers::new();
        let bridge = start(&tiers).await;
        let ack = bridge.put("u:1", b"a".to_vec()).await.unwrap();
        assert!(ack.is_durable());

        for raw in [&tiers.raw_local, &tiers.raw_remote, &tiers.raw_store] {
            assert_eq!(raw.peek(&key("u:1")).unwrap().version, ack.version);
        }
        assert_eq!(bridge.get("u:1").await.unwrap(), Some(b"a".to_vec()));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_miss_promotes_into_faster_tiers() {
        let tiers = Tiers::new();
        let bridge = start(&tiers).await;
        let ack = bridge.put("u:1", b"a".to_vec()).await.unwrap();
        tiers.raw_local.delete(&key("u:1")).await.unwrap();

        let read = bridge.read("u:1", CallOptions::new()).await.unwrap().unwrap();
        assert_eq!(read.tier(), "remote");
        assert!(read.was_cache_hit());
        assert_eq!(read.version(), ack.version);

        eventually(|| tiers.raw_local.peek(&key("u:1")).is_some()).await;
        assert_eq!(tiers.raw_local.peek(&key("u:1")).unwrap().version, ack.version);
        eventually(|| bridge.metrics().promotions == 1).await;
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_store_failure_fails_write_and_evicts_caches() {
        let tiers = Tiers::new();
        let bridge = start(&tiers).await;
        bridge.put("u:1", b"old".to_vec()).await.unwrap();

        tiers.store.fail_next_puts(1);
        let err = bridge.put("u:1", b"new".to_vec()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Unavailable { .. }));
        assert!(tiers.raw_local.peek(&key("u:1")).is_none());
        assert!(tiers.raw_remote.peek(&key("u:1")).is_none());
        assert_eq!(tiers.raw_store.peek(&key("u:1")).unwrap().value, b"old");
        assert_eq!(bridge.get("u:1").await.unwrap(), Some(b"old".to_vec()));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_cache_failure_is_repaired() {
        let tiers = Tiers::new();
        let bridge = start(&tiers).await;
        let mut events = bridge.events();

        tiers.remote.fail_next_puts(1);
        let ack = bridge.put("u:1", b"a".to_vec()).await.unwrap();

        let scheduled = next_event(&mut events, |e| matches!(e, BridgeEvent::RepairScheduled { .. })).await;
        assert_eq!(scheduled.tier(), "remote");
        let completed = next_event(&mut events, |e| matches!(e, BridgeEvent::RepairCompleted { .. })).await;
        assert_eq!(completed.tier(), "remote");
        assert_eq!(tiers.raw_remote.peek(&key("u:1")).unwrap().version, ack.version);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_aborts_when_store_fails() {
        let tiers = Tiers::new();
        let bridge = start(&tiers).await;
        bridge.put("u:1", b"a".to_vec()).await.unwrap();

        tiers.store.kill();
        let err = bridge.delete("u:1").await.unwrap_err();
        assert!(matches!(err, BridgeError::Unavailable { .. }));
        assert!(tiers.raw_local.peek(&key("u:1")).is_some());

        tiers.store.revive();
        bridge.delete("u:1").await.unwrap();
        assert_eq!(bridge.get("u:1").await.unwrap(), None);
        assert!(tiers.raw_local.peek(&key("u:1")).is_none());
        assert!(tiers.raw_remote.peek(&key("u:1")).is_none());
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_conditional_writes() {
        let tiers = Tiers::new();
        let bridge = start(&tiers).await;

        let first = bridge
            .put_with("k", b"1".to_vec(), CallOptions::new().expecting_absent())
            .await
            .unwrap();
        let err = bridge
            .put_with("k", b"2".to_vec(), CallOptions::new().expecting_absent())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Conflict { current: Some(v), .. } if v == first.version));

        let stale = bridge
            .put_with("k", b"2".to_vec(), CallOptions::new().expecting(Version::new(1)))
            .await
            .unwrap_err();
        assert!(matches!(stale, BridgeError::Conflict { expected: Some(_), .. }));

        let second = bridge
            .put_with("k", b"2".to_vec(), CallOptions::new().expecting(first.version))
            .await
            .unwrap();
        assert!(second.version > first.version);
        assert_eq!(bridge.metrics().conflicts, 2);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_reads_degrade_when_store_is_down() {
        let tiers = Tiers::new();
        let bridge = start(&tiers).await;
        bridge.put("u:1", b"a".to_vec()).await.unwrap();

        tiers.store.kill();
        assert_eq!(bridge.get("u:1").await.unwrap(), Some(b"a".to_vec()));

        let err = bridge.get("u:2").await.unwrap_err();
        assert!(matches!(err, BridgeError::Unavailable { .. }));
        let err = bridge
            .get_with("u:1", CallOptions::new().authoritative())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Unavailable { .. }));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_negative_cache_suppresses_store_lookups() {
        let tiers = Tiers::new();
        let bridge = Coordinator::builder(tiers.chain(WriteMode::Through))
            .settings(CoordinatorSettings {
                negative_cache_ttl: Some(Duration::from_secs(60)),
                ..settings()
            })
            .start()
            .await
            .unwrap();

        assert_eq!(bridge.get("ghost").await.unwrap(), None);
        eventually(|| {
            tiers
                .raw_local
                .peek(&key("ghost"))
                .is_some_and(|e| e.tombstone)
        })
        .await;

        let store_gets = tiers.store.get_calls();
        assert_eq!(bridge.get("ghost").await.unwrap(), None);
        assert_eq!(tiers.store.get_calls(), store_gets);

        bridge.put("ghost", b"boo".to_vec()).await.unwrap();
        assert_eq!(bridge.get("ghost").await.unwrap(), Some(b"boo".to_vec()));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_without_negative_ttl_misses_are_not_cached() {
        let tiers = Tiers::new();
        let bridge = start(&tiers).await;
        assert_eq!(bridge.get("ghost").await.unwrap(), None);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(tiers.raw_local.is_empty());
        assert!(tiers.raw_remote.is_empty());
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_back_store_becomes_durable() {
        let tiers = Tiers::new();
        let bridge = Coordinator::builder(tiers.chain(WriteMode::Back))
            .settings(settings())
            .start()
            .await
            .unwrap();

        let ack = bridge.put("u:1", b"a".to_vec()).await.unwrap();
        assert!(!ack.is_durable());
        let version = ack.version;
        assert_eq!(ack.durable().await.unwrap(), version);
        assert_eq!(tiers.raw_store.peek(&key("u:1")).unwrap().version, version);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_back_exhaustion_reports_data_loss() {
        let tiers = Tiers::new();
        let bridge = Coordinator::builder(tiers.chain(WriteMode::Back))
            .settings(settings())
            .start()
            .await
            .unwrap();
        let mut events = bridge.events();

        tiers.store.fail_next_puts(10);
        let ack = bridge.put("u:1", b"a".to_vec()).await.unwrap();
        let err = ack.durable().await.unwrap_err();
        assert!(matches!(err, BridgeError::DataLoss { attempts: 3, .. }));
        let event = next_event(&mut events, |e| matches!(e, BridgeEvent::WriteBackExhausted { .. })).await;
        assert_eq!(event.tier(), "pg");
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_peer_eviction_over_bus() {
        let bus = Arc::new(LocalInvalidationBus::default());
        let a_tiers = Tiers::new();
        let b_tiers = Tiers::sharing(&a_tiers.raw_remote, &a_tiers.raw_store);
        let a = Coordinator::builder(a_tiers.chain(WriteMode::Through))
            .settings(settings())
            .instance_id("a")
            .invalidation_bus(Arc::clone(&bus) as Arc<dyn InvalidationBus>)
            .start()
            .await
            .unwrap();
        let b = Coordinator::builder(b_tiers.chain(WriteMode::Through))
            .settings(settings())
            .instance_id("b")
            .invalidation_bus(Arc::clone(&bus) as Arc<dyn InvalidationBus>)
            .start()
            .await
            .unwrap();

        a.put("u:1", b"a".to_vec()).await.unwrap();
        assert_eq!(b.get("u:1").await.unwrap(), Some(b"a".to_vec()));
        eventually(|| b_tiers.raw_local.peek(&key("u:1")).is_some()).await;

        a.delete("u:1").await.unwrap();
        eventually(|| b_tiers.raw_local.peek(&key("u:1")).is_none()).await;
        assert_eq!(b.get("u:1").await.unwrap(), None);
        assert_eq!(b.metrics().invalidations_received, 1);
        assert_eq!(a.metrics().invalidations_received, 0);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_housekeeping_runs_without_health_monitor() {
        let tiers = Tiers::new();
        let bridge = Coordinator::builder(tiers.chain(WriteMode::Through))
            .settings(CoordinatorSettings {
                version_retention: Duration::from_millis(200),
                housekeeping_interval: Duration::from_millis(10),
                ..settings()
            })
            .start()
            .await
            .unwrap();
        assert!(bridge.settings().health_check_interval.is_zero());

        bridge.put("u:1", b"a".to_vec()).await.unwrap();
        bridge.put("u:2", b"b".to_vec()).await.unwrap();
        assert_eq!(bridge.shared.versions.len(), 2);
        eventually(|| bridge.shared.versions.is_empty()).await;
        assert_eq!(bridge.get("u:1").await.unwrap(), Some(b"a".to_vec()));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_expired_shared_entries_are_announced() {
        use futures_util::StreamExt;

        let bus = Arc::new(LocalInvalidationBus::default());
        let mut messages = bus.subscribe().await.unwrap();
        let tiers = Tiers::new();
        let bridge = Coordinator::builder(tiers.chain(WriteMode::Through))
            .settings(CoordinatorSettings {
                housekeeping_interval: Duration::from_millis(10),
                ..settings()
            })
            .instance_id("a")
            .invalidation_bus(Arc::clone(&bus) as Arc<dyn InvalidationBus>)
            .start()
            .await
            .unwrap();

        bridge
            .put_with(
                "u:1",
                b"a".to_vec(),
                CallOptions::new().with_ttl(Duration::from_millis(30)),
            )
            .await
            .unwrap();

        let expired = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match messages.next().await {
                    Some(m) if m.reason == InvalidationReason::Expire => return m,
                    Some(_) => continue,
                    None => panic!("bus closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(expired.key, key("u:1"));
        assert_eq!(expired.origin, "a");
        eventually(|| tiers.raw_store.peek(&key("u:1")).is_none()).await;
        assert!(bridge.metrics().invalidations_published >= 1);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_put_still_commits() {
        let tiers = Tiers::new();
        let bridge = start(&tiers).await;
        tiers.store.set_latency(Some(Duration::from_millis(50)));

        let attempt =
            tokio::time::timeout(Duration::from_millis(10), bridge.put("u:1", b"a".to_vec())).await;
        assert!(attempt.is_err());
        eventually(|| tiers.raw_store.peek(&key("u:1")).is_some()).await;
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejects_invalid_input() {
        let tiers = Tiers::new();
        let bridge = Coordinator::builder(tiers.chain(WriteMode::Through))
            .settings(CoordinatorSettings {
                max_value_bytes: 4,
                ..settings()
            })
            .start()
            .await
            .unwrap();
        assert!(matches!(
            bridge.put("k", b"too long".to_vec()).await.unwrap_err(),
            BridgeError::Failure { .. }
        ));
        assert!(matches!(
            bridge.put("", b"x".to_vec()).await.unwrap_err(),
            BridgeError::Failure { .. }
        ));
        assert_eq!(tiers.store.put_calls(), 0);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let tiers = Tiers::new();
        let bridge = start(&tiers).await;
        for k in ["a:1", "a:2", "b:1"] {
            bridge.put(k, k.as_bytes().to_vec()).await.unwrap();
        }
        let listed = bridge.list(b"a:", 10).await.unwrap();
        let keys: Vec<String> = listed.iter().map(|r| r.key().to_string()).collect();
        assert_eq!(keys, vec!["a:1", "a:2"]);
        assert!(bridge.list(b"a:", 0).await.unwrap().is_empty());
        bridge.shutdown().await;
    }
}
