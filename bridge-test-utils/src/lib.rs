//! Bridge Test Utilities
//!
//! Shared test infrastructure for the bridge workspace:
//! - Proptest generators for keys, values, versions and configurations
//! - Fixtures for fault-injecting tier chains and peer coordinators
//! - Event-wait helpers and custom assertions

pub use bridge_core::{
    BridgeConfig, BridgeError, BridgeEvent, BridgeResult, Entry, Key, RepairKind, RetryConfig,
    TierConfig, TierDescriptor, TierError, TierKind, Version, WriteMode,
};
pub use bridge_storage::{
    CallOptions, Coordinator, CoordinatorSettings, FaultInjectingTier, LocalInvalidationBus,
    MemoryTier, RetryPolicy, TierAdapter, TierChain,
};

use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for bridge types.

    use super::*;
    use proptest::prelude::*;

    /// Readable `namespace:id` keys.
    pub fn arb_key() -> impl Strategy<Value = Key> {
        "[a-z]{1,6}:[0-9]{1,4}".prop_map(Key::from)
    }

    /// Arbitrary non-empty binary keys.
    pub fn arb_binary_key() -> impl Strategy<Value = Key> {
        prop::collection::vec(any::<u8>(), 1..64).prop_map(Key::from)
    }

    pub fn arb_value() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..256)
    }

    /// Versions well inside the hybrid clock range.
    pub fn arb_version() -> impl Strategy<Value = Version> {
        (1u64..u64::MAX / 2).prop_map(Version::new)
    }

    pub fn arb_entry() -> impl Strategy<Value = Entry> {
        (arb_key(), arb_value(), arb_version())
            .prop_map(|(key, value, version)| Entry::new(key, value, version))
    }

    pub fn arb_cache_kind() -> impl Strategy<Value = TierKind> {
        prop_oneof![Just(TierKind::LocalCache), Just(TierKind::RemoteCache)]
    }

    pub fn arb_store_kind() -> impl Strategy<Value = TierKind> {
        prop_oneof![Just(TierKind::Relational), Just(TierKind::Document)]
    }

    pub fn arb_retry_config() -> impl Strategy<Value = RetryConfig> {
        (1u64..1000, 1u64..10, 1.0f64..4.0).prop_map(|(initial, factor, multiplier)| RetryConfig {
            initial_backoff_millis: initial,
            max_backoff_millis: initial * factor * 10,
            backoff_multiplier: multiplier,
        })
    }

    /// A configuration that passes validation: one or two caches ahead of
    /// a single store, optional TTLs and negative caching.
    pub fn arb_valid_config() -> impl Strategy<Value = BridgeConfig> {
        (
            prop::option::of(1u64..3600),
            any::<bool>(),
            arb_store_kind(),
            prop::option::of(1u64..60),
            16usize..10_000,
            1u32..10,
            arb_retry_config(),
        )
            .prop_map(
                |(local_ttl, with_remote, store_kind, negative_ttl, capacity, attempts, retry)| {
                    let mut local = TierConfig::new("local", TierKind::LocalCache, 0);
                    if let Some(ttl) = local_ttl {
                        local = local.with_ttl_seconds(ttl);
                    }
                    let mut tiers = vec![local];
                    if with_remote {
                        tiers.push(TierConfig::new("remote", TierKind::RemoteCache, 1));
                    }
                    tiers.push(TierConfig::new("store", store_kind, 2));

                    let mut config = BridgeConfig::new(tiers);
                    config.negative_cache_ttl_seconds = negative_ttl;
                    config.write_back_queue_capacity = capacity;
                    config.max_retry_attempts = attempts;
                    config.retry = retry;
                    config
                },
            )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Tier chains over in-memory backends with fault injection.

    use super::*;
    use bridge_storage::InvalidationBus;

    /// One tier: the fault-injecting adapter the chain sees and the memory
    /// backend underneath, for inspecting state directly.
    #[derive(Clone)]
    pub struct TierHandle {
        pub name: String,
        pub faults: Arc<FaultInjectingTier>,
        pub data: Arc<MemoryTier>,
    }

    impl TierHandle {
        pub fn new(name: &str, kind: TierKind) -> Self {
            let data = Arc::new(MemoryTier::new().with_kind(kind));
            Self {
                name: name.to_string(),
                faults: Arc::new(FaultInjectingTier::new(
                    Arc::clone(&data) as Arc<dyn TierAdapter>
                )),
                data,
            }
        }

        pub fn adapter(&self) -> Arc<dyn TierAdapter> {
            Arc::clone(&self.faults) as Arc<dyn TierAdapter>
        }

        /// Entry held by the backend, bypassing faults.
        pub fn peek(&self, key: &str) -> Option<Entry> {
            self.data.peek(&Key::from(key))
        }

        pub fn kill(&self) {
            self.faults.kill();
        }

        pub fn revive(&self) {
            self.faults.revive();
        }
    }

    /// `[local-cache 0, remote-cache 1, relational 2 (store)]`, all
    /// write-through unless the store is switched to write-back.
    #[derive(Clone)]
    pub struct ThreeTierFixture {
        pub local: TierHandle,
        pub remote: TierHandle,
        pub store: TierHandle,
    }

    impl Default for ThreeTierFixture {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ThreeTierFixture {
        pub fn new() -> Self {
            Self {
                local: TierHandle::new("local", TierKind::LocalCache),
                remote: TierHandle::new("remote", TierKind::RemoteCache),
                store: TierHandle::new("pg", TierKind::Relational),
            }
        }

        /// Another instance: its own local cache, the same remote cache and
        /// store (faults included).
        pub fn peer(&self) -> Self {
            Self {
                local: TierHandle::new("local", TierKind::LocalCache),
                remote: self.remote.clone(),
                store: self.store.clone(),
            }
        }

        pub fn chain(&self) -> TierChain {
            self.chain_with(WriteMode::Through)
        }

        pub fn chain_with(&self, store_mode: WriteMode) -> TierChain {
            let builder = TierChain::builder()
                .tier(
                    TierDescriptor::new(&self.local.name, TierKind::LocalCache, 0),
                    self.local.adapter(),
                )
                .tier(
                    TierDescriptor::new(&self.remote.name, TierKind::RemoteCache, 1),
                    self.remote.adapter(),
                )
                .tier(
                    TierDescriptor::new(&self.store.name, TierKind::Relational, 2)
                        .with_write_mode(store_mode),
                    self.store.adapter(),
                )
                .write_back_enabled(store_mode == WriteMode::Back);
            match builder.build() {
                Ok(chain) => chain,
                Err(e) => panic!("fixture chain is invalid: {e}"),
            }
        }

        pub async fn start(&self) -> Coordinator {
            self.start_with(test_settings(), WriteMode::Through).await
        }

        pub async fn start_with(&self, settings: CoordinatorSettings, store_mode: WriteMode) -> Coordinator {
            match Coordinator::builder(self.chain_with(store_mode))
                .settings(settings)
                .start()
                .await
            {
                Ok(bridge) => bridge,
                Err(e) => panic!("coordinator failed to start: {e}"),
            }
        }
    }

    /// Retries that settle within a few milliseconds.
    pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            RetryConfig {
                initial_backoff_millis: 1,
                max_backoff_millis: 10,
                backoff_multiplier: 2.0,
            },
        )
    }

    /// Settings for tests: fast retries, short timeouts, no health monitor.
    pub fn test_settings() -> CoordinatorSettings {
        CoordinatorSettings {
            retry: fast_retry(3),
            call_timeout: Duration::from_millis(500),
            health_check_interval: Duration::ZERO,
            resubscribe_delay: Duration::from_millis(10),
            ..CoordinatorSettings::default()
        }
    }

    /// Two coordinators sharing remote cache, store and an invalidation bus.
    pub struct Peers {
        pub a_tiers: ThreeTierFixture,
        pub a: Coordinator,
        pub b_tiers: ThreeTierFixture,
        pub b: Coordinator,
        pub bus: Arc<LocalInvalidationBus>,
    }

    impl Peers {
        pub async fn start() -> Self {
            Self::start_with(test_settings()).await
        }

        pub async fn start_with(settings: CoordinatorSettings) -> Self {
            let bus = Arc::new(LocalInvalidationBus::default());
            let a_tiers = ThreeTierFixture::new();
            let b_tiers = a_tiers.peer();
            let a = start_peer(&a_tiers, &settings, "peer-a", &bus).await;
            let b = start_peer(&b_tiers, &settings, "peer-b", &bus).await;
            Self {
                a_tiers,
                a,
                b_tiers,
                b,
                bus,
            }
        }

        pub async fn shutdown(&self) {
            self.a.shutdown().await;
            self.b.shutdown().await;
        }
    }

    async fn start_peer(
        tiers: &ThreeTierFixture,
        settings: &CoordinatorSettings,
        id: &str,
        bus: &Arc<LocalInvalidationBus>,
    ) -> Coordinator {
        let started = Coordinator::builder(tiers.chain())
            .settings(settings.clone())
            .instance_id(id)
            .invalidation_bus(Arc::clone(bus) as Arc<dyn InvalidationBus>)
            .start()
            .await;
        match started {
            Ok(bridge) => bridge,
            Err(e) => panic!("peer {id} failed to start: {e}"),
        }
    }

    /// The chain described by a three-tier configuration document.
    pub fn three_tier_config() -> BridgeConfig {
        BridgeConfig::new(vec![
            TierConfig::new("local", TierKind::LocalCache, 0).with_ttl_seconds(60),
            TierConfig::new("remote", TierKind::RemoteCache, 1).with_ttl_seconds(600),
            TierConfig::new("pg", TierKind::Relational, 2),
        ])
    }
}

// ============================================================================
// HELPERS
// ============================================================================

pub mod helpers {
    //! Waiting on asynchronous effects.

    use super::*;
    use tokio::sync::broadcast;

    /// Default bound for [`await_event`] and [`eventually`].
    pub const WAIT: Duration = Duration::from_secs(3);

    /// Next event matching `pred`, or `None` after `timeout`.
    pub async fn await_event(
        rx: &mut broadcast::Receiver<BridgeEvent>,
        timeout: Duration,
        pred: impl Fn(&BridgeEvent) -> bool,
    ) -> Option<BridgeEvent> {
        let found = tokio::time::timeout(timeout, async {
            loop {
                match rx.recv().await {
                    Ok(event) if pred(&event) => return Some(event),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await;
        found.ok().flatten()
    }

    /// Poll `check` until it holds or `timeout` passes.
    pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn is_repair_scheduled_for(tier: &str) -> impl Fn(&BridgeEvent) -> bool + '_ {
        move |e| matches!(e, BridgeEvent::RepairScheduled { tier: t, .. } if t == tier)
    }

    pub fn is_repair_completed_for(tier: &str) -> impl Fn(&BridgeEvent) -> bool + '_ {
        move |e| matches!(e, BridgeEvent::RepairCompleted { tier: t, .. } if t == tier)
    }

    /// Events already buffered, without waiting.
    pub fn drain_events(rx: &mut broadcast::Receiver<BridgeEvent>) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return events,
            }
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on bridge results.

    use super::*;

    pub fn assert_conflict<T: std::fmt::Debug>(result: &BridgeResult<T>) {
        assert!(
            matches!(result, Err(BridgeError::Conflict { .. })),
            "Expected Conflict, got {:?}",
            result
        );
    }

    pub fn assert_unavailable<T: std::fmt::Debug>(result: &BridgeResult<T>) {
        assert!(
            matches!(result, Err(BridgeError::Unavailable { .. })),
            "Expected Unavailable, got {:?}",
            result
        );
    }

    pub fn assert_failure<T: std::fmt::Debug>(result: &BridgeResult<T>) {
        assert!(
            matches!(result, Err(BridgeError::Failure { .. })),
            "Expected Failure, got {:?}",
            result
        );
    }

    /// The backend holds `key` at exactly `version`.
    pub fn assert_holds(tier: &fixtures::TierHandle, key: &str, version: Version) {
        match tier.peek(key) {
            Some(entry) => assert_eq!(
                entry.version, version,
                "tier {} holds {} at {}, expected {}",
                tier.name, key, entry.version, version
            ),
            None => panic!("tier {} does not hold {}", tier.name, key),
        }
    }

    pub fn assert_missing(tier: &fixtures::TierHandle, key: &str) {
        if let Some(entry) = tier.peek(key) {
            panic!("tier {} still holds {} at {}", tier.name, key, entry.version);
        }
    }
}
