//! Bridge Storage - Tier Adapters and Coordinator
//!
//! Adapters for every backend tier, the ordered tier chain, and the
//! coordinator that reads, writes, promotes and repairs across it.
//! Configuration and entity types live in `bridge-core`.

pub mod chain;
pub mod coordinator;
pub mod events;
pub mod factory;
pub mod health;
pub mod invalidation;
pub mod metrics;
pub mod retry;
pub mod telemetry;
pub mod tier;
pub mod typed;
pub mod write_back;

pub use chain::{Tier, TierChain, TierChainBuilder};
pub use coordinator::{
    BridgeRead, CallOptions, Coordinator, CoordinatorBuilder, CoordinatorSettings, Durability,
    ReadConsistency, ReadSource, WriteAck, WriteCondition,
};
pub use events::EventBus;
pub use factory::{build_chain, connect};
pub use health::HealthTracker;
pub use invalidation::{InvalidationBus, InvalidationStream, LocalInvalidationBus};
pub use metrics::{CoordinatorMetrics, CoordinatorMetricsSnapshot};
pub use retry::RetryPolicy;
pub use telemetry::{init_tracing, LogFormat};
pub use tier::{FaultInjectingTier, MemoryTier, PutOutcome, SnapshotTier, TierAdapter, TierStats};
pub use typed::TypedBridge;
pub use write_back::WriteBackHandle;

#[cfg(feature = "redis")]
pub use invalidation::RedisInvalidationBus;
