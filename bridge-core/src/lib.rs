//! Bridge Core - Entity Types
//!
//! Keys, versioned entries, configuration, serializers, events and errors
//! shared by every tier of the bridge. No I/O lives here.

pub mod codec;
pub mod config;
pub mod entry;
pub mod error;
pub mod event;
pub mod health;
pub mod key;

pub use codec::{decode_entry, encode_entry, JsonSerializer, Serializer, YamlSerializer};
pub use config::{
    validate_descriptors, BridgeConfig, ConnectionSpec, ReadMode, RetryConfig, TierConfig,
    TierDescriptor, TierKind, TierRole, WriteMode,
};
pub use entry::{Entry, Version};
pub use error::{BridgeError, BridgeResult, CodecError, ConfigError, TierError, TierResult};
pub use event::{BridgeEvent, InvalidationMessage, InvalidationReason, RepairKind};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use key::{prefix_successor, Key, MAX_KEY_BYTES};
