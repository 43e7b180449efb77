//! Error types for bridge operations

use thiserror::Error;

use crate::entry::Version;
use crate::key::Key;

/// Failure reported by a single tier adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TierError {
    /// Connection reset, refused, pool exhausted. Retrying may succeed.
    #[error("Transient tier failure: {reason}")]
    Transient { reason: String },

    /// Malformed key, oversized payload, read-only tier. Never retried.
    #[error("Permanent tier failure: {reason}")]
    Permanent { reason: String },

    #[error("Tier call timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
}

impl TierError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    /// Timeouts count as transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent { .. })
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Backend not supported: {backend}")]
    BackendNotSupported { backend: String },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },

    #[error("Failed to read configuration file {path}: {reason}")]
    Io { path: String, reason: String },
}

/// Serialization errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Failed to encode {format}: {reason}")]
    Encode { format: String, reason: String },

    #[error("Failed to decode {format}: {reason}")]
    Decode { format: String, reason: String },

    #[error("Corrupt entry envelope: {reason}")]
    CorruptEnvelope { reason: String },
}

/// Master error type surfaced to bridge callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// A conditional write lost against a newer committed version.
    #[error("Version conflict on {key}: expected {expected:?}, store holds {current:?}")]
    Conflict {
        key: Key,
        expected: Option<Version>,
        current: Option<Version>,
    },

    /// The system of record could not be reached and no tier had the value.
    #[error("Bridge unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Bridge operation failed: {reason}")]
    Failure { reason: String },

    /// A write-back exhausted its retries without reaching its target.
    #[error("Write-back for {key} lost after {attempts} attempts: {reason}")]
    DataLoss {
        key: Key,
        attempts: u32,
        reason: String,
    },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl BridgeError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    /// Map a system-of-record failure onto the caller-level taxonomy.
    pub fn from_store(err: TierError) -> Self {
        match err {
            TierError::Permanent { reason } => Self::Failure { reason },
            other => Self::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}

/// Result type alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Result type alias for tier adapter calls.
pub type TierResult<T> = Result<T, TierError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_retryable() {
        assert!(TierError::Timeout { after_ms: 50 }.is_retryable());
        assert!(TierError::transient("reset").is_retryable());
        assert!(!TierError::permanent("read-only").is_retryable());
    }

    #[test]
    fn test_from_store_maps_permanent_to_failure() {
        let err = BridgeError::from_store(TierError::permanent("payload too large"));
        assert!(matches!(err, BridgeError::Failure { .. }));
    }

    #[test]
    fn test_from_store_maps_transient_to_unavailable() {
        let err = BridgeError::from_store(TierError::Timeout { after_ms: 100 });
        match err {
            BridgeError::Unavailable { reason } => assert!(reason.contains("100ms")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_conflict_display() {
        let err = BridgeError::Conflict {
            key: Key::from("u:1"),
            expected: Some(Version::new(3)),
            current: Some(Version::new(7)),
        };
        let msg = err.to_string();
        assert!(msg.contains("u:1"));
        assert!(msg.contains("Version conflict"));
    }

    #[test]
    fn test_config_error_converts() {
        let err: BridgeError = ConfigError::MissingRequired {
            field: "tiers".to_string(),
        }
        .into();
        assert!(err.to_string().contains("tiers"));
    }
}
