//! Events emitted by the bridge and messages exchanged between instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::Version;
use crate::key::Key;

/// What a repair is trying to restore on a cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairKind {
    /// Re-put a committed version the tier missed.
    Put,
    /// Re-delete a key the tier failed to drop.
    Delete,
}

/// Out-of-band notifications about degraded tiers and recovery work.
///
/// Delivered on a broadcast channel; slow subscribers may miss events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    RepairScheduled {
        tier: String,
        key: Key,
        version: Version,
        kind: RepairKind,
        reason: String,
    },
    RepairCompleted {
        tier: String,
        key: Key,
        version: Version,
        attempts: u32,
    },
    RepairAbandoned {
        tier: String,
        key: Key,
        version: Version,
        attempts: u32,
        reason: String,
    },
    /// The write-back queue was full; the write was applied synchronously.
    WriteBackDegraded {
        tier: String,
        key: Key,
        version: Version,
    },
    WriteBackExhausted {
        tier: String,
        key: Key,
        version: Version,
        attempts: u32,
        reason: String,
    },
    AdapterUnhealthy {
        tier: String,
        reason: String,
    },
    AdapterRecovered {
        tier: String,
    },
}

impl BridgeEvent {
    /// Tier the event concerns.
    pub fn tier(&self) -> &str {
        match self {
            BridgeEvent::RepairScheduled { tier, .. }
            | BridgeEvent::RepairCompleted { tier, .. }
            | BridgeEvent::RepairAbandoned { tier, .. }
            | BridgeEvent::WriteBackDegraded { tier, .. }
            | BridgeEvent::WriteBackExhausted { tier, .. }
            | BridgeEvent::AdapterUnhealthy { tier, .. }
            | BridgeEvent::AdapterRecovered { tier } => tier,
        }
    }

    pub fn key(&self) -> Option<&Key> {
        match self {
            BridgeEvent::RepairScheduled { key, .. }
            | BridgeEvent::RepairCompleted { key, .. }
            | BridgeEvent::RepairAbandoned { key, .. }
            | BridgeEvent::WriteBackDegraded { key, .. }
            | BridgeEvent::WriteBackExhausted { key, .. } => Some(key),
            BridgeEvent::AdapterUnhealthy { .. } | BridgeEvent::AdapterRecovered { .. } => None,
        }
    }
}

/// Why a key is being invalidated on peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationReason {
    Delete,
    Expire,
    Write,
}

/// Broadcast to peers so they drop stale local copies of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationMessage {
    pub key: Key,
    /// Instance that published the message.
    pub origin: String,
    pub timestamp: DateTime<Utc>,
    /// Version that made local copies stale.
    pub version: Version,
    pub reason: InvalidationReason,
}

impl InvalidationMessage {
    pub fn new(
        key: Key,
        origin: impl Into<String>,
        version: Version,
        reason: InvalidationReason,
    ) -> Self {
        Self {
            key,
            origin: origin.into(),
            timestamp: Utc::now(),
            version,
            reason,
        }
    }

    pub fn is_from(&self, instance_id: &str) -> bool {
        self.origin == instance_id
    }
}
