//! Versioned entries as stored by every tier.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::key::Key;

/// Per-key version stamp.
///
/// Versions are hybrid: a successor is at least one greater than its
/// predecessor and never behind the wall clock in microseconds, so
/// versions minted on different instances still order by commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Version carried by negative-cache tombstones. Any real write beats it.
    pub const ZERO: Version = Version(0);

    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Version for a value in SQL columns (BIGINT).
    pub fn as_i64(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    pub fn from_i64(v: i64) -> Self {
        Self(u64::try_from(v).unwrap_or(0))
    }

    /// Mint the next version for a key whose last known version is `prev`.
    pub fn next_after(prev: Option<Version>) -> Self {
        let clock = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
        let floor = prev.map(|v| v.0.saturating_add(1)).unwrap_or(1);
        Self(clock.max(floor))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A value as held by one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: Key,
    pub value: Vec<u8>,
    pub version: Version,
    /// Absent means the entry never expires on its own.
    pub expires_at: Option<DateTime<Utc>>,
    /// Name of the tier the entry was read from. Not persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Negative-cache marker: the key is known absent.
    #[serde(default)]
    pub tombstone: bool,
}

impl Entry {
    pub fn new(key: Key, value: Vec<u8>, version: Version) -> Self {
        Self {
            key,
            value,
            version,
            expires_at: None,
            origin: None,
            tombstone: false,
        }
    }

    /// Negative-cache marker for `key` living for `ttl`.
    pub fn tombstone(key: Key, ttl: Duration) -> Self {
        Self {
            key,
            value: Vec::new(),
            version: Version::ZERO,
            expires_at: None,
            origin: None,
            tombstone: true,
        }
        .with_ttl(Some(ttl))
    }

    /// Set the expiry to `ttl` from now. `None` clears it.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.expires_at = ttl.and_then(expiry_from_now);
        self
    }

    pub fn with_expiry(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Copy of this entry whose expiry is no later than `ttl` from now.
    ///
    /// Cache tiers use this so a cached copy never outlives its tier TTL
    /// even when the source entry lives longer.
    pub fn capped_to(&self, ttl: Option<Duration>) -> Entry {
        let mut copy = self.clone();
        copy.origin = None;
        if let Some(cap) = ttl.and_then(expiry_from_now) {
            copy.expires_at = Some(match copy.expires_at {
                Some(existing) if existing < cap => existing,
                _ => cap,
            });
        }
        copy
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Time left before expiry. `None` for entries without an expiry.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Payload size as counted against tier limits.
    pub fn size_bytes(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

fn expiry_from_now(ttl: Duration) -> Option<DateTime<Utc>> {
    let delta = TimeDelta::from_std(ttl).ok()?;
    Utc::now().checked_add_signed(delta)
}
