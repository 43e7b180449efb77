//! Write path.
//!
//! Tiers up to the store are written in ascending order. Write-through
//! caches first, then the store, then write-back targets are queued. A
//! cache failure never fails the write; the store decides the outcome.

use std::sync::Arc;
use std::time::Duration;

use bridge_core::{
    BridgeError, BridgeEvent, BridgeResult, Entry, InvalidationReason, Key, RepairKind,
    TierError, Version, WriteMode,
};

use super::options::{CallOptions, WriteCondition};
use super::promotion::schedule_repair;
use super::state::{OpTracker, WriteState};
use super::Shared;
use crate::metrics::CoordinatorMetrics;
use crate::tier::PutOutcome;
use crate::write_back::{PendingWrite, WriteBackHandle};

/// How durable an acknowledged write is.
#[derive(Debug)]
pub enum Durability {
    /// Every target, the store included, holds the write.
    Durable,
    /// Some targets are still being written in the background.
    Pending(WriteBackHandle),
}

/// Acknowledgement of a successful write.
#[derive(Debug)]
pub struct WriteAck {
    pub version: Version,
    pub durability: Durability,
}

impl WriteAck {
    pub fn is_durable(&self) -> bool {
        matches!(self.durability, Durability::Durable)
    }

    /// Wait for outstanding write-backs. Resolves immediately when durable.
    pub async fn durable(self) -> BridgeResult<Version> {
        match self.durability {
            Durability::Durable => Ok(self.version),
            Durability::Pending(handle) => handle.durable().await,
        }
    }
}

/// Validate a write before any adapter is touched.
pub(super) fn begin(shared: &Shared, key: &Key, value_len: usize) -> BridgeResult<OpTracker<WriteState>> {
    let mut op = OpTracker::new("put", key, WriteState::Started);
    op.advance(WriteState::Validating)?;
    if let Err(e) = key.validate() {
        op.fail(WriteState::Failed);
        return Err(BridgeError::failure(e.to_string()));
    }
    if value_len > shared.settings.max_value_bytes {
        op.fail(WriteState::Failed);
        return Err(BridgeError::failure(format!(
            "value for {key} is {value_len} bytes, limit is {}",
            shared.settings.max_value_bytes
        )));
    }
    Ok(op)
}

/// Outcome of the synchronous cache writes, used for repair and rollback.
#[derive(Default)]
struct CacheWrites {
    /// Caches now holding the new, not yet committed version.
    accepted: Vec<usize>,
    /// Caches to re-put once the store commits.
    repairs: Vec<(usize, TierError)>,
}

pub(super) async fn put(
    shared: &Arc<Shared>,
    mut op: OpTracker<WriteState>,
    key: Key,
    value: Vec<u8>,
    options: CallOptions,
) -> BridgeResult<WriteAck> {
    let chain = Arc::clone(&shared.chain);
    let store_index = chain.store_index();
    let store = chain.store_tier();
    let timeout = shared.settings.timeout_for(&options);

    let store_mode = store.descriptor().write_mode;

    // An unconditional write-back never waits on the store. Its version comes
    // from the local table and the drainer settles any race by version.
    let skip_store_read =
        store_mode == WriteMode::Back && options.condition == WriteCondition::Unconditional;
    let current = if skip_store_read {
        None
    } else {
        match shared
            .call(store_index, timeout, store.adapter().get(&key))
            .await
        {
            Ok(entry) => entry.filter(|e| !e.tombstone).map(|e| e.version),
            Err(e) => {
                op.fail(WriteState::Failed);
                return Err(BridgeError::from_store(e));
            }
        }
    };

    let expected = match options.condition {
        WriteCondition::Unconditional => None,
        WriteCondition::Expecting(v) if current == Some(v) => None,
        WriteCondition::ExpectingAbsent if current.is_none() => None,
        WriteCondition::Expecting(v) => Some(Some(v)),
        WriteCondition::ExpectingAbsent => Some(None),
    };
    if let Some(expected) = expected {
        CoordinatorMetrics::incr(&shared.metrics.conflicts);
        op.fail(WriteState::Failed);
        return Err(BridgeError::Conflict {
            key,
            expected,
            current,
        });
    }

    let version = Version::next_after(current.max(shared.versions.latest(&key)));
    let entry = Entry::new(key.clone(), value, version).with_ttl(options.ttl);
    op.advance(WriteState::WritingThrough)?;

    // Write-through caches, fastest first.
    let mut caches = CacheWrites::default();
    let mut deferred: Vec<usize> = Vec::new();
    for (index, tier) in chain.writable_caches() {
        if tier.descriptor().write_mode == WriteMode::Back {
            deferred.push(index);
            continue;
        }
        write_cache(shared, index, &entry, timeout, &mut caches).await;
    }

    // The store.
    let mut handle = WriteBackHandle::new(key.clone(), version);
    let store_queued = store_mode == WriteMode::Back
        && !caches.accepted.is_empty()
        && enqueue(shared, store_index, &entry, &mut handle);

    if !store_queued {
        if store_mode == WriteMode::Back {
            degraded(shared, store_index, &entry);
        }
        match shared
            .call(store_index, timeout, store.adapter().put(&entry))
            .await
        {
            Ok(PutOutcome::Applied) => {}
            Ok(PutOutcome::Superseded { current: newer }) => {
                rollback(shared, &key, version, &caches.accepted, timeout).await;
                shared.versions.record_commit(&key, newer);
                CoordinatorMetrics::incr(&shared.metrics.conflicts);
                op.fail(WriteState::Failed);
                return Err(BridgeError::Conflict {
                    key,
                    expected: current,
                    current: Some(newer),
                });
            }
            Err(e) => {
                tracing::warn!(tier = store.name(), key = %key, error = %e, "Store write failed");
                rollback(shared, &key, version, &caches.accepted, timeout).await;
                op.fail(WriteState::Failed);
                return Err(BridgeError::from_store(e));
            }
        }
    }
    shared.versions.record_commit(&key, version);

    // Write-back caches.
    for index in deferred {
        if !enqueue(shared, index, &entry, &mut handle) {
            degraded(shared, index, &entry);
            write_cache(shared, index, &entry, timeout, &mut caches).await;
        }
    }

    for (index, error) in caches.repairs {
        schedule_repair(shared, index, key.clone(), version, RepairKind::Put, error);
    }

    if shared.settings.invalidate_on_write {
        shared.publish(&key, version, InvalidationReason::Write).await;
    }

    CoordinatorMetrics::incr(&shared.metrics.writes);
    let durability = if handle.targets().next().is_some() {
        op.advance(WriteState::WriteBackQueued)?;
        Durability::Pending(handle)
    } else {
        Durability::Durable
    };
    op.advance(WriteState::Completed)?;
    tracing::debug!(key = %key, version = %version, durable = matches!(durability, Durability::Durable), "Write acknowledged");

    Ok(WriteAck {
        version,
        durability,
    })
}

async fn write_cache(
    shared: &Arc<Shared>,
    index: usize,
    entry: &Entry,
    timeout: Duration,
    writes: &mut CacheWrites,
) {
    let Some(tier) = shared.chain.tier(index) else {
        return;
    };
    let copy = entry.capped_to(tier.descriptor().ttl);
    match shared.call(index, timeout, tier.adapter().put(&copy)).await {
        Ok(PutOutcome::Applied) => writes.accepted.push(index),
        Ok(PutOutcome::Superseded { current }) => {
            tracing::debug!(tier = tier.name(), key = %entry.key, current = %current, "Cache already newer");
        }
        Err(e) if e.is_retryable() => {
            tracing::debug!(tier = tier.name(), key = %entry.key, error = %e, "Cache write failed; repair after commit");
            writes.repairs.push((index, e));
        }
        Err(e) => {
            // The tier refuses this value; make sure it keeps no older copy.
            tracing::warn!(tier = tier.name(), key = %entry.key, error = %e, "Cache rejected write; evicting");
            if let Err(evict) = shared.call(index, timeout, tier.adapter().delete(&entry.key)).await {
                schedule_repair(shared, index, entry.key.clone(), entry.version, RepairKind::Delete, evict);
            }
        }
    }
}

/// Undo cache writes of a version the store did not commit.
async fn rollback(
    shared: &Arc<Shared>,
    key: &Key,
    version: Version,
    accepted: &[usize],
    timeout: Duration,
) {
    for &index in accepted {
        let Some(tier) = shared.chain.tier(index) else {
            continue;
        };
        if let Err(e) = shared.call(index, timeout, tier.adapter().delete(key)).await {
            schedule_repair(shared, index, key.clone(), version, RepairKind::Delete, e);
        }
    }
}

fn enqueue(shared: &Shared, index: usize, entry: &Entry, handle: &mut WriteBackHandle) -> bool {
    let (pending, rx) = PendingWrite::new(entry.clone(), index);
    match shared.write_back.try_enqueue(pending) {
        Ok(()) => {
            if let Some(tier) = shared.chain.tier(index) {
                handle.track(tier.name(), rx);
            }
            CoordinatorMetrics::incr(&shared.metrics.write_back_enqueued);
            true
        }
        Err(_) => false,
    }
}

fn degraded(shared: &Shared, index: usize, entry: &Entry) {
    let tier = shared
        .chain
        .tier(index)
        .map(|t| t.name().to_string())
        .unwrap_or_default();
    CoordinatorMetrics::incr(&shared.metrics.write_back_degraded);
    shared.events.emit(BridgeEvent::WriteBackDegraded {
        tier,
        key: entry.key.clone(),
        version: entry.version,
    });
}
