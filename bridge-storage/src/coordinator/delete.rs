//! Delete path.
//!
//! The store is deleted first. If that fails nothing else is touched, so a
//! cache can only ever be missing a record the store still has, never the
//! other way round.

use std::sync::Arc;

use bridge_core::{BridgeError, BridgeResult, InvalidationReason, Key, RepairKind, Version};

use super::options::CallOptions;
use super::promotion::schedule_repair;
use super::state::{OpTracker, WriteState};
use super::Shared;
use crate::metrics::CoordinatorMetrics;

pub(super) async fn delete(
    shared: &Arc<Shared>,
    mut op: OpTracker<WriteState>,
    key: Key,
    options: CallOptions,
) -> BridgeResult<()> {
    let chain = Arc::clone(&shared.chain);
    let store = chain.store_tier();
    let timeout = shared.settings.timeout_for(&options);
    op.advance(WriteState::WritingThrough)?;

    if let Err(e) = shared
        .call(chain.store_index(), timeout, store.adapter().delete(&key))
        .await
    {
        tracing::warn!(tier = store.name(), key = %key, error = %e, "Store delete failed; aborting");
        op.fail(WriteState::Failed);
        return Err(BridgeError::from_store(e));
    }

    // Marks every version up to now as deleted so in-flight promotions,
    // repairs and write-backs of the old value are dropped.
    let version = Version::next_after(shared.versions.latest(&key));
    shared.versions.record_delete(&key, version);

    for (index, tier) in chain.writable_caches() {
        if let Err(e) = shared.call(index, timeout, tier.adapter().delete(&key)).await {
            if e.is_retryable() {
                schedule_repair(shared, index, key.clone(), version, RepairKind::Delete, e);
            } else {
                tracing::warn!(tier = tier.name(), key = %key, error = %e, "Cache delete rejected");
            }
        }
    }

    shared
        .publish(&key, version, InvalidationReason::Delete)
        .await;

    CoordinatorMetrics::incr(&shared.metrics.deletes);
    op.advance(WriteState::Completed)?;
    tracing::debug!(key = %key, version = %version, "Deleted");
    Ok(())
}
