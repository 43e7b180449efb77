//! Background promotion and repair of cache tiers.

use std::sync::Arc;
use std::time::Duration;

use bridge_core::{BridgeEvent, Entry, Key, RepairKind, TierError, Version};

use super::Shared;
use crate::metrics::CoordinatorMetrics;
use crate::retry::{retry, RetryOutcome};
use crate::tier::PutOutcome;

/// Copy `entry` into the `targets` tiers without blocking the caller.
pub(crate) fn schedule_promotion(
    shared: &Arc<Shared>,
    entry: Entry,
    targets: Vec<usize>,
    timeout: Duration,
) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        for index in targets {
            promote(&shared, index, &entry, timeout).await;
        }
    });
}

async fn promote(shared: &Arc<Shared>, index: usize, entry: &Entry, timeout: Duration) {
    let Some(tier) = shared.chain.tier(index) else {
        return;
    };
    let key = &entry.key;
    if !shared.versions.permits(key, entry.version) {
        CoordinatorMetrics::incr(&shared.metrics.promotions_skipped);
        tracing::debug!(tier = tier.name(), key = %key, version = %entry.version, "Promotion superseded");
        return;
    }

    let copy = entry.capped_to(tier.descriptor().ttl);
    match shared.call(index, timeout, tier.adapter().put(&copy)).await {
        Ok(PutOutcome::Applied) => {
            // A delete or newer write may have landed while we were writing.
            if !shared.versions.permits(key, entry.version) {
                CoordinatorMetrics::incr(&shared.metrics.promotions_skipped);
                if let Err(e) = shared.call(index, timeout, tier.adapter().delete(key)).await {
                    schedule_repair(shared, index, key.clone(), entry.version, RepairKind::Delete, e);
                }
                return;
            }
            CoordinatorMetrics::incr(&shared.metrics.promotions);
            tracing::trace!(tier = tier.name(), key = %key, version = %entry.version, "Promoted");
        }
        Ok(PutOutcome::Superseded { current }) => {
            CoordinatorMetrics::incr(&shared.metrics.promotions_skipped);
            tracing::trace!(tier = tier.name(), key = %key, current = %current, "Tier already holds an equal or newer version");
        }
        Err(e) if e.is_retryable() && !entry.tombstone => {
            schedule_repair(shared, index, key.clone(), entry.version, RepairKind::Put, e);
        }
        Err(e) => {
            tracing::debug!(tier = tier.name(), key = %key, error = %e, "Promotion failed");
        }
    }
}

/// Restore a cache tier that missed a write or delete.
///
/// Put repairs re-read the value from the system of record so they never
/// resurrect data: if the store no longer holds `version`, the repair is
/// dropped. Delete repairs are dropped once a newer commit is recorded.
pub(crate) fn schedule_repair(
    shared: &Arc<Shared>,
    index: usize,
    key: Key,
    version: Version,
    kind: RepairKind,
    cause: TierError,
) {
    let Some(tier) = shared.chain.tier(index) else {
        return;
    };
    let tier_name = tier.name().to_string();
    CoordinatorMetrics::incr(&shared.metrics.repairs_scheduled);
    shared.events.emit(BridgeEvent::RepairScheduled {
        tier: tier_name.clone(),
        key: key.clone(),
        version,
        kind,
        reason: cause.to_string(),
    });

    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let policy = shared.settings.retry.clone().delayed();
        let shutdown = Some(shared.shutdown_signal());
        let outcome = retry(&policy, shutdown, |_| {
            let shared = Arc::clone(&shared);
            let key = key.clone();
            async move { repair_once(&shared, index, &key, version, kind).await }
        })
        .await;

        match outcome {
            RetryOutcome::Succeeded { value: true, attempts } => {
                CoordinatorMetrics::incr(&shared.metrics.repairs_completed);
                shared.events.emit(BridgeEvent::RepairCompleted {
                    tier: tier_name,
                    key,
                    version,
                    attempts,
                });
            }
            RetryOutcome::Succeeded { value: false, .. } => {
                tracing::debug!(tier = %tier_name, key = %key, version = %version, "Repair no longer needed");
            }
            RetryOutcome::Exhausted { error, attempts } => {
                CoordinatorMetrics::incr(&shared.metrics.repairs_abandoned);
                shared.events.emit(BridgeEvent::RepairAbandoned {
                    tier: tier_name,
                    key,
                    version,
                    attempts,
                    reason: error.to_string(),
                });
            }
            RetryOutcome::Cancelled { attempts } => {
                tracing::debug!(tier = %tier_name, key = %key, attempts, "Repair cancelled by shutdown");
            }
        }
    });
}

/// One repair attempt. `Ok(false)` means the repair became unnecessary.
async fn repair_once(
    shared: &Shared,
    index: usize,
    key: &Key,
    version: Version,
    kind: RepairKind,
) -> Result<bool, TierError> {
    let Some(tier) = shared.chain.tier(index) else {
        return Ok(false);
    };
    let timeout = shared.settings.call_timeout;
    match kind {
        RepairKind::Put => {
            if !shared.versions.permits(key, version) {
                return Ok(false);
            }
            let store = shared.chain.store_tier();
            let current = shared
                .call(shared.chain.store_index(), timeout, store.adapter().get(key))
                .await?;
            let Some(entry) = current.filter(|e| !e.tombstone && e.version >= version) else {
                return Ok(false);
            };
            let copy = entry.capped_to(tier.descriptor().ttl);
            shared
                .call(index, timeout, tier.adapter().put(&copy))
                .await?;
            Ok(true)
        }
        RepairKind::Delete => {
            if shared.versions.is_live(key)
                && shared.versions.latest(key).is_some_and(|v| v > version)
            {
                return Ok(false);
            }
            shared.call(index, timeout, tier.adapter().delete(key)).await?;
            Ok(true)
        }
    }
}
