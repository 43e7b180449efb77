//! Periodic housekeeping, independent of health probing.
//!
//! Purges expired entries from tiers that do not expire them on their own,
//! tells peers about keys that expired in a shared tier, and forgets
//! version records older than the retention window.

use std::sync::Arc;

use bridge_core::{InvalidationReason, TierKind, Version};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::Shared;

pub(crate) async fn housekeeping_task(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let period = shared.settings.housekeeping_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!("Housekeeping shutting down");
                    break;
                }
            }
            _ = ticker.tick() => run_once(&shared).await,
        }
    }
}

/// One housekeeping cycle.
async fn run_once(shared: &Shared) {
    let timeout = shared.settings.call_timeout;
    let mut purged = 0usize;

    for (index, tier) in shared.chain.ordered_tiers().iter().enumerate() {
        let keys = match shared.call(index, timeout, tier.adapter().purge_expired()).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::debug!(tier = tier.name(), error = %e, "Expired-entry purge failed");
                continue;
            }
        };
        purged += keys.len();

        // Peers hold copies of shared tiers only.
        if tier.descriptor().kind == TierKind::LocalCache {
            continue;
        }
        for key in &keys {
            shared.publish(key, Version::ZERO, InvalidationReason::Expire).await;
        }
    }

    let swept = shared.versions.sweep();
    if purged > 0 || swept > 0 {
        tracing::debug!(purged, swept, "Housekeeping cycle completed");
    }
}
