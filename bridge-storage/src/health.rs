//! Tier health tracking and the background probe task.
//!
//! Every adapter call outcome feeds [`HealthTracker`]. A tier that fails
//! with retryable errors `unhealthy_threshold` times in a row is reported
//! once via `AdapterUnhealthy`; its next success reports `AdapterRecovered`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bridge_core::{BridgeEvent, HealthCheck, HealthReport, TierError};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::chain::TierChain;
use crate::events::EventBus;
use crate::retry::call_with_timeout;

#[derive(Debug)]
struct TierHealth {
    name: String,
    consecutive_failures: AtomicU32,
    unhealthy: AtomicBool,
}

/// Consecutive-failure counters per tier, indexed like the chain.
#[derive(Debug)]
pub struct HealthTracker {
    tiers: Vec<TierHealth>,
    threshold: u32,
    events: EventBus,
}

impl HealthTracker {
    pub fn new(chain: &TierChain, threshold: u32, events: EventBus) -> Self {
        let tiers = chain
            .ordered_tiers()
            .iter()
            .map(|t| TierHealth {
                name: t.name().to_string(),
                consecutive_failures: AtomicU32::new(0),
                unhealthy: AtomicBool::new(false),
            })
            .collect();
        Self {
            tiers,
            threshold: threshold.max(1),
            events,
        }
    }

    pub fn record_success(&self, index: usize) {
        let Some(tier) = self.tiers.get(index) else {
            return;
        };
        tier.consecutive_failures.store(0, Ordering::Relaxed);
        if tier.unhealthy.swap(false, Ordering::AcqRel) {
            tracing::info!(tier = %tier.name, "Tier recovered");
            self.events.emit(BridgeEvent::AdapterRecovered {
                tier: tier.name.clone(),
            });
        }
    }

    /// Count a failure. Permanent errors describe the request, not the
    /// tier, and are ignored.
    pub fn record_failure(&self, index: usize, error: &TierError) {
        if !error.is_retryable() {
            return;
        }
        let Some(tier) = self.tiers.get(index) else {
            return;
        };
        let failures = tier.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.threshold && !tier.unhealthy.swap(true, Ordering::AcqRel) {
            self.events.emit(BridgeEvent::AdapterUnhealthy {
                tier: tier.name.clone(),
                reason: format!("{failures} consecutive failures, last: {error}"),
            });
        }
    }

    /// Feed a call result into the tracker and hand it back.
    pub fn observe<T>(&self, index: usize, result: Result<T, TierError>) -> Result<T, TierError> {
        match &result {
            Ok(_) => self.record_success(index),
            Err(e) => self.record_failure(index, e),
        }
        result
    }

    pub fn is_healthy(&self, index: usize) -> bool {
        self.tiers
            .get(index)
            .is_some_and(|t| !t.unhealthy.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self, index: usize) -> u32 {
        self.tiers
            .get(index)
            .map(|t| t.consecutive_failures.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Probe every tier once and build a report. Results feed the tracker.
pub async fn probe_chain(
    chain: &TierChain,
    tracker: &HealthTracker,
    timeout: Duration,
) -> HealthReport {
    let mut checks = Vec::with_capacity(chain.len());
    for (index, tier) in chain.ordered_tiers().iter().enumerate() {
        let started = Instant::now();
        let probe = call_with_timeout(timeout, async {
            if tier.adapter().healthy().await {
                Ok(())
            } else {
                Err(TierError::transient("health probe failed"))
            }
        })
        .await;
        let elapsed_ms = started.elapsed().as_millis() as i64;
        let stats = tier.adapter().stats().await;

        let check = match tracker.observe(index, probe) {
            Ok(()) if tracker.is_healthy(index) => HealthCheck::healthy(tier.name()),
            Ok(()) => HealthCheck::degraded(tier.name(), "recovering"),
            Err(e) => HealthCheck::unhealthy(tier.name(), e.to_string()),
        };
        checks.push(
            check
                .with_response_time(elapsed_ms)
                .with_metadata("kind", serde_json::json!(tier.descriptor().kind.as_str()))
                .with_metadata("hitRate", serde_json::json!(stats.hit_rate()))
                .with_metadata("entries", serde_json::json!(stats.entry_count)),
        );
    }
    HealthReport::from_checks(chain.store_tier().name(), checks)
}

/// Settings for [`health_monitor_task`].
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
}

/// Background task probing tiers until shutdown.
pub async fn health_monitor_task(
    chain: Arc<TierChain>,
    tracker: Arc<HealthTracker>,
    config: MonitorConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_ms = config.interval.as_millis() as u64,
        tiers = chain.len(),
        "Health monitor started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Health monitor shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                let report = probe_chain(&chain, &tracker, config.probe_timeout).await;
                tracing::trace!(status = ?report.status, "Health probe cycle completed");
            }
        }
    }
}
