//! Coordinator counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for coordinator activity since startup.
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub reads: AtomicU64,
    /// Reads answered by a tier ahead of the store
    pub cache_hits: AtomicU64,
    pub store_hits: AtomicU64,
    pub fallback_hits: AtomicU64,
    pub misses: AtomicU64,
    pub writes: AtomicU64,
    pub deletes: AtomicU64,
    pub conflicts: AtomicU64,
    pub promotions: AtomicU64,
    /// Promotions dropped because a newer version or delete was recorded
    pub promotions_skipped: AtomicU64,
    pub repairs_scheduled: AtomicU64,
    pub repairs_completed: AtomicU64,
    pub repairs_abandoned: AtomicU64,
    pub write_back_enqueued: AtomicU64,
    pub write_back_applied: AtomicU64,
    pub write_back_degraded: AtomicU64,
    pub write_back_exhausted: AtomicU64,
    pub invalidations_published: AtomicU64,
    pub invalidations_received: AtomicU64,
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> CoordinatorMetricsSnapshot {
        CoordinatorMetricsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            store_hits: self.store_hits.load(Ordering::Relaxed),
            fallback_hits: self.fallback_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            promotions_skipped: self.promotions_skipped.load(Ordering::Relaxed),
            repairs_scheduled: self.repairs_scheduled.load(Ordering::Relaxed),
            repairs_completed: self.repairs_completed.load(Ordering::Relaxed),
            repairs_abandoned: self.repairs_abandoned.load(Ordering::Relaxed),
            write_back_enqueued: self.write_back_enqueued.load(Ordering::Relaxed),
            write_back_applied: self.write_back_applied.load(Ordering::Relaxed),
            write_back_degraded: self.write_back_degraded.load(Ordering::Relaxed),
            write_back_exhausted: self.write_back_exhausted.load(Ordering::Relaxed),
            invalidations_published: self.invalidations_published.load(Ordering::Relaxed),
            invalidations_received: self.invalidations_received.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of coordinator metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CoordinatorMetricsSnapshot {
    pub reads: u64,
    pub cache_hits: u64,
    pub store_hits: u64,
    pub fallback_hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub deletes: u64,
    pub conflicts: u64,
    pub promotions: u64,
    pub promotions_skipped: u64,
    pub repairs_scheduled: u64,
    pub repairs_completed: u64,
    pub repairs_abandoned: u64,
    pub write_back_enqueued: u64,
    pub write_back_applied: u64,
    pub write_back_degraded: u64,
    pub write_back_exhausted: u64,
    pub invalidations_published: u64,
    pub invalidations_received: u64,
}

impl CoordinatorMetricsSnapshot {
    /// Share of reads answered without reaching the store.
    pub fn cache_hit_rate(&self) -> f64 {
        if self.reads == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.reads as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = CoordinatorMetrics::new();
        CoordinatorMetrics::incr(&metrics.reads);
        CoordinatorMetrics::incr(&metrics.reads);
        CoordinatorMetrics::incr(&metrics.cache_hits);
        let snap = metrics.snapshot();
        assert_eq!(snap.reads, 2);
        assert!((snap.cache_hit_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(CoordinatorMetricsSnapshot::default().cache_hit_rate(), 0.0);
    }
}
