//! Fault injection wrapper for chaos drills and tests.
//!
//! Wraps any adapter and makes it fail on demand: killed outright, failing
//! with a chosen error, failing a fixed number of upcoming writes, or slowed
//! down to trip call timeouts.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bridge_core::{Entry, Key, TierError, TierKind, TierResult};

use super::{PutOutcome, TierAdapter, TierStats};

pub struct FaultInjectingTier {
    inner: Arc<dyn TierAdapter>,
    killed: AtomicBool,
    failure: Mutex<Option<TierError>>,
    failing_puts: AtomicU32,
    latency: Mutex<Option<Duration>>,
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
}

impl FaultInjectingTier {
    pub fn new(inner: Arc<dyn TierAdapter>) -> Self {
        Self {
            inner,
            killed: AtomicBool::new(false),
            failure: Mutex::new(None),
            failing_puts: AtomicU32::new(0),
            latency: Mutex::new(None),
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Fail every call with a connection error and report unhealthy.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        tracing::warn!(kind = %self.inner.kind(), "Fault injection: tier killed");
    }

    /// Undo [`kill`](Self::kill), [`fail_with`](Self::fail_with) and pending put failures.
    pub fn revive(&self) {
        self.killed.store(false, Ordering::SeqCst);
        self.failing_puts.store(0, Ordering::SeqCst);
        if let Ok(mut failure) = self.failure.lock() {
            *failure = None;
        }
        tracing::info!(kind = %self.inner.kind(), "Fault injection: tier revived");
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Fail every call with `error` until revived. Health stays green.
    pub fn fail_with(&self, error: TierError) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(error);
        }
    }

    /// Fail the next `n` puts transiently, then behave normally.
    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut slot) = self.latency.lock() {
            *slot = latency;
        }
    }

    pub fn get_calls(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    async fn gate(&self) -> TierResult<()> {
        let latency = self.latency.lock().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.is_killed() {
            return Err(TierError::transient("connection refused (tier killed)"));
        }
        let failure = self.failure.lock().ok().and_then(|f| f.clone());
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn take_put_failure(&self) -> bool {
        self.failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl TierAdapter for FaultInjectingTier {
    fn kind(&self) -> TierKind {
        self.inner.kind()
    }

    async fn get(&self, key: &Key) -> TierResult<Option<Entry>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        self.inner.get(key).await
    }

    async fn put(&self, entry: &Entry) -> TierResult<PutOutcome> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        if self.take_put_failure() {
            return Err(TierError::transient("connection reset (injected)"));
        }
        self.inner.put(entry).await
    }

    async fn delete(&self, key: &Key) -> TierResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &Key) -> TierResult<bool> {
        self.gate().await?;
        self.inner.exists(key).await
    }

    async fn healthy(&self) -> bool {
        !self.is_killed() && self.inner.healthy().await
    }

    async fn scan(&self, prefix: &[u8], limit: usize) -> TierResult<Vec<Entry>> {
        self.gate().await?;
        self.inner.scan(prefix, limit).await
    }

    async fn purge_expired(&self) -> TierResult<Vec<Key>> {
        self.gate().await?;
        self.inner.purge_expired().await
    }

    async fn stats(&self) -> TierStats {
        self.inner.stats().await
    }
}
