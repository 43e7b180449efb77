//! Write-back queue.
//!
//! Writes to tiers configured with write mode `back` are acknowledged to
//! the caller first and applied here afterwards. The queue is sharded by
//! key hash; each shard is a bounded channel drained by exactly one worker,
//! so writes to one key reach their target in enqueue order. A full shard
//! is reported back to the producer, which then writes synchronously.

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use bridge_core::{BridgeError, BridgeEvent, BridgeResult, Entry, Key, Version};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::coordinator::Shared;
use crate::metrics::CoordinatorMetrics;
use crate::retry::{call_with_timeout, retry, RetryOutcome};
use crate::tier::PutOutcome;

/// An acknowledged write that has not yet reached its target tier.
#[derive(Debug)]
pub struct PendingWrite {
    pub entry: Entry,
    /// Chain index of the target tier.
    pub target: usize,
    /// Attempts made so far.
    pub attempts: u32,
    pub enqueued_at: Instant,
    completion: Option<oneshot::Sender<BridgeResult<Version>>>,
}

impl PendingWrite {
    /// Build a pending write and the receiver its outcome is reported on.
    pub fn new(entry: Entry, target: usize) -> (Self, oneshot::Receiver<BridgeResult<Version>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                entry,
                target,
                attempts: 0,
                enqueued_at: Instant::now(),
                completion: Some(tx),
            },
            rx,
        )
    }

    fn complete(&mut self, outcome: BridgeResult<Version>) {
        if let Some(tx) = self.completion.take() {
            // The caller may have dropped its handle; the event channel still reports.
            let _ = tx.send(outcome);
        }
    }
}

/// Completion handle for the write-back part of an acknowledged write.
#[derive(Debug)]
pub struct WriteBackHandle {
    key: Key,
    version: Version,
    pending: Vec<(String, oneshot::Receiver<BridgeResult<Version>>)>,
}

impl WriteBackHandle {
    pub(crate) fn new(key: Key, version: Version) -> Self {
        Self {
            key,
            version,
            pending: Vec::new(),
        }
    }

    pub(crate) fn track(&mut self, tier: &str, rx: oneshot::Receiver<BridgeResult<Version>>) {
        self.pending.push((tier.to_string(), rx));
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Tiers still owed this write.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(|(tier, _)| tier.as_str())
    }

    /// Wait until every write-back target holds the write.
    ///
    /// Fails with [`BridgeError::DataLoss`] if a target exhausted its retries.
    pub async fn durable(self) -> BridgeResult<Version> {
        for (tier, rx) in self.pending {
            match rx.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(BridgeError::failure(format!(
                        "write-back to {tier} for {} was dropped before completing",
                        self.key
                    )))
                }
            }
        }
        Ok(self.version)
    }
}

/// Sharded, bounded queue of [`PendingWrite`]s with one drainer per shard.
#[derive(Debug, Default)]
pub struct WriteBackQueue {
    shards: RwLock<Vec<mpsc::Sender<PendingWrite>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    hasher: std::collections::hash_map::RandomState,
}

impl WriteBackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `workers` drainers sharing `capacity` slots between them.
    pub(crate) async fn start(&self, shared: Arc<Shared>, capacity: usize, workers: usize) {
        let workers = workers.max(1);
        let per_shard = (capacity / workers).max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = self.workers.lock().await;
        for shard in 0..workers {
            let (tx, rx) = mpsc::channel(per_shard);
            senders.push(tx);
            handles.push(tokio::spawn(drain_shard(Arc::clone(&shared), rx, shard)));
        }
        if let Ok(mut guard) = self.shards.write() {
            *guard = senders;
        }
        tracing::info!(workers, per_shard, "Write-back drainers started");
    }

    fn shard_for(&self, key: &Key, shards: usize) -> usize {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        (hasher.finish() % shards as u64) as usize
    }

    /// Queue a write, or hand it back when its shard is full or closed.
    pub fn try_enqueue(&self, write: PendingWrite) -> Result<(), PendingWrite> {
        let Ok(shards) = self.shards.read() else {
            return Err(write);
        };
        if shards.is_empty() {
            return Err(write);
        }
        let shard = self.shard_for(&write.entry.key, shards.len());
        shards[shard].try_send(write).map_err(|e| match e {
            mpsc::error::TrySendError::Full(w) | mpsc::error::TrySendError::Closed(w) => w,
        })
    }

    pub fn is_running(&self) -> bool {
        self.shards.read().map(|s| !s.is_empty()).unwrap_or(false)
    }

    /// Close the queue and wait for drainers to flush what is queued.
    pub async fn shutdown(&self) {
        if let Ok(mut guard) = self.shards.write() {
            guard.clear();
        }
        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Write-back drainer panicked");
            }
        }
    }
}

async fn drain_shard(shared: Arc<Shared>, mut rx: mpsc::Receiver<PendingWrite>, shard: usize) {
    tracing::debug!(shard, "Write-back drainer running");
    while let Some(write) = rx.recv().await {
        apply_pending(&shared, write).await;
    }
    tracing::debug!(shard, "Write-back drainer stopped");
}

/// Apply one pending write with bounded retry and report the outcome.
pub(crate) async fn apply_pending(shared: &Shared, mut write: PendingWrite) {
    let Some(tier) = shared.chain.tier(write.target) else {
        write.complete(Err(BridgeError::failure("write-back target left the chain")));
        return;
    };
    let key = write.entry.key.clone();
    let version = write.entry.version;
    let is_store = write.target == shared.chain.store_index();

    if !shared.versions.permits(&key, version) {
        tracing::debug!(tier = tier.name(), key = %key, version = %version, "Write-back superseded before drain");
        write.complete(Ok(version));
        return;
    }

    let entry = if is_store {
        write.entry.clone()
    } else {
        write.entry.capped_to(tier.descriptor().ttl)
    };
    let timeout = shared.settings.call_timeout;
    let target = write.target;
    let adapter = Arc::clone(tier.adapter());
    let outcome = retry(&shared.settings.retry, None, |_| {
        let adapter = Arc::clone(&adapter);
        let entry = entry.clone();
        async move {
            let result = call_with_timeout(timeout, adapter.put(&entry)).await;
            shared.health.observe(target, result)
        }
    })
    .await;

    match outcome {
        RetryOutcome::Succeeded { value, attempts } => {
            write.attempts = attempts;
            CoordinatorMetrics::incr(&shared.metrics.write_back_applied);
            if let PutOutcome::Superseded { current } = value {
                tracing::debug!(tier = tier.name(), key = %key, version = %version, current = %current, "Write-back target already newer");
            }
            tracing::debug!(
                tier = tier.name(),
                key = %key,
                version = %version,
                attempts,
                queued_ms = write.enqueued_at.elapsed().as_millis() as u64,
                "Write-back applied"
            );
            write.complete(Ok(version));
        }
        RetryOutcome::Exhausted { error, attempts } => {
            write.attempts = attempts;
            CoordinatorMetrics::incr(&shared.metrics.write_back_exhausted);
            let reason = error.to_string();
            shared.events.emit(BridgeEvent::WriteBackExhausted {
                tier: tier.name().to_string(),
                key: key.clone(),
                version,
                attempts,
                reason: reason.clone(),
            });
            if is_store && shared.versions.latest(&key) == Some(version) {
                shared.evict_caches(&key).await;
            }
            write.complete(Err(BridgeError::DataLoss {
                key,
                attempts,
                reason,
            }));
        }
        RetryOutcome::Cancelled { attempts } => {
            write.complete(Err(BridgeError::DataLoss {
                key,
                attempts,
                reason: "write-back cancelled".to_string(),
            }));
        }
    }
}
