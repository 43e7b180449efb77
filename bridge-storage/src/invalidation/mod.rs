//! Invalidation bus.
//!
//! Instances sharing a remote cache and a store announce deletes, expired
//! shared entries and, optionally, writes so peers drop their in-process
//! copies. Delivery is
//! at-most-once; a lost message leaves a peer stale until its local TTL.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bridge_core::{InvalidationMessage, TierResult};
use futures_util::{Stream, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;

use crate::coordinator::Shared;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "redis")]
pub use self::redis::RedisInvalidationBus;

pub type InvalidationStream = Pin<Box<dyn Stream<Item = InvalidationMessage> + Send>>;

/// Publish/subscribe transport for [`InvalidationMessage`]s.
#[async_trait]
pub trait InvalidationBus: Send + Sync {
    async fn publish(&self, message: &InvalidationMessage) -> TierResult<()>;

    /// Open a new subscription. Messages published before it opened are not
    /// delivered.
    async fn subscribe(&self) -> TierResult<InvalidationStream>;
}

/// In-process bus. Clones share one channel, so coordinators in the same
/// process can act as peers of each other.
#[derive(Debug, Clone)]
pub struct LocalInvalidationBus {
    tx: broadcast::Sender<InvalidationMessage>,
}

impl Default for LocalInvalidationBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl LocalInvalidationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

#[async_trait]
impl InvalidationBus for LocalInvalidationBus {
    async fn publish(&self, message: &InvalidationMessage) -> TierResult<()> {
        // No subscribers is not an error for a best-effort bus.
        let _ = self.tx.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self) -> TierResult<InvalidationStream> {
        let stream = BroadcastStream::new(self.tx.subscribe())
            .filter_map(|item| async move { item.ok() });
        Ok(Box::pin(stream))
    }
}

/// Apply peer invalidations until shutdown, resubscribing when the
/// subscription ends or cannot be opened.
pub(crate) async fn invalidation_listener(
    shared: Arc<Shared>,
    bus: Arc<dyn InvalidationBus>,
    initial: Option<InvalidationStream>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let delay = shared.settings.resubscribe_delay;
    let mut next = initial;

    loop {
        let mut stream = match next.take() {
            Some(stream) => stream,
            None => match bus.subscribe().await {
                Ok(stream) => {
                    tracing::info!("Invalidation bus resubscribed");
                    stream
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Invalidation bus subscribe failed");
                    if !pause(delay, &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }
            },
        };

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::debug!("Invalidation listener shutting down");
                        return;
                    }
                }
                message = stream.next() => match message {
                    Some(message) => shared.apply_invalidation(message).await,
                    None => {
                        tracing::warn!("Invalidation subscription ended");
                        break;
                    }
                },
            }
        }

        if !pause(delay, &mut shutdown_rx).await {
            break;
        }
    }
}

async fn pause(delay: std::time::Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown_rx.changed() => changed.is_ok() && !*shutdown_rx.borrow(),
    }
}
