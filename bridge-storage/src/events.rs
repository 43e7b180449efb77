//! Failure/event channel.

use bridge_core::BridgeEvent;
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Buffered events per subscriber before the slowest one starts lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Fan-out of [`BridgeEvent`]s to any number of subscribers.
///
/// Emitting never blocks and never fails; events sent while nobody is
/// subscribed are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BridgeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: BridgeEvent) {
        match &event {
            BridgeEvent::RepairAbandoned { .. }
            | BridgeEvent::WriteBackExhausted { .. }
            | BridgeEvent::AdapterUnhealthy { .. } => {
                tracing::warn!(tier = event.tier(), event = ?event, "Bridge event")
            }
            _ => tracing::debug!(tier = event.tier(), event = ?event, "Bridge event"),
        }
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a stream. Lagged gaps are skipped silently.
    pub fn stream(&self) -> impl Stream<Item = BridgeEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|item| async move { item.ok() })
    }
}
