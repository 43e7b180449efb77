//! Invalidation bus over Redis pub/sub.

use async_trait::async_trait;
use bridge_core::{ConnectionSpec, InvalidationMessage, TierError, TierResult};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use super::{InvalidationBus, InvalidationStream};
use crate::tier::redis::classify;

pub struct RedisInvalidationBus {
    client: Client,
    publisher: ConnectionManager,
    channel: String,
}

impl RedisInvalidationBus {
    pub async fn connect(spec: &ConnectionSpec, channel: impl Into<String>) -> TierResult<Self> {
        let client = Client::open(spec.redis_url()).map_err(classify)?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(classify)?;
        let channel = channel.into();
        tracing::info!(redis = %spec.redacted(), channel = %channel, "Connected invalidation bus");
        Ok(Self {
            client,
            publisher,
            channel,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl std::fmt::Debug for RedisInvalidationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisInvalidationBus")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl InvalidationBus for RedisInvalidationBus {
    async fn publish(&self, message: &InvalidationMessage) -> TierResult<()> {
        let payload = serde_json::to_string(message)
            .map_err(|e| TierError::permanent(format!("encoding invalidation: {e}")))?;
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(&self.channel, payload)
            .await
            .map_err(classify)?;
        tracing::debug!(key = %message.key, channel = %self.channel, "Published invalidation");
        Ok(())
    }

    async fn subscribe(&self) -> TierResult<InvalidationStream> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(classify)?;
        pubsub.subscribe(&self.channel).await.map_err(classify)?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "Unreadable invalidation payload");
                    return None;
                }
            };
            match serde_json::from_str::<InvalidationMessage>(&payload) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed invalidation message");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
