//! Typed repository over a [`Coordinator`].
//!
//! Values go through a [`Serializer`] before reaching the tiers; JSON unless
//! another serializer is supplied.

use std::marker::PhantomData;
use std::time::Duration;

use bridge_core::{BridgeError, BridgeResult, JsonSerializer, Key, Serializer};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::coordinator::{BridgeRead, CallOptions, Coordinator, WriteAck};

/// Typed view of one coordinator for values of type `T`.
pub struct TypedBridge<T, S = JsonSerializer> {
    bridge: Coordinator,
    serializer: S,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S: Clone> Clone for TypedBridge<T, S> {
    fn clone(&self) -> Self {
        Self {
            bridge: self.bridge.clone(),
            serializer: self.serializer.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T, S: Serializer + std::fmt::Debug> std::fmt::Debug for TypedBridge<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedBridge")
            .field("type", &std::any::type_name::<T>())
            .field("serializer", &self.serializer)
            .finish()
    }
}

impl<T> TypedBridge<T, JsonSerializer>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(bridge: Coordinator) -> Self {
        Self::with_serializer(bridge, JsonSerializer)
    }
}

impl<T, S> TypedBridge<T, S>
where
    T: Serialize + DeserializeOwned,
    S: Serializer,
{
    pub fn with_serializer(bridge: Coordinator, serializer: S) -> Self {
        Self {
            bridge,
            serializer,
            _marker: PhantomData,
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.bridge
    }

    pub async fn fetch(&self, key: impl Into<Key>) -> BridgeResult<Option<T>> {
        Ok(self.fetch_read(key).await?.map(BridgeRead::into_value))
    }

    /// Fetch with version and origin metadata.
    pub async fn fetch_read(&self, key: impl Into<Key>) -> BridgeResult<Option<BridgeRead<T>>> {
        match self.bridge.read(key, CallOptions::default()).await? {
            Some(read) => Ok(Some(read.try_map(|bytes| self.serializer.decode(&bytes))?)),
            None => Ok(None),
        }
    }

    /// Every value under `prefix`, in key order, at most `limit`.
    pub async fn fetch_all(&self, prefix: impl AsRef<[u8]>, limit: usize) -> BridgeResult<Vec<T>> {
        self.bridge
            .list(prefix.as_ref(), limit)
            .await?
            .into_iter()
            .map(|read| self.serializer.decode(read.value()).map_err(BridgeError::from))
            .collect()
    }

    pub async fn save(&self, key: impl Into<Key>, value: &T) -> BridgeResult<WriteAck> {
        self.save_with(key, value, CallOptions::default()).await
    }

    pub async fn save_with_ttl(
        &self,
        key: impl Into<Key>,
        value: &T,
        ttl: Duration,
    ) -> BridgeResult<WriteAck> {
        self.save_with(key, value, CallOptions::new().with_ttl(ttl))
            .await
    }

    pub async fn save_with(
        &self,
        key: impl Into<Key>,
        value: &T,
        options: CallOptions,
    ) -> BridgeResult<WriteAck> {
        let bytes = self.serializer.encode(value)?;
        self.bridge.put_with(key, bytes, options).await
    }

    pub async fn delete(&self, key: impl Into<Key>) -> BridgeResult<()> {
        self.bridge.delete(key).await
    }
}
