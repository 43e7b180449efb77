//! MongoDB document store tier.
//!
//! One document per key. `_id` is the lowercase hex of the key so prefix
//! scans become anchored regex queries that use the `_id` index and sort in
//! key order. Puts are version-guarded upserts: when the guard rejects an
//! existing document the upsert collides on `_id`, which is reported as
//! [`PutOutcome::Superseded`].

use std::time::Duration;

use async_trait::async_trait;
use bridge_core::{ConnectionSpec, Entry, Key, TierError, TierKind, TierResult, Version};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{doc, Binary, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};

use super::{PutOutcome, TierAdapter};

const DUPLICATE_KEY: i32 = 11000;

pub(crate) fn classify(e: mongodb::error::Error) -> TierError {
    let retryable_label =
        e.contains_label("RetryableWriteError") || e.contains_label("TransientTransactionError");
    let transient = retryable_label
        || matches!(
            *e.kind,
            ErrorKind::Io(_)
                | ErrorKind::ServerSelection { .. }
                | ErrorKind::ConnectionPoolCleared { .. }
        );
    if transient {
        TierError::transient(format!("mongodb: {}", e))
    } else {
        TierError::permanent(format!("mongodb: {}", e))
    }
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    match *e.kind {
        ErrorKind::Write(WriteFailure::WriteError(ref we)) => we.code == DUPLICATE_KEY,
        ErrorKind::Command(ref ce) => ce.code == DUPLICATE_KEY,
        _ => false,
    }
}

fn to_bson_time(at: DateTime<Utc>) -> mongodb::bson::DateTime {
    mongodb::bson::DateTime::from_millis(at.timestamp_millis())
}

fn binary(bytes: Vec<u8>) -> Binary {
    Binary {
        subtype: BinarySubtype::Generic,
        bytes,
    }
}

fn entry_to_fields(entry: &Entry) -> Document {
    let expires_at = match entry.expires_at {
        Some(at) => Bson::DateTime(to_bson_time(at)),
        None => Bson::Null,
    };
    let key = binary(entry.key.as_bytes().to_vec());
    let value = binary(entry.value.clone());
    doc! {
        "key": key,
        "value": value,
        "version": entry.version.as_i64(),
        "expiresAt": expires_at,
        "tombstone": entry.tombstone,
    }
}

fn entry_from_document(doc: &Document) -> TierResult<Entry> {
    let id = doc
        .get_str("_id")
        .map_err(|e| TierError::permanent(format!("mongodb document _id: {e}")))?;
    let key = Key::from_hex(id)
        .map_err(|e| TierError::permanent(format!("mongodb document _id {id:?}: {e}")))?;
    let value = doc
        .get_binary_generic("value")
        .map_err(|e| TierError::permanent(format!("mongodb document value: {e}")))?
        .clone();
    let version = doc
        .get_i64("version")
        .map_err(|e| TierError::permanent(format!("mongodb document version: {e}")))?;
    let expires_at = doc
        .get_datetime("expiresAt")
        .ok()
        .and_then(|at| DateTime::<Utc>::from_timestamp_millis(at.timestamp_millis()));
    Ok(Entry {
        key,
        value,
        version: Version::from_i64(version),
        expires_at,
        origin: None,
        tombstone: doc.get_bool("tombstone").unwrap_or(false),
    })
}

/// Filter matching documents that have not expired.
fn live_filter() -> Document {
    let now = to_bson_time(Utc::now());
    doc! { "$or": [ { "expiresAt": Bson::Null }, { "expiresAt": { "$gt": now } } ] }
}

pub struct MongoTier {
    collection: Collection<Document>,
}

impl MongoTier {
    pub async fn connect(spec: &ConnectionSpec) -> TierResult<Self> {
        let client = Client::with_uri_str(spec.mongo_url())
            .await
            .map_err(classify)?;
        let collection = client
            .database(spec.database())
            .collection::<Document>(spec.table());
        let tier = Self::with_collection(collection);
        tier.ensure_indexes().await;
        tracing::info!(
            target = %spec.redacted(),
            collection = spec.table(),
            "Connected MongoDB tier"
        );
        Ok(tier)
    }

    pub fn with_collection(collection: Collection<Document>) -> Self {
        Self { collection }
    }

    /// TTL index so the server drops expired documents on its own.
    async fn ensure_indexes(&self) {
        let index = IndexModel::builder()
            .keys(doc! { "expiresAt": 1 })
            .options(
                IndexOptions::builder()
                    .expire_after(Duration::ZERO)
                    .build(),
            )
            .build();
        if let Err(e) = self.collection.create_index(index).await {
            tracing::warn!(error = %e, "Failed to create MongoDB TTL index");
        }
    }

    async fn current_version(&self, id: &str) -> TierResult<Version> {
        let found = self
            .collection
            .find_one(doc! { "_id": id })
            .await
            .map_err(classify)?;
        Ok(found
            .and_then(|d| d.get_i64("version").ok())
            .map(Version::from_i64)
            .unwrap_or(Version::ZERO))
    }
}

#[async_trait]
impl TierAdapter for MongoTier {
    fn kind(&self) -> TierKind {
        TierKind::Document
    }

    async fn get(&self, key: &Key) -> TierResult<Option<Entry>> {
        let mut filter = live_filter();
        filter.insert("_id", key.to_hex());
        let found = self.collection.find_one(filter).await.map_err(classify)?;
        found.as_ref().map(entry_from_document).transpose()
    }

    async fn put(&self, entry: &Entry) -> TierResult<PutOutcome> {
        let id = entry.key.to_hex();
        let now = to_bson_time(Utc::now());
        let filter = doc! {
            "_id": id.as_str(),
            "$or": [
                { "version": { "$lt": entry.version.as_i64() } },
                { "expiresAt": { "$lte": now } },
            ],
        };
        let update = doc! { "$set": entry_to_fields(entry) };

        match self.collection.update_one(filter, update).upsert(true).await {
            Ok(result) if result.matched_count > 0 || result.upserted_id.is_some() => {
                Ok(PutOutcome::Applied)
            }
            Ok(_) => Ok(PutOutcome::Superseded {
                current: self.current_version(&id).await?,
            }),
            Err(e) if is_duplicate_key(&e) => Ok(PutOutcome::Superseded {
                current: self.current_version(&id).await?,
            }),
            Err(e) => Err(classify(e)),
        }
    }

    async fn delete(&self, key: &Key) -> TierResult<()> {
        self.collection
            .delete_one(doc! { "_id": key.to_hex() })
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn exists(&self, key: &Key) -> TierResult<bool> {
        let mut filter = live_filter();
        filter.insert("_id", key.to_hex());
        filter.insert("tombstone", false);
        let count = self
            .collection
            .count_documents(filter)
            .await
            .map_err(classify)?;
        Ok(count > 0)
    }

    async fn healthy(&self) -> bool {
        self.collection
            .client()
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .is_ok()
    }

    async fn scan(&self, prefix: &[u8], limit: usize) -> TierResult<Vec<Entry>> {
        let mut filter = live_filter();
        filter.insert("_id", doc! { "$regex": format!("^{}", hex::encode(prefix)) });
        filter.insert("tombstone", false);
        let cursor = self
            .collection
            .find(filter)
            .sort(doc! { "_id": 1 })
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .await
            .map_err(classify)?;
        let docs: Vec<Document> = cursor.try_collect().await.map_err(classify)?;
        docs.iter().map(entry_from_document).collect()
    }
}
