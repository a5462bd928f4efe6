//! Persistence of classification results, one record per classified image.
//!
//! Each record carries a fresh UUID, matching created/updated timestamps and
//! the JSON payload under a per-kind attribute name.

use crate::config::StoreConfig;
use async_trait::async_trait;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client as DynamoClient;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, instrument};
use uuid::Uuid;

/// Which classifier produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Primary,
    Fallback,
}

/// Item attribute names holding the JSON payload, per record kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadAttributes {
    pub primary: String,
    pub fallback: String,
}

impl PayloadAttributes {
    pub fn for_kind(&self, kind: RecordKind) -> &str {
        match kind {
            RecordKind::Primary => &self.primary,
            RecordKind::Fallback => &self.fallback,
        }
    }
}

impl From<&StoreConfig> for PayloadAttributes {
    fn from(config: &StoreConfig) -> Self {
        Self {
            primary: config.primary_attribute.clone(),
            fallback: config.fallback_attribute.clone(),
        }
    }
}

/// A persisted classification result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub id: Uuid,
    pub created_at: String,
    pub updated_at: String,
    pub kind: RecordKind,
    /// Payload serialized as a JSON string
    pub payload: String,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to serialize payload: {0}")]
    Serialize(String),

    #[error("Failed to write record {id} to table {table}: {message}")]
    Write {
        table: String,
        id: Uuid,
        message: String,
    },
}

/// Writes one record to a table.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordWriter: Send + Sync {
    async fn put(&self, table: &str, record: &ClassificationRecord) -> Result<(), StoreError>;
}

/// Timestamped, uniquely identified result persistence
#[derive(Clone)]
pub struct ResultStore {
    writer: Arc<dyn RecordWriter>,
    primary_table: String,
    fallback_table: String,
}

impl ResultStore {
    pub fn new(writer: Arc<dyn RecordWriter>, config: &StoreConfig) -> Self {
        Self {
            writer,
            primary_table: config.primary_table.clone(),
            fallback_table: config.fallback_table.clone(),
        }
    }

    /// Table a record of the given kind is routed to
    pub fn table_for(&self, kind: RecordKind) -> &str {
        match kind {
            RecordKind::Primary => &self.primary_table,
            RecordKind::Fallback => &self.fallback_table,
        }
    }

    /// Persist a payload as a new record and return its id.
    #[instrument(skip(self, payload))]
    pub async fn save<T: Serialize + ?Sized + Sync>(
        &self,
        kind: RecordKind,
        payload: &T,
    ) -> Result<Uuid, StoreError> {
        let payload =
            serde_json::to_string(payload).map_err(|e| StoreError::Serialize(e.to_string()))?;
        let record = new_record(kind, payload);
        let table = self.table_for(kind);

        if let Err(e) = self.writer.put(table, &record).await {
            error!(table = %table, record_id = %record.id, error = %e, "Failed to persist record");
            return Err(e);
        }

        debug!(table = %table, record_id = %record.id, "Record persisted");
        metrics::counter!("classifier.records.persisted").increment(1);

        Ok(record.id)
    }
}

/// Build a record with a fresh id and one second-precision UTC timestamp.
fn new_record(kind: RecordKind, payload: String) -> ClassificationRecord {
    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string();

    ClassificationRecord {
        id: Uuid::new_v4(),
        created_at: timestamp.clone(),
        updated_at: timestamp,
        kind,
        payload,
    }
}

/// DynamoDB implementation of [`RecordWriter`]
pub struct DynamoRecordWriter {
    client: DynamoClient,
    attributes: PayloadAttributes,
}

impl DynamoRecordWriter {
    pub fn new(client: DynamoClient, config: &StoreConfig) -> Self {
        Self {
            client,
            attributes: PayloadAttributes::from(config),
        }
    }
}

#[async_trait]
impl RecordWriter for DynamoRecordWriter {
    async fn put(&self, table: &str, record: &ClassificationRecord) -> Result<(), StoreError> {
        self.client
            .put_item()
            .table_name(table)
            .item("id", AttributeValue::S(record.id.to_string()))
            .item("createdAt", AttributeValue::S(record.created_at.clone()))
            .item("updatedAt", AttributeValue::S(record.updated_at.clone()))
            .item(
                self.attributes.for_kind(record.kind),
                AttributeValue::S(record.payload.clone()),
            )
            .send()
            .await
            .map_err(|e| StoreError::Write {
                table: table.to_string(),
                id: record.id,
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }
}

/// Records kept in memory, grouped by table
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryWriter {
    pub records: std::sync::Mutex<Vec<(String, ClassificationRecord)>>,
}

#[cfg(test)]
impl MemoryWriter {
    pub fn in_table(&self, table: &str) -> Vec<ClassificationRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[cfg(test)]
#[async_trait]
impl RecordWriter for MemoryWriter {
    async fn put(&self, table: &str, record: &ClassificationRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap()
            .push((table.to_string(), record.clone()));
        Ok(())
    }
}
