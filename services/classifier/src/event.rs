//! S3 event notifications and the records derived from them.

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::Client as S3Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

/// Region S3 reports as an empty location constraint
const DEFAULT_REGION: &str = "us-east-1";

/// S3 event notification as delivered by the trigger
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventNotification {
    #[serde(rename = "Records", default)]
    pub records: Vec<NotificationRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub s3: S3Entity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Entity {
    pub bucket: BucketEntity,
    pub object: ObjectEntity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketEntity {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectEntity {
    /// URL-encoded object key
    pub key: String,
}

impl NotificationRecord {
    pub fn bucket(&self) -> &str {
        &self.s3.bucket.name
    }

    /// Object key with the notification's form encoding removed.
    pub fn object_key(&self) -> String {
        decode_key(&self.s3.object.key)
    }
}

/// One image to classify
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub bucket: String,
    pub object_key: String,
    pub resource_url: String,
}

impl EventRecord {
    pub fn new(bucket: &str, object_key: &str, region: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            object_key: object_key.to_string(),
            resource_url: resource_url(bucket, region, object_key),
        }
    }
}

/// Public virtual-hosted URL of an object.
pub fn resource_url(bucket: &str, region: &str, object_key: &str) -> String {
    let key = object_key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");

    format!("https://{bucket}.s3.{region}.amazonaws.com/{key}")
}

/// Decode a key from an S3 notification (`+` for space, then percent escapes).
pub fn decode_key(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|key| key.into_owned())
        .unwrap_or(spaced)
}

/// Map a bucket location constraint to a region name.
pub fn region_from_constraint(constraint: Option<&str>) -> String {
    match constraint {
        None | Some("") => DEFAULT_REGION.to_string(),
        Some("EU") => "eu-west-1".to_string(),
        Some(region) => region.to_string(),
    }
}

#[derive(Error, Debug)]
pub enum LocateError {
    #[error("Failed to resolve location of bucket {bucket}: {message}")]
    Remote { bucket: String, message: String },
}

/// Resolves the region a bucket lives in.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BucketLocator: Send + Sync {
    async fn region(&self, bucket: &str) -> Result<String, LocateError>;
}

/// S3 `GetBucketLocation` implementation of [`BucketLocator`]
pub struct S3BucketLocator {
    client: S3Client,
}

impl S3BucketLocator {
    pub fn new(client: S3Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BucketLocator for S3BucketLocator {
    #[instrument(skip(self))]
    async fn region(&self, bucket: &str) -> Result<String, LocateError> {
        let output = self
            .client
            .get_bucket_location()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| LocateError::Remote {
                bucket: bucket.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        let region = region_from_constraint(output.location_constraint().map(|c| c.as_str()));
        debug!(region = %region, "Resolved bucket region");

        Ok(region)
    }
}
