//! Label detection for images the primary classifier rejects.

use async_trait::async_trait;
use aws_sdk_rekognition::error::DisplayErrorContext;
use aws_sdk_rekognition::types::{Image, S3Object};
use aws_sdk_rekognition::Client as RekognitionClient;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

/// One detected label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    /// Label name as reported by the detector
    pub name: String,
    /// Confidence as reported by the detector
    pub confidence: f32,
}

/// Labels in the order the detector ranked them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(pub Vec<Label>);

impl LabelSet {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn top(&self) -> Option<&Label> {
        self.0.first()
    }
}

#[derive(Error, Debug)]
pub enum FallbackError {
    #[error("Label detection failed: {0}")]
    Remote(String),
}

/// Detects labels on an object already stored in S3.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FallbackClassifier: Send + Sync {
    async fn detect_labels(&self, bucket: &str, object_key: &str) -> Result<LabelSet, FallbackError>;
}

/// Rekognition implementation of [`FallbackClassifier`]
pub struct RekognitionClassifier {
    client: RekognitionClient,
    max_labels: i32,
}

impl RekognitionClassifier {
    pub fn new(client: RekognitionClient, max_labels: i32) -> Self {
        Self { client, max_labels }
    }
}

#[async_trait]
impl FallbackClassifier for RekognitionClassifier {
    #[instrument(skip(self))]
    async fn detect_labels(&self, bucket: &str, object_key: &str) -> Result<LabelSet, FallbackError> {
        let image = Image::builder()
            .s3_object(S3Object::builder().bucket(bucket).name(object_key).build())
            .build();

        let output = self
            .client
            .detect_labels()
            .image(image)
            .max_labels(self.max_labels)
            .send()
            .await
            .map_err(|e| FallbackError::Remote(DisplayErrorContext(&e).to_string()))?;

        let labels: Vec<Label> = output
            .labels()
            .iter()
            .map(|label| Label {
                name: label.name().unwrap_or_default().to_string(),
                confidence: label.confidence().unwrap_or_default(),
            })
            .collect();

        debug!(label_count = labels.len(), "Labels detected");

        Ok(LabelSet(labels))
    }
}
