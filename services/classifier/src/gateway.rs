//! Primary classifier client.
//!
//! The remote service recognizes cars from a publicly resolvable image URL.
//! Its HTTP status codes are folded into a [`ClassificationOutcome`] here so
//! the pipeline only has to branch on a typed value.

use crate::config::ClassifierConfig;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

/// Error text the classifier returns for images without a car.
pub const NO_CAR_ERROR: &str = "Image doesn't contain a car";

/// Reason attached to [`ClassificationOutcome::NotApplicable`] when the image
/// is outside the classifier's domain.
pub const NOT_EXPECTED_SUBJECT: &str = "not the expected subject";

/// Result of one classification call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClassificationOutcome {
    /// Classifier recognized the image; body is the decoded JSON response
    Success(serde_json::Value),
    /// Classifier is throttling the caller
    RateLimited,
    /// Classifier declined the image
    NotApplicable(String),
    /// Any other status
    Failure(u16),
}

impl ClassificationOutcome {
    /// True when the fallback label detector should handle the image.
    pub fn wants_fallback(&self) -> bool {
        matches!(self, Self::NotApplicable(reason) if reason == NOT_EXPECTED_SUBJECT)
    }
}

/// Errors that prevent a classification outcome from being produced
#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Failed to create HTTP client: {0}")]
    ClientBuild(String),

    #[error("Request to classifier failed: {0}")]
    Transport(String),

    #[error("Failed to decode classifier response: {0}")]
    Decode(String),
}

/// Classifies an image by URL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClassifierGateway: Send + Sync {
    async fn classify(&self, resource_url: &str) -> Result<ClassificationOutcome, ClassifierError>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// Map a classifier status code and raw body to an outcome.
pub fn interpret(status: StatusCode, body: &str) -> Result<ClassificationOutcome, ClassifierError> {
    match status {
        StatusCode::OK => serde_json::from_str(body)
            .map(ClassificationOutcome::Success)
            .map_err(|e| ClassifierError::Decode(e.to_string())),
        StatusCode::TOO_MANY_REQUESTS => Ok(ClassificationOutcome::RateLimited),
        StatusCode::INTERNAL_SERVER_ERROR => {
            let not_a_car = serde_json::from_str::<ErrorBody>(body)
                .ok()
                .and_then(|b| b.error)
                .is_some_and(|e| e == NO_CAR_ERROR);

            if not_a_car {
                Ok(ClassificationOutcome::NotApplicable(
                    NOT_EXPECTED_SUBJECT.to_string(),
                ))
            } else {
                Ok(ClassificationOutcome::Failure(status.as_u16()))
            }
        }
        other => Ok(ClassificationOutcome::Failure(other.as_u16())),
    }
}

/// HTTP implementation of [`ClassifierGateway`]
pub struct HttpClassifierGateway {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpClassifierGateway {
    pub fn new(config: &ClassifierConfig) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ClassifierError::ClientBuild(e.to_string()))?;

        Ok(Self::with_client(client, &config.endpoint))
    }

    /// Reuse an already configured client.
    pub fn with_client(client: reqwest::Client, endpoint: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl ClassifierGateway for HttpClassifierGateway {
    #[instrument(skip(self))]
    async fn classify(&self, resource_url: &str) -> Result<ClassificationOutcome, ClassifierError> {
        let response = self
            .client
            .post(&self.endpoint)
            .body(resource_url.to_string())
            .send()
            .await
            .map_err(|e| ClassifierError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ClassifierError::Transport(e.to_string()))?;

        debug!(status = status.as_u16(), "Classifier responded");

        interpret(status, &body)
    }
}
