//! Per-record classification state machine and the batch driver around it.
//!
//! Each record moves through primary classification, optional rate-limit
//! backoff, optional fallback label detection and finally persistence. Remote
//! failures end the record as [`ItemOutcome::Abandoned`] without disturbing the
//! rest of the batch; a persistence failure stops the batch.

use crate::config::ClassifierConfig;
use crate::event::{BucketLocator, EventNotification, EventRecord};
use crate::fallback::FallbackClassifier;
use crate::gateway::{ClassificationOutcome, ClassifierGateway};
use crate::store::{RecordKind, ResultStore, StoreError};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Errors that escape a single record
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a record ended without a persisted result
#[derive(Debug, Clone, PartialEq)]
pub enum AbandonReason {
    /// Still rate limited after the retry ceiling
    RetriesExhausted { attempts: u32 },
    /// Classifier declined the image for a reason without a fallback
    Rejected { reason: String },
    /// Classifier answered with an unexpected status
    RemoteFailure { status: u16 },
    /// Classifier could not be reached or answered garbage
    ClassifierError(String),
    /// Label detection failed
    FallbackFailed(String),
    /// Bucket region could not be resolved
    LocationUnresolved(String),
}

/// Terminal state of one record
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Persisted { record_id: Uuid, kind: RecordKind },
    Abandoned(AbandonReason),
}

/// Counts for one invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub persisted: usize,
    pub abandoned: usize,
}

impl BatchSummary {
    fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Persisted { .. } => self.persisted += 1,
            ItemOutcome::Abandoned(_) => self.abandoned += 1,
        }
    }
}

/// Fixed acknowledgment returned once every record was attempted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: String,
}

impl HandlerResponse {
    pub fn done() -> Self {
        Self {
            status_code: 200,
            body: "Done!".to_string(),
        }
    }
}

/// Backoff applied to rate-limited classification calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_max_interval(self.max_delay)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

impl From<&ClassifierConfig> for RetryPolicy {
    fn from(config: &ClassifierConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.backoff_initial(),
            max_delay: config.backoff_max(),
            multiplier: config.backoff_multiplier,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ClassifierConfig::default())
    }
}

/// Classify, fall back, persist
pub struct ClassificationPipeline {
    gateway: Arc<dyn ClassifierGateway>,
    fallback: Arc<dyn FallbackClassifier>,
    locator: Arc<dyn BucketLocator>,
    store: ResultStore,
    retry: RetryPolicy,
}

impl ClassificationPipeline {
    pub fn new(
        gateway: Arc<dyn ClassifierGateway>,
        fallback: Arc<dyn FallbackClassifier>,
        locator: Arc<dyn BucketLocator>,
        store: ResultStore,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            gateway,
            fallback,
            locator,
            store,
            retry,
        }
    }

    /// Process every record of a notification in arrival order.
    ///
    /// Returns early with the store error if any record fails to persist;
    /// records after it are not attempted.
    #[instrument(skip_all, fields(records = notification.records.len()))]
    pub async fn handle(&self, notification: &EventNotification) -> Result<BatchSummary, PipelineError> {
        let mut summary = BatchSummary::default();
        let mut regions: HashMap<String, String> = HashMap::new();
        let total = notification.records.len();

        for (index, entry) in notification.records.iter().enumerate() {
            let bucket = entry.bucket();

            let region = match regions.get(bucket) {
                Some(region) => region.clone(),
                None => match self.locator.region(bucket).await {
                    Ok(region) => {
                        regions.insert(bucket.to_string(), region.clone());
                        region
                    }
                    Err(e) => {
                        error!(bucket = %bucket, error = %e, "Skipping record");
                        let outcome =
                            ItemOutcome::Abandoned(AbandonReason::LocationUnresolved(e.to_string()));
                        summary.record(&outcome);
                        metrics::counter!("classifier.records.abandoned").increment(1);
                        continue;
                    }
                },
            };

            let record = EventRecord::new(bucket, &entry.object_key(), &region);

            match self.process(&record).await {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    error!(
                        bucket = %record.bucket,
                        key = %record.object_key,
                        remaining = total - index - 1,
                        error = %e,
                        "Persistence failed, aborting batch"
                    );
                    return Err(e);
                }
            }
        }

        info!(
            persisted = summary.persisted,
            abandoned = summary.abandoned,
            "Batch processed"
        );

        Ok(summary)
    }

    /// Run one record to a terminal state.
    #[instrument(skip(self, record), fields(bucket = %record.bucket, key = %record.object_key))]
    pub async fn process(&self, record: &EventRecord) -> Result<ItemOutcome, PipelineError> {
        let mut backoff = self.retry.backoff();
        let mut retries = 0u32;

        loop {
            let outcome = match self.gateway.classify(&record.resource_url).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "Classifier call failed");
                    return Ok(abandon(AbandonReason::ClassifierError(e.to_string())));
                }
            };

            match outcome {
                ClassificationOutcome::Success(payload) => {
                    let record_id = self.store.save(RecordKind::Primary, &payload).await?;
                    info!(record_id = %record_id, "Classification persisted");
                    return Ok(ItemOutcome::Persisted {
                        record_id,
                        kind: RecordKind::Primary,
                    });
                }
                ClassificationOutcome::RateLimited => {
                    metrics::counter!("classifier.rate_limited").increment(1);

                    if retries >= self.retry.max_retries {
                        warn!(attempts = retries + 1, "Still rate limited, giving up");
                        return Ok(abandon(AbandonReason::RetriesExhausted {
                            attempts: retries + 1,
                        }));
                    }
                    retries += 1;

                    let delay = backoff.next_backoff().unwrap_or(self.retry.max_delay);
                    warn!(
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                outcome if outcome.wants_fallback() => return self.classify_fallback(record).await,
                ClassificationOutcome::NotApplicable(reason) => {
                    warn!(reason = %reason, "Classifier declined image");
                    return Ok(abandon(AbandonReason::Rejected { reason }));
                }
                ClassificationOutcome::Failure(status) => {
                    warn!(status = status, "Bad classifier response");
                    return Ok(abandon(AbandonReason::RemoteFailure { status }));
                }
            }
        }
    }

    async fn classify_fallback(&self, record: &EventRecord) -> Result<ItemOutcome, PipelineError> {
        let labels = match self
            .fallback
            .detect_labels(&record.bucket, &record.object_key)
            .await
        {
            Ok(labels) => labels,
            Err(e) => {
                warn!(error = %e, "Fallback label detection failed");
                return Ok(abandon(AbandonReason::FallbackFailed(e.to_string())));
            }
        };

        info!(
            label_count = labels.len(),
            top = labels.top().map(|l| l.name.as_str()).unwrap_or(""),
            "Not a car, using detected labels"
        );

        let record_id = self.store.save(RecordKind::Fallback, &labels).await?;

        Ok(ItemOutcome::Persisted {
            record_id,
            kind: RecordKind::Fallback,
        })
    }
}

fn abandon(reason: AbandonReason) -> ItemOutcome {
    metrics::counter!("classifier.records.abandoned").increment(1);
    ItemOutcome::Abandoned(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::event::{MockBucketLocator, NotificationRecord};
    use crate::fallback::{FallbackError, Label, LabelSet, MockFallbackClassifier};
    use crate::gateway::{ClassifierError, MockClassifierGateway, NOT_EXPECTED_SUBJECT};
    use crate::store::{MemoryWriter, MockRecordWriter, RecordWriter};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    const BUCKET: &str = "car-photos";

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            multiplier: 1.0,
        }
    }

    fn us_east_locator() -> MockBucketLocator {
        let mut locator = MockBucketLocator::new();
        locator
            .expect_region()
            .returning(|_| Ok("us-east-1".to_string()));
        locator
    }

    fn pipeline(
        gateway: MockClassifierGateway,
        fallback: MockFallbackClassifier,
        writer: Arc<dyn RecordWriter>,
        retry: RetryPolicy,
    ) -> ClassificationPipeline {
        ClassificationPipeline::new(
            Arc::new(gateway),
            Arc::new(fallback),
            Arc::new(us_east_locator()),
            ResultStore::new(writer, &StoreConfig::default()),
            retry,
        )
    }

    fn record(key: &str) -> EventRecord {
        EventRecord::new(BUCKET, key, "us-east-1")
    }

    fn notification(keys: &[&str]) -> EventNotification {
        let records = keys
            .iter()
            .map(|key| {
                serde_json::from_value::<NotificationRecord>(json!({
                    "s3": {"bucket": {"name": BUCKET}, "object": {"key": key}}
                }))
                .unwrap()
            })
            .collect();
        EventNotification { records }
    }

    fn not_a_car() -> ClassificationOutcome {
        ClassificationOutcome::NotApplicable(NOT_EXPECTED_SUBJECT.to_string())
    }

    fn boat() -> LabelSet {
        LabelSet(vec![Label {
            name: "Boat".to_string(),
            confidence: 0.97,
        }])
    }

    #[tokio::test]
    async fn test_success_persists_primary_record() {
        let mut gateway = MockClassifierGateway::new();
        gateway
            .expect_classify()
            .times(1)
            .returning(|_| Ok(ClassificationOutcome::Success(json!({"make": "Toyota"}))));
        let mut fallback = MockFallbackClassifier::new();
        fallback.expect_detect_labels().never();
        let writer = Arc::new(MemoryWriter::default());

        let pipeline = pipeline(gateway, fallback, writer.clone(), fast_retry(3));
        let outcome = pipeline.process(&record("a.jpg")).await.unwrap();

        assert!(matches!(
            outcome,
            ItemOutcome::Persisted { kind: RecordKind::Primary, .. }
        ));
        let stored = writer.in_table(&StoreConfig::default().primary_table);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].created_at, stored[0].updated_at);
        assert_eq!(stored[0].payload, r#"{"make":"Toyota"}"#);
    }

    #[tokio::test]
    async fn test_not_a_car_uses_fallback_with_same_object() {
        let mut gateway = MockClassifierGateway::new();
        gateway.expect_classify().times(1).returning(|_| Ok(not_a_car()));
        let mut fallback = MockFallbackClassifier::new();
        fallback
            .expect_detect_labels()
            .withf(|bucket, key| bucket == BUCKET && key == "boats/b.jpg")
            .times(1)
            .returning(|_, _| Ok(boat()));
        let writer = Arc::new(MemoryWriter::default());

        let pipeline = pipeline(gateway, fallback, writer.clone(), fast_retry(3));
        let outcome = pipeline.process(&record("boats/b.jpg")).await.unwrap();

        assert!(matches!(
            outcome,
            ItemOutcome::Persisted { kind: RecordKind::Fallback, .. }
        ));
        let stored = writer.in_table(&StoreConfig::default().fallback_table);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].kind, RecordKind::Fallback);
    }

    #[tokio::test]
    async fn test_other_server_error_abandons_without_fallback() {
        let mut gateway = MockClassifierGateway::new();
        gateway
            .expect_classify()
            .times(1)
            .returning(|_| Ok(ClassificationOutcome::Failure(500)));
        let mut fallback = MockFallbackClassifier::new();
        fallback.expect_detect_labels().never();
        let writer = Arc::new(MemoryWriter::default());

        let pipeline = pipeline(gateway, fallback, writer.clone(), fast_retry(3));
        let outcome = pipeline.process(&record("c.jpg")).await.unwrap();

        assert_eq!(
            outcome,
            ItemOutcome::Abandoned(AbandonReason::RemoteFailure { status: 500 })
        );
        assert_eq!(writer.count(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_backs_off_then_retries_same_url() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let expected_url = record("d.jpg").resource_url;

        let mut gateway = MockClassifierGateway::new();
        gateway
            .expect_classify()
            .withf(move |url| url == expected_url)
            .times(3)
            .returning(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(ClassificationOutcome::RateLimited)
                } else {
                    Ok(ClassificationOutcome::Success(json!({"make": "Honda"})))
                }
            });
        let writer = Arc::new(MemoryWriter::default());

        let pipeline = pipeline(gateway, MockFallbackClassifier::new(), writer.clone(), fast_retry(3));
        let started = Instant::now();
        let outcome = pipeline.process(&record("d.jpg")).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(outcome, ItemOutcome::Persisted { .. }));
        assert_eq!(writer.count(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_ceiling_abandons() {
        let mut gateway = MockClassifierGateway::new();
        gateway
            .expect_classify()
            .times(4)
            .returning(|_| Ok(ClassificationOutcome::RateLimited));
        let writer = Arc::new(MemoryWriter::default());

        let pipeline = pipeline(gateway, MockFallbackClassifier::new(), writer.clone(), fast_retry(3));
        let outcome = pipeline.process(&record("e.jpg")).await.unwrap();

        assert_eq!(
            outcome,
            ItemOutcome::Abandoned(AbandonReason::RetriesExhausted { attempts: 4 })
        );
        assert_eq!(writer.count(), 0);
    }

    #[tokio::test]
    async fn test_classifier_transport_error_abandons() {
        let mut gateway = MockClassifierGateway::new();
        gateway
            .expect_classify()
            .returning(|_| Err(ClassifierError::Transport("connection reset".to_string())));
        let writer = Arc::new(MemoryWriter::default());

        let pipeline = pipeline(gateway, MockFallbackClassifier::new(), writer.clone(), fast_retry(3));
        let outcome = pipeline.process(&record("f.jpg")).await.unwrap();

        assert!(matches!(
            outcome,
            ItemOutcome::Abandoned(AbandonReason::ClassifierError(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_of_car_and_boat() {
        let mut gateway = MockClassifierGateway::new();
        gateway.expect_classify().times(2).returning(|url| {
            if url.ends_with("/a.jpg") {
                Ok(ClassificationOutcome::Success(json!({"make": "Toyota"})))
            } else {
                Ok(not_a_car())
            }
        });
        let mut fallback = MockFallbackClassifier::new();
        fallback
            .expect_detect_labels()
            .withf(|bucket, key| bucket == BUCKET && key == "b.jpg")
            .times(1)
            .returning(|_, _| Ok(boat()));
        let mut locator = MockBucketLocator::new();
        locator
            .expect_region()
            .withf(|bucket| bucket == BUCKET)
            .times(1)
            .returning(|_| Ok("eu-central-1".to_string()));
        let writer = Arc::new(MemoryWriter::default());

        let pipeline = ClassificationPipeline::new(
            Arc::new(gateway),
            Arc::new(fallback),
            Arc::new(locator),
            ResultStore::new(writer.clone(), &StoreConfig::default()),
            fast_retry(3),
        );

        let summary = pipeline.handle(&notification(&["a.jpg", "b.jpg"])).await.unwrap();

        assert_eq!(summary, BatchSummary { persisted: 2, abandoned: 0 });
        let primary = writer.in_table(&StoreConfig::default().primary_table);
        let fallback = writer.in_table(&StoreConfig::default().fallback_table);
        assert_eq!(primary.len(), 1);
        assert_eq!(fallback.len(), 1);
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&primary[0].payload).unwrap(),
            json!({"make": "Toyota"})
        );
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&fallback[0].payload).unwrap(),
            serde_json::to_value(boat()).unwrap()
        );
        assert_ne!(primary[0].id, fallback[0].id);
        assert_eq!(
            serde_json::to_value(HandlerResponse::done()).unwrap(),
            json!({"statusCode": 200, "body": "Done!"})
        );
    }

    #[tokio::test]
    async fn test_store_failure_aborts_remaining_records() {
        let mut gateway = MockClassifierGateway::new();
        gateway
            .expect_classify()
            .times(1)
            .returning(|_| Ok(ClassificationOutcome::Success(json!({"make": "Kia"}))));
        let mut writer = MockRecordWriter::new();
        writer.expect_put().times(1).returning(|table, record| {
            Err(StoreError::Write {
                table: table.to_string(),
                id: record.id,
                message: "AccessDenied".to_string(),
            })
        });

        let pipeline = pipeline(gateway, MockFallbackClassifier::new(), Arc::new(writer), fast_retry(3));
        let result = pipeline.handle(&notification(&["a.jpg", "b.jpg"])).await;

        assert!(matches!(result, Err(PipelineError::Store(_))));
    }

    #[tokio::test]
    async fn test_fallback_failure_continues_batch() {
        let mut gateway = MockClassifierGateway::new();
        gateway.expect_classify().times(2).returning(|url| {
            if url.ends_with("/boat.jpg") {
                Ok(not_a_car())
            } else {
                Ok(ClassificationOutcome::Success(json!({"make": "Ford"})))
            }
        });
        let mut fallback = MockFallbackClassifier::new();
        fallback
            .expect_detect_labels()
            .times(1)
            .returning(|_, _| Err(FallbackError::Remote("InvalidImageFormatException".to_string())));
        let writer = Arc::new(MemoryWriter::default());

        let pipeline = pipeline(gateway, fallback, writer.clone(), fast_retry(3));
        let summary = pipeline
            .handle(&notification(&["boat.jpg", "car.jpg"]))
            .await
            .unwrap();

        assert_eq!(summary, BatchSummary { persisted: 1, abandoned: 1 });
        assert_eq!(writer.count(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_bucket_is_abandoned() {
        let mut locator = MockBucketLocator::new();
        locator.expect_region().returning(|bucket| {
            Err(crate::event::LocateError::Remote {
                bucket: bucket.to_string(),
                message: "NoSuchBucket".to_string(),
            })
        });
        let mut gateway = MockClassifierGateway::new();
        gateway.expect_classify().never();
        let writer = Arc::new(MemoryWriter::default());

        let pipeline = ClassificationPipeline::new(
            Arc::new(gateway),
            Arc::new(MockFallbackClassifier::new()),
            Arc::new(locator),
            ResultStore::new(writer.clone(), &StoreConfig::default()),
            fast_retry(3),
        );

        let summary = pipeline.handle(&notification(&["a.jpg"])).await.unwrap();
        assert_eq!(summary, BatchSummary { persisted: 0, abandoned: 1 });
        assert_eq!(writer.count(), 0);
    }

    #[test]
    fn test_default_policy_starts_at_half_a_second() {
        let mut backoff = RetryPolicy::default().backoff();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(500)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(1000)));
    }
}
