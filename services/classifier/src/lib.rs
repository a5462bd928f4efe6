//! Carscan Classifier
//!
//! Event-driven classification of car photos uploaded to S3. For every
//! object-created record the service asks the primary car classifier about
//! the object's public URL, falls back to generic label detection when the
//! classifier says the image holds no car, and writes the result to one of
//! two DynamoDB tables.
//!
//! ## Architecture
//!
//! ```text
//! S3 event            Primary classifier        DynamoDB
//! ┌──────────────┐    ┌──────────────┐          ┌──────────────┐
//! │ Records[]    │───▶│ recognize-url│─── 200 ─▶│ primary      │
//! └──────────────┘    └──────────────┘          └──────────────┘
//!        │                 │      │
//!        │ bucket      429 │      │ 500 "no car"      ┌──────────────┐
//!        ▼                 ▼      ▼                   │ fallback     │
//! ┌──────────────┐    ┌─────────┐ ┌──────────────┐    └──────────────┘
//! │ Bucket       │    │ Backoff │ │ Rekognition  │───────────▲
//! │ Location     │    │ & retry │ │ DetectLabels │
//! └──────────────┘    └─────────┘ └──────────────┘
//! ```

pub mod config;
pub mod event;
pub mod fallback;
pub mod gateway;
pub mod pipeline;
pub mod store;

pub use config::Config;
pub use event::{BucketLocator, EventNotification, EventRecord, S3BucketLocator};
pub use fallback::{FallbackClassifier, Label, LabelSet, RekognitionClassifier};
pub use gateway::{ClassificationOutcome, ClassifierGateway, HttpClassifierGateway};
pub use pipeline::{
    AbandonReason, BatchSummary, ClassificationPipeline, HandlerResponse, ItemOutcome,
    PipelineError, RetryPolicy,
};
pub use store::{
    ClassificationRecord, DynamoRecordWriter, PayloadAttributes, RecordKind, ResultStore,
    StoreError,
};
