use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_types::SdkConfig;
use carscan_classifier::config::{AwsConfig, Config};
use carscan_classifier::{
    ClassificationPipeline, DynamoRecordWriter, EventNotification, HandlerResponse,
    HttpClassifierGateway, RekognitionClassifier, ResultStore, RetryPolicy, S3BucketLocator,
};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(service = %config.service.name, "Starting classifier");

    let notification = read_notification()
        .await
        .context("Failed to read event notification")?;

    // Clients are built once and shared by every record
    let sdk_config = load_sdk_config(&config.aws).await;

    let gateway = HttpClassifierGateway::new(&config.classifier)
        .context("Failed to initialize classifier gateway")?;
    let fallback = RekognitionClassifier::new(
        aws_sdk_rekognition::Client::new(&sdk_config),
        config.fallback.max_labels,
    );
    let locator = S3BucketLocator::new(s3_client(&sdk_config, &config.aws));
    let writer = DynamoRecordWriter::new(dynamodb_client(&sdk_config, &config.aws), &config.store);

    let pipeline = ClassificationPipeline::new(
        Arc::new(gateway),
        Arc::new(fallback),
        Arc::new(locator),
        ResultStore::new(Arc::new(writer), &config.store),
        RetryPolicy::from(&config.classifier),
    );

    let summary = pipeline
        .handle(&notification)
        .await
        .context("Batch aborted")?;

    info!(
        persisted = summary.persisted,
        abandoned = summary.abandoned,
        "Classifier finished"
    );

    println!("{}", serde_json::to_string(&HandlerResponse::done())?);

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Read the notification from the file named by the first argument, or stdin.
async fn read_notification() -> Result<EventNotification> {
    let raw = match std::env::args().nth(1) {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path))?,
        None => {
            let mut raw = String::new();
            tokio::io::stdin().read_to_string(&mut raw).await?;
            raw
        }
    };

    serde_json::from_str(&raw).context("Failed to deserialize event notification")
}

async fn load_sdk_config(config: &AwsConfig) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());

    if let Some(ref region) = config.region {
        loader = loader.region(aws_config::Region::new(region.clone()));
    }

    loader.load().await
}

fn s3_client(sdk_config: &SdkConfig, config: &AwsConfig) -> aws_sdk_s3::Client {
    let mut builder = aws_sdk_s3::config::Builder::from(sdk_config);

    // Configure custom endpoint for MinIO/LocalStack
    if let Some(ref endpoint_url) = config.s3_endpoint_url {
        builder = builder.endpoint_url(endpoint_url);
    }

    if config.force_path_style {
        builder = builder.force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(builder.build())
}

fn dynamodb_client(sdk_config: &SdkConfig, config: &AwsConfig) -> aws_sdk_dynamodb::Client {
    let mut builder = aws_sdk_dynamodb::config::Builder::from(sdk_config);

    if let Some(ref endpoint_url) = config.dynamodb_endpoint_url {
        builder = builder.endpoint_url(endpoint_url);
    }

    aws_sdk_dynamodb::Client::from_conf(builder.build())
}
