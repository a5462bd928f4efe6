use anyhow::{bail, Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_types::SdkConfig;
use carscan_harvester::config::{Config, S3Config};
use carscan_harvester::{BulkFetcher, BulkPublisher, ListingClient, S3ObjectStore};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for the harvester
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(about = "Download car photos and publish them to S3")]
#[command(version)]
struct Args {
    /// Download images from the listing into the staging directory
    #[arg(short, long)]
    download: bool,

    /// Upload the staging directory to the S3 bucket
    #[arg(short, long)]
    upload: bool,

    /// Name of the S3 bucket
    #[arg(short, long, env = "HARVESTER_BUCKET")]
    bucket_name: Option<String>,

    /// Number of listing pages to walk
    #[arg(long)]
    pages: Option<u32>,

    /// Staging directory for downloaded images
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    /// Maximum transfers in flight
    #[arg(long)]
    concurrency: Option<usize>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(ref bucket) = self.bucket_name {
            config.s3.bucket = Some(bucket.clone());
        }
        if let Some(pages) = self.pages {
            config.listing.pages = pages;
        }
        if let Some(ref dir) = self.staging_dir {
            config.transfer.staging_dir = dir.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.transfer.concurrency = concurrency;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load configuration
    let mut config = Config::load().context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate()?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    if !args.download && !args.upload {
        bail!("Nothing to do: pass --download and/or --upload");
    }

    // Validate the bucket before spending time on downloads
    let bucket = if args.upload {
        Some(config.bucket()?.to_string())
    } else {
        None
    };

    info!(service = %config.service.name, "Starting harvester");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Cancelling outstanding transfers");
        shutdown.cancel();
    });

    let staging_dir = config.transfer.staging_dir.clone();

    if args.download {
        let listing = ListingClient::new(config.listing.clone())
            .context("Failed to initialize listing client")?;
        let urls = listing
            .collect_image_urls()
            .await
            .context("Failed to collect image URLs")?;

        let fetcher = BulkFetcher::new(&config.transfer)
            .context("Failed to initialize downloader")?;
        let report = fetcher
            .fetch_all(&urls, &staging_dir, &cancel)
            .await
            .context("Download phase failed")?;

        println!(
            "Total number of downloaded images: {} ({} failed, {} skipped)",
            report.staged.len(),
            report.failed,
            report.skipped
        );
    }

    if let Some(bucket) = bucket {
        let sdk_config = load_sdk_config(&config.s3).await;
        let store = S3ObjectStore::new(s3_client(&sdk_config, &config.s3));
        let publisher = BulkPublisher::new(Arc::new(store), config.transfer.concurrency);

        let report = publisher
            .publish_all(&staging_dir, &bucket, &cancel)
            .await
            .context("Upload phase failed")?;

        println!(
            "Uploaded {} images to {}, {} made public ({} failed)",
            report.uploaded, bucket, report.made_public, report.failed
        );
    }

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

async fn load_sdk_config(config: &S3Config) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());

    if let Some(ref region) = config.region {
        loader = loader.region(aws_config::Region::new(region.clone()));
    }

    loader.load().await
}

fn s3_client(sdk_config: &SdkConfig, config: &S3Config) -> aws_sdk_s3::Client {
    let mut s3_config_builder = S3ConfigBuilder::from(sdk_config);

    // Configure custom endpoint for MinIO/LocalStack
    if let Some(ref endpoint_url) = config.endpoint_url {
        s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
    }

    // Force path-style access for MinIO compatibility
    if config.force_path_style {
        s3_config_builder = s3_config_builder.force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(s3_config_builder.build())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
