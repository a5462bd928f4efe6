use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the harvester
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Listing API configuration
    #[serde(default)]
    pub listing: ListingConfig,
    /// Download/upload worker configuration
    #[serde(default)]
    pub transfer: TransferConfig,
    /// S3 configuration
    #[serde(default)]
    pub s3: S3Config,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Listing API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ListingConfig {
    /// Products endpoint
    #[serde(default = "default_listing_endpoint")]
    pub endpoint: String,
    /// Base URL photos are served from
    #[serde(default = "default_photo_base_url")]
    pub photo_base_url: String,
    /// First page requested
    #[serde(default)]
    pub first_page: u32,
    /// Number of pages requested
    #[serde(default = "default_pages")]
    pub pages: u32,
    /// User agent sent with listing requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Transfer worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Local staging directory
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Maximum transfers in flight
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Write size when streaming a download to disk
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// S3 storage configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3Config {
    /// Destination bucket
    pub bucket: Option<String>,
    /// AWS region; the provider chain decides when unset
    pub region: Option<String>,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

// Default value functions
fn default_service_name() -> String {
    "harvester".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listing_endpoint() -> String {
    "https://api2.myauto.ge/ka/products".to_string()
}

fn default_photo_base_url() -> String {
    "https://static.my.ge/myauto/photos".to_string()
}

fn default_pages() -> u32 {
    1
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/58.0.3029.110 Safari/537.3"
        .to_string()
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("downloaded_images")
}

fn default_concurrency() -> usize {
    16
}

fn default_chunk_size() -> usize {
    1024
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/harvester").required(false))
            .add_source(config::File::with_name("/etc/carscan/harvester").required(false))
            // HARVESTER__TRANSFER__CONCURRENCY -> transfer.concurrency
            .add_source(
                config::Environment::with_prefix("HARVESTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.listing.endpoint.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "listing.endpoint".to_string(),
            ));
        }
        if self.listing.pages == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "listing.pages".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if self.listing.first_page.checked_add(self.listing.pages - 1).is_none() {
            return Err(ConfigValidationError::InvalidValue {
                field: "listing.pages".to_string(),
                message: "Last page number overflows u32".to_string(),
            });
        }
        if self.transfer.staging_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "transfer.staging_dir".to_string(),
            ));
        }
        if self.transfer.concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "transfer.concurrency".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if self.transfer.chunk_size_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "transfer.chunk_size_bytes".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Destination bucket, required for uploads.
    pub fn bucket(&self) -> Result<&str, ConfigValidationError> {
        self.s3
            .bucket
            .as_deref()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ConfigValidationError::MissingField("s3.bucket".to_string()))
    }
}

impl ListingConfig {
    /// Page numbers to walk, stopping at the largest page number.
    pub fn page_range(&self) -> impl Iterator<Item = u32> {
        (self.first_page..=u32::MAX).take(self.pages as usize)
    }
}

impl TransferConfig {
    /// Get request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_listing_endpoint(),
            photo_base_url: default_photo_base_url(),
            first_page: 0,
            pages: default_pages(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            concurrency: default_concurrency(),
            chunk_size_bytes: default_chunk_size(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
