use serde::Deserialize;
use std::time::Duration;

/// Largest label count a fallback detection may request
pub const MAX_LABELS_CEILING: i32 = 10;

/// Main configuration for the classifier service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Primary classifier configuration
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Label-detection fallback configuration
    #[serde(default)]
    pub fallback: FallbackConfig,
    /// Result table configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// AWS client configuration
    #[serde(default)]
    pub aws: AwsConfig,
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

/// Primary classifier HTTP configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Recognize-by-URL endpoint
    #[serde(default = "default_classifier_endpoint")]
    pub endpoint: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Retries allowed after a rate-limited response
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay after a rate-limited response
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    /// Upper bound for a single backoff delay
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Growth factor between consecutive delays (1.0 = fixed delay)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

/// Fallback label detection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    /// Maximum number of labels requested
    #[serde(default = "default_max_labels")]
    pub max_labels: i32,
}

/// Result table configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Table receiving primary classifier results
    #[serde(default = "default_primary_table")]
    pub primary_table: String,
    /// Table receiving fallback label results
    #[serde(default = "default_fallback_table")]
    pub fallback_table: String,
    /// Item attribute holding the primary classifier payload
    #[serde(default = "default_primary_attribute")]
    pub primary_attribute: String,
    /// Item attribute holding the fallback label payload
    #[serde(default = "default_fallback_attribute")]
    pub fallback_attribute: String,
}

/// AWS client configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AwsConfig {
    /// Region override; the provider chain decides when unset
    pub region: Option<String>,
    /// Custom S3 endpoint URL (LocalStack, MinIO)
    pub s3_endpoint_url: Option<String>,
    /// Custom DynamoDB endpoint URL (DynamoDB Local)
    pub dynamodb_endpoint_url: Option<String>,
    /// Force path-style S3 access
    #[serde(default)]
    pub force_path_style: bool,
}

// Default value functions
fn default_service_name() -> String {
    "classifier".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_classifier_endpoint() -> String {
    "https://carnet.ai/recognize-url".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_labels() -> i32 {
    MAX_LABELS_CEILING
}

fn default_primary_table() -> String {
    "classifications".to_string()
}

fn default_fallback_table() -> String {
    "label-detections".to_string()
}

fn default_primary_attribute() -> String {
    "carnet".to_string()
}

fn default_fallback_attribute() -> String {
    "rekognition".to_string()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/classifier").required(false))
            .add_source(config::File::with_name("/etc/carscan/classifier").required(false))
            // CLASSIFIER__STORE__PRIMARY_TABLE -> store.primary_table
            .add_source(
                config::Environment::with_prefix("CLASSIFIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.classifier.endpoint.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "classifier.endpoint".to_string(),
            ));
        }
        if !self.classifier.endpoint.starts_with("http://")
            && !self.classifier.endpoint.starts_with("https://")
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "classifier.endpoint".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }
        if self.classifier.backoff_multiplier < 1.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "classifier.backoff_multiplier".to_string(),
                message: "Multiplier must be at least 1.0".to_string(),
            });
        }
        if !(1..=MAX_LABELS_CEILING).contains(&self.fallback.max_labels) {
            return Err(ConfigValidationError::InvalidValue {
                field: "fallback.max_labels".to_string(),
                message: format!("Must be between 1 and {}", MAX_LABELS_CEILING),
            });
        }
        if self.store.primary_table.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "store.primary_table".to_string(),
            ));
        }
        if self.store.fallback_table.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "store.fallback_table".to_string(),
            ));
        }
        if self.store.primary_attribute.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "store.primary_attribute".to_string(),
            ));
        }
        if self.store.fallback_attribute.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "store.fallback_attribute".to_string(),
            ));
        }

        Ok(())
    }
}

impl ClassifierConfig {
    /// Get request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Get the first backoff delay as Duration.
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    /// Get the maximum backoff delay as Duration.
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
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

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: default_classifier_endpoint(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_labels: default_max_labels(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            primary_table: default_primary_table(),
            fallback_table: default_fallback_table(),
            primary_attribute: default_primary_attribute(),
            fallback_attribute: default_fallback_attribute(),
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
