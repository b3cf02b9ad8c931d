use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the classifier service.
///
/// Pipeline settings are flat keys so they keep the names the function app
/// was deployed with (`INPUT_CONTAINER`, `MAX_TIMEOUT`, ...). Connection
/// settings for the queue, object store and process live in nested sections
/// (`KAFKA__BOOTSTRAP_SERVERS`, `S3__REGION`, `SERVICE__LOG_LEVEL`).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// S3 configuration
    #[serde(default)]
    pub s3: S3Config,

    /// Container watched for new PDFs
    #[serde(default = "default_input_container")]
    pub input_container: String,
    /// Container receiving the classified copy of each PDF
    #[serde(default = "default_classification_container")]
    pub classification_container: String,
    /// Container receiving result documents
    #[serde(default = "default_results_container")]
    pub results_container: String,
    /// Container holding the per-file metadata documents (`{file_id}.json`)
    #[serde(default = "default_metadata_container")]
    pub metadata_container: String,
    /// Topic carrying the blob-created events
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Classification endpoint
    pub classification_api_url: String,
    /// Function key appended as `?code=` when non-empty
    #[serde(default)]
    pub classification_api_code: String,
    /// Total budget for one classification call, in seconds
    #[serde(default = "default_classification_api_timeout")]
    pub classification_api_timeout: u64,
    #[serde(default = "default_classification_connect_timeout")]
    pub classification_connect_timeout: u64,
    #[serde(default = "default_classification_read_timeout")]
    pub classification_read_timeout: u64,

    /// Base URL of the transaction resource, e.g. `http://host/api/Transaction`
    pub transaction_url: String,
    pub login_url: Option<String>,
    pub login_email: Option<String>,
    pub login_password: Option<String>,

    #[serde(default = "default_process_code")]
    pub process_code: String,
    #[serde(default = "default_org_id")]
    pub org_id: i64,
    #[serde(default = "default_status")]
    pub status: i64,
    #[serde(default = "default_client_id")]
    pub client_id: i64,

    /// Budget for each blob operation, in seconds
    #[serde(default = "default_blob_operation_timeout")]
    pub blob_operation_timeout: u64,
    /// Budget for the login call, in seconds
    #[serde(default = "default_api_request_timeout")]
    pub api_request_timeout: u64,
    /// Budget for each transaction API call, in seconds
    #[serde(default = "default_wmt_api_timeout")]
    pub wmt_api_timeout: u64,
    /// Deadline for a whole run, in seconds
    #[serde(default = "default_max_timeout")]
    pub max_timeout: u64,
    /// Maximum length of one blob metadata value
    #[serde(default = "default_metadata_max_length")]
    pub metadata_max_length: usize,
    /// Budget for all user metadata of one blob (keys plus values), in bytes
    #[serde(default = "default_metadata_max_total_bytes")]
    pub metadata_max_total_bytes: usize,

    /// Event type that starts a run; everything else is skipped
    #[serde(default = "default_blob_created_event_type")]
    pub blob_created_event_type: String,
    /// `data.api` values that are skipped (our own metadata rewrites)
    #[serde(default = "default_ignored_event_apis")]
    pub ignored_event_apis: Vec<String>,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Kafka consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
    /// Redeliveries of one message before it is dropped as poison
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
    /// Pause before a message is redelivered, in milliseconds
    #[serde(default = "default_redelivery_backoff_ms")]
    pub redelivery_backoff_ms: u64,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

// Default value functions
fn default_service_name() -> String {
    "classifier-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_consumer_group() -> String {
    "classifier-service".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    // a run may take up to MAX_TIMEOUT; keep the member alive past it
    1_200_000
}

fn default_max_redeliveries() -> u32 {
    5
}

fn default_redelivery_backoff_ms() -> u64 {
    5000
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_input_container() -> String {
    "stampedstorage".to_string()
}

fn default_classification_container() -> String {
    "classificationstorage".to_string()
}

fn default_results_container() -> String {
    "resultstorage".to_string()
}

fn default_metadata_container() -> String {
    "jsonfiles".to_string()
}

fn default_queue_name() -> String {
    "classificationconsumerqa".to_string()
}

fn default_classification_api_timeout() -> u64 {
    300
}

fn default_classification_connect_timeout() -> u64 {
    30
}

fn default_classification_read_timeout() -> u64 {
    300
}

fn default_process_code() -> String {
    "715".to_string()
}

fn default_org_id() -> i64 {
    4
}

fn default_status() -> i64 {
    1
}

fn default_client_id() -> i64 {
    714
}

fn default_blob_operation_timeout() -> u64 {
    600
}

fn default_api_request_timeout() -> u64 {
    60
}

fn default_wmt_api_timeout() -> u64 {
    60
}

fn default_max_timeout() -> u64 {
    900
}

fn default_metadata_max_length() -> usize {
    250
}

fn default_metadata_max_total_bytes() -> usize {
    2048
}

fn default_blob_created_event_type() -> String {
    "Microsoft.Storage.BlobCreated".to_string()
}

fn default_ignored_event_apis() -> Vec<String> {
    vec!["CopyObject".to_string()]
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "classifier-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/classifier").required(false))
            .add_source(config::File::with_name("/etc/classifier/classifier").required(false))
            // Override with environment variables
            // INPUT_CONTAINER -> input_container
            // KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("ignored_event_apis")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get the total classification budget as Duration
    pub fn classification_timeout(&self) -> Duration {
        Duration::from_secs(self.classification_api_timeout)
    }

    /// Get the classification connect budget as Duration
    pub fn classification_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.classification_connect_timeout)
    }

    /// Get the classification socket-read budget as Duration
    pub fn classification_read_timeout(&self) -> Duration {
        Duration::from_secs(self.classification_read_timeout)
    }

    pub fn blob_operation_timeout(&self) -> Duration {
        Duration::from_secs(self.blob_operation_timeout)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.api_request_timeout)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.wmt_api_timeout)
    }

    /// Get the overall run deadline as Duration
    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout)
    }

    /// Login credentials, when all three login settings are present
    pub fn login_credentials(&self) -> Option<(&str, &str, &str)> {
        match (&self.login_url, &self.login_email, &self.login_password) {
            (Some(url), Some(email), Some(password))
                if !url.is_empty() && !email.is_empty() && !password.is_empty() =>
            {
                Some((url, email, password))
            }
            _ => None,
        }
    }

    /// Redelivery pause as Duration
    pub fn redelivery_backoff(&self) -> Duration {
        Duration::from_millis(self.kafka.redelivery_backoff_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}
