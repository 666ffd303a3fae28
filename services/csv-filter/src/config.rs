use rdkafka::config::ClientConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the filter service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// HTTP API configuration
    pub api: ApiConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Filtering pipeline configuration
    pub filter: FilterConfig,
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

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Listen address, `host:port`
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

/// Kafka consumer and producer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic carrying filter requests
    #[serde(default = "default_consumer_topic")]
    pub consumer_topic: String,
    /// Topic receiving transform requests once a file is filtered
    #[serde(default = "default_producer_topic")]
    pub producer_topic: String,
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
    /// Max poll interval in milliseconds; a single file must be filtered
    /// within this window
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
    /// Producer retries before a notification is reported as failed
    #[serde(default = "default_producer_retries")]
    pub producer_retries: u32,
    /// Producer delivery timeout in milliseconds
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
}

impl KafkaConfig {
    /// Client settings shared by the consumer and the producer
    pub fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", &self.bootstrap_servers);

        if self.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = self.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        if let (Some(ref username), Some(ref password)) = (&self.sasl_username, &self.sasl_password)
        {
            // Credentials are ignored under the default PLAINTEXT protocol
            if !self.ssl_enabled {
                client_config.set("security.protocol", "SASL_PLAINTEXT");
            }
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        client_config
    }

    /// Producer delivery timeout as Duration
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }
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
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Filtering pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    /// Extension accepted for source files, without the dot
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
    /// Bucket (optionally with folder) receiving filtered files
    #[serde(default = "default_intermediate_bucket")]
    pub intermediate_bucket: String,
    /// Directory for scratch files, system temp dir when unset
    pub scratch_dir: Option<PathBuf>,
}

// Default value functions
fn default_service_name() -> String {
    "csv-filter".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_bind_addr() -> String {
    "0.0.0.0:21100".to_string()
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_consumer_group() -> String {
    "filter-request".to_string()
}

fn default_consumer_topic() -> String {
    "filter-request".to_string()
}

fn default_producer_topic() -> String {
    "transform-request".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    300000
}

fn default_producer_retries() -> u32 {
    5
}

fn default_message_timeout_ms() -> u64 {
    30000
}

fn default_region() -> String {
    "eu-west-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB, S3 minimum for all but the last part
}

fn default_file_extension() -> String {
    "csv".to_string()
}

fn default_intermediate_bucket() -> String {
    "dp-csv-filter".to_string()
}

/// Flat environment variables kept for existing deployments
const LEGACY_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("BIND_ADDR", "api.bind_addr"),
    ("KAFKA_ADDR", "kafka.bootstrap_servers"),
    ("KAFKA_CONSUMER_GROUP", "kafka.consumer_group"),
    ("KAFKA_CONSUMER_TOPIC", "kafka.consumer_topic"),
    ("KAFKA_PRODUCER_TOPIC", "kafka.producer_topic"),
    ("AWS_REGION", "s3.region"),
    ("S3_FILTER_BUCKET", "filter.intermediate_bucket"),
];

impl Config {
    /// Load configuration from defaults, config files and environment
    pub fn load() -> anyhow::Result<Self> {
        let mut builder = Self::builder_with_defaults()?
            // Add config file if present
            .add_source(config::File::with_name("config/csv-filter").required(false))
            .add_source(config::File::with_name("/etc/csv-filter/config").required(false))
            // Override with environment variables
            // CSV_FILTER__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("CSV_FILTER")
                    .separator("__")
                    .try_parsing(true),
            );

        for (var, key) in LEGACY_ENV_OVERRIDES {
            let value = std::env::var(var).ok().filter(|v| !v.is_empty());
            builder = builder.set_override_option(*key, value)?;
        }

        Self::from_builder(builder)
    }

    /// Build, normalize and validate the layered sources
    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> anyhow::Result<Self> {
        let mut config: Self = builder.build()?.try_deserialize()?;
        config.api.bind_addr = normalize_bind_addr(&config.api.bind_addr);
        config.validate()?;

        Ok(config)
    }

    /// Builder holding the default value of every section
    fn builder_with_defaults(
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        config::Config::builder()
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?
            .set_default("service.metrics_port", i64::from(default_metrics_port()))?
            .set_default("api.bind_addr", default_bind_addr())?
            .set_default("kafka.bootstrap_servers", default_bootstrap_servers())?
            .set_default("s3.region", default_region())?
            .set_default("filter.file_extension", default_file_extension())?
            .set_default("filter.intermediate_bucket", default_intermediate_bucket())
    }

    /// Check values that would otherwise only fail at first use
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kafka.bootstrap_servers.trim().is_empty() {
            return Err(ConfigError::MissingRequired("kafka.bootstrap_servers".to_string()));
        }

        if self.kafka.consumer_topic.trim().is_empty() {
            return Err(ConfigError::MissingRequired("kafka.consumer_topic".to_string()));
        }

        if self.kafka.producer_topic.trim().is_empty() {
            return Err(ConfigError::MissingRequired("kafka.producer_topic".to_string()));
        }

        if self.filter.intermediate_bucket.trim_matches('/').is_empty() {
            return Err(ConfigError::MissingRequired(
                "filter.intermediate_bucket".to_string(),
            ));
        }

        if self.filter.file_extension.starts_with('.') {
            return Err(ConfigError::InvalidValue {
                key: "filter.file_extension".to_string(),
                message: "extension must not include the leading dot".to_string(),
            });
        }

        if self.s3.part_size_bytes < 5 * 1024 * 1024 {
            return Err(ConfigError::InvalidValue {
                key: "s3.part_size_bytes".to_string(),
                message: "S3 parts must be at least 5MB".to_string(),
            });
        }

        Ok(())
    }

    /// Directory receiving scratch files
    pub fn scratch_dir(&self) -> PathBuf {
        self.filter
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

}

/// Existing deployments give the bind address as `:PORT`, meaning every
/// interface
fn normalize_bind_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Config {
        Config::builder_with_defaults()
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = defaults();

        assert_eq!(config.api.bind_addr, "0.0.0.0:21100");
        assert_eq!(config.kafka.bootstrap_servers, "localhost:9092");
        assert_eq!(config.kafka.consumer_group, "filter-request");
        assert_eq!(config.kafka.consumer_topic, "filter-request");
        assert_eq!(config.kafka.producer_topic, "transform-request");
        assert_eq!(config.s3.region, "eu-west-1");
        assert_eq!(config.filter.file_extension, "csv");
        assert_eq!(config.filter.intermediate_bucket, "dp-csv-filter");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_bucket_prefix() {
        let mut config = defaults();
        config.filter.intermediate_bucket = "/".to_string();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(ref key)) if key == "filter.intermediate_bucket"
        ));
    }

    #[test]
    fn test_validate_rejects_dotted_extension() {
        let mut config = defaults();
        config.filter.file_extension = ".csv".to_string();

        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_validate_rejects_small_parts() {
        let mut config = defaults();
        config.s3.part_size_bytes = 1024;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_kafka_client_config_security() {
        let mut config = defaults();
        config.kafka.ssl_enabled = true;
        config.kafka.ssl_ca_location = Some("/etc/ssl/ca.pem".to_string());

        let client_config = config.kafka.client_config();
        assert_eq!(client_config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(client_config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(client_config.get("ssl.ca.location"), Some("/etc/ssl/ca.pem"));
        assert_eq!(client_config.get("sasl.username"), None);
    }

    #[test]
    fn test_port_only_bind_addr_listens_everywhere() {
        let builder = Config::builder_with_defaults()
            .unwrap()
            .set_override("api.bind_addr", ":21100")
            .unwrap();

        let config = Config::from_builder(builder).unwrap();
        assert_eq!(config.api.bind_addr, "0.0.0.0:21100");
        assert!(config.api.bind_addr.parse::<std::net::SocketAddr>().is_ok());
    }

    #[test]
    fn test_normalize_bind_addr_keeps_full_addresses() {
        assert_eq!(normalize_bind_addr("127.0.0.1:8080"), "127.0.0.1:8080");
        assert_eq!(normalize_bind_addr(":9000"), "0.0.0.0:9000");
    }

    #[test]
    fn test_sasl_without_ssl_uses_sasl_plaintext() {
        let mut config = defaults();
        config.kafka.sasl_username = Some("user".to_string());
        config.kafka.sasl_password = Some("secret".to_string());

        let client_config = config.kafka.client_config();
        assert_eq!(client_config.get("security.protocol"), Some("SASL_PLAINTEXT"));
        assert_eq!(client_config.get("sasl.username"), Some("user"));

        config.kafka.ssl_enabled = true;
        let client_config = config.kafka.client_config();
        assert_eq!(client_config.get("security.protocol"), Some("SASL_SSL"));
    }

    #[test]
    fn test_message_timeout() {
        let config = defaults();
        assert_eq!(config.kafka.message_timeout(), Duration::from_millis(30000));
    }

    #[test]
    fn test_scratch_dir_defaults_to_temp() {
        let mut config = defaults();
        assert_eq!(config.scratch_dir(), std::env::temp_dir());

        config.filter.scratch_dir = Some(PathBuf::from("/var/tmp"));
        assert_eq!(config.scratch_dir(), PathBuf::from("/var/tmp"));
    }
}
