use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the archive manager
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Archive pipeline configuration
    pub archive: ArchiveConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// API configuration
    pub api: ApiConfig,
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
    /// Topic carrying camera state events
    #[serde(default = "default_cameras_topic")]
    pub cameras_topic: String,
    /// Suffix appended to a camera id to form its frame topic
    #[serde(default = "default_stream_suffix")]
    pub stream_suffix: String,
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
    /// Bounded wait for broker metadata at startup, in seconds
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,
}

/// Archive pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Root directory for fragment files
    pub storage_root: PathBuf,
    /// Nominal fragment length in seconds
    #[serde(default = "default_fragment_length_secs")]
    pub fragment_length_secs: u64,
    /// Frame queue capacity per camera (~10 s at 30 fps)
    #[serde(default = "default_frame_queue_capacity")]
    pub frame_queue_capacity: usize,
    /// Index-entry queue capacity per camera
    #[serde(default = "default_index_queue_capacity")]
    pub index_queue_capacity: usize,
    /// Index batch size that triggers an immediate flush
    #[serde(default = "default_index_batch_size")]
    pub index_batch_size: usize,
    /// Periodic index flush interval in seconds
    #[serde(default = "default_index_flush_interval_secs")]
    pub index_flush_interval_secs: u64,
    /// Camera reconcile interval for the lifecycle controller, in seconds
    #[serde(default = "default_controller_interval_secs")]
    pub controller_interval_secs: u64,
    /// Concurrent per-camera purge jobs in the retention sweep
    #[serde(default = "default_retention_workers")]
    pub retention_workers: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

/// API configuration for the health/readiness endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

// Default value functions
fn default_service_name() -> String {
    "archive-manager".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_consumer_group() -> String {
    "archive-manager".to_string()
}

fn default_cameras_topic() -> String {
    "mediaserver.cameras".to_string()
}

fn default_stream_suffix() -> String {
    "_main".to_string()
}

fn default_auto_offset_reset() -> String {
    "latest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_metadata_timeout_secs() -> u64 {
    10
}

fn default_fragment_length_secs() -> u64 {
    300
}

fn default_frame_queue_capacity() -> usize {
    300
}

fn default_index_queue_capacity() -> usize {
    100
}

fn default_index_batch_size() -> usize {
    50
}

fn default_index_flush_interval_secs() -> u64 {
    5
}

fn default_controller_interval_secs() -> u64 {
    5
}

fn default_retention_workers() -> usize {
    4
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "archive-manager")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/archive").required(false))
            .add_source(config::File::with_name("/etc/mediaserver/archive").required(false))
            // Override with environment variables
            // ARCHIVE__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("ARCHIVE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl ArchiveConfig {
    /// Get the nominal fragment length as Duration
    pub fn fragment_length(&self) -> Duration {
        Duration::from_secs(self.fragment_length_secs)
    }

    /// Fragment length in whole seconds, for bucket arithmetic
    pub fn fragment_secs(&self) -> i64 {
        self.fragment_length_secs as i64
    }

    /// Get the index flush interval as Duration
    pub fn index_flush_interval(&self) -> Duration {
        Duration::from_secs(self.index_flush_interval_secs)
    }

    /// Get the controller reconcile interval as Duration
    pub fn controller_interval(&self) -> Duration {
        Duration::from_secs(self.controller_interval_secs)
    }
}

impl KafkaConfig {
    /// Get the startup metadata wait as Duration
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    /// Frame topic for a camera id
    pub fn frame_topic(&self, camera_id: &str) -> String {
        format!("{}{}", camera_id, self.stream_suffix)
    }
}

impl DatabaseConfig {
    /// Get database connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}
