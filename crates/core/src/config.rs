use crate::types::DType;
use serde::Deserialize;
use std::time::Duration;

/// Root application configuration. Loaded from environment variables
/// with the prefix `BATCHLINE__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_queue_key")]
    pub queue_key: String,
    #[serde(default = "default_result_prefix")]
    pub result_prefix: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Where the work queue and result store live.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            other => Err(format!("unknown store backend '{other}' (expected memory or redis)")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_server_sleep_ms")]
    pub server_sleep_ms: u64,
    /// Enqueue is rejected with `QueueFull` once this depth is reached.
    #[serde(default)]
    pub max_queue_depth: Option<usize>,
    /// Claim items with a single drain operation instead of peek + trim.
    #[serde(default = "default_atomic_drain")]
    pub atomic_drain: bool,
    #[serde(default = "default_input_shape")]
    pub input_shape: Vec<usize>,
    #[serde(default = "default_input_type")]
    pub input_type: DType,
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// After shutdown is requested, how long the loop keeps retrying result
    /// writes for a batch it already claimed before handing it back.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_client_sleep_ms")]
    pub client_sleep_ms: u64,
    /// `None` waits forever.
    #[serde(default = "default_gateway_timeout_ms")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    5000
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_queue_key() -> String {
    "image_queue".to_string()
}
fn default_result_prefix() -> String {
    "result:".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}
fn default_batch_size() -> usize {
    32
}
fn default_server_sleep_ms() -> u64 {
    250
}
fn default_atomic_drain() -> bool {
    true
}
fn default_input_shape() -> Vec<usize> {
    vec![224, 224, 3]
}
fn default_input_type() -> DType {
    DType::Float32
}
fn default_result_ttl_secs() -> u64 {
    3600
}
fn default_retry_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    5000
}
fn default_shutdown_grace_ms() -> u64 {
    5000
}
fn default_client_sleep_ms() -> u64 {
    250
}
fn default_gateway_timeout_ms() -> Option<u64> {
    Some(30_000)
}
fn default_num_classes() -> usize {
    1000
}
fn default_hidden_dim() -> usize {
    64
}
fn default_top_k() -> usize {
    5
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            queue_key: default_queue_key(),
            result_prefix: default_result_prefix(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            batch_size: default_batch_size(),
            server_sleep_ms: default_server_sleep_ms(),
            max_queue_depth: None,
            atomic_drain: default_atomic_drain(),
            input_shape: default_input_shape(),
            input_type: default_input_type(),
            result_ttl_secs: default_result_ttl_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            client_sleep_ms: default_client_sleep_ms(),
            timeout_ms: default_gateway_timeout_ms(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_classes: default_num_classes(),
            hidden_dim: default_hidden_dim(),
            top_k: default_top_k(),
            labels: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            redis: RedisConfig::default(),
            broker: BrokerConfig::default(),
            gateway: GatewayConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn server_sleep(&self) -> Duration {
        Duration::from_millis(self.server_sleep_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

impl GatewayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.client_sleep_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl AppConfig {
    /// Load configuration from environment variables only.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from an optional TOML file, then environment
    /// variables, which take precedence.
    pub fn load_from(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            tracing::debug!(path = path, "Loading configuration file");
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let builder = builder.add_source(
            config::Environment::with_prefix("BATCHLINE")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("broker.input_shape")
                .with_list_parse_key("model.labels"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Reject values the broker cannot run with.
    pub fn validate(&self) -> Result<(), crate::error::BrokerError> {
        use crate::error::BrokerError;

        if self.broker.batch_size == 0 {
            return Err(BrokerError::Config("broker.batch_size must be > 0".into()));
        }
        if self.broker.input_shape.is_empty() || self.broker.input_shape.contains(&0) {
            return Err(BrokerError::Config(
                "broker.input_shape must be non-empty with non-zero dimensions".into(),
            ));
        }
        // Zero intervals turn the idle wait and the outage backoff into a busy spin.
        if self.broker.server_sleep_ms == 0 {
            return Err(BrokerError::Config("broker.server_sleep_ms must be > 0".into()));
        }
        if self.broker.retry_backoff_ms == 0 {
            return Err(BrokerError::Config("broker.retry_backoff_ms must be > 0".into()));
        }
        if self.broker.max_backoff_ms < self.broker.retry_backoff_ms {
            return Err(BrokerError::Config(
                "broker.max_backoff_ms must be >= broker.retry_backoff_ms".into(),
            ));
        }
        if self.gateway.client_sleep_ms == 0 {
            return Err(BrokerError::Config("gateway.client_sleep_ms must be > 0".into()));
        }
        if self.broker.max_queue_depth == Some(0) {
            return Err(BrokerError::Config(
                "broker.max_queue_depth must be > 0 when set".into(),
            ));
        }
        if self.model.top_k == 0 {
            return Err(BrokerError::Config("model.top_k must be > 0".into()));
        }
        if let Some(labels) = &self.model.labels {
            if labels.len() != self.model.num_classes {
                return Err(BrokerError::Config(format!(
                    "model.labels has {} entries, model.num_classes is {}",
                    labels.len(),
                    self.model.num_classes
                )));
            }
        }
        Ok(())
    }
}
