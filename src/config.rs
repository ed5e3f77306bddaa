//! Service configuration.
//!
//! Settings are read from an optional YAML file and then overridden by
//! environment variables (a `.env` file is honoured by the binary).

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Exchange every vendor routing key is bound against.
pub const FEED_EXCHANGE: &str = "unifiedfeed";

/// Unacknowledged-message ceiling recommended by the vendor.
pub const PREFETCH_COUNT: u16 = 100;

/// Top-level configuration for the feed service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Vendor access token, used for both the broker login and the HTTP API.
    pub access_token: String,

    /// Base URL of the vendor HTTP API (identity lookup, recovery).
    pub api_base_url: String,

    /// Broker `host:port`.
    pub messaging_host: String,

    /// Routing patterns bound to the exclusive queue.
    pub routing_keys: Vec<String>,

    pub connector: ConnectorConfig,
    pub health: HealthConfig,
    pub recovery: RecoveryConfig,

    /// Bind address of the status HTTP API.
    pub status_addr: String,

    /// Optional JetStream sink for classified envelopes.
    pub forwarder: Option<ForwarderConfig>,

    /// Optional Postgres URL for the recovery audit log.
    pub database_url: Option<String>,

    /// Optional chat webhook for operator alerts.
    pub alert_webhook_url: Option<String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            api_base_url: "https://stgapi.betradar.com/v1".to_string(),
            messaging_host: "stgmq.betradar.com:5671".to_string(),
            routing_keys: vec!["#".to_string()],
            connector: ConnectorConfig::default(),
            health: HealthConfig::default(),
            recovery: RecoveryConfig::default(),
            status_addr: "0.0.0.0:8080".to_string(),
            forwarder: None,
            database_url: None,
            alert_webhook_url: None,
        }
    }
}

/// Broker connection and reconnect settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Time budget for each attempt of the first connect.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// AMQP heartbeat negotiated with the broker.
    pub heartbeat_secs: u16,

    pub backoff: BackoffConfig,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            heartbeat_secs: 60,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential reconnect backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,

    #[serde(with = "duration_secs")]
    pub max_delay: Duration,

    /// Multiplier applied after every failed attempt.
    pub factor: f64,

    /// `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
            max_retries: None,
        }
    }
}

/// Producer liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Age of the last heartbeat after which a producer is considered down.
    #[serde(with = "duration_secs")]
    pub down_threshold: Duration,

    /// Period of the background health check.
    #[serde(with = "duration_secs")]
    pub check_interval: Duration,

    /// Grace period after startup before the first check runs.
    #[serde(with = "duration_secs")]
    pub warmup: Duration,

    /// Producers that must report in; empty means "the recovery products".
    pub expected_producers: Vec<u32>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            down_threshold: Duration::from_secs(20),
            check_interval: Duration::from_secs(5),
            warmup: Duration::from_secs(30),
            expected_producers: Vec::new(),
        }
    }
}

/// One vendor product that recovery can be requested for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductConfig {
    /// URL path segment, e.g. `liveodds` or `pre`.
    pub name: String,

    /// Producer id the product's heartbeats carry.
    pub producer_id: u32,

    /// Vendor ceiling on the `after` window, in hours.
    #[serde(default = "default_window_ceiling")]
    pub max_window_hours: u32,

    /// Some producers misbehave when `after` is supplied; let the vendor pick.
    #[serde(default)]
    pub omit_after: bool,
}

fn default_window_ceiling() -> u32 {
    10
}

impl ProductConfig {
    /// Products with well-known producer ids.
    pub fn known(name: &str) -> Option<Self> {
        let (producer_id, omit_after) = match name {
            "liveodds" => (1, true),
            "pre" => (3, false),
            "betpal" => (4, false),
            "premium_cricket" => (5, false),
            "vf" => (6, false),
            _ => return None,
        };
        Some(Self {
            name: name.to_string(),
            producer_id,
            max_window_hours: default_window_ceiling(),
            omit_after,
        })
    }
}

/// Recovery coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub products: Vec<ProductConfig>,

    /// Requested recovery window in hours; 0 lets the vendor choose.
    pub after_hours: u32,

    /// Identifies this client to the vendor among concurrent recovery clients.
    pub node_id: u32,

    /// Trigger a full recovery after the first connect and every reconnect.
    pub auto_recovery: bool,

    /// Wait after a (re)connect before recovery is requested.
    #[serde(with = "duration_secs")]
    pub settle_delay: Duration,

    /// Cool-down after the first rate-limit rejection.
    #[serde(with = "duration_secs")]
    pub rate_limit_cooldown: Duration,

    /// Cool-down after a retry is rate limited again.
    #[serde(with = "duration_secs")]
    pub escalated_cooldown: Duration,

    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            products: ["liveodds", "pre"]
                .iter()
                .filter_map(|name| ProductConfig::known(name))
                .collect(),
            after_hours: 10,
            node_id: 1,
            auto_recovery: true,
            settle_delay: Duration::from_secs(3),
            rate_limit_cooldown: Duration::from_secs(15 * 60),
            escalated_cooldown: Duration::from_secs(30 * 60),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RecoveryConfig {
    pub fn product(&self, name: &str) -> Option<&ProductConfig> {
        self.products.iter().find(|p| p.name == name)
    }

    pub fn product_for_producer(&self, producer_id: u32) -> Option<&ProductConfig> {
        self.products.iter().find(|p| p.producer_id == producer_id)
    }
}

/// JetStream sink for classified envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    pub url: String,
    pub stream_name: String,

    /// Subject prefix; envelopes go to `<prefix>.<kind>`.
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,

    /// Envelopes buffered before the forwarder starts shedding.
    #[serde(default = "default_forward_buffer")]
    pub buffer: usize,
}

fn default_subject_prefix() -> String {
    "feed".to_string()
}

fn default_forward_buffer() -> usize {
    10_000
}

impl FeedConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns error if the file can't be read or isn't valid YAML for this schema
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from an optional file, then apply process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("BETRADAR_ACCESS_TOKEN") {
            self.access_token = v;
        }
        if let Some(v) = get("BETRADAR_API_BASE_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = get("BETRADAR_MESSAGING_HOST") {
            self.messaging_host = v;
        }
        if let Some(v) = get("ROUTING_KEYS") {
            self.routing_keys = split_list(&v);
        }
        if let Some(v) = get("RECOVERY_PRODUCTS") {
            self.recovery.products = split_list(&v)
                .iter()
                .map(|name| {
                    ProductConfig::known(name).ok_or_else(|| ConfigError::InvalidValue {
                        key: "RECOVERY_PRODUCTS".to_string(),
                        message: format!("unknown product '{}'", name),
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(v) = get("RECOVERY_AFTER_HOURS") {
            self.recovery.after_hours = parse_num("RECOVERY_AFTER_HOURS", &v)?;
        }
        if let Some(v) = get("RECOVERY_NODE_ID") {
            self.recovery.node_id = parse_num("RECOVERY_NODE_ID", &v)?;
        }
        if let Some(v) = get("AUTO_RECOVERY") {
            self.recovery.auto_recovery = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Some(v) = get("PRODUCER_CHECK_INTERVAL_SECONDS") {
            self.health.check_interval =
                Duration::from_secs(parse_num("PRODUCER_CHECK_INTERVAL_SECONDS", &v)?);
        }
        if let Some(v) = get("PRODUCER_DOWN_THRESHOLD_SECONDS") {
            self.health.down_threshold =
                Duration::from_secs(parse_num("PRODUCER_DOWN_THRESHOLD_SECONDS", &v)?);
        }
        if let Some(v) = get("RECONNECT_INITIAL_DELAY_SECONDS") {
            self.connector.backoff.initial_delay =
                Duration::from_secs(parse_num("RECONNECT_INITIAL_DELAY_SECONDS", &v)?);
        }
        if let Some(v) = get("RECONNECT_MAX_DELAY_SECONDS") {
            self.connector.backoff.max_delay =
                Duration::from_secs(parse_num("RECONNECT_MAX_DELAY_SECONDS", &v)?);
        }
        if let Some(v) = get("RECONNECT_BACKOFF_FACTOR") {
            self.connector.backoff.factor = parse_num("RECONNECT_BACKOFF_FACTOR", &v)?;
        }
        if let Some(v) = get("RECONNECT_MAX_RETRIES") {
            let retries: u32 = parse_num("RECONNECT_MAX_RETRIES", &v)?;
            self.connector.backoff.max_retries = (retries > 0).then_some(retries);
        }
        if let Some(v) = get("STATUS_ADDR") {
            self.status_addr = v;
        } else if let Some(port) = get("PORT") {
            self.status_addr = format!("0.0.0.0:{}", port);
        }
        if let Some(v) = get("DATABASE_URL") {
            self.database_url = Some(v);
        }
        if let Some(v) = get("LARK_WEBHOOK_URL") {
            self.alert_webhook_url = Some(v);
        }
        if let Some(url) = get("NATS_URL") {
            let stream_name = get("NATS_STREAM").unwrap_or_else(|| "FEED".to_string());
            self.forwarder = Some(ForwarderConfig {
                url,
                stream_name,
                subject_prefix: default_subject_prefix(),
                buffer: default_forward_buffer(),
            });
        }

        Ok(())
    }

    /// Reject settings the service can't run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access_token.trim().is_empty() {
            return Err(ConfigError::Missing("BETRADAR_ACCESS_TOKEN".to_string()));
        }
        if self.routing_keys.is_empty() {
            return Err(ConfigError::Missing("routing_keys".to_string()));
        }
        if self.health.down_threshold.is_zero() {
            return Err(invalid("health.down_threshold", "must be greater than zero"));
        }
        if self.health.check_interval.is_zero() {
            return Err(invalid("health.check_interval", "must be greater than zero"));
        }
        let backoff = &self.connector.backoff;
        if backoff.initial_delay.is_zero() {
            return Err(invalid("connector.backoff.initial_delay", "must be greater than zero"));
        }
        if backoff.factor < 1.0 {
            return Err(invalid("connector.backoff.factor", "must be at least 1.0"));
        }
        if backoff.max_delay < backoff.initial_delay {
            return Err(invalid(
                "connector.backoff.max_delay",
                "must not be shorter than initial_delay",
            ));
        }
        Ok(())
    }

    /// Producers whose silence should be reported even if never heard from.
    pub fn expected_producers(&self) -> Vec<u32> {
        if self.health.expected_producers.is_empty() {
            self.recovery.products.iter().map(|p| p.producer_id).collect()
        } else {
            self.health.expected_producers.clone()
        }
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// (De)serialize a `Duration` as whole seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
