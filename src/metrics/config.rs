//! Configuration for the Ingestion Pipeline
//!
//! Configuration is a plain value handed to the pipeline at construction.
//! It can be loaded from a TOML file, from environment variables, or both
//! (environment wins):
//!
//! - `METRICS_CONFIG`: path to a TOML config file (optional)
//! - `METRICS_SOURCE_URL`: metrics endpoint URL
//! - `METRICS_SOURCE_TIMEOUT_MS`: HTTP request timeout
//! - `METRICS_SUBSCRIPTIONS`: comma-separated kinds, e.g. `load_avg,cpu_usage`
//! - `METRICS_POLL_INTERVAL_MS`: pause between fetches (0 = back-to-back)
//! - `METRICS_FETCH_LIMIT`: stop after this many fetches (optional)
//! - `METRICS_INTROSPECTION_INTERVAL_MS`: how often the binary logs snapshots

use crate::metrics::types::MetricKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read
    Io(std::io::Error),
    /// Config file is not valid TOML for this schema
    Parse(String),
    /// A value is out of range or unrecognized
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config I/O error: {}", e),
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

/// Main configuration for the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Kinds to dispatch and aggregate; readings of other kinds are dropped
    pub subscriptions: Vec<MetricKind>,
    /// How often the driver logs aggregate snapshots
    #[serde(with = "duration_millis")]
    pub introspection_interval: Duration,
    /// Remote metrics source
    pub source: SourceConfig,
    /// Fetch loop settings
    pub generator: GeneratorConfig,
    /// Per-kind stream settings
    pub dispatcher: DispatcherConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            subscriptions: MetricKind::ALL.to_vec(),
            introspection_interval: Duration::from_secs(5),
            source: SourceConfig::default(),
            generator: GeneratorConfig::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Create config for testing (short timeouts, fast introspection)
    pub fn test() -> Self {
        PipelineConfig {
            source: SourceConfig {
                url: "http://127.0.0.1:0/metrics".to_string(),
                timeout: Duration::from_millis(500),
            },
            subscriptions: MetricKind::ALL.to_vec(),
            generator: GeneratorConfig::default(),
            dispatcher: DispatcherConfig::default(),
            introspection_interval: Duration::from_millis(50),
        }
    }

    /// Parse from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Load from `METRICS_CONFIG` (if set) and apply environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("METRICS_CONFIG") {
            Ok(path) => Self::load(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `METRICS_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("METRICS_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(ms) = lookup("METRICS_SOURCE_TIMEOUT_MS") {
            self.source.timeout = parse_millis("METRICS_SOURCE_TIMEOUT_MS", &ms)?;
        }
        if let Some(list) = lookup("METRICS_SUBSCRIPTIONS") {
            self.subscriptions = parse_subscriptions(&list)?;
        }
        if let Some(ms) = lookup("METRICS_POLL_INTERVAL_MS") {
            self.generator.poll_interval = parse_millis("METRICS_POLL_INTERVAL_MS", &ms)?;
        }
        if let Some(limit) = lookup("METRICS_FETCH_LIMIT") {
            let limit = limit.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("METRICS_FETCH_LIMIT: {:?} is not a count", limit))
            })?;
            self.generator.limit = Some(limit);
        }
        if let Some(ms) = lookup("METRICS_INTROSPECTION_INTERVAL_MS") {
            self.introspection_interval =
                parse_millis("METRICS_INTROSPECTION_INTERVAL_MS", &ms)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscriptions.is_empty() {
            return Err(ConfigError::Invalid(
                "subscriptions must name at least one metric kind".to_string(),
            ));
        }
        if self.source.url.is_empty() {
            return Err(ConfigError::Invalid("source.url is empty".to_string()));
        }
        if self.generator.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "generator.channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.dispatcher.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.introspection_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "introspection_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Remote metrics source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Endpoint returning a JSON array of readings
    pub url: String,
    /// Per-request timeout (default: 10s)
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            url: "http://localhost:8080/metrics".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Fetch loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Pause between fetches (default: none)
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Stop after this many fetches (default: run until cancelled)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Results buffered ahead of the dispatcher (default: 1)
    pub channel_capacity: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            poll_interval: Duration::ZERO,
            limit: None,
            channel_capacity: 1,
        }
    }
}

impl GeneratorConfig {
    /// Run exactly `n` fetches, then close the stream
    pub fn bounded(n: u64) -> Self {
        GeneratorConfig {
            limit: Some(n),
            ..Default::default()
        }
    }
}

/// Per-kind stream configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Values buffered ahead of each handler (default: 1)
    pub channel_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            channel_capacity: 1,
        }
    }
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::Invalid(format!("{}: {:?} is not milliseconds", key, raw)))
}

fn parse_subscriptions(raw: &str) -> Result<Vec<MetricKind>, ConfigError> {
    let mut kinds = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let kind = name
            .parse::<MetricKind>()
            .map_err(|e| ConfigError::Invalid(format!("METRICS_SUBSCRIPTIONS: {}", e)))?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    Ok(kinds)
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.source.url, "http://localhost:8080/metrics");
        assert_eq!(config.subscriptions, MetricKind::ALL.to_vec());
        assert_eq!(config.generator.limit, None);
        assert_eq!(config.introspection_interval, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = PipelineConfig::test();
        let text = toml::to_string(&config).unwrap();
        let parsed = PipelineConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            subscriptions = ["load_avg"]
            introspection_interval = 1000

            [source]
            url = "http://metrics.internal:9000/metrics"

            [generator]
            limit = 3
        "#;
        let config = PipelineConfig::from_toml_str(text).unwrap();
        assert_eq!(config.subscriptions, vec![MetricKind::LoadAverage]);
        assert_eq!(config.source.url, "http://metrics.internal:9000/metrics");
        assert_eq!(config.source.timeout, Duration::from_secs(10));
        assert_eq!(config.generator.limit, Some(3));
        assert_eq!(config.generator.channel_capacity, 1);
        assert_eq!(config.introspection_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_toml_rejects_unknown_kind() {
        let err = PipelineConfig::from_toml_str(r#"subscriptions = ["disk_io"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dispatcher]\nchannel_capacity = 16").unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.dispatcher.channel_capacity, 16);
    }

    #[test]
    fn test_load_missing_file() {
        let err = PipelineConfig::load("/nonexistent/metrics-consumer.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("METRICS_SOURCE_URL", "http://10.0.0.5:8080/metrics"),
            ("METRICS_SOURCE_TIMEOUT_MS", "250"),
            ("METRICS_SUBSCRIPTIONS", "cpu_usage, load_avg,cpu_usage"),
            ("METRICS_POLL_INTERVAL_MS", "100"),
            ("METRICS_FETCH_LIMIT", "42"),
        ]
        .into_iter()
        .collect();

        let mut config = PipelineConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.source.url, "http://10.0.0.5:8080/metrics");
        assert_eq!(config.source.timeout, Duration::from_millis(250));
        assert_eq!(
            config.subscriptions,
            vec![MetricKind::CpuUsage, MetricKind::LoadAverage]
        );
        assert_eq!(config.generator.poll_interval, Duration::from_millis(100));
        assert_eq!(config.generator.limit, Some(42));
    }

    #[test]
    fn test_env_overrides_reject_bad_values() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_overrides(|key| (key == "METRICS_SUBSCRIPTIONS").then(|| "load_avg,nope".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let mut config = PipelineConfig::default();
        let err = config
            .apply_overrides(|key| (key == "METRICS_POLL_INTERVAL_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_empty_subscriptions_rejected() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_overrides(|key| (key == "METRICS_SUBSCRIPTIONS").then(|| " , ".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = PipelineConfig::from_toml_str("subscriptions = []").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = PipelineConfig::default();
        config.dispatcher.channel_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
