//! Logging Configuration
//!
//! All settings are loaded from environment variables for 12-factor compliance.

/// Logging configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directives (RUST_LOG, default: info)
    pub filter: String,
    /// Emit one JSON object per event (METRICS_LOG_JSON)
    pub json: bool,
    /// Include the event target in each line (METRICS_LOG_TARGET, default: true)
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".to_string(),
            json: false,
            with_target: true,
        }
    }
}

impl LogConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup, falling back to defaults for missing keys
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = LogConfig::default();
        LogConfig {
            filter: lookup("RUST_LOG")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.filter),
            json: lookup("METRICS_LOG_JSON")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.json),
            with_target: lookup("METRICS_LOG_TARGET")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.with_target),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "true" | "1" | "yes")
}
