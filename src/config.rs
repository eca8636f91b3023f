//! Configuration for the client-side SDK.
//!
//! Every recognised option is a typed field on [`Config`]. A config read from
//! disk (or built in code) goes through [`Config::sanitize`] before a factory
//! is built from it, which clamps rates to their minimums and rejects values
//! the engine cannot work with.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default location of the local flag store.
pub const DEFAULT_SQL_URL: &str = "sqlite:///split.sqlite";

/// Default events API base URL.
pub const DEFAULT_EVENTS_URL: &str = "https://events.split.io/api";

/// How impressions are deduplicated before being queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpressionsMode {
    /// Identical impressions within the same hour are stored once and counted.
    Optimized,
    /// Every impression is stored.
    Debug,
}

impl Default for ImpressionsMode {
    fn default() -> Self {
        ImpressionsMode::Optimized
    }
}

/// Main configuration for a bound factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection string for the local flag store
    pub sql_url: String,

    /// Whether impressions carry the evaluation label
    pub labels_enabled: bool,

    /// Impression dedupe strategy
    pub impressions_mode: ImpressionsMode,

    /// Queued impressions before a flush is forced
    pub impressions_queue_size: usize,

    /// Impressions sent per flush
    pub impressions_bulk_size: usize,

    /// Interval between impression flushes
    #[serde(with = "duration_secs")]
    pub impressions_refresh_rate: Duration,

    /// Queued events before a flush is forced
    pub events_queue_size: usize,

    /// Events sent per flush
    pub events_bulk_size: usize,

    /// Interval between event flushes
    #[serde(with = "duration_secs")]
    pub events_push_rate: Duration,

    /// Interval between telemetry flushes
    #[serde(with = "duration_secs")]
    pub metrics_refresh_rate: Duration,

    /// HTTP timeout for the events API
    #[serde(with = "duration_millis")]
    pub connection_timeout: Duration,

    /// How often the store is checked for definitions until the factory is ready
    #[serde(with = "duration_millis")]
    pub definitions_poll_interval: Duration,

    /// Events API base URL
    pub events_url: String,

    /// Whether machine name and IP are reported as SDK metadata
    pub ip_addresses_enabled: bool,

    /// Overrides the detected machine name
    pub machine_name: Option<String>,

    /// Overrides the detected machine IP
    pub machine_ip: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sql_url: DEFAULT_SQL_URL.to_string(),
            labels_enabled: true,
            impressions_mode: ImpressionsMode::Optimized,
            impressions_queue_size: 10_000,
            impressions_bulk_size: 5_000,
            impressions_refresh_rate: Duration::from_secs(300),
            events_queue_size: 10_000,
            events_bulk_size: 5_000,
            events_push_rate: Duration::from_secs(10),
            metrics_refresh_rate: Duration::from_secs(3600),
            connection_timeout: Duration::from_millis(1500),
            definitions_poll_interval: Duration::from_millis(1000),
            events_url: DEFAULT_EVENTS_URL.to_string(),
            ip_addresses_enabled: true,
            machine_name: None,
            machine_ip: None,
        }
    }
}

impl Config {
    /// Config pointing at the given store, everything else defaulted.
    pub fn with_sql_url(sql_url: impl Into<String>) -> Self {
        Self {
            sql_url: sql_url.into(),
            ..Self::default()
        }
    }

    /// Load configuration from the default location.
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::from_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content).map_err(ConfigError::Parse)?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("split-client-side")
            .join("config.json")
    }

    /// Validate and normalize the configuration.
    ///
    /// Rates below their minimum are raised to it (with a warning); values
    /// that cannot be repaired are rejected.
    pub fn sanitize(mut self) -> Result<Self, ConfigError> {
        if !self.sql_url.starts_with("sqlite://") {
            return Err(ConfigError::Invalid {
                option: "sql_url",
                reason: format!("unsupported connection string '{}'", self.sql_url),
            });
        }

        for (option, value) in [
            ("impressions_queue_size", self.impressions_queue_size),
            ("impressions_bulk_size", self.impressions_bulk_size),
            ("events_queue_size", self.events_queue_size),
            ("events_bulk_size", self.events_bulk_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    option,
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        if self.events_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                option: "events_url",
                reason: "must not be empty".to_string(),
            });
        }
        self.events_url = self.events_url.trim_end_matches('/').to_string();

        let impressions_min = match self.impressions_mode {
            ImpressionsMode::Optimized => Duration::from_secs(60),
            ImpressionsMode::Debug => Duration::from_secs(1),
        };
        self.impressions_refresh_rate = at_least(
            "impressions_refresh_rate",
            self.impressions_refresh_rate,
            impressions_min,
        );
        self.events_push_rate = at_least(
            "events_push_rate",
            self.events_push_rate,
            Duration::from_secs(1),
        );
        self.metrics_refresh_rate = at_least(
            "metrics_refresh_rate",
            self.metrics_refresh_rate,
            Duration::from_secs(60),
        );
        self.connection_timeout = at_least(
            "connection_timeout",
            self.connection_timeout,
            Duration::from_millis(1),
        );
        self.definitions_poll_interval = at_least(
            "definitions_poll_interval",
            self.definitions_poll_interval,
            Duration::from_millis(50),
        );

        Ok(self)
    }
}

fn at_least(option: &str, value: Duration, min: Duration) -> Duration {
    if value < min {
        tracing::warn!(
            option,
            ?value,
            ?min,
            "configured value below minimum, using minimum"
        );
        min
    } else {
        value
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("Serialize error: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Invalid value for {option}: {reason}")]
    Invalid { option: &'static str, reason: String },
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

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
