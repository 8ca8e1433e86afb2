//! Configuration management for Ratewarden.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, WardenError};
use crate::ratelimit::{default_rules, RuleConfig, RuleRegistry};

/// Prefix for environment variable overrides, e.g. `RATEWARDEN__STORE__REDIS_URL`.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the Ratewarden engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Shared state store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Adaptive behavior scoring configuration
    #[serde(default)]
    pub behavior: BehaviorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limit rules
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Which store implementation backs the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map, single instance only
    #[default]
    Memory,
    /// Redis shared across instances
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace prepended to every store key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_key_prefix() -> String {
    "ratewarden".to_string()
}

/// Behavior scorer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorConfig {
    /// When false every multiplier is 1.0
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Trailing window for rolling request counts, in seconds
    #[serde(default = "default_behavior_window")]
    pub window_secs: u64,

    /// Number of recent outcomes kept per identifier
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Denial ratio above which the limit is halved
    #[serde(default = "default_error_ratio_threshold")]
    pub error_ratio_threshold: f64,

    /// Denial ratio at or below which conduct counts as good
    #[serde(default = "default_low_error_ratio")]
    pub low_error_ratio: f64,

    /// Requests per window above which the limit is reduced
    #[serde(default = "default_volume_ceiling")]
    pub volume_ceiling: u64,

    /// Outcomes required before good conduct is rewarded
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            window_secs: default_behavior_window(),
            history_size: default_history_size(),
            error_ratio_threshold: default_error_ratio_threshold(),
            low_error_ratio: default_low_error_ratio(),
            volume_ceiling: default_volume_ceiling(),
            min_samples: default_min_samples(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_behavior_window() -> u64 {
    3600
}

fn default_history_size() -> usize {
    100
}

fn default_error_ratio_threshold() -> f64 {
    0.10
}

fn default_low_error_ratio() -> f64 {
    0.01
}

fn default_volume_ceiling() -> u64 {
    1000
}

fn default_min_samples() -> usize {
    20
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl WardenConfig {
    /// Load configuration from a YAML file, then apply `RATEWARDEN__*`
    /// environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| WardenError::Config(e.to_string()))?;

        let config: WardenConfig = settings
            .try_deserialize()
            .map_err(|e| WardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path without environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WardenConfig =
            serde_yaml::from_str(yaml).map_err(|e| WardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(WardenError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        if self.store.key_prefix.is_empty() || self.store.key_prefix.contains(':') {
            return Err(WardenError::Config(
                "store.key_prefix must be non-empty and must not contain ':'".to_string(),
            ));
        }
        let behavior = &self.behavior;
        if !(0.0..=1.0).contains(&behavior.error_ratio_threshold)
            || !(0.0..=1.0).contains(&behavior.low_error_ratio)
        {
            return Err(WardenError::Config(
                "behavior ratios must lie within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the rule registry, falling back to the preset rules.
    pub fn rule_registry(&self) -> Result<RuleRegistry> {
        if self.rules.is_empty() {
            info!("No rules configured, using presets");
            RuleRegistry::from_configs(&default_rules())
        } else {
            RuleRegistry::from_configs(&self.rules)
        }
    }
}
