//! Rate limit rules configuration and registry.
//!
//! Rules are loaded once at startup and never mutated in place. An admin
//! override installs a new rule version; checks already holding the previous
//! `Arc<Rule>` finish against it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::strategy::{Limits, Strategy};
use crate::error::{Result, WardenError};

/// A rate limit rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Unique rule name
    pub name: String,
    /// Number of requests allowed per window
    pub max_requests: u64,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Admission-control algorithm
    #[serde(default = "default_strategy")]
    pub strategy: Strategy,
    /// Seconds a client stays blocked after a violation (0 = re-evaluate every request)
    #[serde(default)]
    pub block_duration: u64,
    /// Bucket capacity override for bucket strategies
    #[serde(default)]
    pub burst_limit: u64,
    /// Refill/leak rate per second for bucket strategies
    #[serde(default)]
    pub refill_rate: f64,
    /// Admit requests when the store is unavailable
    #[serde(default)]
    pub fail_open: bool,
}

fn default_strategy() -> Strategy {
    Strategy::FixedWindow
}

/// Wrapper used when a rules file is parsed on its own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// A validated, immutable rate limit policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rule {
    pub name: String,
    pub max_requests: u64,
    pub window_seconds: u64,
    pub strategy: Strategy,
    pub block_duration: u64,
    pub burst_limit: u64,
    pub refill_rate: f64,
    pub fail_open: bool,
    /// Incremented each time an admin override replaces the rule
    pub version: u32,
}

impl Rule {
    /// Validate a configured rule.
    pub fn from_config(config: &RuleConfig) -> Result<Self> {
        let invalid = |msg: &str| WardenError::Config(format!("rule '{}': {}", config.name, msg));

        if config.name.trim().is_empty() {
            return Err(WardenError::Config("rule name must not be empty".to_string()));
        }
        if config.name.contains(':') {
            return Err(invalid("name must not contain ':'"));
        }
        if config.max_requests == 0 {
            return Err(invalid("max_requests must be greater than 0"));
        }
        if config.window_seconds == 0 {
            return Err(invalid("window_seconds must be greater than 0"));
        }
        if !config.refill_rate.is_finite() || config.refill_rate < 0.0 {
            return Err(invalid("refill_rate must be a finite, non-negative number"));
        }

        Ok(Self {
            name: config.name.clone(),
            max_requests: config.max_requests,
            window_seconds: config.window_seconds,
            strategy: config.strategy,
            block_duration: config.block_duration,
            burst_limit: config.burst_limit,
            refill_rate: config.refill_rate,
            fail_open: config.fail_open,
            version: 1,
        })
    }

    /// The unscaled limit: bucket capacity for bucket strategies, otherwise
    /// requests per window.
    pub fn base_limit(&self) -> u64 {
        if self.strategy.is_bucket() && self.burst_limit > 0 {
            self.burst_limit
        } else {
            self.max_requests
        }
    }

    /// Refill/leak rate per second.
    pub fn rate(&self) -> f64 {
        if self.refill_rate > 0.0 {
            self.refill_rate
        } else {
            self.max_requests as f64 / self.window_seconds as f64
        }
    }

    /// Scale the base limit by an adaptive multiplier, never below 1.
    pub fn effective_limit(&self, multiplier: f64) -> u64 {
        let scaled = (self.base_limit() as f64 * multiplier).round();
        if scaled.is_finite() && scaled >= 1.0 {
            scaled as u64
        } else {
            1
        }
    }

    /// Strategy parameters for a given multiplier.
    pub fn limits(&self, multiplier: f64) -> Limits {
        Limits {
            limit: self.effective_limit(multiplier),
            window_secs: self.window_seconds,
            rate: self.rate(),
        }
    }
}

/// Registry of named rules.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, Arc<Rule>>>,
}

impl RuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry, rejecting the whole set if any rule is invalid.
    pub fn from_configs(configs: &[RuleConfig]) -> Result<Self> {
        let mut rules = HashMap::with_capacity(configs.len());
        for config in configs {
            let rule = Rule::from_config(config)?;
            if rules.contains_key(&rule.name) {
                return Err(WardenError::Config(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
            rules.insert(rule.name.clone(), Arc::new(rule));
        }

        info!(count = rules.len(), "Loaded rate limit rules");

        Ok(Self {
            rules: RwLock::new(rules),
        })
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string with a top-level `rules:` list.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: RulesFile = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse rules: {}", e)))?;
        Self::from_configs(&file.rules)
    }

    /// Look up a rule by name.
    pub fn get(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.read().get(name).cloned()
    }

    /// Install a new version of a rule (or a brand new rule).
    pub fn override_rule(&self, config: &RuleConfig) -> Result<Arc<Rule>> {
        let mut rule = Rule::from_config(config)?;
        let mut rules = self.rules.write();
        if let Some(previous) = rules.get(&rule.name) {
            rule.version = previous.version + 1;
        }

        let rule = Arc::new(rule);
        rules.insert(rule.name.clone(), rule.clone());

        info!(
            rule = %rule.name,
            version = rule.version,
            strategy = %rule.strategy,
            max_requests = rule.max_requests,
            "Installed rule override"
        );
        Ok(rule)
    }

    /// All rules, sorted by name.
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        let mut rules: Vec<Arc<Rule>> = self.rules.read().values().cloned().collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        rules
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Preset rules used when configuration names none.
pub fn default_rules() -> Vec<RuleConfig> {
    vec![
        RuleConfig {
            name: "default".to_string(),
            max_requests: 100,
            window_seconds: 60,
            strategy: Strategy::SlidingWindow,
            block_duration: 0,
            burst_limit: 0,
            refill_rate: 0.0,
            fail_open: false,
        },
        RuleConfig {
            name: "auth".to_string(),
            max_requests: 5,
            window_seconds: 300,
            strategy: Strategy::FixedWindow,
            block_duration: 900,
            burst_limit: 0,
            refill_rate: 0.0,
            fail_open: false,
        },
        RuleConfig {
            name: "api".to_string(),
            max_requests: 1000,
            window_seconds: 3600,
            strategy: Strategy::TokenBucket,
            block_duration: 0,
            burst_limit: 50,
            refill_rate: 0.5,
            fail_open: false,
        },
        RuleConfig {
            name: "upload".to_string(),
            max_requests: 10,
            window_seconds: 60,
            strategy: Strategy::LeakyBucket,
            block_duration: 0,
            burst_limit: 0,
            refill_rate: 0.2,
            fail_open: false,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_config(name: &str, max_requests: u64, window_seconds: u64) -> RuleConfig {
        RuleConfig {
            name: name.to_string(),
            max_requests,
            window_seconds,
            strategy: Strategy::FixedWindow,
            block_duration: 0,
            burst_limit: 0,
            refill_rate: 0.0,
            fail_open: false,
        }
    }

    #[test]
    fn test_parse_rules_yaml() {
        let yaml = r#"
rules:
  - name: login
    max_requests: 5
    window_seconds: 300
    block_duration: 900
  - name: search
    max_requests: 20
    window_seconds: 10
    strategy: token_bucket
    burst_limit: 40
    refill_rate: 2.0
"#;
        let registry = RuleRegistry::from_yaml(yaml).unwrap();
        assert_eq!(registry.len(), 2);

        let login = registry.get("login").unwrap();
        assert_eq!(login.strategy, Strategy::FixedWindow);
        assert_eq!(login.block_duration, 900);
        assert_eq!(login.version, 1);

        let search = registry.get("search").unwrap();
        assert_eq!(search.strategy, Strategy::TokenBucket);
        assert_eq!(search.base_limit(), 40);
        assert_eq!(search.rate(), 2.0);
    }

    #[test]
    fn test_zero_max_requests_rejected() {
        let err = RuleRegistry::from_configs(&[rule_config("bad", 0, 60)]).unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(Rule::from_config(&rule_config("bad", 10, 0)).is_err());
    }

    #[test]
    fn test_invalid_names_rejected() {
        assert!(Rule::from_config(&rule_config("", 10, 60)).is_err());
        assert!(Rule::from_config(&rule_config("a:b", 10, 60)).is_err());
    }

    #[test]
    fn test_negative_refill_rejected() {
        let mut config = rule_config("bucket", 10, 60);
        config.refill_rate = -1.0;
        assert!(Rule::from_config(&config).is_err());

        config.refill_rate = f64::NAN;
        assert!(Rule::from_config(&config).is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let configs = [rule_config("dup", 1, 1), rule_config("dup", 2, 2)];
        assert!(RuleRegistry::from_configs(&configs).is_err());
    }

    #[test]
    fn test_effective_limit_rounding_and_floor() {
        let rule = Rule::from_config(&rule_config("r", 10, 60)).unwrap();
        assert_eq!(rule.effective_limit(1.0), 10);
        assert_eq!(rule.effective_limit(0.5), 5);
        assert_eq!(rule.effective_limit(1.25), 13);
        assert_eq!(rule.effective_limit(0.01), 1);
        assert_eq!(rule.effective_limit(f64::NAN), 1);
    }

    #[test]
    fn test_default_rate_is_requests_per_second() {
        let mut config = rule_config("leaky", 10, 20);
        config.strategy = Strategy::LeakyBucket;
        let rule = Rule::from_config(&config).unwrap();
        assert_eq!(rule.rate(), 0.5);
        assert_eq!(rule.base_limit(), 10);
    }

    #[test]
    fn test_override_bumps_version() {
        let registry = RuleRegistry::from_configs(&[rule_config("api", 10, 60)]).unwrap();
        let original = registry.get("api").unwrap();

        let replaced = registry.override_rule(&rule_config("api", 20, 60)).unwrap();
        assert_eq!(replaced.version, 2);
        assert_eq!(registry.get("api").unwrap().max_requests, 20);

        // The old Arc is untouched.
        assert_eq!(original.max_requests, 10);
        assert_eq!(original.version, 1);
    }

    #[test]
    fn test_default_rules_are_valid() {
        let registry = RuleRegistry::from_configs(&default_rules()).unwrap();
        assert_eq!(registry.len(), 4);
        let names: Vec<String> = registry.rules().iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["api", "auth", "default", "upload"]);
    }
}
