use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Rules keyed by the topic they subscribe to.
pub type RuleSet = HashMap<String, Rule>;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub mqtt: BrokerConfig,
    pub topics: Vec<Rule>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    pub broker: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// One subscribed topic and the linear transform applied to its payloads.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Rule {
    pub subscribe_topic: String,
    pub field: String,
    pub a0: f64,
    pub a1: f64,
    pub publish_topic: String,
    pub publish_field: String,
    #[serde(default)]
    pub publish_qos: u8,
    #[serde(default)]
    pub retain: bool,
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}

fn default_channel_capacity() -> usize {
    64
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Rule {
    /// `a0 + a1 * x` in plain f64 arithmetic.
    pub fn apply(&self, x: f64) -> f64 {
        self.a0 + self.a1 * x
    }

    fn validate(&self, index: usize) -> Result<(), ConfigError> {
        let required = [
            ("subscribe_topic", &self.subscribe_topic),
            ("field", &self.field),
            ("publish_topic", &self.publish_topic),
            ("publish_field", &self.publish_field),
        ];
        for (name, value) in required {
            if value.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "topics[{}].{} must not be empty",
                    index, name
                )));
            }
        }

        if self.publish_qos > 2 {
            return Err(ConfigError::Invalid(format!(
                "topics[{}].publish_qos must be 0, 1 or 2, got {}",
                index, self.publish_qos
            )));
        }

        if !self.a0.is_finite() || !self.a1.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "topics[{}] coefficients must be finite numbers",
                index
            )));
        }

        if has_wildcard(&self.publish_topic) {
            return Err(ConfigError::Invalid(format!(
                "topics[{}].publish_topic '{}' must not contain wildcards",
                index, self.publish_topic
            )));
        }

        if has_wildcard(&self.subscribe_topic) {
            // Routing is exact-match, so messages arriving through this filter
            // carry concrete topics and will never find this rule.
            warn!(
                "topics[{}].subscribe_topic '{}' contains a wildcard and will not match any message",
                index, self.subscribe_topic
            );
        }

        Ok(())
    }
}

impl BrokerConfig {
    const MIN_RECONNECT_MS: u64 = 100;
    const MAX_RECONNECT_MS: u64 = 60_000;
    const MIN_KEEP_ALIVE_SECS: u64 = 5;

    /// Configured client id, or a fresh random one.
    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("mqtt-linear-mapper-{}", Uuid::new_v4()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.is_empty() {
            return Err(ConfigError::Invalid("mqtt.broker must not be empty".to_string()));
        }

        if !(Self::MIN_RECONNECT_MS..=Self::MAX_RECONNECT_MS).contains(&self.reconnect_interval_ms) {
            return Err(ConfigError::Invalid(format!(
                "mqtt.reconnect_interval_ms must be between {} and {} ms",
                Self::MIN_RECONNECT_MS,
                Self::MAX_RECONNECT_MS
            )));
        }

        if self.keep_alive_secs < Self::MIN_KEEP_ALIVE_SECS {
            return Err(ConfigError::Invalid(format!(
                "mqtt.keep_alive_secs must be at least {}",
                Self::MIN_KEEP_ALIVE_SECS
            )));
        }

        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "mqtt.channel_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Config {
    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt.validate()?;
        for (index, rule) in self.topics.iter().enumerate() {
            rule.validate(index)?;
        }
        Ok(())
    }

    /// Index rules by subscribe topic. A later rule replaces an earlier one
    /// with the same topic.
    pub fn rule_set(&self) -> RuleSet {
        let mut rules = RuleSet::with_capacity(self.topics.len());
        for rule in &self.topics {
            if let Some(previous) = rules.insert(rule.subscribe_topic.clone(), rule.clone()) {
                warn!(
                    "Duplicate rule for topic '{}', replacing earlier rule publishing to '{}'",
                    previous.subscribe_topic, previous.publish_topic
                );
            }
        }
        rules
    }
}

fn has_wildcard(topic: &str) -> bool {
    topic.contains('+') || topic.contains('#')
}
