//! Broker and bridge configuration (`mqtt.toml`).
//!
//! ```toml
//! [mqtt]
//! hostname = "192.168.1.10"
//! username = "tuya"
//! password = "secret"
//! base_topic = "tuya"
//!
//! [bridge]
//! poll_interval = 60
//! snapshot_policy = "merge"
//! ```

use crate::bridge::{BridgeOptions, DEFAULT_BASE_TOPIC, TopicConvention, TopicScheme};
use crate::error::{Result, TuyaError};
use crate::session::{SessionOptions, SnapshotPolicy};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mqtt: BrokerConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl Config {
    /// Loads and validates a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TuyaError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TuyaError::Config(format!("invalid broker config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.mqtt.hostname.trim().is_empty() {
            return Err(TuyaError::Config("mqtt.hostname is empty".into()));
        }
        let base = self.mqtt.base_topic.trim_matches('/');
        if base.is_empty() || base.contains(['+', '#']) {
            return Err(TuyaError::Config(format!(
                "mqtt.base_topic '{}' is not a usable topic prefix",
                self.mqtt.base_topic
            )));
        }
        let b = &self.bridge;
        if b.poll_interval == 0 || b.heartbeat_interval == 0 || b.connect_timeout == 0 {
            return Err(TuyaError::Config(
                "bridge intervals and timeouts must be positive".into(),
            ));
        }
        if b.reconnect_min == 0 || b.reconnect_min > b.reconnect_max {
            return Err(TuyaError::Config(format!(
                "bridge.reconnect_min ({}) must be positive and not above reconnect_max ({})",
                b.reconnect_min, b.reconnect_max
            )));
        }
        Ok(())
    }

    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            topics: TopicScheme::new(self.mqtt.base_topic.clone()),
            convention: TopicConvention {
                per_key: self.bridge.per_key_topics,
                aggregate: self.bridge.aggregate_topic,
            },
            ..Default::default()
        }
    }
}

/// Broker connection parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub hostname: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_base_topic")]
    pub base_topic: String,

    /// Generated when unset
    #[serde(default)]
    pub client_id: Option<String>,

    /// Seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
}

/// Device polling and publication settings. All durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub poll_interval: u64,
    pub heartbeat_interval: u64,
    pub connect_timeout: u64,
    pub reconnect_min: u64,
    pub reconnect_max: u64,
    pub per_key_topics: bool,
    pub aggregate_topic: bool,
    pub snapshot_policy: SnapshotPolicy,
    pub shutdown_timeout: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval: 60,
            heartbeat_interval: 9,
            connect_timeout: 10,
            reconnect_min: 5,
            reconnect_max: 600,
            per_key_topics: true,
            aggregate_topic: true,
            snapshot_policy: SnapshotPolicy::Merge,
            shutdown_timeout: 5,
        }
    }
}

impl BridgeConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            poll_interval: Duration::from_secs(self.poll_interval),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            reconnect_min: Duration::from_secs(self.reconnect_min),
            reconnect_max: Duration::from_secs(self.reconnect_max),
            snapshot_policy: self.snapshot_policy,
            ..Default::default()
        }
    }

    pub fn shutdown_window(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

fn default_port() -> u16 {
    1883
}

fn default_base_topic() -> String {
    DEFAULT_BASE_TOPIC.to_string()
}

fn default_keep_alive() -> u64 {
    30
}
