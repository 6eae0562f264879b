//! Service configuration (YAML)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level
    #[serde(rename = "log-level")]
    pub log_level: String,

    /// Capture interface handed to the engine
    pub capture: CaptureConfig,

    /// Ping sweep tuning
    pub ping: PingConfig,

    /// Switch decision tuning
    pub selection: SelectionConfig,

    /// Subscription refresh tuning
    pub subscription: SubscriptionConfig,

    /// Routing ruleset refresh
    pub routing: RoutingConfig,

    /// Shared reconciler tuning
    pub reconcile: ReconcileTuning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub name: String,
    pub mtu: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            name: "tun0".to_string(),
            mtu: 1500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    #[serde(rename = "interval-secs")]
    pub interval_secs: u64,
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,
    pub concurrency: usize,
}

impl Default for PingConfig {
    fn default() -> Self {
        PingConfig {
            interval_secs: 30,
            timeout_secs: 5,
            concurrency: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    #[serde(rename = "auto-switch")]
    pub auto_switch: bool,
    #[serde(rename = "min-ping-threshold-ms")]
    pub min_ping_threshold_ms: u32,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        SelectionConfig {
            auto_switch: true,
            min_ping_threshold_ms: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// How often the reconciler looks for due groups; each group still has
    /// its own refresh interval.
    #[serde(rename = "check-interval-secs")]
    pub check_interval_secs: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        SubscriptionConfig {
            check_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    #[serde(rename = "ruleset-url")]
    pub ruleset_url: Option<String>,
    #[serde(rename = "refresh-interval-secs")]
    pub refresh_interval_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        RoutingConfig {
            ruleset_url: None,
            refresh_interval_secs: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileTuning {
    #[serde(rename = "max-backoff-secs")]
    pub max_backoff_secs: u64,
    #[serde(rename = "stale-after")]
    pub stale_after: u32,
    #[serde(rename = "fetch-timeout-secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for ReconcileTuning {
    fn default() -> Self {
        ReconcileTuning {
            max_backoff_secs: 6 * 3600,
            stale_after: 5,
            fetch_timeout_secs: 30,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".to_string(),
            capture: CaptureConfig::default(),
            ping: PingConfig::default(),
            selection: SelectionConfig::default(),
            subscription: SubscriptionConfig::default(),
            routing: RoutingConfig::default(),
            reconcile: ReconcileTuning::default(),
        }
    }
}

impl Config {
    /// Load configuration from file (synchronous)
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.ping.timeout_secs == 0 {
            return Err(Error::config("ping timeout must be non-zero"));
        }
        if self.ping.concurrency == 0 {
            return Err(Error::config("ping concurrency must be non-zero"));
        }
        if self.ping.interval_secs == 0 {
            return Err(Error::config("ping interval must be non-zero"));
        }
        if self.routing.refresh_interval_secs == 0 {
            return Err(Error::config("routing refresh interval must be non-zero"));
        }
        if let Some(raw) = &self.routing.ruleset_url {
            url::Url::parse(raw)
                .map_err(|e| Error::config(format!("invalid ruleset URL '{}': {}", raw, e)))?;
        }
        Ok(())
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping.timeout_secs)
    }
}
