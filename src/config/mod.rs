//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables
//! - CLI arguments (for the `amq` binary)
//!
//! ```toml
//! [broker]
//! frame_max = 131072
//! protocol = "0-8"
//!
//! [flow]
//! prefetch_count = 100
//! auto_close = true
//!
//! [access]
//! provider = "rules"
//! default = "deny"
//!
//! [[access.rules]]
//! effect = "allow"
//! operation = "consume"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::access::{AccessRule, ProviderKind, RuleEffect};
use crate::delivery::CreditLimit;
use crate::error::{AmqError, Result};
use crate::framing::{ProtocolVersion, DEFAULT_FRAME_MAX, FRAME_MIN_SIZE};

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Connection-level limits and protocol version
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Consumer flow control defaults
    #[serde(default)]
    pub flow: FlowConfig,

    /// Access control provider
    #[serde(default)]
    pub access: AccessConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            AmqError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| AmqError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("AMQ_FRAME_MAX") {
            if let Ok(val) = val.parse() {
                config.broker.frame_max = val;
            }
        }
        if let Ok(val) = std::env::var("AMQ_PROTOCOL") {
            if let Ok(val) = val.parse() {
                config.broker.protocol = val;
            }
        }
        if let Ok(val) = std::env::var("AMQ_PREFETCH") {
            if let Ok(val) = val.parse() {
                config.flow.prefetch_count = val;
            }
        }
        if let Ok(val) = std::env::var("AMQ_ACCESS_PROVIDER") {
            if let Ok(val) = val.parse() {
                config.access.provider = val;
            }
        }
        if let Ok(val) = std::env::var("AMQ_ACCESS_DEFAULT") {
            match val.to_lowercase().as_str() {
                "allow" => config.access.default = RuleEffect::Allow,
                "deny" => config.access.default = RuleEffect::Deny,
                _ => tracing::warn!("Ignoring AMQ_ACCESS_DEFAULT={val}"),
            }
        }

        config
    }

    /// Default config file location (`~/.config/amq/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("amq").join("config.toml"))
    }

    /// Load from the default path if it exists, else defaults
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    /// Merge with another config (other takes precedence where it differs
    /// from the defaults)
    pub fn merge(self, other: Self) -> Self {
        let broker_default = BrokerConfig::default();
        let flow_default = FlowConfig::default();
        let access_default = AccessConfig::default();

        fn pick<T: PartialEq>(base: T, other: T, default: &T) -> T {
            if other != *default {
                other
            } else {
                base
            }
        }

        Self {
            broker: BrokerConfig {
                frame_max: pick(self.broker.frame_max, other.broker.frame_max, &broker_default.frame_max),
                channel_max: pick(
                    self.broker.channel_max,
                    other.broker.channel_max,
                    &broker_default.channel_max,
                ),
                protocol: pick(self.broker.protocol, other.broker.protocol, &broker_default.protocol),
                heartbeat_secs: pick(
                    self.broker.heartbeat_secs,
                    other.broker.heartbeat_secs,
                    &broker_default.heartbeat_secs,
                ),
            },
            flow: FlowConfig {
                prefetch_count: pick(
                    self.flow.prefetch_count,
                    other.flow.prefetch_count,
                    &flow_default.prefetch_count,
                ),
                prefetch_bytes: pick(
                    self.flow.prefetch_bytes,
                    other.flow.prefetch_bytes,
                    &flow_default.prefetch_bytes,
                ),
                auto_close: pick(self.flow.auto_close, other.flow.auto_close, &flow_default.auto_close),
                idle_auto_close_secs: pick(
                    self.flow.idle_auto_close_secs,
                    other.flow.idle_auto_close_secs,
                    &flow_default.idle_auto_close_secs,
                ),
            },
            access: if other.access != access_default {
                other.access
            } else {
                self.access
            },
        }
    }

    /// Reject settings the broker cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.broker.frame_max != 0 && self.broker.frame_max < FRAME_MIN_SIZE {
            return Err(AmqError::Config(format!(
                "frame_max {} is below the protocol minimum {FRAME_MIN_SIZE}",
                self.broker.frame_max
            )));
        }
        if self.broker.channel_max == 0 {
            return Err(AmqError::Config("channel_max must be at least 1".to_string()));
        }
        if self.access.provider != ProviderKind::Rules && !self.access.rules.is_empty() {
            tracing::warn!(
                "{} access rules ignored by provider {:?}",
                self.access.rules.len(),
                self.access.provider
            );
        }
        Ok(())
    }
}

/// Connection-level settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Negotiated maximum frame size in bytes (0 = unlimited)
    pub frame_max: u32,

    /// Highest channel id a connection may open
    pub channel_max: u16,

    /// Protocol version spoken on connections
    pub protocol: ProtocolVersion,

    /// Heartbeat interval in seconds (0 = disabled)
    pub heartbeat_secs: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            frame_max: DEFAULT_FRAME_MAX,
            channel_max: 2047,
            protocol: ProtocolVersion::default(),
            heartbeat_secs: 60,
        }
    }
}

/// Consumer flow control defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Unacknowledged deliveries per consumer (0 = unlimited)
    pub prefetch_count: u32,

    /// Unacknowledged body bytes per consumer (0 = unlimited)
    pub prefetch_bytes: u64,

    /// Auto-close consumers whose window is exhausted
    pub auto_close: bool,

    /// Auto-close consumers idle for this long (disabled when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_auto_close_secs: Option<u64>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 0,
            prefetch_bytes: 0,
            auto_close: false,
            idle_auto_close_secs: None,
        }
    }
}

impl FlowConfig {
    /// Default credit window for new consumers
    pub fn credit_limit(&self) -> CreditLimit {
        CreditLimit {
            count: self.prefetch_count,
            bytes: self.prefetch_bytes,
        }
    }

    /// Idle auto-close threshold, if enabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_auto_close_secs.map(Duration::from_secs)
    }
}

/// Access control settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Provider name, reported in its attributes
    pub name: String,

    /// Built-in provider to use
    pub provider: ProviderKind,

    /// Decision when the provider defers
    pub default: RuleEffect,

    /// Provider description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Durable provider
    pub durable: bool,

    /// Ordered rules for the `rules` provider
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<AccessRule>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            provider: ProviderKind::AllowAll,
            default: RuleEffect::Deny,
            description: None,
            durable: false,
            rules: Vec::new(),
        }
    }
}
