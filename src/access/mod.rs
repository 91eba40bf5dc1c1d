//! Access control for state-changing channel operations.
//!
//! # Decision Precedence
//!
//! | Provider answer | Gate result                          |
//! |-----------------|--------------------------------------|
//! | `Allowed`       | Allowed (final)                      |
//! | `Denied`        | Denied (final)                       |
//! | `Defer`         | Broker-wide default (deny by default)|
//!
//! The gate asks the provider fresh on every call and keeps no per-request
//! state. Providers are selected by configuration:
//!
//! | `provider`  | Behavior                                      |
//! |-------------|-----------------------------------------------|
//! | `allow-all` | Allow every operation                         |
//! | `deny-all`  | Deny every operation                          |
//! | `rules`     | Ordered rule list, first match wins, else defer |
//!
//! # Usage
//!
//! ```rust,ignore
//! use amq::access::{AccessControlGate, Operation, Subject, ObjectAttributes};
//!
//! let gate = AccessControlGate::from_config(&config.access)?;
//! gate.check(Operation::Consume, &Subject::new("guest"), &ObjectAttributes::named("orders"))?;
//! ```

mod gate;
mod policies;
mod provider;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use gate::AccessControlGate;
pub use policies::{AccessRule, AllowAll, DenyAll, RuleBasedAccessControl, RuleEffect};
pub use provider::{AccessControlProvider, LifetimePolicy, ProviderKind, ProviderState};

/// Operations gated by access control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Publish a message to an exchange
    Publish,
    /// Register a consumer on a queue
    Consume,
    /// Push a message to a consumer
    Deliver,
    /// Hand out a message in answer to basic.get
    Get,
    /// Close a channel
    CloseChannel,
}

impl Operation {
    /// Stable lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Consume => "consume",
            Self::Deliver => "deliver",
            Self::Get => "get",
            Self::CloseChannel => "close-channel",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "publish" => Ok(Self::Publish),
            "consume" => Ok(Self::Consume),
            "deliver" => Ok(Self::Deliver),
            "get" => Ok(Self::Get),
            "close-channel" | "close" => Ok(Self::CloseChannel),
            _ => Err(format!("Unknown operation: {s}")),
        }
    }
}

/// Provider answer for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessDecision {
    /// Operation may proceed
    Allowed,
    /// Operation is refused
    Denied,
    /// Provider has no opinion; the broker default applies
    Defer,
}

/// Principal performing an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    /// Authenticated user name
    pub user: String,
    /// Virtual host the connection is bound to
    pub virtual_host: String,
}

impl Subject {
    /// Subject on the default virtual host
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            virtual_host: "/".to_string(),
        }
    }

    /// Set the virtual host
    pub fn on_vhost(mut self, virtual_host: &str) -> Self {
        self.virtual_host = virtual_host.to_string();
        self
    }
}

/// Object an operation targets: its name plus descriptive attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectAttributes {
    /// Queue or exchange name
    pub name: String,
    /// Extra attributes (consumer tag, channel id, ...)
    pub properties: BTreeMap<String, String>,
}

impl ObjectAttributes {
    /// Attributes for a named object
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            properties: BTreeMap::new(),
        }
    }

    /// Add one attribute
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    /// Look up one attribute
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Pluggable access-control policy.
pub trait AccessControl: Send + Sync + std::fmt::Debug {
    /// Decide whether `subject` may perform `operation` on the object.
    fn authorize(
        &self,
        operation: Operation,
        subject: &Subject,
        object: &ObjectAttributes,
    ) -> AccessDecision;

    /// Provider type name, as reported in the `type` attribute
    fn kind(&self) -> &'static str;
}
