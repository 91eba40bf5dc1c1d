//! Access-control provider extension point.
//!
//! The provider is a configured object: it carries descriptive attributes
//! for management plus the policy itself. Only `state` matters at runtime;
//! a provider that is not active refuses to answer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::policies::{AllowAll, DenyAll, RuleBasedAccessControl};
use super::AccessControl;
use crate::config::AccessConfig;
use crate::error::{AmqError, Result};

/// Declared attribute names.
pub mod attr {
    /// Free-form description
    pub const DESCRIPTION: &str = "description";
    /// Lifecycle state
    pub const STATE: &str = "state";
    /// Survives broker restart
    pub const DURABLE: &str = "durable";
    /// When the provider is removed
    pub const LIFETIME_POLICY: &str = "lifetimePolicy";
    /// Seconds before the provider expires, 0 = never
    pub const TIME_TO_LIVE: &str = "timeToLive";
    /// Creation time
    pub const CREATED: &str = "created";
    /// Last update time
    pub const UPDATED: &str = "updated";
    /// Provider type name
    pub const TYPE: &str = "type";

    /// All declared attributes, in declaration order
    pub const ALL: [&str; 8] = [
        DESCRIPTION,
        STATE,
        DURABLE,
        LIFETIME_POLICY,
        TIME_TO_LIVE,
        CREATED,
        UPDATED,
        TYPE,
    ];
}

/// Provider lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderState {
    /// Created, not yet opened
    Initializing,
    /// Answering authorization calls
    Active,
    /// Administratively stopped
    Stopped,
    /// Failed to open
    Errored,
    /// Removed
    Deleted,
}

/// When the provider goes away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifetimePolicy {
    /// Lives until deleted
    #[default]
    Permanent,
    /// Removed with the connection that created it
    DeleteOnConnectionClose,
    /// Removed when nothing refers to it
    DeleteOnNoLinks,
}

/// Built-in provider selected by configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// [`AllowAll`]
    #[default]
    AllowAll,
    /// [`DenyAll`]
    DenyAll,
    /// [`RuleBasedAccessControl`]
    Rules,
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "allow-all" | "allow" => Ok(Self::AllowAll),
            "deny-all" | "deny" => Ok(Self::DenyAll),
            "rules" | "acl" => Ok(Self::Rules),
            _ => Err(format!("Unknown access control provider: {s}")),
        }
    }
}

/// Configured access-control provider.
#[derive(Debug, Clone)]
pub struct AccessControlProvider {
    id: Uuid,
    name: String,
    description: Option<String>,
    state: ProviderState,
    durable: bool,
    lifetime_policy: LifetimePolicy,
    time_to_live: u64,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    access_control: Arc<dyn AccessControl>,
}

impl AccessControlProvider {
    /// Wrap a policy in an active provider
    pub fn new(name: &str, access_control: Arc<dyn AccessControl>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            state: ProviderState::Active,
            durable: false,
            lifetime_policy: LifetimePolicy::Permanent,
            time_to_live: 0,
            created: now,
            updated: now,
            access_control,
        }
    }

    /// Build the provider named by configuration
    pub fn from_config(config: &AccessConfig) -> Result<Self> {
        let access_control: Arc<dyn AccessControl> = match config.provider {
            ProviderKind::AllowAll => Arc::new(AllowAll),
            ProviderKind::DenyAll => Arc::new(DenyAll),
            ProviderKind::Rules => Arc::new(RuleBasedAccessControl::new(&config.rules)?),
        };

        let mut provider = Self::new(&config.name, access_control);
        provider.description = config.description.clone();
        provider.durable = config.durable;
        Ok(provider)
    }

    /// Set the description
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Provider id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Provider name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProviderState {
        self.state
    }

    /// Whether the provider answers authorization calls
    pub fn is_active(&self) -> bool {
        self.state == ProviderState::Active
    }

    /// Provider type name (from the policy)
    pub fn provider_type(&self) -> &'static str {
        self.access_control.kind()
    }

    /// Change lifecycle state
    pub fn set_state(&mut self, state: ProviderState) {
        if self.state != state {
            tracing::info!(
                "Access control provider '{}' {:?} -> {:?}",
                self.name,
                self.state,
                state
            );
            self.state = state;
            self.updated = Utc::now();
        }
    }

    /// The policy, if the provider is active.
    ///
    /// An inactive provider is a configuration problem, not a denial.
    pub fn access_control(&self) -> Result<&Arc<dyn AccessControl>> {
        if !self.is_active() {
            return Err(AmqError::Config(format!(
                "access control provider '{}' is {:?}, not ACTIVE",
                self.name, self.state
            )));
        }
        Ok(&self.access_control)
    }

    /// Value of one declared attribute
    pub fn attribute(&self, name: &str) -> Option<Value> {
        let value = match name {
            attr::DESCRIPTION => json!(self.description),
            attr::STATE => json!(self.state),
            attr::DURABLE => json!(self.durable),
            attr::LIFETIME_POLICY => json!(self.lifetime_policy),
            attr::TIME_TO_LIVE => json!(self.time_to_live),
            attr::CREATED => json!(self.created.to_rfc3339()),
            attr::UPDATED => json!(self.updated.to_rfc3339()),
            attr::TYPE => json!(self.provider_type()),
            _ => return None,
        };
        Some(value)
    }

    /// All declared attributes plus id and name
    pub fn attributes(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("id".to_string(), json!(self.id.to_string()));
        map.insert("name".to_string(), json!(self.name));
        for name in attr::ALL {
            if let Some(value) = self.attribute(name) {
                map.insert(name.to_string(), value);
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessRule, RuleEffect};

    #[test]
    fn test_attributes_exposed() {
        let provider =
            AccessControlProvider::new("default", Arc::new(AllowAll)).with_description("open");
        let attrs = provider.attributes();
        for name in attr::ALL {
            assert!(attrs.contains_key(name), "missing {name}");
        }
        assert_eq!(attrs["type"], json!("allow-all"));
        assert_eq!(attrs["state"], json!("ACTIVE"));
        assert_eq!(attrs["lifetimePolicy"], json!("PERMANENT"));
        assert_eq!(attrs["description"], json!("open"));
        assert_eq!(provider.attribute("bogus"), None);
    }

    #[test]
    fn test_inactive_provider_is_config_error() {
        let mut provider = AccessControlProvider::new("default", Arc::new(DenyAll));
        assert!(provider.access_control().is_ok());

        provider.set_state(ProviderState::Stopped);
        assert!(matches!(provider.access_control(), Err(AmqError::Config(_))));
        assert!(provider.updated >= provider.created);
    }

    #[test]
    fn test_from_config_rules() {
        let config = AccessConfig {
            provider: ProviderKind::Rules,
            rules: vec![AccessRule::new(RuleEffect::Allow)],
            ..AccessConfig::default()
        };
        let provider = AccessControlProvider::from_config(&config).unwrap();
        assert_eq!(provider.provider_type(), "rules");
    }

    #[test]
    fn test_from_config_bad_rule() {
        let config = AccessConfig {
            provider: ProviderKind::Rules,
            rules: vec![AccessRule::new(RuleEffect::Allow).for_object("[")],
            ..AccessConfig::default()
        };
        assert!(AccessControlProvider::from_config(&config).is_err());
    }
}
