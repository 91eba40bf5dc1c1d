//! Authorization decision point.

use std::sync::{Arc, RwLock};

use super::policies::RuleEffect;
use super::provider::{AccessControlProvider, ProviderState};
use super::{AccessDecision, ObjectAttributes, Operation, Subject};
use crate::config::AccessConfig;
use crate::error::{AmqError, Result};

/// Consulted before every state-changing channel operation.
///
/// Cloning shares the provider; swapping it or changing its state is
/// visible to every clone.
#[derive(Debug, Clone)]
pub struct AccessControlGate {
    provider: Arc<RwLock<AccessControlProvider>>,
    default_decision: AccessDecision,
}

impl AccessControlGate {
    /// Gate over `provider`, denying whatever the provider defers
    pub fn new(provider: AccessControlProvider) -> Self {
        Self {
            provider: Arc::new(RwLock::new(provider)),
            default_decision: AccessDecision::Denied,
        }
    }

    /// Build provider and default policy from configuration
    pub fn from_config(config: &AccessConfig) -> Result<Self> {
        let provider = AccessControlProvider::from_config(config)?;
        Ok(Self::new(provider).with_default(config.default))
    }

    /// Set the broker-wide default for deferred decisions
    pub fn with_default(mut self, effect: RuleEffect) -> Self {
        self.default_decision = match effect {
            RuleEffect::Allow => AccessDecision::Allowed,
            RuleEffect::Deny => AccessDecision::Denied,
        };
        self
    }

    /// Decision applied when the provider defers
    pub fn default_decision(&self) -> AccessDecision {
        self.default_decision
    }

    /// Replace the provider
    pub fn replace_provider(&self, provider: AccessControlProvider) -> Result<()> {
        let mut guard = self
            .provider
            .write()
            .map_err(|_| AmqError::Config("access control provider lock poisoned".to_string()))?;
        *guard = provider;
        Ok(())
    }

    /// Change the provider's lifecycle state
    pub fn set_provider_state(&self, state: ProviderState) -> Result<()> {
        self.provider
            .write()
            .map_err(|_| AmqError::Config("access control provider lock poisoned".to_string()))?
            .set_state(state);
        Ok(())
    }

    /// Snapshot of the provider's declared attributes
    pub fn provider_attributes(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let guard = self
            .provider
            .read()
            .map_err(|_| AmqError::Config("access control provider lock poisoned".to_string()))?;
        Ok(guard.attributes())
    }

    /// Final decision: `Allowed` or `Denied`, never `Defer`.
    pub fn authorize(
        &self,
        operation: Operation,
        subject: &Subject,
        object: &ObjectAttributes,
    ) -> Result<AccessDecision> {
        let guard = self
            .provider
            .read()
            .map_err(|_| AmqError::Config("access control provider lock poisoned".to_string()))?;

        let decision = match guard.access_control()?.authorize(operation, subject, object) {
            AccessDecision::Defer => self.default_decision,
            decided => decided,
        };

        tracing::debug!(
            "authorize {} by {} on '{}': {:?}",
            operation,
            subject.user,
            object.name,
            decision
        );
        Ok(decision)
    }

    /// Like [`authorize`](Self::authorize) but a denial is an error.
    pub fn check(
        &self,
        operation: Operation,
        subject: &Subject,
        object: &ObjectAttributes,
    ) -> Result<()> {
        match self.authorize(operation, subject, object)? {
            AccessDecision::Allowed => Ok(()),
            _ => {
                tracing::warn!(
                    "Denied {} by {} on '{}'",
                    operation,
                    subject.user,
                    object.name
                );
                Err(AmqError::AccessDenied {
                    operation,
                    subject: subject.user.clone(),
                    object: object.name.clone(),
                })
            },
        }
    }
}

impl Default for AccessControlGate {
    fn default() -> Self {
        Self::new(AccessControlProvider::new(
            "default",
            Arc::new(super::AllowAll),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessRule, DenyAll, RuleBasedAccessControl};

    fn rule_gate(rules: &[AccessRule]) -> AccessControlGate {
        let acl = RuleBasedAccessControl::new(rules).unwrap();
        AccessControlGate::new(AccessControlProvider::new("acl", Arc::new(acl)))
    }

    #[test]
    fn test_explicit_decision_is_final() {
        let gate = rule_gate(&[AccessRule::new(RuleEffect::Allow).for_user("alice")])
            .with_default(RuleEffect::Deny);
        let decision = gate
            .authorize(
                Operation::Consume,
                &Subject::new("alice"),
                &ObjectAttributes::named("q"),
            )
            .unwrap();
        assert_eq!(decision, AccessDecision::Allowed);
    }

    #[test]
    fn test_defer_falls_back_to_default() {
        let gate = rule_gate(&[]);
        let subject = Subject::new("bob");
        let object = ObjectAttributes::named("q");

        assert_eq!(gate.default_decision(), AccessDecision::Denied);
        assert_eq!(
            gate.authorize(Operation::Get, &subject, &object).unwrap(),
            AccessDecision::Denied
        );

        let gate = gate.with_default(RuleEffect::Allow);
        assert_eq!(
            gate.authorize(Operation::Get, &subject, &object).unwrap(),
            AccessDecision::Allowed
        );
    }

    #[test]
    fn test_check_maps_denial_to_error() {
        let gate = AccessControlGate::new(AccessControlProvider::new("deny", Arc::new(DenyAll)))
            .with_default(RuleEffect::Allow);
        let err = gate
            .check(
                Operation::Deliver,
                &Subject::new("carol"),
                &ObjectAttributes::named("orders"),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            AmqError::AccessDenied {
                operation: Operation::Deliver,
                ..
            }
        ));
    }

    #[test]
    fn test_stopped_provider_refuses_with_config_error() {
        let gate = AccessControlGate::default();
        gate.set_provider_state(ProviderState::Stopped).unwrap();
        let result = gate.authorize(
            Operation::Publish,
            &Subject::new("dave"),
            &ObjectAttributes::named("x"),
        );
        assert!(matches!(result, Err(AmqError::Config(_))));

        gate.set_provider_state(ProviderState::Active).unwrap();
        assert!(gate
            .check(Operation::Publish, &Subject::new("dave"), &ObjectAttributes::named("x"))
            .is_ok());
    }

    #[test]
    fn test_clones_share_provider() {
        let gate = AccessControlGate::default();
        let clone = gate.clone();
        gate.replace_provider(AccessControlProvider::new("deny", Arc::new(DenyAll)))
            .unwrap();
        assert!(clone
            .check(Operation::Get, &Subject::new("erin"), &ObjectAttributes::named("q"))
            .is_err());
    }
}
