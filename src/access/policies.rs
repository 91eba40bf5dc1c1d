//! Built-in access-control policies.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{AccessControl, AccessDecision, ObjectAttributes, Operation, Subject};
use crate::error::Result;

/// Allows every operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn authorize(&self, _: Operation, _: &Subject, _: &ObjectAttributes) -> AccessDecision {
        AccessDecision::Allowed
    }

    fn kind(&self) -> &'static str {
        "allow-all"
    }
}

/// Denies every operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl AccessControl for DenyAll {
    fn authorize(&self, _: Operation, _: &Subject, _: &ObjectAttributes) -> AccessDecision {
        AccessDecision::Denied
    }

    fn kind(&self) -> &'static str {
        "deny-all"
    }
}

/// What a matching rule decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleEffect {
    /// Allow the operation
    Allow,
    /// Deny the operation
    Deny,
}

/// One access rule as written in configuration.
///
/// ```toml
/// [[access.rules]]
/// effect = "deny"
/// user = "guest"
/// operation = "consume"
/// object = "^audit\\."
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    /// Decision when the rule matches
    pub effect: RuleEffect,
    /// User name; absent or `*` matches anyone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Operation; absent matches every operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    /// Regex over the object name; absent matches every object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
}

impl AccessRule {
    /// Rule with no constraints
    pub fn new(effect: RuleEffect) -> Self {
        Self {
            effect,
            user: None,
            operation: None,
            object: None,
        }
    }

    /// Restrict to one user
    pub fn for_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    /// Restrict to one operation
    pub fn for_operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Restrict to objects whose name matches `pattern`
    pub fn for_object(mut self, pattern: &str) -> Self {
        self.object = Some(pattern.to_string());
        self
    }
}

#[derive(Debug)]
struct CompiledRule {
    effect: RuleEffect,
    user: Option<String>,
    operation: Option<Operation>,
    object: Option<Regex>,
}

impl CompiledRule {
    fn matches(&self, operation: Operation, subject: &Subject, object: &ObjectAttributes) -> bool {
        let user_ok = match self.user.as_deref() {
            None | Some("*") => true,
            Some(user) => user == subject.user,
        };
        let op_ok = self.operation.map_or(true, |op| op == operation);
        let object_ok = self
            .object
            .as_ref()
            .map_or(true, |re| re.is_match(&object.name));
        user_ok && op_ok && object_ok
    }
}

/// Ordered rule list; the first matching rule decides, no match defers.
#[derive(Debug)]
pub struct RuleBasedAccessControl {
    rules: Vec<CompiledRule>,
}

impl RuleBasedAccessControl {
    /// Compile the rules. Fails on an invalid object pattern.
    pub fn new(rules: &[AccessRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| -> Result<CompiledRule> {
                Ok(CompiledRule {
                    effect: rule.effect,
                    user: rule.user.clone(),
                    operation: rule.operation,
                    object: rule.object.as_deref().map(Regex::new).transpose()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether there are no rules
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl AccessControl for RuleBasedAccessControl {
    fn authorize(
        &self,
        operation: Operation,
        subject: &Subject,
        object: &ObjectAttributes,
    ) -> AccessDecision {
        self.rules
            .iter()
            .find(|rule| rule.matches(operation, subject, object))
            .map_or(AccessDecision::Defer, |rule| match rule.effect {
                RuleEffect::Allow => AccessDecision::Allowed,
                RuleEffect::Deny => AccessDecision::Denied,
            })
    }

    fn kind(&self) -> &'static str {
        "rules"
    }
}
