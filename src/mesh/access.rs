//! Namespace access rules.
//!
//! Rules are `(from, to, action, reason?)` tuples whose `from`/`to` are
//! namespace expressions with Relay-style wildcards. Evaluation is
//! deny-first; absent rules default to allow within a namespace and deny
//! across namespaces.

use serde::{Deserialize, Serialize};

use crate::relay::subject::SubjectPattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRule {
    pub from: String,
    pub to: String,
    pub action: AccessAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn pattern_matches(pattern: &str, namespace: &str) -> bool {
    SubjectPattern::compile(pattern)
        .map(|p| p.matches(namespace))
        .unwrap_or(false)
}

impl AccessRule {
    pub fn applies(&self, from_ns: &str, to_ns: &str) -> bool {
        pattern_matches(&self.from, from_ns) && pattern_matches(&self.to, to_ns)
    }

    /// Does this rule reference the namespace on either side?
    pub fn mentions(&self, namespace: &str) -> bool {
        pattern_matches(&self.from, namespace) || pattern_matches(&self.to, namespace)
    }
}

/// Deny-first evaluation: any matching deny rule wins, then any matching
/// allow; otherwise same-namespace access is allowed and cross-namespace
/// access is denied.
pub fn evaluate(rules: &[AccessRule], from_ns: &str, to_ns: &str) -> bool {
    if rules
        .iter()
        .any(|r| r.action == AccessAction::Deny && r.applies(from_ns, to_ns))
    {
        return false;
    }
    if rules
        .iter()
        .any(|r| r.action == AccessAction::Allow && r.applies(from_ns, to_ns))
    {
        return true;
    }
    from_ns == to_ns
}
