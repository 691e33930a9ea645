use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{PermissionId, SessionId};

/// Disposition of a permission rule or reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionAction {
    Allow,
    Deny,
    Ask,
}

/// One rule; first match wins during evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub pattern: String,
    pub action: PermissionAction,
}

impl PermissionRule {
    pub fn new(pattern: impl Into<String>, action: PermissionAction) -> Self {
        Self {
            pattern: pattern.into(),
            action,
        }
    }
}

/// Wildcard match: `*` spans any run of characters, everything else is
/// literal. Anchored at both ends.
pub fn pattern_matches(pattern: &str, key: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == key;
    }

    let first = segments[0];
    if !key.starts_with(first) {
        return false;
    }
    let last = segments[segments.len() - 1];
    if !key.ends_with(last) || key.len() < first.len() + last.len() {
        return false;
    }

    let mut rest = &key[first.len()..key.len() - last.len()];
    for segment in &segments[1..segments.len() - 1] {
        if segment.is_empty() {
            continue;
        }
        match rest.find(segment) {
            Some(at) => rest = &rest[at + segment.len()..],
            None => return false,
        }
    }
    true
}

/// Evaluate a key against layered rulesets, most specific first
/// (session, then agent, then project). Default is `Ask`.
pub fn evaluate(key: &str, layers: &[&[PermissionRule]]) -> PermissionAction {
    for rules in layers {
        for rule in *rules {
            if pattern_matches(&rule.pattern, key) {
                return rule.action;
            }
        }
    }
    PermissionAction::Ask
}

/// Payload of a `permission.updated` event awaiting a reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: PermissionId,
    pub session_id: SessionId,
    pub call_id: String,
    pub tool: String,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// User's answer to a pending ask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionReply {
    Once,
    /// Allow now and append an allow rule to the session override ruleset.
    Always,
    Reject,
}
