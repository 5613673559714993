//! Permission rules, wildcard matching, and ruleset evaluation.
//!
//! A ruleset is an ordered list. Evaluation scans from the end, so rules
//! merged later take precedence; there is no pattern-specificity ranking.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::config::{PermissionConfig, PermissionValue};

/// What a matching rule decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    Ask,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub permission: String,
    pub pattern: String,
    pub action: PermissionAction,
}

impl PermissionRule {
    pub fn new(
        permission: impl Into<String>,
        pattern: impl Into<String>,
        action: PermissionAction,
    ) -> Self {
        Self {
            permission: permission.into(),
            pattern: pattern.into(),
            action,
        }
    }

    pub fn allow(permission: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(permission, pattern, PermissionAction::Allow)
    }

    pub fn ask(permission: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(permission, pattern, PermissionAction::Ask)
    }

    pub fn deny(permission: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(permission, pattern, PermissionAction::Deny)
    }
}

/// Ordered list of rules; later entries win.
pub type Ruleset = Vec<PermissionRule>;

/// Tool ids that share the `edit` permission.
const EDIT_TOOLS: [&str; 4] = ["edit", "write", "patch", "multiedit"];

/// Glob-style match of `value` against `pattern`.
///
/// `*` matches any run of characters (including newlines), `?` matches one
/// character, everything else is literal. The whole value must match.
pub fn wildcard_match(value: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push_str("(?s)^");
    for ch in pattern.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    source.push('$');
    match regex::Regex::new(&source) {
        Ok(re) => re.is_match(value),
        Err(err) => {
            tracing::warn!(pattern, error = %err, "invalid permission pattern");
            false
        }
    }
}

/// Concatenate rulesets in argument order.
pub fn merge(rulesets: &[&[PermissionRule]]) -> Ruleset {
    rulesets.iter().flat_map(|set| set.iter().cloned()).collect()
}

/// Find the deciding rule for `(permission, pattern)`.
///
/// Scans the concatenation of `rulesets` from the end and returns the first
/// rule whose permission and pattern both match. Falls back to an implicit
/// `ask` for the permission.
pub fn evaluate(permission: &str, pattern: &str, rulesets: &[&[PermissionRule]]) -> PermissionRule {
    rulesets
        .iter()
        .rev()
        .flat_map(|set| set.iter().rev())
        .find(|rule| wildcard_match(permission, &rule.permission) && wildcard_match(pattern, &rule.pattern))
        .cloned()
        .unwrap_or_else(|| PermissionRule::ask(permission, "*"))
}

/// Tool ids that are fully disabled by `ruleset`.
///
/// A tool is disabled when the last rule matching its permission (pattern
/// ignored) is exactly `{pattern: "*", action: deny}`.
pub fn disabled<'a>(tool_ids: impl IntoIterator<Item = &'a str>, ruleset: &[PermissionRule]) -> BTreeSet<String> {
    tool_ids
        .into_iter()
        .filter(|tool| {
            let permission = if EDIT_TOOLS.contains(tool) { "edit" } else { tool };
            ruleset
                .iter()
                .rev()
                .find(|rule| wildcard_match(permission, &rule.permission))
                .is_some_and(|rule| rule.pattern == "*" && rule.action == PermissionAction::Deny)
        })
        .map(str::to_string)
        .collect()
}

/// Convert user configuration into a ruleset, preserving document order.
pub fn from_config(config: &PermissionConfig) -> Ruleset {
    let home = directories::UserDirs::new().map(|dirs| dirs.home_dir().to_path_buf());
    let mut rules = Vec::new();
    for (permission, value) in config.entries() {
        match value {
            PermissionValue::Action(action) => rules.push(PermissionRule::new(permission, "*", *action)),
            PermissionValue::Patterns(patterns) => {
                for (pattern, action) in patterns {
                    let pattern = expand_home(pattern, home.as_deref());
                    rules.push(PermissionRule::new(permission, pattern, *action));
                }
            }
        }
    }
    rules
}

fn expand_home(pattern: &str, home: Option<&Path>) -> String {
    let Some(home) = home else {
        return pattern.to_string();
    };
    let home = home.to_string_lossy();
    if pattern == "~" {
        return home.into_owned();
    }
    if let Some(rest) = pattern.strip_prefix("~/") {
        return format!("{home}/{rest}");
    }
    if let Some(rest) = pattern.strip_prefix("$HOME") {
        return format!("{home}{rest}");
    }
    pattern.to_string()
}
