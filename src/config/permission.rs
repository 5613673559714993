//! User permission table with document order preserved.
//!
//! ```toml
//! [permission]
//! "*" = "allow"
//! edit = "ask"
//! read = { "*" = "allow", "*.env" = "ask" }
//! ```

use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::permission::PermissionAction;

/// Value of one permission entry: a blanket action or per-pattern actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionValue {
    Action(PermissionAction),
    Patterns(Vec<(String, PermissionAction)>),
}

/// Ordered `permission -> value` entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionConfig(Vec<(String, PermissionValue)>);

impl PermissionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[(String, PermissionValue)] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, permission: impl Into<String>, value: PermissionValue) {
        self.0.push((permission.into(), value));
    }

    /// Append every entry of `other` after the current ones.
    pub fn extend(&mut self, other: PermissionConfig) {
        self.0.extend(other.0);
    }
}

fn parse_action<E: de::Error>(value: &str) -> Result<PermissionAction, E> {
    value
        .parse::<PermissionAction>()
        .map_err(|_| E::custom(format!("unknown permission action '{value}'")))
}

impl<'de> Deserialize<'de> for PermissionValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = PermissionValue;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("\"allow\", \"ask\", \"deny\", or a table of pattern actions")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                parse_action(value).map(PermissionValue::Action)
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut patterns = Vec::new();
                while let Some((pattern, action)) = map.next_entry::<String, String>()? {
                    patterns.push((pattern, parse_action(&action)?));
                }
                Ok(PermissionValue::Patterns(patterns))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

impl Serialize for PermissionValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Action(action) => serializer.serialize_str(&action.to_string()),
            Self::Patterns(patterns) => {
                let mut map = serializer.serialize_map(Some(patterns.len()))?;
                for (pattern, action) in patterns {
                    map.serialize_entry(pattern, &action.to_string())?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for PermissionConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ConfigVisitor;

        impl<'de> Visitor<'de> for ConfigVisitor {
            type Value = PermissionConfig;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a table of permission entries")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some(entry) = map.next_entry::<String, PermissionValue>()? {
                    entries.push(entry);
                }
                Ok(PermissionConfig(entries))
            }
        }

        deserializer.deserialize_map(ConfigVisitor)
    }
}

impl Serialize for PermissionConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (permission, value) in &self.0 {
            map.serialize_entry(permission, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn json_entries_keep_document_order() {
        let config: PermissionConfig = serde_json::from_str(
            r#"{"read": {"*": "allow", "*.env": "ask"}, "*": "deny", "edit": "ask"}"#,
        )
        .unwrap();
        assert_eq!(
            config.entries(),
            &[
                (
                    "read".to_string(),
                    PermissionValue::Patterns(vec![
                        ("*".to_string(), PermissionAction::Allow),
                        ("*.env".to_string(), PermissionAction::Ask),
                    ])
                ),
                ("*".to_string(), PermissionValue::Action(PermissionAction::Deny)),
                ("edit".to_string(), PermissionValue::Action(PermissionAction::Ask)),
            ]
        );
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = serde_json::from_str::<PermissionConfig>(r#"{"read": "maybe"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown permission action"));
    }
}
