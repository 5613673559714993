//! Typed access to tool call input.

use serde_json::Value;

use crate::error::{BuddyError, Result};

/// Wrapper around a tool call's input providing typed extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolArguments {
    value: Value,
}

impl ToolArguments {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    pub fn raw(&self) -> &Value {
        &self.value
    }

    pub fn into_inner(self) -> Value {
        self.value
    }

    pub fn get_str(&self, key: &str) -> Result<&str> {
        self.get_str_opt(key)
            .ok_or_else(|| BuddyError::InvalidArgument(format!("Missing string argument: {key}")))
    }

    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Result<i64> {
        self.value
            .get(key)
            .and_then(Value::as_i64)
            .ok_or_else(|| BuddyError::InvalidArgument(format!("Missing integer argument: {key}")))
    }

    pub fn get_bool_opt(&self, key: &str) -> Option<bool> {
        self.value.get(key).and_then(Value::as_bool)
    }

    /// Deserialize the whole input into a typed struct.
    ///
    /// A string input is parsed as JSON first; an empty string is `{}`.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let value = match &self.value {
            Value::String(raw) if raw.trim().is_empty() => Value::Object(Default::default()),
            Value::String(raw) => serde_json::from_str(raw.trim()).map_err(|e| {
                BuddyError::InvalidArgument(format!("Failed to deserialize arguments: {e}"))
            })?,
            other => other.clone(),
        };
        serde_json::from_value(value)
            .map_err(|e| BuddyError::InvalidArgument(format!("Failed to deserialize arguments: {e}")))
    }
}
