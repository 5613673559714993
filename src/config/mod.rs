//! Configuration system (layered: defaults < TOML file < environment).

pub mod permission;

pub use permission::{PermissionConfig, PermissionValue};

use std::path::{Path, PathBuf};

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::error::{BuddyError, Result};

pub const DEFAULT_CONTEXT_LIMIT: u64 = 128_000;
pub const DEFAULT_OUTPUT_LIMIT: u64 = 32_000;
pub const DEFAULT_TASK_WAIT_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_TASK_POLL_INTERVAL_MS: u64 = 150;

/// Top-level configuration for the execution core.
#[derive(Debug, Clone, Default, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct BuddyConfig {
    #[builder(default)]
    pub processor: ProcessorConfig,
    #[builder(default)]
    pub compaction: CompactionConfig,
    #[builder(default)]
    pub limits: ModelLimits,
    #[builder(default)]
    pub task: TaskConfig,
    #[builder(default)]
    pub session: SessionConfig,
    /// User permission rules, appended after agent defaults.
    #[builder(default)]
    pub permission: PermissionConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Keep looping after the user rejects a tool call.
    pub continue_loop_on_deny: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub prune: bool,
    pub auto: bool,
    pub reserved: Option<u64>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            prune: true,
            auto: true,
            reserved: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelLimits {
    pub context: u64,
    pub output: u64,
}

impl Default for ModelLimits {
    fn default() -> Self {
        Self {
            context: DEFAULT_CONTEXT_LIMIT,
            output: DEFAULT_OUTPUT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub wait_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: DEFAULT_TASK_WAIT_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_TASK_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Generate a session title from the first user message.
    pub auto_title: bool,
}

fn truthy(value: Option<String>) -> bool {
    value
        .map(|v| v.to_ascii_lowercase())
        .is_some_and(|v| v == "true" || v == "1")
}

fn positive_integer(value: Option<String>) -> Option<u64> {
    value?.trim().parse::<u64>().ok().filter(|v| *v > 0)
}

impl BuddyConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| BuddyError::Configuration(e.to_string()))
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            BuddyError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    /// Load from `BUDDY_CONFIG` (if set) and apply environment flags.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let mut config = match std::env::var("BUDDY_CONFIG") {
            Ok(path) => Self::load(PathBuf::from(path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment flags read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if truthy(lookup("BUDDY_DISABLE_PRUNE")) {
            self.compaction.prune = false;
        }
        if truthy(lookup("BUDDY_DISABLE_AUTOCOMPACT")) {
            self.compaction.auto = false;
        }
        if truthy(lookup("BUDDY_CONTINUE_LOOP_ON_DENY")) {
            self.processor.continue_loop_on_deny = true;
        }
        if let Some(output) = positive_integer(lookup("BUDDY_EXPERIMENTAL_OUTPUT_TOKEN_MAX")) {
            self.limits.output = output;
        }
        if let Some(inline) = lookup("BUDDY_PERMISSION") {
            self.permission.extend(parse_inline_permission(&inline)?);
        }
        Ok(())
    }
}

fn parse_inline_permission(source: &str) -> Result<PermissionConfig> {
    let trimmed = source.trim();
    if trimmed.starts_with('{') {
        if let Ok(config) = serde_json::from_str(trimmed) {
            return Ok(config);
        }
    }
    toml::from_str(trimmed)
        .map_err(|e| BuddyError::Configuration(format!("invalid BUDDY_PERMISSION: {e}")))
}
