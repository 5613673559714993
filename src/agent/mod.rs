//! Agent definitions and the default catalog.

use bon::Builder;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::config::{PermissionConfig, PermissionValue};
use crate::error::{BuddyError, Result};
use crate::permission::{from_config, merge, PermissionAction, PermissionRule, Ruleset};

pub const DEFAULT_AGENT: &str = "build";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AgentMode {
    Primary,
    Subagent,
    All,
}

/// An agent: a named permission ruleset plus loop settings.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct AgentInfo {
    #[builder(into)]
    pub name: String,
    #[builder(into)]
    pub description: Option<String>,
    pub mode: AgentMode,
    #[builder(default)]
    pub permission: Ruleset,
    /// Configured step limit; clamped by the processor.
    pub steps: Option<i64>,
    #[builder(into)]
    pub prompt: Option<String>,
    #[builder(default)]
    pub hidden: bool,
}

impl AgentInfo {
    pub fn is_subagent(&self) -> bool {
        self.mode == AgentMode::Subagent
    }

    /// Whether any rule keeps the `task` tool usable for this agent.
    pub fn allows_task(&self) -> bool {
        self.permission
            .iter()
            .any(|rule| rule.permission == "task" && rule.action != PermissionAction::Deny)
    }
}

fn table(entries: &[(&str, PermissionAction)]) -> PermissionConfig {
    let mut config = PermissionConfig::new();
    for (permission, action) in entries {
        config.push(*permission, PermissionValue::Action(*action));
    }
    config
}

/// Rules every built-in agent starts from.
pub fn base_rules() -> Ruleset {
    use PermissionAction::{Allow, Ask, Deny};
    let mut config = table(&[
        ("*", Allow),
        ("doom_loop", Ask),
        ("question", Deny),
        ("plan_enter", Deny),
        ("plan_exit", Deny),
    ]);
    config.push(
        "external_directory",
        PermissionValue::Patterns(vec![("*".into(), Ask)]),
    );
    config.push(
        "read",
        PermissionValue::Patterns(vec![
            ("*".into(), Allow),
            ("*.env".into(), Ask),
            ("*.env.*".into(), Ask),
            ("*.env.example".into(), Allow),
        ]),
    );
    from_config(&config)
}

/// Explicit agent registry, built once and shared by reference.
#[derive(Debug, Clone, Default)]
pub struct AgentCatalog {
    agents: Vec<AgentInfo>,
}

impl AgentCatalog {
    pub fn new(agents: Vec<AgentInfo>) -> Self {
        Self { agents }
    }

    /// Built-in `build` and `general` agents with `user_rules` appended.
    pub fn with_defaults(user_rules: &[PermissionRule]) -> Self {
        let base = base_rules();
        let build = AgentInfo::builder()
            .name("build")
            .description("The default agent. Executes tools based on configured permissions.")
            .mode(AgentMode::Primary)
            .permission(merge(&[
                &base,
                &[PermissionRule::allow("question", "*")],
                user_rules,
            ]))
            .steps(8)
            .build();
        let general = AgentInfo::builder()
            .name("general")
            .description("General-purpose subagent for research and multi-step execution.")
            .mode(AgentMode::Subagent)
            .permission(merge(&[
                &base,
                &[
                    PermissionRule::deny("todoread", "*"),
                    PermissionRule::deny("todowrite", "*"),
                ],
                user_rules,
            ]))
            .build();
        Self::new(vec![build, general])
    }

    pub fn get(&self, name: &str) -> Option<&AgentInfo> {
        self.agents.iter().find(|agent| agent.name == name)
    }

    pub fn require(&self, name: &str) -> Result<&AgentInfo> {
        self.get(name)
            .ok_or_else(|| BuddyError::UnknownAgent(name.to_string()))
    }

    /// Agents with the default agent first.
    pub fn list(&self) -> Vec<&AgentInfo> {
        let mut agents: Vec<&AgentInfo> = self.agents.iter().collect();
        agents.sort_by_key(|agent| agent.name != DEFAULT_AGENT);
        agents
    }

    pub fn subagents(&self) -> impl Iterator<Item = &AgentInfo> {
        self.agents.iter().filter(|agent| agent.mode != AgentMode::Primary)
    }

    /// Name of the agent used when a prompt does not pick one.
    pub fn default_agent(&self) -> Result<&str> {
        if let Some(build) = self.get(DEFAULT_AGENT) {
            if !build.is_subagent() && !build.hidden {
                return Ok(&build.name);
            }
        }
        self.agents
            .iter()
            .find(|agent| !agent.is_subagent() && !agent.hidden)
            .map(|agent| agent.name.as_str())
            .ok_or_else(|| BuddyError::Configuration("No primary agent found".into()))
    }

    pub fn insert(&mut self, agent: AgentInfo) {
        self.agents.retain(|existing| existing.name != agent.name);
        self.agents.push(agent);
    }
}
