//! Explicit catalog of tools and agents, built once per runtime.

use std::sync::Arc;

use super::tool::Tool;
use super::types::ToolDefinition;
use crate::agent::AgentCatalog;
use crate::permission::{disabled, PermissionRule};

#[derive(Clone, Default)]
pub struct Registry {
    tools: Vec<Arc<dyn Tool>>,
    agents: AgentCatalog,
}

impl Registry {
    pub fn new(tools: Vec<Arc<dyn Tool>>, agents: AgentCatalog) -> Self {
        let mut registry = Self {
            tools: Vec::new(),
            agents,
        };
        for tool in tools {
            registry.register(tool);
        }
        registry
    }

    /// Add a tool, replacing any tool with the same id.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|existing| existing.id() != tool.id());
        self.tools.push(tool);
    }

    pub fn agents(&self) -> &AgentCatalog {
        &self.agents
    }

    pub fn tool(&self, id: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|tool| tool.id() == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.tools.iter().map(|tool| tool.id()).collect()
    }

    /// Tools not fully disabled by `ruleset`.
    pub fn tools_for(&self, ruleset: &[PermissionRule]) -> Vec<Arc<dyn Tool>> {
        let off = disabled(self.ids(), ruleset);
        self.tools
            .iter()
            .filter(|tool| !off.contains(tool.id()))
            .cloned()
            .collect()
    }

    pub fn definitions(&self, ruleset: &[PermissionRule]) -> Vec<ToolDefinition> {
        self.tools_for(ruleset)
            .iter()
            .map(|tool| tool.definition())
            .collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("tools", &self.ids())
            .field("agents", &self.agents)
            .finish()
    }
}
