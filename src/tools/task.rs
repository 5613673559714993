//! Delegation tool: runs a sub-agent in a child session and reports its answer.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::arguments::ToolArguments;
use super::tool::{MetadataUpdate, Tool, ToolAsk, ToolContext};
use super::types::{ToolOutput, ToolParameters};
use crate::agent::{AgentCatalog, AgentInfo, AgentMode};
use crate::error::{BuddyError, Result};
use crate::permission::{PermissionRule, Ruleset};
use crate::runtime::PromptInput;
use crate::session::CreateSession;
use crate::types::{Metadata, MessageWithParts, Part, SessionId, ToolState};

pub const TASK_TOOL_ID: &str = "task";

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);
const NO_TEXT_OUTPUT: &str = "Sub-agent completed without text output.";

const DESCRIPTION: &str = "Launch a new agent to handle complex, multistep tasks autonomously.

Available agent types and the tools they have access to:
{agents}

When using the Task tool, you must specify a subagent_type parameter to select which agent type to use.

Usage notes:
1. Launch multiple agents concurrently whenever possible.
2. When the agent is done, it will return a single message back to you. The result returned by the agent is not visible to the user; send the user a short summary of it.
3. Each agent invocation starts fresh unless you provide task_id to resume the same subagent session.
4. Clearly tell the agent whether you expect it to write code or just to do research.";

#[derive(Debug, Deserialize)]
struct TaskParams {
    description: String,
    prompt: String,
    subagent_type: String,
    #[serde(default)]
    task_id: Option<String>,
}

#[derive(Debug)]
pub struct TaskTool {
    description: String,
    parameters: ToolParameters,
}

impl TaskTool {
    /// Build the tool, listing the catalog's sub-agents in its description.
    pub fn new(agents: &AgentCatalog) -> Self {
        let listing = agents
            .subagents()
            .map(|agent| {
                format!(
                    "- {}: {}",
                    agent.name,
                    agent
                        .description
                        .as_deref()
                        .unwrap_or("This subagent should only be called manually by the user.")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            description: DESCRIPTION.replace("{agents}", &listing),
            parameters: ToolParameters::object()
                .string("description", "A short (3-5 words) description of the task", true)
                .string("prompt", "The task for the agent to perform", true)
                .string("subagent_type", "The type of specialized agent to use for this task", true)
                .string(
                    "task_id",
                    "Only set this to resume a previous task; the task continues the same subagent session",
                    false,
                )
                .string("command", "The command that triggered this task", false)
                .build(),
        }
    }
}

/// Overrides applied to a fresh child session.
fn child_overrides(allows_task: bool) -> Ruleset {
    let mut rules = vec![
        PermissionRule::deny("todowrite", "*"),
        PermissionRule::deny("todoread", "*"),
    ];
    if !allows_task {
        rules.push(PermissionRule::deny(TASK_TOOL_ID, "*"));
    }
    rules
}

fn child_toggles(allows_task: bool) -> Vec<(String, bool)> {
    let mut toggles = vec![("todowrite".to_string(), false), ("todoread".to_string(), false)];
    if !allows_task {
        toggles.push((TASK_TOOL_ID.to_string(), false));
    }
    toggles
}

fn progress(history: &[MessageWithParts]) -> Value {
    let (mut pending, mut running, mut completed, mut error) = (0, 0, 0, 0);
    for tool in history
        .iter()
        .flat_map(|message| message.parts.iter())
        .filter_map(Part::as_tool)
    {
        match tool.state {
            ToolState::Pending { .. } => pending += 1,
            ToolState::Running { .. } => running += 1,
            ToolState::Completed { .. } => completed += 1,
            ToolState::Error { .. } => error += 1,
        }
    }
    json!({
        "messages": history.len(),
        "tools": { "pending": pending, "running": running, "completed": completed, "error": error },
    })
}

/// Text of the child's last assistant message, or a summary of its tool outcomes.
fn assistant_result(history: &[MessageWithParts]) -> String {
    let Some(last) = history.iter().rev().find(|message| !message.info.is_user()) else {
        return String::new();
    };
    let text = last
        .parts
        .iter()
        .filter_map(Part::as_text)
        .map(|part| part.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let text = text.trim();
    if !text.is_empty() {
        return text.to_string();
    }

    let mut lines = vec![NO_TEXT_OUTPUT.to_string(), "Tool outcomes:".to_string()];
    let tools: Vec<_> = last.parts.iter().filter_map(Part::as_tool).collect();
    for tool in &tools {
        if let ToolState::Completed { .. } = tool.state {
            lines.push(format!("- {}: completed", tool.tool));
        }
    }
    for tool in &tools {
        if let ToolState::Error { error, .. } = &tool.state {
            lines.push(format!("- {}: error ({error})", tool.tool));
        }
    }
    if lines.len() == 2 {
        lines.push("- No tool outputs were recorded.".to_string());
    }
    lines.join("\n")
}

fn metadata_of(value: Value) -> Metadata {
    match value {
        Value::Object(map) => map,
        _ => Metadata::new(),
    }
}

impl TaskTool {
    fn resolve_agent(&self, ctx: &ToolContext, name: &str) -> Result<AgentInfo> {
        ctx.runtime()
            .registry()
            .agents()
            .get(name)
            .filter(|agent| agent.mode != AgentMode::Primary)
            .cloned()
            .ok_or_else(|| BuddyError::UnknownAgent(name.to_string()))
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn id(&self) -> &str {
        TASK_TOOL_ID
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }

    async fn execute(&self, args: &ToolArguments, ctx: &ToolContext) -> Result<ToolOutput> {
        let params: TaskParams = args.deserialize()?;
        ctx.ask(ToolAsk {
            permission: TASK_TOOL_ID.into(),
            patterns: vec![params.subagent_type.clone()],
            always: vec!["*".into()],
            metadata: metadata_of(json!({
                "description": params.description,
                "subagent_type": params.subagent_type,
            })),
        })
        .await?;

        let agent = self.resolve_agent(ctx, &params.subagent_type)?;
        let allows_task = agent.allows_task();
        let runtime = ctx.runtime().clone();
        let sessions = runtime.sessions();

        let resumed = match &params.task_id {
            Some(id) => sessions.get_session(&ctx.project, &SessionId::from(id.as_str()))?,
            None => None,
        };
        let reused = resumed.is_some();
        let child = match resumed {
            Some(session) => session,
            None => sessions.create_session(
                &ctx.project,
                CreateSession {
                    parent_id: Some(ctx.session_id.clone()),
                    title: Some(format!("{} (@{} subagent)", params.description, agent.name)),
                    permission: child_overrides(allows_task),
                },
            )?,
        };
        tracing::debug!(
            parent_session_id = %ctx.session_id,
            child_session_id = %child.id,
            reused,
            subagent = %agent.name,
            "task child session"
        );

        ctx.metadata(MetadataUpdate {
            title: Some(params.description.clone()),
            metadata: metadata_of(json!({
                "phase": "starting",
                "sessionId": child.id,
                "agent": agent.name,
                "reused": reused,
                "progress": progress(&sessions.list_messages(&ctx.project, &child.id)?),
            })),
        })?;

        runtime
            .prompt(
                &ctx.project,
                PromptInput::builder()
                    .session_id(child.id.clone())
                    .text(params.prompt.clone())
                    .agent(agent.name.clone())
                    .tools(child_toggles(allows_task))
                    .parent_cancel(ctx.cancel.clone())
                    .build(),
            )
            .await?;

        let task = &runtime.config().task;
        let mut last_report = Duration::ZERO;
        let waited = runtime
            .wait_for_idle(
                &ctx.project,
                &child.id,
                &ctx.cancel,
                Duration::from_millis(task.wait_timeout_ms),
                Duration::from_millis(task.poll_interval_ms),
                |elapsed, busy| {
                    if busy && elapsed.saturating_sub(last_report) < PROGRESS_INTERVAL {
                        return;
                    }
                    last_report = elapsed;
                    let history = sessions
                        .list_messages(&ctx.project, &child.id)
                        .unwrap_or_default();
                    let update = MetadataUpdate {
                        title: Some(params.description.clone()),
                        metadata: metadata_of(json!({
                            "phase": if busy { "running" } else { "completed" },
                            "elapsedMs": u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                            "sessionId": child.id,
                            "agent": agent.name,
                            "progress": progress(&history),
                        })),
                    };
                    if let Err(err) = ctx.metadata(update) {
                        tracing::debug!(error = %err, "task progress update failed");
                    }
                },
            )
            .await;

        if let Err(err) = waited {
            if let BuddyError::TaskWaitTimeout { elapsed_ms, .. } = &err {
                let aborted = runtime.abort(&ctx.project, &child.id);
                tracing::warn!(
                    parent_session_id = %ctx.session_id,
                    child_session_id = %child.id,
                    elapsed_ms,
                    aborted,
                    "task timed out"
                );
            }
            tracing::error!(
                parent_session_id = %ctx.session_id,
                child_session_id = %child.id,
                subagent = %agent.name,
                error = %err,
                "task failed"
            );
            return Err(err);
        }

        let history = sessions.list_messages(&ctx.project, &child.id)?;
        let output = format!(
            "task_id: {} (for resuming to continue this task if needed)\n\n<task_result>\n{}\n</task_result>",
            child.id,
            assistant_result(&history)
        );
        Ok(ToolOutput {
            title: Some(params.description),
            output,
            metadata: metadata_of(json!({
                "sessionId": child.id,
                "agent": agent.name,
                "reused": reused,
                "truncated": false,
            })),
        })
    }
}
