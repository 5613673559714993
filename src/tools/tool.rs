//! Tool trait, execution context, and closure-based tool wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::arguments::ToolArguments;
use super::truncation::truncate_output;
use super::types::{ToolDefinition, ToolOutput, ToolParameters};
use super::validation::validate_arguments;
use crate::bus::BusEvent;
use crate::error::{BuddyError, Result};
use crate::permission::{AskInput, Ruleset, ToolRef};
use crate::runtime::Runtime;
use crate::types::{Metadata, MessageId, MessageWithParts, Part, PartId, ProjectId, SessionId};

/// Permission prompt raised from inside a tool.
#[derive(Debug, Clone, Default)]
pub struct ToolAsk {
    pub permission: String,
    pub patterns: Vec<String>,
    pub always: Vec<String>,
    pub metadata: Metadata,
}

/// Progress written to the running tool part's side channel.
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    pub title: Option<String>,
    pub metadata: Metadata,
}

/// Context available during tool execution.
#[derive(Clone)]
pub struct ToolContext {
    pub project: ProjectId,
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub part_id: PartId,
    pub call_id: String,
    pub agent: String,
    /// Cancelled when the owning turn is aborted.
    pub cancel: CancellationToken,
    /// Agent rules merged with the session overrides.
    pub ruleset: Ruleset,
    runtime: Arc<Runtime>,
}

impl ToolContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<Runtime>,
        project: ProjectId,
        session_id: SessionId,
        message_id: MessageId,
        part_id: PartId,
        call_id: impl Into<String>,
        agent: impl Into<String>,
        cancel: CancellationToken,
        ruleset: Ruleset,
    ) -> Self {
        Self {
            project,
            session_id,
            message_id,
            part_id,
            call_id: call_id.into(),
            agent: agent.into(),
            cancel,
            ruleset,
            runtime,
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Ask the permission engine on behalf of this tool call.
    pub async fn ask(&self, ask: ToolAsk) -> Result<()> {
        let input = AskInput {
            session_id: self.session_id.clone(),
            permission: ask.permission,
            patterns: ask.patterns,
            always: ask.always,
            metadata: ask.metadata,
            tool: Some(ToolRef {
                message_id: self.message_id.clone(),
                call_id: self.call_id.clone(),
            }),
            ruleset: self.ruleset.clone(),
        };
        self.runtime.permissions().ask(&self.project, input).await
    }

    /// Merge `update` into the in-flight tool part's metadata and publish it.
    pub fn metadata(&self, update: MetadataUpdate) -> Result<()> {
        let updated = self.runtime.sessions().modify_part(
            &self.project,
            &self.session_id,
            &self.message_id,
            &self.part_id,
            |part| {
                let Some(tool) = part.as_tool_mut() else {
                    return;
                };
                if !tool.state.is_in_flight() {
                    return;
                }
                let slot = tool.metadata.get_or_insert_with(Metadata::new);
                if let Some(title) = &update.title {
                    slot.insert("title".into(), Value::String(title.clone()));
                }
                slot.extend(update.metadata.clone());
            },
        )?;
        if let Some(part) = updated {
            self.runtime
                .bus()
                .publish(&self.project, BusEvent::PartUpdated { part });
        }
        Ok(())
    }

    /// Conversation history of the calling session.
    pub fn messages(&self) -> Result<Vec<MessageWithParts>> {
        self.runtime
            .sessions()
            .list_messages(&self.project, &self.session_id)
    }

    /// Stored tool part this call is writing to.
    pub fn part(&self) -> Result<Option<Part>> {
        self.runtime.sessions().get_part(
            &self.project,
            &self.session_id,
            &self.message_id,
            &self.part_id,
        )
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("project", &self.project)
            .field("session_id", &self.session_id)
            .field("message_id", &self.message_id)
            .field("call_id", &self.call_id)
            .field("agent", &self.agent)
            .finish_non_exhaustive()
    }
}

/// Core tool trait: implement to expose a capability to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool id (must match what the model calls).
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema parameters.
    fn parameters(&self) -> &ToolParameters;

    async fn execute(&self, args: &ToolArguments, ctx: &ToolContext) -> Result<ToolOutput>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.id().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters().schema.clone(),
        }
    }
}

/// Validate, execute under the turn's cancellation, and truncate the output.
pub async fn invoke(tool: &dyn Tool, input: Value, ctx: &ToolContext) -> Result<ToolOutput> {
    validate_arguments(&input, &tool.parameters().schema).map_err(|reason| {
        BuddyError::InvalidToolInput {
            tool: tool.id().to_string(),
            reason,
        }
    })?;
    let args = ToolArguments::new(input);
    let mut output = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Err(BuddyError::Aborted),
        result = tool.execute(&args, ctx) => result?,
    };
    if !output.metadata.contains_key("truncated") {
        let truncated = truncate_output(&output.output);
        output.output = truncated.content;
        output
            .metadata
            .insert("truncated".into(), Value::Bool(truncated.truncated));
    }
    Ok(output)
}

type ToolHandler = dyn Fn(ToolArguments, ToolContext) -> Pin<Box<dyn Future<Output = Result<ToolOutput>> + Send>>
    + Send
    + Sync;

/// Closure-based tool for quick tool creation.
pub struct AgentTool {
    id: String,
    description: String,
    parameters: ToolParameters,
    handler: Arc<ToolHandler>,
}

impl AgentTool {
    pub fn new<F, Fut>(
        id: impl Into<String>,
        description: impl Into<String>,
        parameters: ToolParameters,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolArguments, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        Self {
            id: id.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }

    async fn execute(&self, args: &ToolArguments, ctx: &ToolContext) -> Result<ToolOutput> {
        (self.handler)(args.clone(), ctx.clone()).await
    }
}

impl std::fmt::Debug for AgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTool")
            .field("id", &self.id)
            .field("description", &self.description)
            .finish()
    }
}
