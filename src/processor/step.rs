//! One model stream: event -> part transitions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde_json::json;

use super::tooling;
use super::TurnContext;
use crate::bus::BusEvent;
use crate::error::{BuddyError, EntityKind, Result};
use crate::llm::{to_model_messages, StreamEvent, StreamRequest, MAX_STEPS_PROMPT};
use crate::permission::Ruleset;
use crate::session::PartDelta;
use crate::tools::{Tool, ToolOutput, TASK_TOOL_ID};
use crate::types::{
    CompletedTime, ErrorTime, FinishReason, MessageInfo, PartId, ReasoningPart,
    RunningTime, StepFinishPart, StepStartPart, TextPart, TimeRange, TokenUsage, ToolPart,
    ToolState,
};

/// What a step observed, used by the loop to decide whether to continue.
#[derive(Debug, Default)]
pub(crate) struct StepOutcome {
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<TokenUsage>,
    pub saw_tool: bool,
    pub saw_task: bool,
    pub saw_text: bool,
    /// A user rejection stopped the loop.
    pub blocked: bool,
}

pub(crate) struct StepRunner<'a> {
    ctx: &'a TurnContext,
    number: usize,
    force_text: bool,
    ruleset: Ruleset,
    tools: Vec<Arc<dyn Tool>>,
    reasoning: HashMap<String, ReasoningPart>,
    text: Option<TextPart>,
    /// Tool parts still waiting for input or a result, by call id.
    calls: HashMap<String, ToolPart>,
    outcome: StepOutcome,
}

impl<'a> StepRunner<'a> {
    pub fn new(ctx: &'a TurnContext, number: usize, force_text: bool) -> Self {
        Self {
            ctx,
            number,
            force_text,
            ruleset: Vec::new(),
            tools: Vec::new(),
            reasoning: HashMap::new(),
            text: None,
            calls: HashMap::new(),
            outcome: StepOutcome::default(),
        }
    }

    pub async fn run(mut self) -> Result<StepOutcome> {
        let request = self.prepare()?;
        let ctx = self.ctx;
        ctx.save_part(StepStartPart {
            id: PartId::new(),
            session_id: ctx.session_id.clone(),
            message_id: ctx.message_id.clone(),
            snapshot: None,
        })?;

        let mut stream = ctx
            .runtime
            .model()
            .stream(request, ctx.cancel.clone())
            .await?;
        loop {
            let event = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(BuddyError::Aborted),
                event = stream.next() => event,
            };
            let Some(event) = event else {
                break;
            };
            self.apply(event).await?;
        }
        Ok(self.outcome)
    }

    fn prepare(&mut self) -> Result<StreamRequest> {
        let ctx = self.ctx;
        let history = ctx.sessions().list_messages(&ctx.project, &ctx.session_id)?;
        self.ruleset = ctx.ruleset()?;
        if !self.force_text {
            self.tools = ctx.runtime.registry().tools_for(&self.ruleset);
        }

        let mut system = Vec::new();
        if let Some(prompt) = &ctx.agent.prompt {
            system.push(prompt.clone());
        }
        let user_system = history.iter().rev().find_map(|message| match &message.info {
            MessageInfo::User(user) => Some(user.system.clone()),
            MessageInfo::Assistant(_) => None,
        });
        if let Some(Some(extra)) = user_system {
            system.push(extra);
        }
        if self.force_text {
            system.push(MAX_STEPS_PROMPT.to_string());
        }

        Ok(StreamRequest {
            session_id: ctx.session_id.clone(),
            message_id: ctx.message_id.clone(),
            agent: ctx.agent.name.clone(),
            system,
            messages: to_model_messages(&history),
            tools: self.tools.iter().map(|tool| tool.definition()).collect(),
            step: self.number,
            force_text_only: self.force_text,
        })
    }

    async fn apply(&mut self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::ReasoningStart { id, metadata } => {
                let part = ReasoningPart {
                    id: PartId::new(),
                    session_id: self.ctx.session_id.clone(),
                    message_id: self.ctx.message_id.clone(),
                    text: String::new(),
                    time: TimeRange::starting_now(),
                    metadata,
                };
                self.ctx.save_part(part.clone())?;
                self.reasoning.insert(id, part);
            }
            StreamEvent::ReasoningDelta { id, text } => {
                if let Some(part) = self.reasoning.get_mut(&id) {
                    part.text.push_str(&text);
                    let part_id = part.id.clone();
                    self.append_delta(part_id, text)?;
                }
            }
            StreamEvent::ReasoningEnd { id, metadata } => {
                if let Some(mut part) = self.reasoning.remove(&id) {
                    part.time.end = Some(Utc::now());
                    if metadata.is_some() {
                        part.metadata = metadata;
                    }
                    self.ctx.save_part(part)?;
                }
            }
            StreamEvent::TextStart { metadata } => {
                let part = TextPart {
                    id: PartId::new(),
                    session_id: self.ctx.session_id.clone(),
                    message_id: self.ctx.message_id.clone(),
                    text: String::new(),
                    synthetic: false,
                    ignored: false,
                    time: Some(TimeRange::starting_now()),
                    metadata,
                };
                self.ctx.save_part(part.clone())?;
                self.text = Some(part);
            }
            StreamEvent::TextDelta { text } => {
                if let Some(part) = self.text.as_mut() {
                    part.text.push_str(&text);
                    let part_id = part.id.clone();
                    self.append_delta(part_id, text)?;
                }
            }
            StreamEvent::TextEnd { metadata } => {
                if let Some(mut part) = self.text.take() {
                    let start = part.time.map_or_else(Utc::now, |time| time.start);
                    part.time = Some(TimeRange {
                        start,
                        end: Some(Utc::now()),
                    });
                    if metadata.is_some() {
                        part.metadata = metadata;
                    }
                    if !part.text.trim().is_empty() {
                        self.outcome.saw_text = true;
                    }
                    self.ctx.save_part(part)?;
                }
            }
            StreamEvent::ToolInputStart { id, tool_name } => {
                let part = ToolPart {
                    id: PartId::new(),
                    session_id: self.ctx.session_id.clone(),
                    message_id: self.ctx.message_id.clone(),
                    tool: tool_name,
                    call_id: id.clone(),
                    state: ToolState::Pending {
                        input: Some(json!({})),
                        raw: Some(String::new()),
                    },
                    metadata: None,
                };
                self.ctx.save_part(part.clone())?;
                self.calls.insert(id, part);
            }
            StreamEvent::ToolCall {
                tool_call_id,
                tool_name,
                input,
                provider_executed,
            } => {
                self.outcome.saw_tool = true;
                if tool_name == TASK_TOOL_ID {
                    self.outcome.saw_task = true;
                }
                let mut part = self.calls.remove(&tool_call_id).unwrap_or_else(|| ToolPart {
                    id: PartId::new(),
                    session_id: self.ctx.session_id.clone(),
                    message_id: self.ctx.message_id.clone(),
                    tool: tool_name.clone(),
                    call_id: tool_call_id.clone(),
                    state: ToolState::Pending {
                        input: None,
                        raw: None,
                    },
                    metadata: None,
                });
                part.tool = tool_name;
                part.state = ToolState::Running {
                    input: input.clone(),
                    time: RunningTime { start: Utc::now() },
                };
                self.ctx.save_part(part.clone())?;
                tracing::debug!(
                    session_id = %self.ctx.session_id,
                    step = self.number,
                    tool = %part.tool,
                    call_id = %part.call_id,
                    "tool running"
                );

                if provider_executed {
                    self.calls.insert(tool_call_id, part);
                    return Ok(());
                }
                let result = tooling::execute(self.ctx, &self.tools, &self.ruleset, &part, input).await;
                match result {
                    Ok(output) => self.complete(&part, output)?,
                    Err(BuddyError::Aborted) if self.ctx.cancel.is_cancelled() => {
                        return Err(BuddyError::Aborted);
                    }
                    Err(err) => {
                        let rejected = err.is_permission_rejection();
                        self.fail(&part, err.to_string(), rejected)?;
                    }
                }
            }
            StreamEvent::ToolResult {
                tool_call_id,
                output,
            } => {
                self.outcome.saw_tool = true;
                if let Some(part) = self.take_running(&tool_call_id) {
                    self.complete(&part, output)?;
                }
            }
            StreamEvent::ToolError {
                tool_call_id,
                error,
                rejected,
            } => {
                self.outcome.saw_tool = true;
                if let Some(part) = self.take_running(&tool_call_id) {
                    self.fail(&part, error, rejected)?;
                }
            }
            StreamEvent::FinishStep {
                finish_reason,
                usage,
            } => {
                self.outcome.finish_reason = Some(finish_reason);
                self.outcome.usage = Some(usage);
                self.ctx.save_part(StepFinishPart {
                    id: PartId::new(),
                    session_id: self.ctx.session_id.clone(),
                    message_id: self.ctx.message_id.clone(),
                    reason: Some(finish_reason.to_string()),
                    snapshot: None,
                    tokens: Some(usage),
                    cost: None,
                })?;
            }
            StreamEvent::Error { message } => {
                tracing::error!(
                    session_id = %self.ctx.session_id,
                    step = self.number,
                    error = %message,
                    "model stream error"
                );
                return Err(BuddyError::Stream(message));
            }
        }
        Ok(())
    }

    fn append_delta(&self, part_id: PartId, delta: String) -> Result<()> {
        let ctx = self.ctx;
        let delta = PartDelta {
            session_id: ctx.session_id.clone(),
            message_id: ctx.message_id.clone(),
            part_id,
            field: "text".into(),
            delta,
        };
        ctx.sessions().update_part_delta(&ctx.project, &delta)?;
        ctx.publish(BusEvent::PartDelta {
            session_id: delta.session_id,
            message_id: delta.message_id,
            part_id: delta.part_id,
            field: delta.field,
            delta: delta.delta,
        });
        Ok(())
    }

    fn take_running(&mut self, call_id: &str) -> Option<ToolPart> {
        let running = self
            .calls
            .get(call_id)
            .is_some_and(|part| matches!(part.state, ToolState::Running { .. }));
        if running {
            self.calls.remove(call_id)
        } else {
            None
        }
    }

    fn note_task(&mut self, part: &ToolPart) {
        if part.tool == TASK_TOOL_ID {
            self.outcome.saw_task = true;
        }
    }

    /// running -> completed, keeping metadata the tool wrote while running.
    fn complete(&mut self, part: &ToolPart, output: ToolOutput) -> Result<()> {
        self.note_task(part);
        let ToolState::Running { input, time } = &part.state else {
            return Ok(());
        };
        let state = ToolState::Completed {
            input: input.clone(),
            output: output.output,
            metadata: Some(output.metadata),
            title: output.title,
            time: CompletedTime {
                start: time.start,
                end: Utc::now(),
                compacted: None,
            },
        };
        self.transition(part, state)
    }

    /// running -> error.
    fn fail(&mut self, part: &ToolPart, error: String, rejected: bool) -> Result<()> {
        self.note_task(part);
        let ToolState::Running { input, time } = &part.state else {
            return Ok(());
        };
        tracing::warn!(
            session_id = %self.ctx.session_id,
            step = self.number,
            tool = %part.tool,
            call_id = %part.call_id,
            error = %error,
            "tool failed"
        );
        if rejected && !self.ctx.runtime.config().processor.continue_loop_on_deny {
            self.outcome.blocked = true;
        }
        let state = ToolState::Error {
            input: Some(input.clone()),
            error,
            time: ErrorTime {
                start: time.start,
                end: Utc::now(),
            },
        };
        self.transition(part, state)
    }

    fn transition(&self, part: &ToolPart, state: ToolState) -> Result<()> {
        let ctx = self.ctx;
        let updated = ctx.sessions().modify_part(
            &ctx.project,
            &ctx.session_id,
            &ctx.message_id,
            &part.id,
            |stored| {
                if let Some(tool) = stored.as_tool_mut() {
                    tool.state = state.clone();
                }
            },
        )?;
        let part = updated.ok_or_else(|| BuddyError::not_found(EntityKind::Part, part.id.as_str()))?;
        ctx.publish(BusEvent::PartUpdated { part });
        Ok(())
    }
}
