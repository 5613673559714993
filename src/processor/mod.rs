//! Step processor: the bounded agent loop behind one assistant turn.
//!
//! Each step opens one model stream, turns its events into part upserts,
//! executes tool calls, and decides whether another step is needed. The turn
//! always finalizes, whatever ended it.

pub mod limits;
mod step;
mod tooling;

pub use limits::{resolve_max_steps, DEFAULT_MAX_STEPS, MAX_STEPS_HARD_CAP};
pub use tooling::DOOM_LOOP_THRESHOLD;

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentInfo;
use crate::bus::{BusEvent, SessionStatus};
use crate::compaction;
use crate::error::{BuddyError, Result};
use crate::permission::{merge, Ruleset};
use crate::runtime::Runtime;
use crate::session::{SessionStore, TurnId};
use crate::types::{AssistantMessage, FinishReason, MessageId, Part, ProjectId, SessionId, TokenUsage};

use step::StepRunner;

/// Everything needed to run one turn.
#[derive(Debug, Clone)]
pub struct Turn {
    pub project: ProjectId,
    pub session_id: SessionId,
    /// The empty assistant message created for this turn.
    pub message: AssistantMessage,
    pub agent: AgentInfo,
    pub turn_id: TurnId,
    pub cancel: CancellationToken,
}

/// Shared per-turn context handed to steps and tool execution.
pub(crate) struct TurnContext {
    pub runtime: Arc<Runtime>,
    pub project: ProjectId,
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub agent: AgentInfo,
    pub cancel: CancellationToken,
}

impl TurnContext {
    pub fn sessions(&self) -> &SessionStore {
        self.runtime.sessions()
    }

    pub fn publish(&self, event: BusEvent) {
        self.runtime.bus().publish(&self.project, event);
    }

    /// Upsert a part and publish it.
    pub fn save_part(&self, part: impl Into<Part>) -> Result<Part> {
        let part = self.sessions().update_part(&self.project, part.into())?;
        self.publish(BusEvent::PartUpdated { part: part.clone() });
        Ok(part)
    }

    pub fn save_message(&self, message: &AssistantMessage) -> Result<()> {
        let info = self
            .sessions()
            .update_message(&self.project, message.clone().into())?;
        self.publish(BusEvent::MessageUpdated { info });
        Ok(())
    }

    /// Agent rules followed by the session's current overrides.
    pub fn ruleset(&self) -> Result<Ruleset> {
        let overrides = self
            .sessions()
            .get_permission(&self.project, &self.session_id)?;
        Ok(merge(&[&self.agent.permission, &overrides]))
    }
}

#[derive(Debug, Default)]
struct TurnState {
    usage: TokenUsage,
    last_usage: Option<TokenUsage>,
    final_reason: Option<FinishReason>,
    max_steps_reached: bool,
    force_text_after_task: bool,
}

/// How the step loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnEnd {
    Completed,
    Aborted,
    Failed,
}

impl TurnEnd {
    /// A cancel only counts when it actually interrupted the loop.
    fn of(result: &Result<()>, cancelled: bool) -> Self {
        match result {
            Ok(()) => Self::Completed,
            Err(_) if cancelled => Self::Aborted,
            Err(_) => Self::Failed,
        }
    }
}

/// Run a turn to completion and return the finalized assistant message.
pub async fn run_turn(runtime: Arc<Runtime>, turn: Turn) -> AssistantMessage {
    let Turn {
        project,
        session_id,
        mut message,
        agent,
        turn_id,
        cancel,
    } = turn;
    let ctx = TurnContext {
        runtime,
        project,
        session_id,
        message_id: message.id.clone(),
        agent,
        cancel,
    };
    tracing::debug!(
        project_id = %ctx.project,
        session_id = %ctx.session_id,
        message_id = %ctx.message_id,
        agent = %ctx.agent.name,
        "turn started"
    );

    let mut state = TurnState::default();
    let result = drive(&ctx, &mut state).await;

    let end = TurnEnd::of(&result, ctx.cancel.is_cancelled());
    let aborted = end == TurnEnd::Aborted;
    let failed = end == TurnEnd::Failed;
    if let Err(err) = &result {
        if aborted {
            tracing::debug!(session_id = %ctx.session_id, "turn aborted");
        } else {
            tracing::error!(session_id = %ctx.session_id, error = %err, "turn failed");
            message.error = Some(err.to_string());
            if let Err(err) = ctx.save_message(&message) {
                tracing::error!(session_id = %ctx.session_id, error = %err, "failed to record turn error");
            }
        }
    }

    finalize(&ctx, &mut state, &mut message, aborted, failed, turn_id);
    message
}

async fn drive(ctx: &TurnContext, state: &mut TurnState) -> Result<()> {
    let max_steps = resolve_max_steps(ctx.agent.steps);
    for step in 1..=max_steps {
        if ctx.cancel.is_cancelled() {
            return Err(BuddyError::Aborted);
        }
        let last_step = step == max_steps;
        let force_text = last_step || state.force_text_after_task;

        let outcome = StepRunner::new(ctx, step, force_text).run().await?;

        if let Some(usage) = &outcome.usage {
            state.usage.merge(usage);
            state.last_usage = Some(*usage);
        }
        state.final_reason = outcome.finish_reason.or(state.final_reason);
        if outcome.saw_task {
            state.force_text_after_task = true;
        }

        let wants_more = outcome.finish_reason.is_some_and(FinishReason::expects_more_work)
            || (outcome.saw_tool && !outcome.saw_text);
        tracing::debug!(
            session_id = %ctx.session_id,
            step,
            finish_reason = ?outcome.finish_reason,
            saw_tool = outcome.saw_tool,
            saw_task = outcome.saw_task,
            saw_text = outcome.saw_text,
            blocked = outcome.blocked,
            force_text,
            "step finished"
        );

        if force_text || outcome.blocked || !wants_more {
            if last_step && wants_more && !outcome.blocked {
                state.max_steps_reached = true;
            }
            break;
        }
    }
    if state.final_reason.is_some_and(FinishReason::expects_more_work) {
        state.max_steps_reached = true;
    }
    Ok(())
}

fn finalize(
    ctx: &TurnContext,
    state: &mut TurnState,
    message: &mut AssistantMessage,
    aborted: bool,
    failed: bool,
    turn_id: TurnId,
) {
    let reason = if aborted {
        "Tool execution aborted"
    } else if failed {
        "Tool execution failed"
    } else if state.max_steps_reached {
        "Stopped at max steps"
    } else {
        "Tool call was not completed"
    };
    if let Err(err) = tooling::finalize_in_flight(ctx, reason) {
        tracing::error!(session_id = %ctx.session_id, error = %err, "failed to finalize tool parts");
    }

    let finish = if aborted {
        FinishReason::Aborted
    } else if failed {
        FinishReason::Error
    } else if state.max_steps_reached {
        FinishReason::MaxSteps
    } else {
        state.final_reason.unwrap_or(FinishReason::Stop)
    };
    message.finish.get_or_insert(finish);
    message.tokens = state.usage;
    message.time.completed = Some(Utc::now());
    if let Err(err) = ctx.save_message(message) {
        tracing::error!(session_id = %ctx.session_id, error = %err, "failed to finalize assistant message");
    }

    let config = ctx.runtime.config();
    if let Err(err) = compaction::prune(ctx.sessions(), &config.compaction, &ctx.project, &ctx.session_id) {
        tracing::warn!(session_id = %ctx.session_id, error = %err, "prune failed");
    }
    compaction::check_overflow(
        &config.compaction,
        &config.limits,
        &ctx.session_id,
        state.last_usage.map(|usage| usage.effective_total()),
    );

    ctx.sessions()
        .release_turn(&ctx.project, &ctx.session_id, turn_id);
    if !ctx.sessions().is_busy(&ctx.project, &ctx.session_id) {
        ctx.publish(BusEvent::SessionStatus {
            session_id: ctx.session_id.clone(),
            status: SessionStatus::Idle,
        });
    }
    tracing::debug!(
        session_id = %ctx.session_id,
        message_id = %ctx.message_id,
        finish = %finish,
        "turn finalized"
    );
}
