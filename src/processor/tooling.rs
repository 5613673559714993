//! Tool execution on behalf of a step, the doom-loop guard, and cleanup of
//! tool parts a turn left behind.

use std::sync::Arc;

use serde_json::{json, Value};

use super::TurnContext;
use crate::error::{BuddyError, Result};
use crate::permission::{AskInput, Ruleset, ToolRef};
use crate::tools::{invoke, Tool, ToolContext, ToolOutput};
use crate::types::{Metadata, Part, ToolPart};

/// Identical consecutive calls that trigger a `doom_loop` ask.
pub const DOOM_LOOP_THRESHOLD: usize = 3;

pub(crate) async fn execute(
    ctx: &TurnContext,
    tools: &[Arc<dyn Tool>],
    ruleset: &Ruleset,
    part: &ToolPart,
    input: Value,
) -> Result<ToolOutput> {
    let Some(tool) = tools.iter().find(|tool| tool.id() == part.tool) else {
        if ctx.runtime.registry().tool(&part.tool).is_some() {
            return Err(BuddyError::ToolExecution {
                tool_name: part.tool.clone(),
                message: "tool is not available in this step".into(),
            });
        }
        return Err(BuddyError::UnknownTool(part.tool.clone()));
    };

    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Err(BuddyError::Aborted),
        guarded = guard_doom_loop(ctx, ruleset, part, &input) => guarded?,
    }

    let tool_ctx = ToolContext::new(
        ctx.runtime.clone(),
        ctx.project.clone(),
        ctx.session_id.clone(),
        ctx.message_id.clone(),
        part.id.clone(),
        part.call_id.clone(),
        ctx.agent.name.clone(),
        ctx.cancel.clone(),
        ruleset.clone(),
    );
    invoke(tool.as_ref(), input, &tool_ctx).await
}

/// Ask `doom_loop` when the last finished calls all repeat this one.
async fn guard_doom_loop(
    ctx: &TurnContext,
    ruleset: &Ruleset,
    part: &ToolPart,
    input: &Value,
) -> Result<()> {
    let Some(message) =
        ctx.sessions()
            .get_message_with_parts(&ctx.project, &ctx.session_id, &ctx.message_id)?
    else {
        return Ok(());
    };
    let finished: Vec<&ToolPart> = message
        .parts
        .iter()
        .filter_map(Part::as_tool)
        .filter(|tool| tool.id != part.id && tool.state.is_finished())
        .collect();
    if finished.len() < DOOM_LOOP_THRESHOLD {
        return Ok(());
    }
    let repeated = finished[finished.len() - DOOM_LOOP_THRESHOLD..]
        .iter()
        .all(|previous| previous.tool == part.tool && previous.state.input() == Some(input));
    if !repeated {
        return Ok(());
    }

    tracing::warn!(
        session_id = %ctx.session_id,
        tool = %part.tool,
        "repeated identical tool calls"
    );
    let mut metadata = Metadata::new();
    metadata.insert("tool".into(), json!(part.tool));
    metadata.insert("input".into(), input.clone());
    ctx.runtime
        .permissions()
        .ask(
            &ctx.project,
            AskInput {
                session_id: ctx.session_id.clone(),
                permission: "doom_loop".into(),
                patterns: vec![part.tool.clone()],
                always: vec![part.tool.clone()],
                metadata,
                tool: Some(ToolRef {
                    message_id: ctx.message_id.clone(),
                    call_id: part.call_id.clone(),
                }),
                ruleset: ruleset.clone(),
            },
        )
        .await
}

/// Force every pending or running tool part of the turn's message to `error`.
pub(crate) fn finalize_in_flight(ctx: &TurnContext, reason: &str) -> Result<usize> {
    let Some(message) =
        ctx.sessions()
            .get_message_with_parts(&ctx.project, &ctx.session_id, &ctx.message_id)?
    else {
        return Ok(0);
    };
    let mut finalized = 0;
    for part in message.parts {
        let Part::Tool(mut tool) = part else {
            continue;
        };
        if !tool.state.is_in_flight() {
            continue;
        }
        tool.fail(reason);
        ctx.save_part(tool)?;
        finalized += 1;
    }
    if finalized > 0 {
        tracing::debug!(session_id = %ctx.session_id, finalized, reason, "finalized in-flight tool parts");
    }
    Ok(finalized)
}
