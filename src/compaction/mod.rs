//! Context-size housekeeping run after every turn.
//!
//! Pruning hides old tool output from the model by stamping
//! `time.compacted`; the stored output itself is left intact. The overflow
//! check only reports.

use chrono::Utc;

use crate::config::{CompactionConfig, ModelLimits};
use crate::error::Result;
use crate::session::SessionStore;
use crate::types::{MessageId, Part, PartId, ProjectId, SessionId, ToolState};

pub const CHARS_PER_TOKEN: usize = 4;
pub const COMPACTION_BUFFER: u64 = 20_000;
pub const PRUNE_PROTECT: u64 = 40_000;
pub const PRUNE_MINIMUM: u64 = 20_000;
pub const PRUNE_KEEP_RECENT_TURNS: usize = 2;
/// Tools whose output is never pruned.
pub const PRUNE_PROTECTED_TOOLS: &[&str] = &["skill"];

/// Rough token count of `text`.
pub fn estimate_tokens(text: &str) -> u64 {
    text.chars().count().div_ceil(CHARS_PER_TOKEN) as u64
}

struct Candidate {
    message_id: MessageId,
    part_id: PartId,
    tokens: u64,
}

/// Mark old completed tool outputs as compacted. Returns how many were marked.
pub fn prune(
    sessions: &SessionStore,
    config: &CompactionConfig,
    project: &ProjectId,
    session: &SessionId,
) -> Result<usize> {
    if !config.prune {
        return Ok(0);
    }
    let messages = sessions.list_messages(project, session)?;

    let mut user_turns = 0;
    let mut boundary = messages.len();
    for (index, message) in messages.iter().enumerate().rev() {
        if message.info.is_user() {
            user_turns += 1;
            if user_turns >= PRUNE_KEEP_RECENT_TURNS {
                boundary = index;
                break;
            }
        }
    }
    if user_turns < PRUNE_KEEP_RECENT_TURNS {
        return Ok(0);
    }

    let candidates: Vec<Candidate> = messages[..boundary]
        .iter()
        .rev()
        .flat_map(|message| message.parts.iter().rev())
        .filter_map(Part::as_tool)
        .filter(|tool| !PRUNE_PROTECTED_TOOLS.contains(&tool.tool.as_str()))
        .filter_map(|tool| match &tool.state {
            ToolState::Completed { output, time, .. } if time.compacted.is_none() => Some(Candidate {
                message_id: tool.message_id.clone(),
                part_id: tool.id.clone(),
                tokens: estimate_tokens(output),
            }),
            _ => None,
        })
        .collect();

    let total: u64 = candidates.iter().map(|c| c.tokens).sum();
    if total < PRUNE_MINIMUM {
        return Ok(0);
    }

    let mut protected = 0u64;
    let mut pruned = 0usize;
    for candidate in &candidates {
        if protected < PRUNE_PROTECT {
            protected += candidate.tokens;
            continue;
        }
        let now = Utc::now();
        let marked = sessions.modify_part(project, session, &candidate.message_id, &candidate.part_id, |part| {
            if let Some(ToolState::Completed { time, .. }) = part.as_tool_mut().map(|tool| &mut tool.state) {
                time.compacted.get_or_insert(now);
            }
        })?;
        if marked.is_some() {
            pruned += 1;
        }
    }

    if pruned > 0 {
        tracing::info!(
            project_id = %project,
            session_id = %session,
            pruned,
            candidates = candidates.len(),
            total_tokens = total,
            protected_tokens = protected,
            "compaction pruned tool outputs"
        );
    }
    Ok(pruned)
}

/// Whether `last_total` leaves too little room for the next response.
pub fn check_overflow(
    config: &CompactionConfig,
    limits: &ModelLimits,
    session: &SessionId,
    last_total: Option<u64>,
) -> bool {
    if !config.auto {
        return false;
    }
    let Some(used) = last_total.filter(|total| *total > 0) else {
        return false;
    };
    let reserved = config
        .reserved
        .unwrap_or_else(|| COMPACTION_BUFFER.min(limits.output));
    let usable = limits
        .context
        .saturating_sub(limits.output)
        .saturating_sub(reserved);
    if used >= usable {
        tracing::warn!(
            session_id = %session,
            used_tokens = used,
            usable_limit = usable,
            context_limit = limits.context,
            reserved,
            "context overflow detected"
        );
        return true;
    }
    false
}
