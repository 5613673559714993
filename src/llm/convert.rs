//! Stored history -> model messages.

use serde_json::Value;

use super::message::{ContentPart, ModelMessage, Role, ToolCallContent, ToolResultContent};
use crate::types::{MessageInfo, MessageWithParts, Part, ToolState};

pub const COMPACTED_PLACEHOLDER: &str = "[Old tool result content cleared]";
pub const INTERRUPTED_PLACEHOLDER: &str = "[Tool execution was interrupted]";

const COMPACTION_PROMPT: &str = "What did we do so far?";
const SUBTASK_PROMPT: &str = "The following tool was executed by the user";

/// Convert stored messages into the conversation sent to the model.
///
/// Assistant tool calls become an assistant message followed by one tool
/// message holding the results, in part order.
pub fn to_model_messages(history: &[MessageWithParts]) -> Vec<ModelMessage> {
    let mut out = Vec::new();
    for message in history.iter().filter(|m| !m.parts.is_empty()) {
        match &message.info {
            MessageInfo::User(_) => {
                let content = user_content(&message.parts);
                if !content.is_empty() {
                    out.push(ModelMessage::new(Role::User, content));
                }
            }
            MessageInfo::Assistant(info) => {
                if info.error.is_some() && !has_usable_output(&message.parts) {
                    continue;
                }
                let (content, results) = assistant_content(&message.parts);
                if !content.is_empty() {
                    out.push(ModelMessage::new(Role::Assistant, content));
                }
                if !results.is_empty() {
                    out.push(ModelMessage::new(Role::Tool, results));
                }
            }
        }
    }
    out
}

fn user_content(parts: &[Part]) -> Vec<ContentPart> {
    parts
        .iter()
        .filter_map(|part| match part {
            Part::Text(text) if !text.ignored => Some(ContentPart::Text {
                text: text.text.clone(),
            }),
            Part::File(file) if file.mime != "text/plain" && file.mime != "application/x-directory" => {
                Some(ContentPart::File {
                    url: file.url.clone(),
                    mime: file.mime.clone(),
                    filename: file.filename.clone(),
                })
            }
            Part::Compaction(_) => Some(ContentPart::Text {
                text: COMPACTION_PROMPT.into(),
            }),
            Part::Subtask(_) => Some(ContentPart::Text {
                text: SUBTASK_PROMPT.into(),
            }),
            _ => None,
        })
        .collect()
}

fn has_usable_output(parts: &[Part]) -> bool {
    parts
        .iter()
        .any(|part| !matches!(part, Part::Reasoning(_) | Part::StepStart(_)))
}

fn assistant_content(parts: &[Part]) -> (Vec<ContentPart>, Vec<ContentPart>) {
    let mut content = Vec::new();
    let mut results = Vec::new();
    for part in parts {
        match part {
            Part::Text(text) => content.push(ContentPart::Text {
                text: text.text.clone(),
            }),
            Part::Reasoning(reasoning) => content.push(ContentPart::Reasoning {
                text: reasoning.text.clone(),
            }),
            Part::Tool(tool) => {
                let input = match tool.state.input() {
                    Some(Value::Object(map)) => Value::Object(map.clone()),
                    _ => Value::Object(Default::default()),
                };
                content.push(ContentPart::ToolCall(ToolCallContent {
                    id: tool.call_id.clone(),
                    name: tool.tool.clone(),
                    arguments: input,
                }));
                let (result, is_error) = match &tool.state {
                    ToolState::Completed { time, .. } if time.compacted.is_some() => {
                        (COMPACTED_PLACEHOLDER.to_string(), false)
                    }
                    ToolState::Completed { output, .. } => (output.clone(), false),
                    ToolState::Error { error, .. } => (error.clone(), true),
                    ToolState::Pending { .. } | ToolState::Running { .. } => {
                        (INTERRUPTED_PLACEHOLDER.to_string(), true)
                    }
                };
                results.push(ContentPart::ToolResult(ToolResultContent {
                    tool_call_id: tool.call_id.clone(),
                    result: Value::String(result),
                    is_error,
                }));
            }
            _ => {}
        }
    }
    (content, results)
}
