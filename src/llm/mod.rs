//! Streaming model interface consumed by the processor.
//!
//! The transport is external: implementations turn a [`StreamRequest`] into
//! a stream of [`StreamEvent`]s and stop promptly when the token is cancelled.

pub mod convert;
pub mod message;

pub use convert::{to_model_messages, COMPACTED_PLACEHOLDER, INTERRUPTED_PLACEHOLDER};
pub use message::{ContentPart, ModelMessage, Role, ToolCallContent, ToolResultContent};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::tools::{ToolDefinition, ToolOutput};
use crate::types::{FinishReason, Metadata, MessageId, SessionId, TokenUsage};

/// System section appended on the last allowed step.
pub const MAX_STEPS_PROMPT: &str = "CRITICAL - MAXIMUM STEPS REACHED

The maximum number of steps allowed for this task has been reached. Tools are disabled until the next user input. Respond with text only.

Your response must:
- Summarize the work done so far
- List any remaining tasks that were not completed
- Recommend what should be done next

Do not attempt to call any tools.";

/// One streaming call: everything the model sees for a single step.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub agent: String,
    pub system: Vec<String>,
    pub messages: Vec<ModelMessage>,
    /// Empty when the step is text-only.
    pub tools: Vec<ToolDefinition>,
    /// 1-based step index within the turn.
    pub step: usize,
    pub force_text_only: bool,
}

/// Typed events produced by a model stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    ReasoningStart {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
    },
    ReasoningDelta {
        id: String,
        text: String,
    },
    ReasoningEnd {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
    },
    TextStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
    },
    TextDelta {
        text: String,
    },
    TextEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
    },
    ToolInputStart {
        id: String,
        tool_name: String,
    },
    /// Resolved tool input. The processor executes the tool on receipt
    /// unless the provider runs it and reports back with `tool-result`.
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        input: Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        provider_executed: bool,
    },
    /// Result of a tool executed by the provider.
    ToolResult {
        tool_call_id: String,
        output: ToolOutput,
    },
    ToolError {
        tool_call_id: String,
        error: String,
        #[serde(default)]
        rejected: bool,
    },
    FinishStep {
        finish_reason: FinishReason,
        #[serde(default)]
        usage: TokenUsage,
    },
    Error {
        message: String,
    },
}

pub type EventStream = BoxStream<'static, StreamEvent>;

/// Streaming completion service.
#[async_trait]
pub trait ModelStream: Send + Sync {
    async fn stream(&self, request: StreamRequest, cancel: CancellationToken) -> Result<EventStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_use_kebab_case_tags() {
        let event = StreamEvent::FinishStep {
            finish_reason: FinishReason::ToolCalls,
            usage: TokenUsage::default(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "finish-step");
        assert_eq!(value["finish_reason"], "tool-calls");

        let parsed: StreamEvent =
            serde_json::from_value(json!({ "type": "text-delta", "text": "hi" })).unwrap();
        assert_eq!(parsed, StreamEvent::TextDelta { text: "hi".into() });
    }
}
