//! Message parts: the independently streamable units of message content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{MessageId, PartId, SessionId};
use super::message::ModelRef;
use super::usage::TokenUsage;

/// Free-form metadata attached to parts and tool states.
pub type Metadata = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn starting_now() -> Self {
        Self {
            start: Utc::now(),
            end: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextPart {
    pub id: PartId,
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub text: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignored: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningPart {
    pub id: PartId,
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub text: String,
    pub time: TimeRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTime {
    pub start: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedTime {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Set once pruning has hidden this output from the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTime {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Lifecycle of a tool call: pending -> running -> completed | error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolState {
    Pending {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw: Option<String>,
    },
    Running {
        input: Value,
        time: RunningTime,
    },
    Completed {
        input: Value,
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        time: CompletedTime,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        error: String,
        time: ErrorTime,
    },
}

impl ToolState {
    pub fn input(&self) -> Option<&Value> {
        match self {
            Self::Pending { input, .. } | Self::Error { input, .. } => input.as_ref(),
            Self::Running { input, .. } | Self::Completed { input, .. } => Some(input),
        }
    }

    /// Still waiting for input or for execution to finish.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending { .. } | Self::Running { .. })
    }

    pub fn is_finished(&self) -> bool {
        !self.is_in_flight()
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "pending",
            Self::Running { .. } => "running",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPart {
    pub id: PartId,
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub tool: String,
    #[serde(rename = "callID")]
    pub call_id: String,
    pub state: ToolState,
    /// Side channel written by tools while running (titles, progress).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl ToolPart {
    /// Move an in-flight part to `error`, keeping whatever input it had.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let now = Utc::now();
        let start = match &self.state {
            ToolState::Running { time, .. } => time.start,
            _ => now,
        };
        self.state = ToolState::Error {
            input: self.state.input().cloned(),
            error: reason.into(),
            time: ErrorTime { start, end: now },
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePart {
    pub id: PartId,
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStartPart {
    pub id: PartId,
    pub session_id: SessionId,
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFinishPart {
    pub id: PartId,
    pub session_id: SessionId,
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchPart {
    pub id: PartId,
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub hash: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPart {
    pub id: PartId,
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub snapshot: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionPart {
    pub id: PartId,
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub auto: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskPart {
    pub id: PartId,
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub prompt: String,
    pub description: String,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPart {
    pub id: PartId,
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPart {
    pub id: PartId,
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub attempt: u32,
    pub error: String,
    pub created: DateTime<Utc>,
}

/// A part of a message, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text(TextPart),
    Reasoning(ReasoningPart),
    Tool(ToolPart),
    File(FilePart),
    StepStart(StepStartPart),
    StepFinish(StepFinishPart),
    Patch(PatchPart),
    Snapshot(SnapshotPart),
    Compaction(CompactionPart),
    Subtask(SubtaskPart),
    Agent(AgentPart),
    Retry(RetryPart),
}

macro_rules! each_part {
    ($value:expr, $p:ident => $body:expr) => {
        match $value {
            Part::Text($p) => $body,
            Part::Reasoning($p) => $body,
            Part::Tool($p) => $body,
            Part::File($p) => $body,
            Part::StepStart($p) => $body,
            Part::StepFinish($p) => $body,
            Part::Patch($p) => $body,
            Part::Snapshot($p) => $body,
            Part::Compaction($p) => $body,
            Part::Subtask($p) => $body,
            Part::Agent($p) => $body,
            Part::Retry($p) => $body,
        }
    };
}

impl Part {
    pub fn id(&self) -> &PartId {
        each_part!(self, p => &p.id)
    }

    pub fn session_id(&self) -> &SessionId {
        each_part!(self, p => &p.session_id)
    }

    pub fn message_id(&self) -> &MessageId {
        each_part!(self, p => &p.message_id)
    }

    pub fn as_tool(&self) -> Option<&ToolPart> {
        match self {
            Self::Tool(tool) => Some(tool),
            _ => None,
        }
    }

    pub fn as_tool_mut(&mut self) -> Option<&mut ToolPart> {
        match self {
            Self::Tool(tool) => Some(tool),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&TextPart> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

macro_rules! impl_from_part {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(impl From<$ty> for Part {
            fn from(part: $ty) -> Self {
                Part::$variant(part)
            }
        })*
    };
}

impl_from_part!(
    Text(TextPart),
    Reasoning(ReasoningPart),
    Tool(ToolPart),
    File(FilePart),
    StepStart(StepStartPart),
    StepFinish(StepFinishPart),
    Patch(PatchPart),
    Snapshot(SnapshotPart),
    Compaction(CompactionPart),
    Subtask(SubtaskPart),
    Agent(AgentPart),
    Retry(RetryPart),
);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_part(state: ToolState) -> ToolPart {
        ToolPart {
            id: PartId::from("part_1"),
            session_id: SessionId::from("session_1"),
            message_id: MessageId::from("message_1"),
            tool: "read".into(),
            call_id: "call_1".into(),
            state,
            metadata: None,
        }
    }

    #[test]
    fn part_json_is_tagged_by_type_and_status() {
        let part = Part::from(tool_part(ToolState::Pending {
            input: None,
            raw: Some(String::new()),
        }));
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "tool");
        assert_eq!(json["callID"], "call_1");
        assert_eq!(json["state"]["status"], "pending");

        let step: Part = serde_json::from_value(json!({
            "type": "step-start",
            "id": "part_2",
            "sessionId": "session_1",
            "messageId": "message_1",
        }))
        .unwrap();
        assert!(matches!(step, Part::StepStart(_)));
        assert_eq!(step.id().as_str(), "part_2");
    }

    #[test]
    fn fail_keeps_running_input_and_start() {
        let start = Utc::now();
        let mut part = tool_part(ToolState::Running {
            input: json!({"path": "a.txt"}),
            time: RunningTime { start },
        });
        part.fail("Tool execution aborted");
        match part.state {
            ToolState::Error { input, error, time } => {
                assert_eq!(input, Some(json!({"path": "a.txt"})));
                assert_eq!(error, "Tool execution aborted");
                assert_eq!(time.start, start);
            }
            other => panic!("unexpected state {other:?}"),
        }
    }
}
