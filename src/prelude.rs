//! Convenience re-exports for common use.

pub use crate::agent::{AgentCatalog, AgentInfo, AgentMode};
pub use crate::bus::{BusEvent, BusMessage, EventBus, InProcessBus, SessionStatus};
pub use crate::config::BuddyConfig;
pub use crate::error::{BuddyError, PermissionError, Result};
pub use crate::llm::{EventStream, ModelStream, StreamEvent, StreamRequest};
pub use crate::permission::{PermissionAction, PermissionEngine, PermissionReply, PermissionRule, Ruleset};
pub use crate::runtime::{PromptInput, PromptOutcome, Runtime, RuntimeOptions, TurnHandle};
pub use crate::session::{CreateSession, Session, SessionStore};
pub use crate::tools::{AgentTool, Tool, ToolArguments, ToolContext, ToolOutput, ToolParameters};
pub use crate::types::{
    AssistantMessage, FinishReason, MessageInfo, MessageWithParts, Part, ProjectId, SessionId,
    TokenUsage, ToolState,
};
