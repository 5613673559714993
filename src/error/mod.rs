//! Error types for buddy-core.

use strum::Display;
use thiserror::Error;

/// Kind of entity a [`BuddyError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum EntityKind {
    Session,
    Message,
    Part,
    Field,
}

/// Outcome of a permission check that did not grant access.
///
/// `Rejected` and `Corrected` come from a user decision and are fed back to
/// the model as a tool result. `Denied` comes from a rule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PermissionError {
    #[error("A permission rule denied access for {permission}.")]
    Denied { permission: String },

    #[error("The user rejected permission to use this specific tool call.")]
    Rejected,

    #[error("The user rejected permission with this feedback: {feedback}")]
    Corrected { feedback: String },
}

/// Primary error type for all buddy-core operations.
#[derive(Error, Debug)]
pub enum BuddyError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("Part field \"{field}\" is not a string")]
    FieldType { field: String },

    #[error("Session is already running")]
    SessionBusy { session_id: String },

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error("Task execution timed out after {}s", .elapsed_ms / 1000)]
    TaskWaitTimeout { session_id: String, elapsed_ms: u64 },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error(
        "The {tool} tool was called with invalid arguments: {reason}. Rewrite the input to satisfy the schema."
    )]
    InvalidToolInput { tool: String, reason: String },

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Turn aborted")]
    Aborted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BuddyError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether this error is a user rejection without feedback.
    ///
    /// The processor stops the loop on this error when configured to break on
    /// denial. Corrections carry feedback for the model and never break.
    pub fn is_permission_rejection(&self) -> bool {
        matches!(self, Self::Permission(PermissionError::Rejected))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, BuddyError>;
