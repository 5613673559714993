//! Typed events published after each state change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::permission::{PermissionReply, PermissionRequest};
use crate::session::Session;
use crate::types::{MessageId, MessageInfo, Part, PartId, PermissionRequestId, ProjectId, SessionId};

/// Whether a session currently has an active turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionStatus {
    Busy,
    Idle,
}

/// Closed set of bus events, serialized as `{type, properties}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "properties")]
pub enum BusEvent {
    #[serde(rename = "permission.asked")]
    PermissionAsked(PermissionRequest),

    #[serde(rename = "permission.replied", rename_all = "camelCase")]
    PermissionReplied {
        session_id: SessionId,
        request_id: PermissionRequestId,
        reply: PermissionReply,
    },

    #[serde(rename = "message.updated")]
    MessageUpdated { info: MessageInfo },

    #[serde(rename = "message.part.updated")]
    PartUpdated { part: Part },

    #[serde(rename = "message.part.delta", rename_all = "camelCase")]
    PartDelta {
        session_id: SessionId,
        message_id: MessageId,
        part_id: PartId,
        field: String,
        delta: String,
    },

    #[serde(rename = "session.status", rename_all = "camelCase")]
    SessionStatus {
        session_id: SessionId,
        status: SessionStatus,
    },

    #[serde(rename = "session.created")]
    SessionCreated { info: Session },

    #[serde(rename = "session.updated")]
    SessionUpdated { info: Session },
}

impl BusEvent {
    /// Wire name of the event, also used as the subscription key.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PermissionAsked(_) => "permission.asked",
            Self::PermissionReplied { .. } => "permission.replied",
            Self::MessageUpdated { .. } => "message.updated",
            Self::PartUpdated { .. } => "message.part.updated",
            Self::PartDelta { .. } => "message.part.delta",
            Self::SessionStatus { .. } => "session.status",
            Self::SessionCreated { .. } => "session.created",
            Self::SessionUpdated { .. } => "session.updated",
        }
    }

    /// Session the event belongs to.
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::PermissionAsked(request) => &request.session_id,
            Self::PermissionReplied { session_id, .. }
            | Self::PartDelta { session_id, .. }
            | Self::SessionStatus { session_id, .. } => session_id,
            Self::MessageUpdated { info } => info.session_id(),
            Self::PartUpdated { part } => part.session_id(),
            Self::SessionCreated { info } | Self::SessionUpdated { info } => &info.id,
        }
    }
}

/// Envelope delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub project: ProjectId,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: BusEvent,
}
