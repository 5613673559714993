//! Session store: the append/upsert data layer plus busy/abort bookkeeping.
//!
//! Every operation takes the owning [`ProjectId`]; rows from another project
//! behave as not found.

pub mod turns;

pub use turns::{ActiveTurns, TurnId};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusEvent, EventBus};
use crate::error::{BuddyError, EntityKind, Result};
use crate::permission::Ruleset;
use crate::store::DurableStore;
use crate::types::{
    AssistantMessage, MessageId, MessageInfo, MessageWithParts, Part, PartId, ProjectId, SessionId,
};

pub const DEFAULT_TITLE: &str = "New chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTime {
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SessionId>,
    pub title: String,
    /// Session permission overrides, merged after the agent's rules.
    #[serde(default)]
    pub permission: Ruleset,
    pub time: SessionTime,
}

impl Session {
    pub fn new(parent_id: Option<SessionId>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            parent_id,
            title: title.into(),
            permission: Vec::new(),
            time: SessionTime {
                created: now,
                updated: now,
            },
        }
    }
}

/// Options for [`SessionStore::create_session`].
#[derive(Debug, Clone, Default)]
pub struct CreateSession {
    pub parent_id: Option<SessionId>,
    pub title: Option<String>,
    pub permission: Ruleset,
}

/// Blind append to one string field of a stored part.
#[derive(Debug, Clone)]
pub struct PartDelta {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub part_id: PartId,
    pub field: String,
    pub delta: String,
}

#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn DurableStore>,
    bus: Arc<dyn EventBus>,
    turns: Arc<ActiveTurns>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("turns", &self.turns)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    pub fn new(store: Arc<dyn DurableStore>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            store,
            bus,
            turns: Arc::new(ActiveTurns::new()),
        }
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    // --- sessions ---------------------------------------------------------

    pub fn create_session(&self, project: &ProjectId, options: CreateSession) -> Result<Session> {
        let mut session = Session::new(
            options.parent_id,
            options.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
        );
        session.permission = options.permission;
        self.store.upsert_session(project, &session)?;
        tracing::debug!(project_id = %project, session_id = %session.id, "session created");
        self.bus.publish(project, BusEvent::SessionCreated { info: session.clone() });
        Ok(session)
    }

    /// Best-effort lookup: `None` when missing.
    pub fn get_session(&self, project: &ProjectId, id: &SessionId) -> Result<Option<Session>> {
        self.store.get_session(project, id)
    }

    /// Lookup that fails with `NotFound` when missing.
    pub fn require_session(&self, project: &ProjectId, id: &SessionId) -> Result<Session> {
        self.store
            .get_session(project, id)?
            .ok_or_else(|| BuddyError::not_found(EntityKind::Session, id.as_str()))
    }

    /// Sessions of a project, most recently updated first.
    pub fn list_sessions(&self, project: &ProjectId) -> Result<Vec<Session>> {
        let mut sessions = self.store.list_sessions(project)?;
        sessions.sort_by(|a, b| b.time.updated.cmp(&a.time.updated).then_with(|| b.id.cmp(&a.id)));
        Ok(sessions)
    }

    pub fn touch(&self, project: &ProjectId, id: &SessionId) -> Result<Session> {
        self.store
            .update_session(project, id, &mut |session| session.time.updated = Utc::now())?
            .ok_or_else(|| BuddyError::not_found(EntityKind::Session, id.as_str()))
    }

    pub fn set_title(&self, project: &ProjectId, id: &SessionId, title: impl Into<String>) -> Result<Session> {
        self.modify_session(project, id, |session| session.title = title.into())
    }

    pub fn get_permission(&self, project: &ProjectId, id: &SessionId) -> Result<Ruleset> {
        Ok(self.require_session(project, id)?.permission)
    }

    pub fn set_permission(&self, project: &ProjectId, id: &SessionId, permission: Ruleset) -> Result<Session> {
        self.modify_session(project, id, |session| session.permission = permission)
    }

    fn modify_session(
        &self,
        project: &ProjectId,
        id: &SessionId,
        apply: impl FnOnce(&mut Session),
    ) -> Result<Session> {
        let mut apply = Some(apply);
        let session = self
            .store
            .update_session(project, id, &mut |session| {
                if let Some(apply) = apply.take() {
                    apply(session);
                }
                session.time.updated = Utc::now();
            })?
            .ok_or_else(|| BuddyError::not_found(EntityKind::Session, id.as_str()))?;
        self.bus.publish(project, BusEvent::SessionUpdated { info: session.clone() });
        Ok(session)
    }

    // --- messages ---------------------------------------------------------

    /// Insert or fully replace a message by id, then touch the session.
    pub fn update_message(&self, project: &ProjectId, info: MessageInfo) -> Result<MessageInfo> {
        self.require_session(project, info.session_id())?;
        self.store.upsert_message(project, &info)?;
        self.touch(project, info.session_id())?;
        Ok(info)
    }

    pub fn append_message(&self, project: &ProjectId, info: MessageInfo) -> Result<MessageInfo> {
        self.update_message(project, info)
    }

    pub fn get_message_with_parts(
        &self,
        project: &ProjectId,
        session: &SessionId,
        message: &MessageId,
    ) -> Result<Option<MessageWithParts>> {
        let Some(info) = self.store.get_message(project, session, message)? else {
            return Ok(None);
        };
        let parts = self.store.list_parts(project, session, message)?;
        Ok(Some(MessageWithParts { info, parts }))
    }

    pub fn get_assistant_info(
        &self,
        project: &ProjectId,
        session: &SessionId,
        message: &MessageId,
    ) -> Result<Option<AssistantMessage>> {
        Ok(self
            .store
            .get_message(project, session, message)?
            .and_then(|info| info.as_assistant().cloned()))
    }

    /// Messages ordered by creation time then id, each with parts in id order.
    pub fn list_messages(&self, project: &ProjectId, session: &SessionId) -> Result<Vec<MessageWithParts>> {
        self.store
            .list_messages(project, session)?
            .into_iter()
            .map(|info| {
                let parts = self.store.list_parts(project, session, info.id())?;
                Ok(MessageWithParts { info, parts })
            })
            .collect()
    }

    pub fn user_message_count(&self, project: &ProjectId, session: &SessionId) -> Result<usize> {
        Ok(self
            .store
            .list_messages(project, session)?
            .iter()
            .filter(|info| info.is_user())
            .count())
    }

    // --- parts ------------------------------------------------------------

    /// Insert or fully replace a part by id. The parent message must exist.
    pub fn update_part(&self, project: &ProjectId, part: Part) -> Result<Part> {
        if self
            .store
            .get_message(project, part.session_id(), part.message_id())?
            .is_none()
        {
            return Err(BuddyError::not_found(EntityKind::Message, part.message_id().as_str()));
        }
        self.store.upsert_part(project, &part)?;
        self.touch(project, part.session_id())?;
        Ok(part)
    }

    pub fn append_part(&self, project: &ProjectId, part: Part) -> Result<Part> {
        self.update_part(project, part)
    }

    pub fn get_part(
        &self,
        project: &ProjectId,
        session: &SessionId,
        message: &MessageId,
        part: &PartId,
    ) -> Result<Option<Part>> {
        self.store.get_part(project, session, message, part)
    }

    /// Atomically edit a stored part in place. `None` when the part is missing.
    pub fn modify_part(
        &self,
        project: &ProjectId,
        session: &SessionId,
        message: &MessageId,
        part: &PartId,
        mut apply: impl FnMut(&mut Part),
    ) -> Result<Option<Part>> {
        self.store.update_part(project, session, message, part, &mut |part| {
            apply(part);
            Ok(())
        })
    }

    /// Append `delta` to a string field of a stored part.
    pub fn update_part_delta(&self, project: &ProjectId, delta: &PartDelta) -> Result<Part> {
        let updated = self.store.update_part(
            project,
            &delta.session_id,
            &delta.message_id,
            &delta.part_id,
            &mut |part| {
                let mut value = serde_json::to_value(&*part)?;
                let slot = value
                    .get_mut(&delta.field)
                    .ok_or_else(|| BuddyError::not_found(EntityKind::Field, delta.field.as_str()))?;
                let Value::String(current) = slot else {
                    return Err(BuddyError::FieldType {
                        field: delta.field.clone(),
                    });
                };
                current.push_str(&delta.delta);
                *part = serde_json::from_value(value)?;
                Ok(())
            },
        )?;
        updated.ok_or_else(|| BuddyError::not_found(EntityKind::Part, delta.part_id.as_str()))
    }

    // --- busy / abort -----------------------------------------------------

    pub fn set_active_abort(&self, project: &ProjectId, session: &SessionId, cancel: CancellationToken) -> TurnId {
        self.turns.set(project, session, cancel)
    }

    /// Atomically claim the session for a new turn.
    pub fn begin_turn(
        &self,
        project: &ProjectId,
        session: &SessionId,
        cancel: CancellationToken,
    ) -> Result<TurnId> {
        self.turns
            .begin(project, session, cancel)
            .ok_or_else(|| BuddyError::SessionBusy {
                session_id: session.to_string(),
            })
    }

    pub fn clear_active_abort(&self, project: &ProjectId, session: &SessionId) -> bool {
        self.turns.clear(project, session)
    }

    /// Clear the handle only if it still belongs to `turn`.
    pub fn release_turn(&self, project: &ProjectId, session: &SessionId, turn: TurnId) -> bool {
        self.turns.release(project, session, turn)
    }

    pub fn is_busy(&self, project: &ProjectId, session: &SessionId) -> bool {
        self.turns.is_busy(project, session)
    }

    pub fn active_token(&self, project: &ProjectId, session: &SessionId) -> Option<CancellationToken> {
        self.turns.token(project, session)
    }

    /// Cancel the session's active turn. Returns whether one existed.
    pub fn abort(&self, project: &ProjectId, session: &SessionId) -> bool {
        let aborted = self.turns.abort(project, session);
        if aborted {
            tracing::info!(project_id = %project, session_id = %session, "turn aborted");
        }
        aborted
    }
}
