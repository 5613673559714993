use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;

use super::{sort_messages, DurableStore};
use crate::error::{BuddyError, Result};
use crate::session::Session;
use crate::types::{MessageId, MessageInfo, Part, PartId, ProjectId, SessionId};

#[derive(Debug, Default)]
struct ProjectTables {
    values: HashMap<String, Value>,
    sessions: HashMap<SessionId, Session>,
    messages: HashMap<SessionId, HashMap<MessageId, MessageInfo>>,
    parts: HashMap<(SessionId, MessageId), BTreeMap<PartId, Part>>,
}

/// Process-local store; the default backend and the one tests use.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    projects: RwLock<HashMap<ProjectId, ProjectTables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<ProjectId, ProjectTables>>> {
        self.projects
            .read()
            .map_err(|_| BuddyError::Store("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<ProjectId, ProjectTables>>> {
        self.projects
            .write()
            .map_err(|_| BuddyError::Store("in-memory store lock poisoned".into()))
    }
}

impl DurableStore for InMemoryStore {
    fn get_value(&self, project: &ProjectId, key: &str) -> Result<Option<Value>> {
        Ok(self
            .read()?
            .get(project)
            .and_then(|tables| tables.values.get(key).cloned()))
    }

    fn put_value(&self, project: &ProjectId, key: &str, value: &Value) -> Result<()> {
        self.write()?
            .entry(project.clone())
            .or_default()
            .values
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn upsert_session(&self, project: &ProjectId, session: &Session) -> Result<()> {
        self.write()?
            .entry(project.clone())
            .or_default()
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn get_session(&self, project: &ProjectId, id: &SessionId) -> Result<Option<Session>> {
        Ok(self
            .read()?
            .get(project)
            .and_then(|tables| tables.sessions.get(id).cloned()))
    }

    fn list_sessions(&self, project: &ProjectId) -> Result<Vec<Session>> {
        Ok(self
            .read()?
            .get(project)
            .map(|tables| tables.sessions.values().cloned().collect())
            .unwrap_or_default())
    }

    fn update_session(
        &self,
        project: &ProjectId,
        id: &SessionId,
        apply: &mut dyn FnMut(&mut Session),
    ) -> Result<Option<Session>> {
        let mut projects = self.write()?;
        let Some(slot) = projects
            .get_mut(project)
            .and_then(|tables| tables.sessions.get_mut(id))
        else {
            return Ok(None);
        };
        apply(slot);
        Ok(Some(slot.clone()))
    }

    fn upsert_message(&self, project: &ProjectId, info: &MessageInfo) -> Result<()> {
        self.write()?
            .entry(project.clone())
            .or_default()
            .messages
            .entry(info.session_id().clone())
            .or_default()
            .insert(info.id().clone(), info.clone());
        Ok(())
    }

    fn get_message(
        &self,
        project: &ProjectId,
        session: &SessionId,
        id: &MessageId,
    ) -> Result<Option<MessageInfo>> {
        Ok(self
            .read()?
            .get(project)
            .and_then(|tables| tables.messages.get(session))
            .and_then(|messages| messages.get(id).cloned()))
    }

    fn list_messages(&self, project: &ProjectId, session: &SessionId) -> Result<Vec<MessageInfo>> {
        let mut messages: Vec<MessageInfo> = self
            .read()?
            .get(project)
            .and_then(|tables| tables.messages.get(session))
            .map(|messages| messages.values().cloned().collect())
            .unwrap_or_default();
        sort_messages(&mut messages);
        Ok(messages)
    }

    fn upsert_part(&self, project: &ProjectId, part: &Part) -> Result<()> {
        self.write()?
            .entry(project.clone())
            .or_default()
            .parts
            .entry((part.session_id().clone(), part.message_id().clone()))
            .or_default()
            .insert(part.id().clone(), part.clone());
        Ok(())
    }

    fn get_part(
        &self,
        project: &ProjectId,
        session: &SessionId,
        message: &MessageId,
        id: &PartId,
    ) -> Result<Option<Part>> {
        Ok(self
            .read()?
            .get(project)
            .and_then(|tables| tables.parts.get(&(session.clone(), message.clone())))
            .and_then(|parts| parts.get(id).cloned()))
    }

    fn list_parts(
        &self,
        project: &ProjectId,
        session: &SessionId,
        message: &MessageId,
    ) -> Result<Vec<Part>> {
        Ok(self
            .read()?
            .get(project)
            .and_then(|tables| tables.parts.get(&(session.clone(), message.clone())))
            .map(|parts| parts.values().cloned().collect())
            .unwrap_or_default())
    }

    fn update_part(
        &self,
        project: &ProjectId,
        session: &SessionId,
        message: &MessageId,
        id: &PartId,
        apply: &mut dyn FnMut(&mut Part) -> Result<()>,
    ) -> Result<Option<Part>> {
        let mut projects = self.write()?;
        let Some(slot) = projects
            .get_mut(project)
            .and_then(|tables| tables.parts.get_mut(&(session.clone(), message.clone())))
            .and_then(|parts| parts.get_mut(id))
        else {
            return Ok(None);
        };
        let mut next = slot.clone();
        apply(&mut next)?;
        *slot = next.clone();
        Ok(Some(next))
    }
}
