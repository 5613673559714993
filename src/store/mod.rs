//! Durable, project-scoped persistence for sessions, messages, parts, and
//! small key/value documents (the approved permission ruleset).

pub mod file;
pub mod memory;

pub use file::{FileStore, FileStoreConfig};
pub use memory::InMemoryStore;

use serde_json::Value;

use crate::error::Result;
use crate::session::Session;
use crate::types::{MessageId, MessageInfo, Part, PartId, ProjectId, SessionId};

/// Storage abstraction behind the session store and the permission engine.
///
/// Every read and write is scoped by project; a row written under one project
/// is invisible from every other project. Upserts are idempotent by id.
pub trait DurableStore: Send + Sync {
    fn get_value(&self, project: &ProjectId, key: &str) -> Result<Option<Value>>;
    fn put_value(&self, project: &ProjectId, key: &str, value: &Value) -> Result<()>;

    fn upsert_session(&self, project: &ProjectId, session: &Session) -> Result<()>;
    fn get_session(&self, project: &ProjectId, id: &SessionId) -> Result<Option<Session>>;
    fn list_sessions(&self, project: &ProjectId) -> Result<Vec<Session>>;
    /// Atomically read, modify, and write back one session row.
    ///
    /// Returns `Ok(None)` when the session does not exist.
    fn update_session(
        &self,
        project: &ProjectId,
        id: &SessionId,
        apply: &mut dyn FnMut(&mut Session),
    ) -> Result<Option<Session>>;

    fn upsert_message(&self, project: &ProjectId, info: &MessageInfo) -> Result<()>;
    fn get_message(
        &self,
        project: &ProjectId,
        session: &SessionId,
        id: &MessageId,
    ) -> Result<Option<MessageInfo>>;
    /// Messages of a session ordered by creation time, then id.
    fn list_messages(&self, project: &ProjectId, session: &SessionId) -> Result<Vec<MessageInfo>>;

    fn upsert_part(&self, project: &ProjectId, part: &Part) -> Result<()>;
    fn get_part(
        &self,
        project: &ProjectId,
        session: &SessionId,
        message: &MessageId,
        id: &PartId,
    ) -> Result<Option<Part>>;
    /// Parts of a message ordered by id.
    fn list_parts(
        &self,
        project: &ProjectId,
        session: &SessionId,
        message: &MessageId,
    ) -> Result<Vec<Part>>;

    /// Atomically read, modify, and write back one part.
    ///
    /// Returns `Ok(None)` when the part does not exist. When `apply` fails
    /// nothing is written.
    fn update_part(
        &self,
        project: &ProjectId,
        session: &SessionId,
        message: &MessageId,
        id: &PartId,
        apply: &mut dyn FnMut(&mut Part) -> Result<()>,
    ) -> Result<Option<Part>>;
}

/// Sort key for messages: creation time, then id.
pub(crate) fn sort_messages(messages: &mut [MessageInfo]) {
    messages.sort_by(|a, b| a.created().cmp(&b.created()).then_with(|| a.id().cmp(b.id())));
}
