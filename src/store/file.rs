use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{sort_messages, DurableStore};
use crate::error::{BuddyError, Result};
use crate::session::Session;
use crate::types::{MessageId, MessageInfo, Part, PartId, ProjectId, SessionId};

/// Configuration for file-backed storage.
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    pub base_dir: PathBuf,
}

impl FileStoreConfig {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn default_dir() -> PathBuf {
        default_buddy_dir()
    }
}

/// JSON-file store: one file per row.
///
/// Layout under `<base>/<project>/`:
/// `values/<key>.json`, `sessions/<id>.json`,
/// `messages/<session>/<id>.json`, `parts/<session>/<message>/<id>.json`.
#[derive(Debug)]
pub struct FileStore {
    base_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(config: FileStoreConfig) -> Self {
        Self {
            base_dir: config.base_dir,
            write_lock: Mutex::new(()),
        }
    }

    pub fn new_default() -> Self {
        Self::new(FileStoreConfig::new(default_buddy_dir()))
    }

    fn project_dir(&self, project: &ProjectId) -> PathBuf {
        self.base_dir.join(normalize_label(project.as_str()))
    }

    fn value_path(&self, project: &ProjectId, key: &str) -> PathBuf {
        self.project_dir(project)
            .join("values")
            .join(format!("{}.json", normalize_label(key)))
    }

    fn session_path(&self, project: &ProjectId, id: &SessionId) -> PathBuf {
        self.project_dir(project)
            .join("sessions")
            .join(format!("{}.json", normalize_label(id.as_str())))
    }

    fn message_dir(&self, project: &ProjectId, session: &SessionId) -> PathBuf {
        self.project_dir(project)
            .join("messages")
            .join(normalize_label(session.as_str()))
    }

    fn part_dir(&self, project: &ProjectId, session: &SessionId, message: &MessageId) -> PathBuf {
        self.project_dir(project)
            .join("parts")
            .join(normalize_label(session.as_str()))
            .join(normalize_label(message.as_str()))
    }

    fn part_path(
        &self,
        project: &ProjectId,
        session: &SessionId,
        message: &MessageId,
        id: &PartId,
    ) -> PathBuf {
        self.part_dir(project, session, message)
            .join(format!("{}.json", normalize_label(id.as_str())))
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| BuddyError::Store("file store lock poisoned".into()))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(Some(serde_json::from_str(&raw)?))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let serialized = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serialized)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_dir_json<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut rows = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        if let Some(row) = read_json(&path)? {
            rows.push(row);
        }
    }
    Ok(rows)
}

impl DurableStore for FileStore {
    fn get_value(&self, project: &ProjectId, key: &str) -> Result<Option<Value>> {
        read_json(&self.value_path(project, key))
    }

    fn put_value(&self, project: &ProjectId, key: &str, value: &Value) -> Result<()> {
        let _guard = self.guard()?;
        write_json(&self.value_path(project, key), value)
    }

    fn upsert_session(&self, project: &ProjectId, session: &Session) -> Result<()> {
        let _guard = self.guard()?;
        write_json(&self.session_path(project, &session.id), session)
    }

    fn get_session(&self, project: &ProjectId, id: &SessionId) -> Result<Option<Session>> {
        read_json(&self.session_path(project, id))
    }

    fn list_sessions(&self, project: &ProjectId) -> Result<Vec<Session>> {
        read_dir_json(&self.project_dir(project).join("sessions"))
    }

    fn update_session(
        &self,
        project: &ProjectId,
        id: &SessionId,
        apply: &mut dyn FnMut(&mut Session),
    ) -> Result<Option<Session>> {
        let _guard = self.guard()?;
        let path = self.session_path(project, id);
        let Some(mut session) = read_json::<Session>(&path)? else {
            return Ok(None);
        };
        apply(&mut session);
        write_json(&path, &session)?;
        Ok(Some(session))
    }

    fn upsert_message(&self, project: &ProjectId, info: &MessageInfo) -> Result<()> {
        let _guard = self.guard()?;
        let path = self
            .message_dir(project, info.session_id())
            .join(format!("{}.json", normalize_label(info.id().as_str())));
        write_json(&path, info)
    }

    fn get_message(
        &self,
        project: &ProjectId,
        session: &SessionId,
        id: &MessageId,
    ) -> Result<Option<MessageInfo>> {
        read_json(
            &self
                .message_dir(project, session)
                .join(format!("{}.json", normalize_label(id.as_str()))),
        )
    }

    fn list_messages(&self, project: &ProjectId, session: &SessionId) -> Result<Vec<MessageInfo>> {
        let mut messages: Vec<MessageInfo> = read_dir_json(&self.message_dir(project, session))?;
        sort_messages(&mut messages);
        Ok(messages)
    }

    fn upsert_part(&self, project: &ProjectId, part: &Part) -> Result<()> {
        let _guard = self.guard()?;
        let path = self.part_path(project, part.session_id(), part.message_id(), part.id());
        write_json(&path, part)
    }

    fn get_part(
        &self,
        project: &ProjectId,
        session: &SessionId,
        message: &MessageId,
        id: &PartId,
    ) -> Result<Option<Part>> {
        read_json(&self.part_path(project, session, message, id))
    }

    fn list_parts(
        &self,
        project: &ProjectId,
        session: &SessionId,
        message: &MessageId,
    ) -> Result<Vec<Part>> {
        let mut parts: Vec<Part> = read_dir_json(&self.part_dir(project, session, message))?;
        parts.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(parts)
    }

    fn update_part(
        &self,
        project: &ProjectId,
        session: &SessionId,
        message: &MessageId,
        id: &PartId,
        apply: &mut dyn FnMut(&mut Part) -> Result<()>,
    ) -> Result<Option<Part>> {
        let _guard = self.guard()?;
        let path = self.part_path(project, session, message, id);
        let Some(mut part) = read_json::<Part>(&path)? else {
            return Ok(None);
        };
        apply(&mut part)?;
        write_json(&path, &part)?;
        Ok(Some(part))
    }
}

fn default_buddy_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".buddy").join("data"))
        .unwrap_or_else(|| PathBuf::from(".buddy/data"))
}

fn normalize_label(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "default".to_string();
    }
    trimmed
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(FileStoreConfig::new(dir.path().to_path_buf()));
        (dir, store)
    }

    #[test]
    fn satisfies_store_contract() {
        let (_dir, store) = temp_store();
        super::super::contract::exercise(&store);
    }

    #[test]
    fn rows_survive_reopening() {
        let (dir, store) = temp_store();
        let project = ProjectId::from("p1");
        let session = Session::new(None, "persisted");
        store.upsert_session(&project, &session).unwrap();
        drop(store);

        let reopened = FileStore::new(FileStoreConfig::new(dir.path().to_path_buf()));
        let loaded = reopened.get_session(&project, &session.id).unwrap().unwrap();
        assert_eq!(loaded.title, "persisted");
    }

    #[test]
    fn keys_are_normalized_into_file_names() {
        let (_dir, store) = temp_store();
        let path = store.value_path(&ProjectId::from("p1"), "permission/approved");
        assert!(path.ends_with("p1/values/permission-approved.json"));
    }
}
