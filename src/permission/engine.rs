//! Ask/reply lifecycle with durable per-project approvals.
//!
//! Pending requests live in a per-project correlation table (request id ->
//! waiting caller). Replies may arrive from any task; each resolution removes
//! the entry and wakes exactly one waiter.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::oneshot;

use super::rule::{evaluate, PermissionAction, PermissionRule, Ruleset};
use crate::bus::{BusEvent, EventBus};
use crate::error::{BuddyError, PermissionError, Result};
use crate::store::DurableStore;
use crate::types::{Metadata, MessageId, PermissionRequestId, ProjectId, SessionId};

/// Durable key of the approved ruleset.
pub const APPROVED_KEY: &str = "permission/approved";

/// Tool call a permission request was raised for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRef {
    pub message_id: MessageId,
    #[serde(rename = "callID")]
    pub call_id: String,
}

/// A pending ask, as shown to whoever answers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub id: PermissionRequestId,
    pub session_id: SessionId,
    pub permission: String,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub always: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolRef>,
}

/// Input to [`PermissionEngine::ask`].
#[derive(Debug, Clone, Default)]
pub struct AskInput {
    pub session_id: SessionId,
    pub permission: String,
    pub patterns: Vec<String>,
    /// Patterns to approve durably on an `always` reply.
    pub always: Vec<String>,
    pub metadata: Metadata,
    pub tool: Option<ToolRef>,
    /// Effective rules of the caller (agent + session overrides).
    pub ruleset: Ruleset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PermissionReply {
    Once,
    Always,
    Reject,
}

type Decision = std::result::Result<(), PermissionError>;

struct PendingEntry {
    request: PermissionRequest,
    responder: oneshot::Sender<Decision>,
}

#[derive(Default)]
struct ProjectPermissions {
    approved: Ruleset,
    pending: BTreeMap<PermissionRequestId, PendingEntry>,
}

type SharedState = Arc<Mutex<ProjectPermissions>>;

fn lock(state: &Mutex<ProjectPermissions>) -> MutexGuard<'_, ProjectPermissions> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of [`PermissionEngine::request`]: granted, or waiting on a reply.
#[must_use = "a pending ticket must be awaited or the request is withdrawn"]
pub struct PermissionTicket {
    pending: Option<PendingWait>,
}

struct PendingWait {
    id: PermissionRequestId,
    rx: oneshot::Receiver<Decision>,
    _cleanup: PendingCleanup,
}

/// Withdraws the pending entry when the waiter goes away first.
struct PendingCleanup {
    state: Weak<Mutex<ProjectPermissions>>,
    id: PermissionRequestId,
}

impl Drop for PendingCleanup {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            lock(&state).pending.remove(&self.id);
        }
    }
}

impl PermissionTicket {
    fn granted() -> Self {
        Self { pending: None }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn request_id(&self) -> Option<&PermissionRequestId> {
        self.pending.as_ref().map(|wait| &wait.id)
    }

    /// Wait for the decision.
    pub async fn wait(self) -> Decision {
        let Some(wait) = self.pending else {
            return Ok(());
        };
        wait.rx.await.unwrap_or(Err(PermissionError::Rejected))
    }
}

impl std::fmt::Debug for PermissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionTicket")
            .field("request_id", &self.request_id())
            .finish()
    }
}

pub struct PermissionEngine {
    store: Arc<dyn DurableStore>,
    bus: Arc<dyn EventBus>,
    projects: DashMap<ProjectId, SharedState>,
}

impl std::fmt::Debug for PermissionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionEngine")
            .field("projects", &self.projects.len())
            .finish_non_exhaustive()
    }
}

impl PermissionEngine {
    pub fn new(store: Arc<dyn DurableStore>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            store,
            bus,
            projects: DashMap::new(),
        }
    }

    /// Project state, loading the approved ruleset on first access.
    fn state(&self, project: &ProjectId) -> Result<SharedState> {
        if let Some(state) = self.projects.get(project) {
            return Ok(state.clone());
        }
        let approved: Ruleset = match self.store.get_value(project, APPROVED_KEY)? {
            Some(value) => serde_json::from_value(value)?,
            None => Vec::new(),
        };
        let state = self
            .projects
            .entry(project.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ProjectPermissions {
                    approved,
                    pending: BTreeMap::new(),
                }))
            })
            .clone();
        Ok(state)
    }

    /// Evaluate `input` and register a pending request when a decision is
    /// needed.
    ///
    /// Patterns are checked in order: the first `deny` fails immediately, the
    /// first `ask` creates the request, and remaining patterns are not
    /// evaluated in this call.
    pub fn request(&self, project: &ProjectId, input: AskInput) -> Result<PermissionTicket> {
        let state = self.state(project)?;
        let mut guard = lock(&state);
        for pattern in &input.patterns {
            let rule = evaluate(&input.permission, pattern, &[&input.ruleset, &guard.approved]);
            match rule.action {
                PermissionAction::Allow => continue,
                PermissionAction::Deny => {
                    tracing::debug!(
                        project_id = %project,
                        session_id = %input.session_id,
                        permission = %input.permission,
                        pattern = %pattern,
                        "permission denied by rule"
                    );
                    return Err(PermissionError::Denied {
                        permission: input.permission.clone(),
                    }
                    .into());
                }
                PermissionAction::Ask => {
                    let request = PermissionRequest {
                        id: PermissionRequestId::new(),
                        session_id: input.session_id.clone(),
                        permission: input.permission.clone(),
                        patterns: input.patterns.clone(),
                        metadata: input.metadata.clone(),
                        always: input.always.clone(),
                        tool: input.tool.clone(),
                    };
                    let (tx, rx) = oneshot::channel();
                    guard.pending.insert(
                        request.id.clone(),
                        PendingEntry {
                            request: request.clone(),
                            responder: tx,
                        },
                    );
                    drop(guard);

                    tracing::info!(
                        project_id = %project,
                        session_id = %request.session_id,
                        request_id = %request.id,
                        permission = %request.permission,
                        "permission asked"
                    );
                    let id = request.id.clone();
                    self.bus.publish(project, BusEvent::PermissionAsked(request));
                    return Ok(PermissionTicket {
                        pending: Some(PendingWait {
                            id: id.clone(),
                            rx,
                            _cleanup: PendingCleanup {
                                state: Arc::downgrade(&state),
                                id,
                            },
                        }),
                    });
                }
            }
        }
        Ok(PermissionTicket::granted())
    }

    /// Evaluate and, if needed, suspend until a reply arrives.
    pub async fn ask(&self, project: &ProjectId, input: AskInput) -> Result<()> {
        self.request(project, input)?.wait().await?;
        Ok(())
    }

    /// Resolve a pending request. Unknown ids return `Ok(false)`.
    pub fn reply(
        &self,
        project: &ProjectId,
        request_id: &PermissionRequestId,
        reply: PermissionReply,
        message: Option<String>,
    ) -> Result<bool> {
        let state = self.state(project)?;
        let mut resolved: Vec<(PermissionRequest, PermissionReply)> = Vec::new();
        {
            let mut guard = lock(&state);
            let Some(entry) = guard.pending.remove(request_id) else {
                return Ok(false);
            };
            let session_id = entry.request.session_id.clone();

            match reply {
                PermissionReply::Once => {
                    let _ = entry.responder.send(Ok(()));
                    resolved.push((entry.request, reply));
                }
                PermissionReply::Reject => {
                    let error = match message {
                        Some(feedback) => PermissionError::Corrected { feedback },
                        None => PermissionError::Rejected,
                    };
                    let _ = entry.responder.send(Err(error));
                    resolved.push((entry.request, reply));

                    let siblings: Vec<PermissionRequestId> = guard
                        .pending
                        .values()
                        .filter(|pending| pending.request.session_id == session_id)
                        .map(|pending| pending.request.id.clone())
                        .collect();
                    for id in siblings {
                        if let Some(sibling) = guard.pending.remove(&id) {
                            let _ = sibling.responder.send(Err(PermissionError::Rejected));
                            resolved.push((sibling.request, PermissionReply::Reject));
                        }
                    }
                }
                PermissionReply::Always => {
                    let mut approved = guard.approved.clone();
                    approved.extend(
                        entry
                            .request
                            .always
                            .iter()
                            .map(|pattern| PermissionRule::allow(entry.request.permission.as_str(), pattern.as_str())),
                    );
                    let persisted = serde_json::to_value(&approved)
                        .map_err(BuddyError::from)
                        .and_then(|value| self.store.put_value(project, APPROVED_KEY, &value));
                    if let Err(err) = persisted {
                        tracing::warn!(project_id = %project, error = %err, "failed to persist approvals");
                        guard.pending.insert(request_id.clone(), entry);
                        return Err(err);
                    }
                    guard.approved = approved;
                    let _ = entry.responder.send(Ok(()));
                    resolved.push((entry.request, reply));

                    let unblocked: Vec<PermissionRequestId> = guard
                        .pending
                        .values()
                        .filter(|pending| pending.request.session_id == session_id)
                        .filter(|pending| {
                            pending.request.patterns.iter().all(|pattern| {
                                evaluate(&pending.request.permission, pattern, &[&guard.approved]).action
                                    == PermissionAction::Allow
                            })
                        })
                        .map(|pending| pending.request.id.clone())
                        .collect();
                    for id in unblocked {
                        if let Some(sibling) = guard.pending.remove(&id) {
                            let _ = sibling.responder.send(Ok(()));
                            resolved.push((sibling.request, PermissionReply::Always));
                        }
                    }
                }
            }
        }

        for (request, reply) in resolved {
            tracing::info!(
                project_id = %project,
                session_id = %request.session_id,
                request_id = %request.id,
                reply = %reply,
                "permission replied"
            );
            self.bus.publish(
                project,
                BusEvent::PermissionReplied {
                    session_id: request.session_id,
                    request_id: request.id,
                    reply,
                },
            );
        }
        Ok(true)
    }

    /// Pending requests of a project in creation order.
    pub fn list(&self, project: &ProjectId) -> Result<Vec<PermissionRequest>> {
        let state = self.state(project)?;
        let guard = lock(&state);
        Ok(guard.pending.values().map(|entry| entry.request.clone()).collect())
    }

    /// Rules accumulated from `always` replies.
    pub fn approved(&self, project: &ProjectId) -> Result<Ruleset> {
        let state = self.state(project)?;
        let guard = lock(&state);
        Ok(guard.approved.clone())
    }
}
