//! In-memory busy/abort bookkeeping.
//!
//! One active turn per session, partitioned by project. Never persisted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::types::{ProjectId, SessionId};

/// Identifies one registration of an active turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TurnId(u64);

#[derive(Debug, Clone)]
struct ActiveTurn {
    id: TurnId,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
pub struct ActiveTurns {
    projects: DashMap<ProjectId, HashMap<SessionId, ActiveTurn>>,
    next_id: AtomicU64,
}

impl ActiveTurns {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self, cancel: CancellationToken) -> ActiveTurn {
        ActiveTurn {
            id: TurnId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            cancel,
        }
    }

    /// Register `cancel` as the session's active handle, replacing any other.
    pub fn set(&self, project: &ProjectId, session: &SessionId, cancel: CancellationToken) -> TurnId {
        let turn = self.allocate(cancel);
        let id = turn.id;
        self.projects
            .entry(project.clone())
            .or_default()
            .insert(session.clone(), turn);
        id
    }

    /// Register `cancel` only if the session has no active handle.
    pub fn begin(
        &self,
        project: &ProjectId,
        session: &SessionId,
        cancel: CancellationToken,
    ) -> Option<TurnId> {
        let mut sessions = self.projects.entry(project.clone()).or_default();
        if sessions.contains_key(session) {
            return None;
        }
        let turn = self.allocate(cancel);
        let id = turn.id;
        sessions.insert(session.clone(), turn);
        Some(id)
    }

    pub fn is_busy(&self, project: &ProjectId, session: &SessionId) -> bool {
        self.projects
            .get(project)
            .is_some_and(|sessions| sessions.contains_key(session))
    }

    pub fn token(&self, project: &ProjectId, session: &SessionId) -> Option<CancellationToken> {
        self.projects
            .get(project)
            .and_then(|sessions| sessions.get(session).map(|turn| turn.cancel.clone()))
    }

    /// Remove the session's handle unconditionally.
    pub fn clear(&self, project: &ProjectId, session: &SessionId) -> bool {
        self.remove_where(project, session, |_| true).is_some()
    }

    /// Remove the session's handle only if it is still `turn`.
    pub fn release(&self, project: &ProjectId, session: &SessionId, turn: TurnId) -> bool {
        self.remove_where(project, session, |active| active.id == turn)
            .is_some()
    }

    /// Cancel and remove the session's handle. Returns whether one existed.
    pub fn abort(&self, project: &ProjectId, session: &SessionId) -> bool {
        match self.remove_where(project, session, |_| true) {
            Some(turn) => {
                turn.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn remove_where(
        &self,
        project: &ProjectId,
        session: &SessionId,
        predicate: impl FnOnce(&ActiveTurn) -> bool,
    ) -> Option<ActiveTurn> {
        let removed = {
            let mut sessions = self.projects.get_mut(project)?;
            if !sessions.get(session).is_some_and(predicate) {
                return None;
            }
            sessions.remove(session)
        };
        self.projects.remove_if(project, |_, sessions| sessions.is_empty());
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (ProjectId, SessionId) {
        (ProjectId::from("p1"), SessionId::from("session_1"))
    }

    #[test]
    fn busy_follows_set_and_clear() {
        let turns = ActiveTurns::new();
        let (project, session) = ids();
        assert!(!turns.is_busy(&project, &session));
        turns.set(&project, &session, CancellationToken::new());
        assert!(turns.is_busy(&project, &session));
        assert!(turns.clear(&project, &session));
        assert!(!turns.is_busy(&project, &session));
        assert!(turns.projects.is_empty());
    }

    #[test]
    fn begin_refuses_a_second_turn() {
        let turns = ActiveTurns::new();
        let (project, session) = ids();
        assert!(turns.begin(&project, &session, CancellationToken::new()).is_some());
        assert!(turns.begin(&project, &session, CancellationToken::new()).is_none());
    }

    #[test]
    fn abort_cancels_and_reports_existence() {
        let turns = ActiveTurns::new();
        let (project, session) = ids();
        assert!(!turns.abort(&project, &session));
        let token = CancellationToken::new();
        turns.set(&project, &session, token.clone());
        assert!(turns.abort(&project, &session));
        assert!(token.is_cancelled());
        assert!(!turns.is_busy(&project, &session));
    }

    #[test]
    fn release_ignores_a_newer_turn() {
        let turns = ActiveTurns::new();
        let (project, session) = ids();
        let old = turns.set(&project, &session, CancellationToken::new());
        turns.abort(&project, &session);
        let new = turns.set(&project, &session, CancellationToken::new());
        assert!(!turns.release(&project, &session, old));
        assert!(turns.is_busy(&project, &session));
        assert!(turns.release(&project, &session, new));
    }

    #[test]
    fn projects_are_isolated() {
        let turns = ActiveTurns::new();
        let (project, session) = ids();
        turns.set(&project, &session, CancellationToken::new());
        assert!(!turns.is_busy(&ProjectId::from("p2"), &session));
    }
}
