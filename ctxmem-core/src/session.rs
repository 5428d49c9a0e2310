//! Session contexts and the manager that owns them.
//!
//! A session scopes every store/retrieve/update/delete call. Each record
//! written under a session carries a copy of its context, so records
//! outlive the session that produced them.

use std::collections::BTreeMap;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CtxMemError, Result};
use crate::events::{EventBus, StoreEvent};
use crate::types::{MemoryId, SessionId, Timestamp};

/// Correlation handle for one caller's interaction stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Unique session identifier.
    pub session_id: SessionId,
    /// Optional end-user identity.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Optional agent identity.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Memory this context was captured for. Set on the record's copy at
    /// store time; always `None` on the manager's own copy.
    #[serde(default)]
    pub memory_id: Option<MemoryId>,
    /// Caller-defined correlation state.
    #[serde(default)]
    pub state: BTreeMap<String, String>,
    /// When the session was created.
    pub timestamp: Timestamp,
}

impl SessionContext {
    /// Create a fresh context with a new id.
    #[must_use]
    pub fn new(user_id: Option<String>, agent_id: Option<String>) -> Self {
        Self {
            session_id: SessionId::new(),
            user_id,
            agent_id,
            memory_id: None,
            state: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Copy of this context stamped with the memory it was captured for.
    #[must_use]
    pub fn for_memory(&self, memory_id: MemoryId) -> Self {
        Self {
            memory_id: Some(memory_id),
            ..self.clone()
        }
    }
}

/// Owns every open [`SessionContext`].
#[derive(Debug)]
pub struct SessionManager {
    sessions: DashMap<SessionId, SessionContext>,
    events: EventBus,
}

impl SessionManager {
    /// Create an empty manager publishing to `events`.
    #[must_use]
    pub fn new(events: EventBus) -> Self {
        Self {
            sessions: DashMap::new(),
            events,
        }
    }

    /// Open a new session and return its id.
    pub fn create_session(&self, user_id: Option<String>, agent_id: Option<String>) -> SessionId {
        let context = SessionContext::new(user_id, agent_id);
        let session_id = context.session_id;
        info!(
            session = %session_id,
            user = context.user_id.as_deref().unwrap_or("-"),
            agent = context.agent_id.as_deref().unwrap_or("-"),
            "Session created"
        );
        self.sessions.insert(session_id, context);
        self.events.publish(StoreEvent::SessionCreated { session_id });
        session_id
    }

    /// Close a session. Records written under it are untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CtxMemError::SessionNotFound`] if the id is unknown.
    pub fn close_session(&self, session_id: SessionId) -> Result<()> {
        self.sessions
            .remove(&session_id)
            .ok_or(CtxMemError::SessionNotFound(session_id))?;
        info!(session = %session_id, "Session closed");
        self.events.publish(StoreEvent::SessionClosed { session_id });
        Ok(())
    }

    /// Snapshot of a session's context.
    ///
    /// # Errors
    ///
    /// Returns [`CtxMemError::SessionNotFound`] if the id is unknown.
    pub fn get(&self, session_id: SessionId) -> Result<SessionContext> {
        self.sessions
            .get(&session_id)
            .map(|entry| entry.value().clone())
            .ok_or(CtxMemError::SessionNotFound(session_id))
    }

    /// Set one key of the session's correlation state.
    ///
    /// # Errors
    ///
    /// Returns [`CtxMemError::SessionNotFound`] if the id is unknown.
    pub fn set_state(
        &self,
        session_id: SessionId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        let mut entry = self
            .sessions
            .get_mut(&session_id)
            .ok_or(CtxMemError::SessionNotFound(session_id))?;
        entry.state.insert(key.into(), value.into());
        Ok(())
    }

    /// Whether the session is open.
    #[must_use]
    pub fn contains(&self, session_id: SessionId) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Number of open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Close every open session, returning the ids that were closed.
    pub fn close_all(&self) -> Vec<SessionId> {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let mut closed = Vec::with_capacity(ids.len());
        for id in ids {
            if self.close_session(id).is_ok() {
                closed.push(id);
            }
        }
        debug!(closed = closed.len(), "Closed all sessions");
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn create_and_close() {
        let manager = SessionManager::new(EventBus::default());
        let id = manager.create_session(Some("user-1".into()), None);
        assert!(manager.contains(id));
        assert_eq!(manager.get(id).expect("get").user_id.as_deref(), Some("user-1"));

        manager.close_session(id).expect("close");
        assert!(!manager.contains(id));
        let err = manager.close_session(id).expect_err("second close");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn state_is_carried_on_the_context() {
        let manager = SessionManager::new(EventBus::default());
        let id = manager.create_session(None, Some("planner".into()));
        manager.set_state(id, "task", "refactor").expect("set");
        let ctx = manager.get(id).expect("get");
        assert_eq!(ctx.state.get("task").map(String::as_str), Some("refactor"));
        assert_eq!(ctx.memory_id, None);
    }

    #[test]
    fn for_memory_stamps_only_the_copy() {
        let ctx = SessionContext::new(None, None);
        let memory_id = MemoryId::new();
        let stamped = ctx.for_memory(memory_id);
        assert_eq!(stamped.memory_id, Some(memory_id));
        assert_eq!(stamped.session_id, ctx.session_id);
        assert_eq!(ctx.memory_id, None);
    }

    #[tokio::test]
    async fn lifecycle_events_are_published() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let manager = SessionManager::new(bus);
        let id = manager.create_session(None, None);
        manager.close_all();

        assert_eq!(
            rx.recv().await.expect("created"),
            StoreEvent::SessionCreated { session_id: id }
        );
        assert_eq!(
            rx.recv().await.expect("closed"),
            StoreEvent::SessionClosed { session_id: id }
        );
        assert_eq!(manager.session_count(), 0);
    }
}
