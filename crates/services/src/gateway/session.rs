//! Session Store (spec §4.D).
//!
//! Per-connection session records, keyed by session id with a secondary
//! index by connection id. Mutations go through a single coarse lock (the
//! pattern the rest of this codebase uses for its in-memory maps, e.g.
//! `services::mcp::manager::McpClientManager`); critical sections are kept
//! to a clone-mutate-store so contention between unrelated session ids stays
//! low in practice even though the lock itself is shared.
//!
//! `transitionState` is the *only* entry point allowed to change a stored
//! session's state (spec §4.C, §4.D): callers never write `session.state`
//! directly.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use domain::{ConversationState, Session, StateMachineError, Turn};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionStoreError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    InvalidTransition(#[from] StateMachineError),
}

/// Result of a successful `transitionState` call (spec §4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub previous_state: ConversationState,
    pub current_state: ConversationState,
}

struct Inner {
    by_id: HashMap<String, Session>,
    /// At most one live session per connection id (spec §3).
    by_connection: HashMap<String, String>,
}

/// Per-connection session record keeper (spec §4.D). Construct one instance
/// per process and share it via `Arc` the way the gateway shares the
/// Connection Registry and Metrics Collector (spec §9 "global mutable
/// state").
pub struct SessionStore {
    inner: RwLock<Inner>,
    ttl: chrono::Duration,
}

impl SessionStore {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_id: HashMap::new(),
                by_connection: HashMap::new(),
            }),
            ttl: chrono::Duration::seconds(ttl_secs),
        }
    }

    /// `create(userId, connectionId) -> Session` (spec §4.D): fresh id,
    /// state IDLE, empty history, `expiresAt = now + SESSION_TTL`.
    pub async fn create(&self, user_id: String, connection_id: Option<String>) -> Session {
        let session = Session::new(user_id, connection_id.clone(), self.ttl);
        let mut inner = self.inner.write().await;
        if let Some(conn_id) = connection_id {
            inner.by_connection.insert(conn_id, session.id.clone());
        }
        inner.by_id.insert(session.id.clone(), session.clone());
        session
    }

    /// Expired records are treated as absent (spec §4.D).
    pub async fn find_by_id(&self, id: &str) -> Option<Session> {
        let inner = self.inner.read().await;
        inner
            .by_id
            .get(id)
            .filter(|s| !s.is_expired(Utc::now()))
            .cloned()
    }

    pub async fn find_by_connection_id(&self, connection_id: &str) -> Option<Session> {
        let inner = self.inner.read().await;
        let session_id = inner.by_connection.get(connection_id)?;
        inner
            .by_id
            .get(session_id)
            .filter(|s| !s.is_expired(Utc::now()))
            .cloned()
    }

    /// Overwrites state and history, refreshes `lastActivityAt`/`expiresAt`
    /// (spec §4.D). Callers needing a state change go through
    /// `transition_state` instead so the machine's legality check applies.
    pub async fn update(&self, mut session: Session) -> Session {
        session.touch(self.ttl, Utc::now());
        let mut inner = self.inner.write().await;
        if let Some(conn_id) = &session.connection_id {
            inner
                .by_connection
                .insert(conn_id.clone(), session.id.clone());
        }
        inner.by_id.insert(session.id.clone(), session.clone());
        session
    }

    pub async fn delete(&self, id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.by_id.remove(id) {
            if let Some(conn_id) = session.connection_id {
                inner.by_connection.remove(&conn_id);
            }
        }
    }

    pub async fn delete_by_connection_id(&self, connection_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(session_id) = inner.by_connection.remove(connection_id) {
            inner.by_id.remove(&session_id);
        }
    }

    /// Atomic read-validate-write under the §4.C transition table; the only
    /// entry point for state changes (spec §4.D).
    pub async fn transition_state(
        &self,
        id: &str,
        new_state: ConversationState,
    ) -> Result<TransitionOutcome, SessionStoreError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .by_id
            .get_mut(id)
            .filter(|s| !s.is_expired(Utc::now()))
            .ok_or_else(|| SessionStoreError::NotFound(id.to_string()))?;

        let previous_state = session.state;
        let current_state = previous_state.transition(new_state)?;
        session.state = current_state;
        session.touch(self.ttl, Utc::now());

        Ok(TransitionOutcome {
            previous_state,
            current_state,
        })
    }

    /// Appends a completed Turn to a session's history (spec §3: "committed
    /// to history once and never modified").
    pub async fn append_turn(&self, id: &str, turn: Turn) -> Result<(), SessionStoreError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .by_id
            .get_mut(id)
            .ok_or_else(|| SessionStoreError::NotFound(id.to_string()))?;
        session.conversation_history.push(turn);
        session.touch(self.ttl, Utc::now());
        Ok(())
    }

    /// Records a free-form key/value entry on a session (spec §3 "metadata
    /// (free-form key/value)"), used by the Message Router to note events
    /// like an interruption (spec §4.I: "record the event in session
    /// metadata").
    pub async fn set_metadata(
        &self,
        id: &str,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), SessionStoreError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .by_id
            .get_mut(id)
            .ok_or_else(|| SessionStoreError::NotFound(id.to_string()))?;
        session.metadata.insert(key.into(), value);
        session.touch(self.ttl, Utc::now());
        Ok(())
    }

    /// The last `n` turns of conversation history, oldest first (spec §4.H
    /// stage B: "fetches the last N turns of conversation history for
    /// context").
    pub async fn recent_history(&self, id: &str, n: usize) -> Vec<Turn> {
        let inner = self.inner.read().await;
        match inner.by_id.get(id) {
            Some(session) => {
                let len = session.conversation_history.len();
                let start = len.saturating_sub(n);
                session.conversation_history[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// `cleanupExpired() -> count` (spec §4.D), called by the periodic sweep
    /// in `spawn_expiry_sweep`.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let expired_ids: Vec<String> = inner
            .by_id
            .iter()
            .filter(|(_, s)| s.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired_ids {
            if let Some(session) = inner.by_id.remove(id) {
                if let Some(conn_id) = session.connection_id {
                    inner.by_connection.remove(&conn_id);
                }
            }
        }
        expired_ids.len()
    }
}

/// Spawns the periodic expiry sweep (spec §4.D: "default every 5 minutes").
/// Returns a handle whose drop does not stop the task; callers that need a
/// clean shutdown should `abort()` the returned handle explicitly.
pub fn spawn_expiry_sweep(
    store: Arc<SessionStore>,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = store.cleanup_expired().await;
            if removed > 0 {
                info!(removed, "session expiry sweep removed expired sessions");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_sets_idle_state_and_slides_expiry() {
        let store = SessionStore::new(60);
        let session = store
            .create("user-1".to_string(), Some("conn-1".to_string()))
            .await;
        assert_eq!(session.state, ConversationState::Idle);
        assert!(session.conversation_history.is_empty());
        assert!(session.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn find_by_connection_id_resolves_through_the_secondary_index() {
        let store = SessionStore::new(60);
        let session = store
            .create("user-1".to_string(), Some("conn-1".to_string()))
            .await;
        let found = store.find_by_connection_id("conn-1").await.unwrap();
        assert_eq!(found.id, session.id);
    }

    #[tokio::test]
    async fn expired_sessions_are_treated_as_absent() {
        let store = SessionStore::new(-1);
        let session = store.create("user-1".to_string(), None).await;
        assert!(store.find_by_id(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn transition_state_refuses_illegal_transitions() {
        let store = SessionStore::new(60);
        let session = store.create("user-1".to_string(), None).await;
        let err = store
            .transition_state(&session.id, ConversationState::Speaking)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionStoreError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn transition_state_applies_legal_transitions_and_slides_expiry() {
        let store = SessionStore::new(60);
        let session = store.create("user-1".to_string(), None).await;
        let outcome = store
            .transition_state(&session.id, ConversationState::Listening)
            .await
            .unwrap();
        assert_eq!(outcome.previous_state, ConversationState::Idle);
        assert_eq!(outcome.current_state, ConversationState::Listening);

        let updated = store.find_by_id(&session.id).await.unwrap();
        assert_eq!(updated.state, ConversationState::Listening);
    }

    #[tokio::test]
    async fn cleanup_expired_counts_and_removes_only_expired_sessions() {
        let store = SessionStore::new(60);
        let live = store.create("user-1".to_string(), None).await;
        let expiring = store.create("user-2".to_string(), Some("conn-2".to_string())).await;

        // Force expiry on the second session only.
        {
            let mut inner = store.inner.write().await;
            inner.by_id.get_mut(&expiring.id).unwrap().expires_at = Utc::now() - chrono::Duration::seconds(1);
        }

        let removed = store.cleanup_expired().await;
        assert_eq!(removed, 1);
        assert!(store.find_by_id(&live.id).await.is_some());
        assert!(store.find_by_id(&expiring.id).await.is_none());
        assert!(store.find_by_connection_id("conn-2").await.is_none());
    }

    #[tokio::test]
    async fn recent_history_returns_last_n_turns_oldest_first() {
        let store = SessionStore::new(60);
        let session = store.create("user-1".to_string(), None).await;
        for i in 0..7 {
            store
                .append_turn(
                    &session.id,
                    Turn {
                        id: format!("turn-{i}"),
                        session_id: session.id.clone(),
                        timestamp: Utc::now(),
                        user_transcript: format!("utterance {i}"),
                        transcript_confidence: 1.0,
                        retrieved_chunks: vec![],
                        llm_response: String::new(),
                        latencies: Default::default(),
                        costs: Default::default(),
                    },
                )
                .await
                .unwrap();
        }

        let history = store.recent_history(&session.id, 5).await;
        assert_eq!(history.len(), 5);
        assert_eq!(history.first().unwrap().id, "turn-2");
        assert_eq!(history.last().unwrap().id, "turn-6");
    }
}
