//! Connection Registry (spec §4.E).
//!
//! Maps connection id -> Connection. The registry owns every Connection;
//! the Gateway Server and Turn Orchestrator hold only the id for lookup
//! (spec §3: "the Gateway Server and Turn Orchestrator hold back-references
//! only for lookup, never ownership").
//!
//! Writes to a connection's socket are serialized per connection (spec §5):
//! `ConnectionSink::send` is the only way out to the wire, and each
//! concrete sink (the websocket layer in `api`) is responsible for
//! serializing its own writes, typically with a single writer task fed by
//! an mpsc channel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::MessageEnvelope;
use tokio::sync::RwLock;

/// Abstraction over "write this envelope to the client's socket", so the
/// registry (and everything above it) never depends on the websocket
/// library directly. The `api` crate supplies the concrete implementation.
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    async fn send(&self, envelope: &MessageEnvelope) -> Result<(), String>;
    /// Closes the underlying socket with the given close code and reason.
    async fn close(&self, code: u16, reason: String);
    /// Whether the socket's write-state is still OPEN (spec §4.G: "sends to
    /// a socket whose write-state is not OPEN are skipped silently").
    fn is_open(&self) -> bool;
}

/// Process-local connection record (spec §3). Exclusively owned by the
/// registry.
pub struct Connection {
    pub id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub authenticated: bool,
    pub created_at: DateTime<Utc>,
    pub last_pong_at: RwLock<DateTime<Utc>>,
    sink: Arc<dyn ConnectionSink>,
}

impl Connection {
    pub fn new(
        id: String,
        user_id: String,
        session_id: Option<String>,
        sink: Arc<dyn ConnectionSink>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            session_id,
            authenticated: true,
            created_at: now,
            last_pong_at: RwLock::new(now),
            sink,
        }
    }

    pub async fn touch_pong(&self) {
        *self.last_pong_at.write().await = Utc::now();
    }

    pub async fn last_pong_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - *self.last_pong_at.read().await
    }

    /// Sends through the registry's serialized path; silently drops on a
    /// non-OPEN socket (spec §4.G).
    pub async fn emit(&self, envelope: &MessageEnvelope) {
        if !self.sink.is_open() {
            return;
        }
        if let Err(err) = self.sink.send(envelope).await {
            tracing::warn!(connection_id = %self.id, error = %err, "failed to write envelope to socket");
        }
    }

    pub async fn close(&self, code: u16, reason: impl Into<String>) {
        self.sink.close(code, reason.into()).await;
    }
}

/// Maps connection id -> Connection (spec §4.E). Losing a connection means
/// losing the mapping: this store is process-local and not persisted.
#[derive(Default)]
pub struct ConnectionRegistry {
    by_id: RwLock<HashMap<String, Arc<Connection>>>,
    /// At most one live connection per session; the latest registration
    /// wins on collision (spec §4.E).
    by_session: RwLock<HashMap<String, String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, connection: Connection) -> Arc<Connection> {
        let connection = Arc::new(connection);
        let mut by_id = self.by_id.write().await;
        if let Some(session_id) = &connection.session_id {
            self.by_session
                .write()
                .await
                .insert(session_id.clone(), connection.id.clone());
        }
        by_id.insert(connection.id.clone(), connection.clone());
        connection
    }

    pub async fn unregister(&self, connection_id: &str) {
        let mut by_id = self.by_id.write().await;
        if let Some(connection) = by_id.remove(connection_id) {
            if let Some(session_id) = &connection.session_id {
                self.by_session.write().await.remove(session_id);
            }
        }
    }

    pub async fn lookup(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.by_id.read().await.get(connection_id).cloned()
    }

    pub async fn lookup_by_session(&self, session_id: &str) -> Option<Arc<Connection>> {
        let connection_id = self.by_session.read().await.get(session_id).cloned()?;
        self.lookup(&connection_id).await
    }

    pub async fn enumerate(&self) -> Vec<Arc<Connection>> {
        self.by_id.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.by_id.read().await.len()
    }

    /// `send-to-session` / `emit-to-session` (spec §4.E): writes go through
    /// the registry so serialization can be enforced at the connection.
    pub async fn send_to_session(&self, session_id: &str, envelope: &MessageEnvelope) {
        if let Some(connection) = self.lookup_by_session(session_id).await {
            connection.emit(envelope).await;
        }
    }

    pub async fn broadcast(&self, envelope: &MessageEnvelope) {
        for connection in self.enumerate().await {
            connection.emit(envelope).await;
        }
    }
}
