//! Gateway Server websocket entrypoint (spec §4.G). Fixed upgrade path
//! `/socket.io/`, kept for client compatibility; framing underneath is
//! plain JSON envelopes, not the proprietary protocol the path name
//! suggests. Authentication token is read, in order, from the `token` query
//! parameter, the `Authorization: Bearer` header, or a `token.`-prefixed
//! websocket subprotocol entry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use chrono::Utc;
use domain::{MessageEnvelope, TokenError};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use services::gateway::{Connection, ConnectionSink, DisconnectReason, FailureReason};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

pub async fn gateway_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let token = extract_token(&query, &headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

fn extract_token(query: &TokenQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query.token.as_ref().filter(|t| !t.is_empty()) {
        return Some(token.clone());
    }

    if let Some(raw) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(stripped) = raw.strip_prefix("Bearer ") {
            return Some(stripped.to_string());
        }
    }

    if let Some(raw) = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
    {
        for entry in raw.split(',') {
            if let Some(stripped) = entry.trim().strip_prefix("token.") {
                return Some(stripped.to_string());
            }
        }
    }

    None
}

fn failure_reason(err: TokenError) -> FailureReason {
    match err {
        TokenError::AuthRequired => FailureReason::AuthRequired,
        TokenError::AuthInvalid => FailureReason::AuthInvalid,
        TokenError::AuthExpired => FailureReason::AuthExpired,
    }
}

/// One connection's lifecycle: authenticate, create a session, register,
/// dispatch inbound envelopes until the socket closes. Every accepted
/// upgrade emits exactly one of `session_created`/`auth_error` (spec §8
/// invariant 1).
async fn handle_socket(socket: WebSocket, state: AppState, token: Option<String>) {
    let connection_id = format!("conn_{}", Uuid::new_v4().simple());
    state.metrics.record_attempt(&connection_id);

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sink.send(msg).await.is_err() {
                break;
            }
        }
    });
    let sink: Arc<dyn ConnectionSink> = Arc::new(WsSink::new(tx));

    let payload = match state.token_verifier.verify(token.as_deref()) {
        Ok(payload) => payload,
        Err(err) => {
            state
                .metrics
                .record_failure(&connection_id, failure_reason(err));
            send_auth_error(&sink, err.code(), &err.to_string()).await;
            sink.close(4001, err.to_string()).await;
            writer.abort();
            return;
        }
    };

    let session = match tokio::time::timeout(
        Duration::from_millis(state.config.session_create_timeout_ms),
        state
            .session_store
            .create(payload.user_id.clone(), Some(connection_id.clone())),
    )
    .await
    {
        Ok(session) => session,
        Err(_) => {
            state
                .metrics
                .record_failure(&connection_id, FailureReason::SessionCreateFailed);
            let message = "Timed out creating session";
            send_auth_error(&sink, "SESSION_CREATE_FAILED", message).await;
            sink.close(4001, message.to_string()).await;
            writer.abort();
            return;
        }
    };

    let connection = Connection::new(
        connection_id.clone(),
        payload.user_id.clone(),
        Some(session.id.clone()),
        sink.clone(),
    );
    state.registry.register(connection).await;
    state.metrics.record_success(&connection_id);
    state
        .metrics
        .set_active(state.registry.count().await as u64);

    let ts = Utc::now().timestamp_millis();
    if let Ok(envelope) = MessageEnvelope::new(
        "session_created",
        Some(session.id.clone()),
        Some(json!({
            "sessionId": session.id,
            "userId": payload.user_id,
            "isGuest": payload.is_guest,
            "timestamp": ts,
        })),
        ts,
    ) {
        state.registry.send_to_session(&session.id, &envelope).await;
    }

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                handle_inbound(&state, &session.id, &connection_id, text.as_str()).await
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    state.registry.unregister(&connection_id).await;
    state.session_store.delete(&session.id).await;
    state.metrics.record_disconnection(DisconnectReason::Normal);
    state
        .metrics
        .set_active(state.registry.count().await as u64);
}

async fn handle_inbound(state: &AppState, session_id: &str, connection_id: &str, text: &str) {
    let envelope = match MessageEnvelope::deserialize(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            emit_protocol_error(state, session_id, err.to_string()).await;
            return;
        }
    };

    match envelope.kind.as_str() {
        "pong" => {
            if let Some(connection) = state.registry.lookup(connection_id).await {
                connection.touch_pong().await;
            }
        }
        "ping" => {
            if let Some(connection) = state.registry.lookup(connection_id).await {
                connection.touch_pong().await;
            }
            let ts = Utc::now().timestamp_millis();
            if let Ok(pong) = MessageEnvelope::new(
                "pong",
                Some(session_id.to_string()),
                Some(json!({"timestamp": ts})),
                ts,
            ) {
                state.registry.send_to_session(session_id, &pong).await;
            }
        }
        _ => state.router.route(session_id, &envelope).await,
    }
}

/// Protocol errors (malformed envelopes) produce an `error` envelope and
/// leave the connection open (spec §7), unlike auth/state errors.
async fn emit_protocol_error(state: &AppState, session_id: &str, message: String) {
    let ts = Utc::now().timestamp_millis();
    if let Ok(envelope) = MessageEnvelope::new(
        "error",
        Some(session_id.to_string()),
        Some(json!({"errorCode": "INVALID_MESSAGE", "errorMessage": message, "recoverable": true})),
        ts,
    ) {
        state.registry.send_to_session(session_id, &envelope).await;
    }
}

async fn send_auth_error(sink: &Arc<dyn ConnectionSink>, code: &str, message: &str) {
    let ts = Utc::now().timestamp_millis();
    if let Ok(envelope) = MessageEnvelope::new(
        "auth_error",
        None,
        Some(json!({"code": code, "message": message, "timestamp": ts})),
        ts,
    ) {
        let _ = sink.send(&envelope).await;
    }
}

/// `ConnectionSink` over a websocket's write half, fed through an mpsc
/// channel so writes stay serialized per connection (spec §5) even though
/// both the inbound loop and the heartbeat ticker may emit concurrently.
struct WsSink {
    tx: mpsc::UnboundedSender<Message>,
    open: AtomicBool,
}

impl WsSink {
    fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            tx,
            open: AtomicBool::new(true),
        }
    }
}

#[async_trait::async_trait]
impl ConnectionSink for WsSink {
    async fn send(&self, envelope: &MessageEnvelope) -> Result<(), String> {
        let text = envelope.serialize().map_err(|e| e.to_string())?;
        self.tx
            .send(Message::Text(text.into()))
            .map_err(|e| e.to_string())
    }

    async fn close(&self, code: u16, reason: String) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.tx.send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })));
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
