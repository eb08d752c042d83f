//! Message Router (spec §4.I). Maps inbound client envelope kinds to state
//! transitions and Turn Orchestrator calls. This is the variant that cancels
//! the active turn on interruption (spec §9 open question: the source has a
//! legacy variant that does not; this spec adopts the cancelling one).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use config::GatewayConfig;
use domain::{ConversationState, MessageEnvelope};
use serde_json::json;

use super::orchestrator::TurnOrchestrator;
use super::registry::ConnectionRegistry;
use super::session::{SessionStore, SessionStoreError};

/// Routes envelopes of kind `audio_chunk`, `end_utterance`, `interruption`
/// and `retry_asr` (spec §4.I). Constructed once per process and shared the
/// way the orchestrator is.
pub struct MessageRouter {
    session_store: Arc<SessionStore>,
    registry: Arc<ConnectionRegistry>,
    orchestrator: Arc<TurnOrchestrator>,
    config: Arc<GatewayConfig>,
}

impl MessageRouter {
    pub fn new(
        session_store: Arc<SessionStore>,
        registry: Arc<ConnectionRegistry>,
        orchestrator: Arc<TurnOrchestrator>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            session_store,
            registry,
            orchestrator,
            config,
        }
    }

    /// Dispatches one envelope already known to carry a session id. Router
    /// errors are caught here and emitted as `error` envelopes with
    /// `errorCode = INTERNAL_ERROR` rather than propagated (spec §4.I, §7).
    pub async fn route(&self, session_id: &str, envelope: &MessageEnvelope) {
        let result = match envelope.kind.as_str() {
            "audio_chunk" => self.handle_audio_chunk(session_id, envelope).await,
            "end_utterance" => self.handle_end_utterance(session_id).await,
            "interruption" => self.handle_interruption(session_id, envelope).await,
            "retry_asr" => self.handle_retry_asr(session_id).await,
            other => {
                tracing::debug!(session_id, kind = other, "unknown message kind, dropping");
                Ok(())
            }
        };

        if let Err(err) = result {
            tracing::warn!(session_id, %err, "message router error");
            self.emit_error(session_id, "INTERNAL_ERROR", err.to_string(), true).await;
        }
    }

    async fn handle_audio_chunk(&self, session_id: &str, envelope: &MessageEnvelope) -> Result<(), RouterError> {
        let session = self
            .session_store
            .find_by_id(session_id)
            .await
            .ok_or_else(|| RouterError::SessionNotFound(session_id.to_string()))?;

        if session.state == ConversationState::Idle {
            match self.session_store.transition_state(session_id, ConversationState::Listening).await {
                Ok(outcome) => self.emit_state_changed(session_id, outcome.previous_state, outcome.current_state).await,
                Err(SessionStoreError::InvalidTransition(_)) => {
                    // Another task raced us into a non-IDLE state; proceed
                    // with the chunk regardless, the orchestrator is the
                    // source of truth for turn admission.
                }
                Err(err) => return Err(RouterError::Session(err)),
            }
        }

        let audio = decode_audio_chunk(envelope)?;
        self.orchestrator.ingest_audio_chunk(session_id, audio).await;
        Ok(())
    }

    async fn handle_end_utterance(&self, session_id: &str) -> Result<(), RouterError> {
        let session = self
            .session_store
            .find_by_id(session_id)
            .await
            .ok_or_else(|| RouterError::SessionNotFound(session_id.to_string()))?;

        match self.session_store.transition_state(session_id, ConversationState::Processing).await {
            Ok(outcome) => {
                self.emit_state_changed(session_id, outcome.previous_state, outcome.current_state).await;
                self.orchestrator.finalize_utterance(session_id, &session.user_id).await;
                Ok(())
            }
            Err(SessionStoreError::InvalidTransition(_)) => {
                self.emit_state_error(
                    session_id,
                    session.state,
                    ConversationState::Processing,
                    "Invalid state transition".to_string(),
                )
                .await;
                Ok(())
            }
            Err(err) => Err(RouterError::Session(err)),
        }
    }

    async fn handle_interruption(&self, session_id: &str, envelope: &MessageEnvelope) -> Result<(), RouterError> {
        let turn_index = envelope
            .data
            .as_ref()
            .and_then(|d| d.get("turnIndex"))
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        let current = self
            .session_store
            .find_by_id(session_id)
            .await
            .ok_or_else(|| RouterError::SessionNotFound(session_id.to_string()))?
            .state;

        match self.session_store.transition_state(session_id, ConversationState::Interrupted).await {
            Ok(outcome) => {
                self.emit_state_changed(session_id, outcome.previous_state, outcome.current_state).await;
            }
            Err(SessionStoreError::InvalidTransition(_)) => {
                self.emit_state_error(
                    session_id,
                    current,
                    ConversationState::Interrupted,
                    "Invalid state transition".to_string(),
                )
                .await;
                return Ok(());
            }
            Err(err) => return Err(RouterError::Session(err)),
        }

        if let Err(err) = self
            .session_store
            .set_metadata(
                session_id,
                "lastInterruption",
                json!({"turnIndex": turn_index, "timestamp": Utc::now().timestamp_millis()}),
            )
            .await
        {
            tracing::warn!(session_id, %err, "failed to record interruption in session metadata");
        }

        self.orchestrator.cancel_turn(session_id).await;

        self.emit(
            session_id,
            "conversation:interrupted",
            json!({"turnIndex": turn_index, "timestamp": Utc::now().timestamp_millis()}),
        )
        .await;

        let session_store = self.session_store.clone();
        let registry = self.registry.clone();
        let session_id = session_id.to_string();
        let settle = Duration::from_millis(self.config.interruption_settle_ms);
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            if let Ok(outcome) = session_store.transition_state(&session_id, ConversationState::Listening).await {
                let ts = Utc::now().timestamp_millis();
                if let Ok(envelope) = MessageEnvelope::new(
                    "state:changed",
                    Some(session_id.clone()),
                    Some(json!({
                        "previousState": outcome.previous_state.as_wire_str(),
                        "currentState": outcome.current_state.as_wire_str(),
                        "timestamp": ts,
                    })),
                    ts,
                ) {
                    registry.send_to_session(&session_id, &envelope).await;
                }
            }
        });

        Ok(())
    }

    async fn handle_retry_asr(&self, session_id: &str) -> Result<(), RouterError> {
        self.emit(
            session_id,
            "asr_retry_acknowledged",
            json!({"message": "Didn't catch that - please try again."}),
        )
        .await;
        Ok(())
    }

    async fn emit_state_changed(&self, session_id: &str, previous: ConversationState, current: ConversationState) {
        self.emit(
            session_id,
            "state:changed",
            json!({
                "previousState": previous.as_wire_str(),
                "currentState": current.as_wire_str(),
                "timestamp": Utc::now().timestamp_millis(),
            }),
        )
        .await;
    }

    async fn emit_state_error(&self, session_id: &str, from: ConversationState, to: ConversationState, message: String) {
        self.emit(
            session_id,
            "state:error",
            json!({
                "attemptedTransition": {"from": from.as_wire_str(), "to": to.as_wire_str()},
                "errorMessage": message,
                "timestamp": Utc::now().timestamp_millis(),
            }),
        )
        .await;
    }

    async fn emit_error(&self, session_id: &str, error_code: &str, message: String, recoverable: bool) {
        self.emit(
            session_id,
            "error",
            json!({"errorCode": error_code, "errorMessage": message, "recoverable": recoverable}),
        )
        .await;
    }

    async fn emit(&self, session_id: &str, kind: &str, data: serde_json::Value) {
        match MessageEnvelope::new(kind, Some(session_id.to_string()), Some(data), Utc::now().timestamp_millis()) {
            Ok(envelope) => self.registry.send_to_session(session_id, &envelope).await,
            Err(err) => tracing::error!(%err, kind, "failed to construct outbound envelope"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
enum RouterError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error(transparent)]
    Session(#[from] SessionStoreError),
    #[error("audio_chunk envelope missing or malformed audioData: {0}")]
    MalformedAudio(String),
}

fn decode_audio_chunk(envelope: &MessageEnvelope) -> Result<Vec<u8>, RouterError> {
    use base64::Engine;

    let data = envelope
        .data
        .as_ref()
        .ok_or_else(|| RouterError::MalformedAudio("missing data".to_string()))?;
    let audio_b64 = data
        .get("audioData")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RouterError::MalformedAudio("missing audioData".to_string()))?;
    base64::engine::general_purpose::STANDARD
        .decode(audio_b64)
        .map_err(|e| RouterError::MalformedAudio(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::registry::{Connection, ConnectionSink};
    use async_trait::async_trait;
    use base64::Engine;
    use inference_providers::{MockAsrClient, MockLipsyncClient, MockLlmClient, MockRagClient, MockTtsClient};
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        kinds: StdMutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self { kinds: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl ConnectionSink for RecordingSink {
        async fn send(&self, envelope: &MessageEnvelope) -> Result<(), String> {
            self.kinds.lock().unwrap().push(envelope.kind.clone());
            Ok(())
        }
        async fn close(&self, _code: u16, _reason: String) {}
        fn is_open(&self) -> bool {
            true
        }
    }

    async fn test_router() -> (MessageRouter, Arc<SessionStore>, Arc<ConnectionRegistry>, domain::Session, Arc<RecordingSink>) {
        let config = Arc::new(GatewayConfig { interruption_settle_ms: 5, ..GatewayConfig::default() });
        let session_store = Arc::new(SessionStore::new(300));
        let registry = Arc::new(ConnectionRegistry::new());
        let orchestrator = TurnOrchestrator::new(
            session_store.clone(),
            registry.clone(),
            Arc::new(MockAsrClient::new("hi")),
            Arc::new(MockRagClient::empty()),
            Arc::new(MockLlmClient::new("Hi.")),
            Arc::new(MockTtsClient::new(vec![0u8; 2])),
            Arc::new(MockLipsyncClient::default()),
            None,
            config.clone(),
        );
        let router = MessageRouter::new(session_store.clone(), registry.clone(), orchestrator, config);

        let session = session_store.create("user-1".to_string(), Some("conn-1".to_string())).await;
        let sink = Arc::new(RecordingSink::new());
        registry
            .register(Connection::new("conn-1".to_string(), "user-1".to_string(), Some(session.id.clone()), sink.clone()))
            .await;

        (router, session_store, registry, session, sink)
    }

    #[tokio::test]
    async fn audio_chunk_transitions_idle_to_listening() {
        let (router, session_store, _registry, session, _sink) = test_router().await;
        let envelope = MessageEnvelope::new(
            "audio_chunk",
            Some(session.id.clone()),
            Some(json!({
                "sequenceNumber": 0,
                "audioData": base64::engine::general_purpose::STANDARD.encode([0u8; 4]),
            })),
            1,
        )
        .unwrap();

        router.route(&session.id, &envelope).await;

        let updated = session_store.find_by_id(&session.id).await.unwrap();
        assert_eq!(updated.state, ConversationState::Listening);
    }

    #[tokio::test]
    async fn retry_asr_acknowledges_without_changing_state() {
        let (router, session_store, _registry, session, sink) = test_router().await;
        let envelope = MessageEnvelope::new("retry_asr", Some(session.id.clone()), None, 1).unwrap();

        router.route(&session.id, &envelope).await;

        let updated = session_store.find_by_id(&session.id).await.unwrap();
        assert_eq!(updated.state, ConversationState::Idle);
        assert!(sink.kinds.lock().unwrap().contains(&"asr_retry_acknowledged".to_string()));
    }

    #[tokio::test]
    async fn interruption_emits_conversation_interrupted_and_settles_to_listening() {
        let (router, session_store, _registry, session, sink) = test_router().await;
        session_store.transition_state(&session.id, ConversationState::Listening).await.unwrap();
        session_store.transition_state(&session.id, ConversationState::Processing).await.unwrap();
        session_store.transition_state(&session.id, ConversationState::Speaking).await.unwrap();

        let envelope = MessageEnvelope::new(
            "interruption",
            Some(session.id.clone()),
            Some(json!({"turnIndex": 7})),
            1,
        )
        .unwrap();
        router.route(&session.id, &envelope).await;

        let updated = session_store.find_by_id(&session.id).await.unwrap();
        assert_eq!(updated.state, ConversationState::Interrupted);
        assert!(sink.kinds.lock().unwrap().contains(&"conversation:interrupted".to_string()));
        assert!(updated.metadata.contains_key("lastInterruption"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = session_store.find_by_id(&session.id).await.unwrap();
        assert_eq!(settled.state, ConversationState::Listening);
    }

    #[tokio::test]
    async fn unknown_kind_is_dropped_without_error() {
        let (router, _session_store, _registry, session, sink) = test_router().await;
        let envelope = MessageEnvelope::new("mystery_kind", Some(session.id.clone()), None, 1).unwrap();
        router.route(&session.id, &envelope).await;
        assert!(sink.kinds.lock().unwrap().is_empty());
    }
}
