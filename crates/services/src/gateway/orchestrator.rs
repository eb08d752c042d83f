//! Turn Orchestrator (spec §4.H). Coordinates the five-stage pipeline
//! (ASR -> RAG -> LLM -> TTS -> LIPSYNC) for one turn at a time per session.
//!
//! ASR here is a single-shot request/response capability
//! (`AsrClient::transcribe`), not a true bidirectional stream. Interim
//! transcripts are produced by re-calling `transcribe` with the
//! progressively-accumulated audio buffer on every `audio_chunk`; the call
//! triggered by `end_utterance` is the one treated as final regardless of
//! what the provider reports, since `end_utterance` is the client's own
//! finalize signal. This keeps stage A's external shape (interim/final
//! `transcript` envelopes) without requiring a streaming ASR transport.
//!
//! Stage A (buffering + interim transcripts) runs inline on the caller's
//! task so it stays synchronous with inbound dispatch, matching "inbound
//! queues do not buffer". Once `end_utterance` finalizes the transcript,
//! stages B-E run as a spawned task holding the TurnContext, so the
//! connection's read loop is free to observe a concurrent `interruption`
//! and call `cancel_turn` while the pipeline is still in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use config::GatewayConfig;
use domain::{ConversationState, Turn, TurnLatencies};
use inference_providers::{
    AsrClient, AsrRequest, ChatCompletionParams, ChatMessage, LipsyncClient, LipsyncFrameFormat,
    LipsyncRequest, LlmClient, MessageRole, RagClient, RagQuery, RetrievedChunk, TtsClient,
    TtsRequest,
};
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use uuid::Uuid;

use super::registry::ConnectionRegistry;
use super::session::SessionStore;

/// Sink for completed turns headed to the persistent archive (spec §1: "the
/// persistent session/turn archive, treated as a repository interface").
/// Defined here rather than depending on `database` directly: `database`
/// already depends on `services` for `RepositoryError`, so the dependency
/// must run this direction to avoid a cycle. The `api` crate supplies the
/// concrete adapter over `database::TurnArchiveRepository`.
#[async_trait]
pub trait TurnArchiver: Send + Sync {
    async fn archive(&self, turn: ArchivedTurn);
}

/// Plain data handed to a `TurnArchiver`; mirrors `database::TurnRow` without
/// requiring this crate to know that type exists.
#[derive(Debug, Clone)]
pub struct ArchivedTurn {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub user_transcript: String,
    pub transcript_confidence: f32,
    pub retrieved_chunks: Vec<String>,
    pub llm_response: String,
    pub latencies: TurnLatencies,
}

struct PendingAsr {
    turn_id: String,
    buffer: Vec<u8>,
    asr_start_time: DateTime<Utc>,
}

struct ActiveTurn {
    /// Identifies which turn currently owns the session's active-turn slot.
    /// A pipeline task must only clear the slot it itself occupies: if an
    /// interruption cancels this turn and a new one is admitted before this
    /// task notices, the slot now belongs to the new turn and must survive
    /// this task's own cleanup.
    turn_id: String,
    cancelled: Arc<AtomicBool>,
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

/// Per-turn state threaded through stages B-E. Stage A builds this once the
/// transcript is final, then hands it to the spawned pipeline task.
struct TurnContext {
    turn_id: String,
    session_id: String,
    user_id: String,
    transcript: String,
    transcript_confidence: f32,
    user_speech_end_time: DateTime<Utc>,
    asr_start_time: DateTime<Utc>,
    asr_end_time: DateTime<Utc>,
    cancelled: Arc<AtomicBool>,
}

/// Model name sent to the LLM provider. The provider endpoint is configured
/// per-deployment (`config::ProvidersConfig`); this crate has no notion of
/// model catalogs, so a single fixed identifier is used for every call.
const LLM_MODEL: &str = "voice-gateway-default";

/// Coordinates one turn at a time per session (spec §4.H: "at most one
/// active turn per session"). Constructed once at bootstrap and shared via
/// `Arc`, the way the Session Store and Connection Registry are.
pub struct TurnOrchestrator {
    session_store: Arc<SessionStore>,
    registry: Arc<ConnectionRegistry>,
    asr: Arc<dyn AsrClient>,
    rag: Arc<dyn RagClient>,
    llm: Arc<dyn LlmClient>,
    tts: Arc<dyn TtsClient>,
    lipsync: Arc<dyn LipsyncClient>,
    archiver: Option<Arc<dyn TurnArchiver>>,
    config: Arc<GatewayConfig>,
    pending_asr: RwLock<HashMap<String, PendingAsr>>,
    active_turns: RwLock<HashMap<String, ActiveTurn>>,
}

impl TurnOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_store: Arc<SessionStore>,
        registry: Arc<ConnectionRegistry>,
        asr: Arc<dyn AsrClient>,
        rag: Arc<dyn RagClient>,
        llm: Arc<dyn LlmClient>,
        tts: Arc<dyn TtsClient>,
        lipsync: Arc<dyn LipsyncClient>,
        archiver: Option<Arc<dyn TurnArchiver>>,
        config: Arc<GatewayConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_store,
            registry,
            asr,
            rag,
            llm,
            tts,
            lipsync,
            archiver,
            config,
            pending_asr: RwLock::new(HashMap::new()),
            active_turns: RwLock::new(HashMap::new()),
        })
    }

    /// Whether a session currently has an in-flight turn (stage A pending or
    /// stages B-E running). The Message Router uses this to decide whether
    /// an `audio_chunk` starts a new turn.
    pub async fn has_active_turn(&self, session_id: &str) -> bool {
        self.pending_asr.read().await.contains_key(session_id)
            || self.active_turns.read().await.contains_key(session_id)
    }

    /// Stage A: forwards one upstream audio chunk. Allocates a TurnContext
    /// on the first chunk of a new turn; every call appends to the running
    /// buffer and re-transcribes it, forwarding the result as an interim
    /// `transcript` envelope.
    pub async fn ingest_audio_chunk(&self, session_id: &str, audio: Vec<u8>) {
        if self.active_turns.read().await.contains_key(session_id) {
            // A turn is already in stages B-E; spec §4.H allows at most one
            // active turn per session, so further chunks are ignored.
            return;
        }

        let buffer_snapshot = {
            let mut pending = self.pending_asr.write().await;
            let entry = pending.entry(session_id.to_string()).or_insert_with(|| PendingAsr {
                turn_id: format!("turn_{}", Uuid::new_v4().simple()),
                buffer: Vec::new(),
                asr_start_time: Utc::now(),
            });
            entry.buffer.extend_from_slice(&audio);
            entry.buffer.clone()
        };

        let turn_id = match self.pending_asr.read().await.get(session_id) {
            Some(p) => p.turn_id.clone(),
            None => return,
        };

        match self
            .asr
            .transcribe(AsrRequest {
                audio: buffer_snapshot,
                sample_rate_hz: 16_000,
                language_hint: None,
            })
            .await
        {
            Ok(response) => {
                self.emit(
                    session_id,
                    "transcript",
                    json!({
                        "transcript": response.transcript,
                        "isFinal": false,
                        "confidence": response.confidence,
                    }),
                )
                .await;
            }
            Err(err) => {
                tracing::warn!(session_id, turn_id, %err, "asr interim transcription failed");
                self.pending_asr.write().await.remove(session_id);
                self.emit_error(session_id, "error:asr", err.to_string(), true).await;
            }
        }
    }

    /// Stage A finalization, triggered by an `end_utterance` envelope.
    /// Stamps `userSpeechEndTime`, issues the finalizing ASR call, emits the
    /// final `transcript` envelope, and spawns stages B-E.
    pub async fn finalize_utterance(self: &Arc<Self>, session_id: &str, user_id: &str) {
        let user_speech_end_time = Utc::now();
        let pending = self.pending_asr.write().await.remove(session_id);
        let Some(pending) = pending else {
            return;
        };

        match self
            .asr
            .transcribe(AsrRequest {
                audio: pending.buffer,
                sample_rate_hz: 16_000,
                language_hint: None,
            })
            .await
        {
            Ok(response) => {
                let asr_end_time = Utc::now();
                self.emit(
                    session_id,
                    "transcript",
                    json!({
                        "transcript": response.transcript,
                        "isFinal": true,
                        "confidence": response.confidence,
                    }),
                )
                .await;

                let cancelled = Arc::new(AtomicBool::new(false));
                let ctx = TurnContext {
                    turn_id: pending.turn_id.clone(),
                    session_id: session_id.to_string(),
                    user_id: user_id.to_string(),
                    transcript: response.transcript,
                    transcript_confidence: response.confidence,
                    user_speech_end_time,
                    asr_start_time: pending.asr_start_time,
                    asr_end_time,
                    cancelled: cancelled.clone(),
                };

                let turn_id = pending.turn_id.clone();
                let this = Arc::clone(self);
                let handle = tokio::spawn(async move { this.run_pipeline(ctx).await });
                self.active_turns.write().await.insert(
                    session_id.to_string(),
                    ActiveTurn { turn_id, cancelled, handle },
                );
            }
            Err(err) => {
                tracing::warn!(session_id, %err, "asr finalization failed, aborting turn");
                self.emit_error(session_id, "error:asr", err.to_string(), true).await;
                self.abort_to_idle(session_id).await;
            }
        }
    }

    /// `cancelTurn(sessionId)` (spec §4.H). Idempotent: flips the
    /// cancellation signal the in-flight pipeline task observes and removes
    /// the session's active-turn slot so a new turn may start immediately.
    /// The spawned task is left to notice the signal and exit on its own
    /// rather than being aborted, so bytes already in flight to a stage are
    /// not torn down mid-write (spec §9 open question).
    pub async fn cancel_turn(&self, session_id: &str) {
        if let Some(active) = self.active_turns.write().await.remove(session_id) {
            active.cancelled.store(true, Ordering::SeqCst);
        }
        self.pending_asr.write().await.remove(session_id);
    }

    /// Clears the session's active-turn slot, but only if it is still
    /// occupied by `turn_id`. A turn that was cancelled and superseded by a
    /// new one before it noticed the cancellation flag must not evict the
    /// new turn's slot on its own exit.
    async fn release_active_turn(&self, session_id: &str, turn_id: &str) {
        let mut active = self.active_turns.write().await;
        if active.get(session_id).is_some_and(|entry| entry.turn_id == turn_id) {
            active.remove(session_id);
        }
    }

    /// Applies a session state transition and, on success, notifies the
    /// client with a `state:changed` envelope (spec §6). Failures are logged
    /// rather than propagated: a concurrent interruption may already have
    /// moved the session elsewhere, which is not itself an error.
    async fn transition_state(&self, session_id: &str, to: ConversationState) {
        match self.session_store.transition_state(session_id, to).await {
            Ok(outcome) => {
                self.emit(
                    session_id,
                    "state:changed",
                    json!({
                        "previousState": outcome.previous_state.as_wire_str(),
                        "currentState": outcome.current_state.as_wire_str(),
                        "timestamp": Utc::now().timestamp_millis(),
                    }),
                )
                .await;
            }
            Err(err) => {
                tracing::debug!(session_id, target = ?to, %err, "orchestrator state transition skipped");
            }
        }
    }

    /// Reverts a session to IDLE after a non-recoverable stage failure so
    /// the next turn can be admitted (spec §4.D: `transitionState` is the
    /// only entry point for state changes; without this, a failed turn
    /// leaves the session stuck in PROCESSING/SPEAKING forever).
    async fn abort_to_idle(&self, session_id: &str) {
        self.transition_state(session_id, ConversationState::Idle).await;
    }

    async fn run_pipeline(self: Arc<Self>, ctx: TurnContext) {
        let (retrieved_chunks, rag_ms) = self.run_rag_stage(&ctx).await;
        if ctx.cancelled.load(Ordering::SeqCst) {
            self.release_active_turn(&ctx.session_id, &ctx.turn_id).await;
            return;
        }

        let outcome = self.run_llm_tts_lipsync_stages(&ctx, &retrieved_chunks).await;
        self.release_active_turn(&ctx.session_id, &ctx.turn_id).await;

        let Some(outcome) = outcome else {
            // Cancelled, or an unrecoverable stage failure already emitted
            // its own `error` envelope. Either way: no `response_end`.
            return;
        };

        self.complete_turn(&ctx, retrieved_chunks, rag_ms, outcome).await;
    }

    /// Stage B: fetch history, issue the RAG query, fall back to an empty
    /// chunk list on failure or timeout without surfacing an error to the
    /// client (spec §4.H: "proceed without knowledge base context"). Latency
    /// is recorded either way.
    async fn run_rag_stage(&self, ctx: &TurnContext) -> (Vec<RetrievedChunk>, i64) {
        let history = self
            .session_store
            .recent_history(&ctx.session_id, self.config.rag_history_turns)
            .await;
        let mut history_text = Vec::with_capacity(history.len() * 2);
        for turn in &history {
            history_text.push(format!("user: {}", turn.user_transcript));
            if !turn.llm_response.is_empty() {
                history_text.push(format!("assistant: {}", turn.llm_response));
            }
        }

        let query = RagQuery {
            query_text: ctx.transcript.clone(),
            history: history_text,
            top_k: self.config.rag_top_k,
            similarity_threshold: self.config.rag_similarity_threshold,
        };

        let rag_start = Utc::now();
        let result = tokio::time::timeout(
            Duration::from_secs(self.config.rag_timeout_secs),
            self.rag.retrieve(query),
        )
        .await;
        let rag_ms = (Utc::now() - rag_start).num_milliseconds();

        let chunks = match result {
            Ok(Ok(response)) => response.chunks,
            Ok(Err(err)) => {
                tracing::warn!(session_id = %ctx.session_id, %err, "rag retrieval failed, proceeding without context");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(session_id = %ctx.session_id, "rag retrieval timed out, proceeding without context");
                Vec::new()
            }
        };
        (chunks, rag_ms)
    }

    /// Stages C, D and E combined: the sentence-by-sentence LLM -> TTS ->
    /// LIPSYNC pipeline. Returns `None` on cancellation or a fatal stage
    /// failure (both of which mean no `response_end` should be sent), `Some`
    /// with the accumulated metrics and response text otherwise.
    async fn run_llm_tts_lipsync_stages(
        &self,
        ctx: &TurnContext,
        retrieved_chunks: &[RetrievedChunk],
    ) -> Option<TurnOutcome> {
        if ctx.cancelled.load(Ordering::SeqCst) {
            return None;
        }

        // The pipeline is about to start emitting audio: PROCESSING -> SPEAKING
        // (spec §4.C). Without this the session never leaves PROCESSING, which
        // makes spec §8 S7 ("while in state SPEAKING, client sends
        // interruption") unreachable and leaves the session unable to admit
        // the next turn's `end_utterance` once this one completes.
        self.transition_state(&ctx.session_id, ConversationState::Speaking).await;

        self.emit(&ctx.session_id, "response_start", json!({"turnId": ctx.turn_id})).await;

        let history = self
            .session_store
            .recent_history(&ctx.session_id, self.config.rag_history_turns)
            .await;
        let messages = build_messages(&history, retrieved_chunks, &ctx.transcript);
        let params = ChatCompletionParams {
            model: LLM_MODEL.to_string(),
            messages,
            max_tokens: None,
            temperature: None,
            stream: Some(true),
            stream_options: None,
        };

        let llm_start = Utc::now();
        let mut stream = match tokio::time::timeout(
            Duration::from_secs(self.config.llm_timeout_secs),
            self.llm.chat_completion_stream(params),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.emit_error(&ctx.session_id, "error:llm", err.to_string(), true).await;
                self.abort_to_idle(&ctx.session_id).await;
                return None;
            }
            Err(_) => {
                self.emit_error(&ctx.session_id, "error:llm", "llm request timed out".to_string(), true)
                    .await;
                self.abort_to_idle(&ctx.session_id).await;
                return None;
            }
        };

        let mut llm_tokens = String::new();
        let mut sentence_buffer = String::new();
        let mut audio_seq: u64 = 0;
        let mut video_seq: u64 = 0;
        let mut first_audio_chunk_time: Option<DateTime<Utc>> = None;
        let mut tts_first_chunk_time: Option<DateTime<Utc>> = None;
        let mut llm_first_token_time: Option<DateTime<Utc>> = None;
        let mut llm_total_tokens: Option<i64> = None;

        'stream: while let Some(event) = stream.next().await {
            if ctx.cancelled.load(Ordering::SeqCst) {
                return None;
            }

            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    self.emit_error(&ctx.session_id, "error:llm", err.to_string(), true).await;
                    self.abort_to_idle(&ctx.session_id).await;
                    return None;
                }
            };

            if let Some(usage) = event.chunk.usage.as_ref() {
                llm_total_tokens = Some(usage.total_tokens as i64);
            }

            let Some(choice) = event.chunk.choices.into_iter().next() else {
                continue;
            };

            if let Some(content) = choice.delta.as_ref().and_then(|d| d.content.clone()) {
                // First token received: the core TTFT metric (spec §4.H,
                // glossary "time-to-first-token").
                llm_first_token_time.get_or_insert_with(Utc::now);

                llm_tokens.push_str(&content);
                sentence_buffer.push_str(&content);

                if sentence_complete(&sentence_buffer) {
                    let sentence = std::mem::take(&mut sentence_buffer).trim_end().to_string();
                    let flushed = self
                        .synthesize_sentence(
                            ctx,
                            &sentence,
                            &mut audio_seq,
                            &mut video_seq,
                            &mut first_audio_chunk_time,
                            &mut tts_first_chunk_time,
                        )
                        .await;
                    if !flushed {
                        if !ctx.cancelled.load(Ordering::SeqCst) {
                            self.abort_to_idle(&ctx.session_id).await;
                        }
                        return None;
                    }
                }
            }

            if choice.finish_reason.is_some() {
                break 'stream;
            }
        }

        let llm_end = Utc::now();
        if ctx.cancelled.load(Ordering::SeqCst) {
            return None;
        }

        let remainder = sentence_buffer.trim().to_string();
        if !remainder.is_empty() {
            let flushed = self
                .synthesize_sentence(
                    ctx,
                    &remainder,
                    &mut audio_seq,
                    &mut video_seq,
                    &mut first_audio_chunk_time,
                    &mut tts_first_chunk_time,
                )
                .await;
            if !flushed {
                if !ctx.cancelled.load(Ordering::SeqCst) {
                    self.abort_to_idle(&ctx.session_id).await;
                }
                return None;
            }
        }

        Some(TurnOutcome {
            llm_response: llm_tokens,
            llm_start,
            llm_end,
            llm_first_token_time,
            first_audio_chunk_time,
            llm_total_tokens,
        })
    }

    /// One sentence through stage D (TTS) and stage E (LIPSYNC fork).
    /// Returns `false` if cancellation was observed or TTS failed fatally
    /// (LIPSYNC failures never cause a `false` return: they are logged and
    /// skipped, per spec §4.H "continuing audio only").
    async fn synthesize_sentence(
        &self,
        ctx: &TurnContext,
        sentence: &str,
        audio_seq: &mut u64,
        video_seq: &mut u64,
        first_audio_chunk_time: &mut Option<DateTime<Utc>>,
        tts_first_chunk_time: &mut Option<DateTime<Utc>>,
    ) -> bool {
        if ctx.cancelled.load(Ordering::SeqCst) {
            return false;
        }

        let mut tts_stream = match tokio::time::timeout(
            Duration::from_secs(self.config.tts_timeout_secs),
            self.tts.synthesize_stream(TtsRequest {
                text: sentence.to_string(),
                voice: None,
            }),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.emit_error(&ctx.session_id, "error:tts", err.to_string(), true).await;
                return false;
            }
            Err(_) => {
                self.emit_error(&ctx.session_id, "error:tts", "tts request timed out".to_string(), true)
                    .await;
                return false;
            }
        };

        while let Some(chunk) = tts_stream.next().await {
            if ctx.cancelled.load(Ordering::SeqCst) {
                return false;
            }
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    self.emit_error(&ctx.session_id, "error:tts", err.to_string(), true).await;
                    return false;
                }
            };

            let now = Utc::now();
            tts_first_chunk_time.get_or_insert(now);
            first_audio_chunk_time.get_or_insert(now);

            let seq = *audio_seq;
            *audio_seq += 1;
            self.emit(
                &ctx.session_id,
                "response_audio",
                json!({
                    "turnId": ctx.turn_id,
                    "audioData": base64::engine::general_purpose::STANDARD.encode(&chunk.audio),
                    "sequenceNumber": seq,
                }),
            )
            .await;

            if ctx.cancelled.load(Ordering::SeqCst) {
                return false;
            }

            // Stage E: non-critical fork. Failures are logged, never surfaced.
            match tokio::time::timeout(
                Duration::from_secs(self.config.lipsync_timeout_secs),
                self.lipsync.generate(LipsyncRequest {
                    audio: chunk.audio,
                    text: Some(sentence.to_string()),
                }),
            )
            .await
            {
                Ok(Ok(response)) => {
                    for frame in response.frames {
                        if ctx.cancelled.load(Ordering::SeqCst) {
                            return false;
                        }
                        let format_str = match frame.format {
                            LipsyncFrameFormat::Jpeg => "jpeg",
                            LipsyncFrameFormat::H264 => "h264",
                        };
                        let seq = *video_seq;
                        *video_seq += 1;
                        self.emit(
                            &ctx.session_id,
                            "response_video",
                            json!({
                                "turnId": ctx.turn_id,
                                "frameData": base64::engine::general_purpose::STANDARD.encode(&frame.frame_data),
                                "sequenceNumber": seq,
                                "format": format_str,
                            }),
                        )
                        .await;
                    }
                }
                Ok(Err(err)) => {
                    tracing::warn!(turn_id = %ctx.turn_id, %err, "lipsync failed, continuing audio-only");
                }
                Err(_) => {
                    tracing::warn!(turn_id = %ctx.turn_id, "lipsync timed out, continuing audio-only");
                }
            }
        }

        true
    }

    /// `completeTurn(sessionId)` (spec §4.H): computes latencies, emits
    /// `response_end`, appends the Turn to history, and best-effort archives
    /// it.
    async fn complete_turn(
        &self,
        ctx: &TurnContext,
        retrieved_chunks: Vec<RetrievedChunk>,
        rag_ms: i64,
        outcome: TurnOutcome,
    ) {
        // SPEAKING -> IDLE: the turn is done, so the session returns to a
        // resting state that admits the next turn's `audio_chunk`/
        // `end_utterance` (spec §4.C; without this the session is stuck in
        // SPEAKING and every subsequent turn is rejected).
        self.transition_state(&ctx.session_id, ConversationState::Idle).await;

        let asr_ms = (ctx.asr_end_time - ctx.asr_start_time).num_milliseconds();
        let rag_ms = Some(rag_ms);
        let llm_ms = (outcome.llm_end - outcome.llm_start).num_milliseconds();
        if let Some(first_token) = outcome.llm_first_token_time {
            let ttft_ms = (first_token - outcome.llm_start).num_milliseconds();
            tracing::debug!(turn_id = %ctx.turn_id, ttft_ms, "llm time-to-first-token");
        }
        let tts_ms = outcome
            .first_audio_chunk_time
            .map(|t| (t - outcome.llm_end).num_milliseconds().max(0));
        let total_ms = outcome
            .first_audio_chunk_time
            .map(|t| (t - ctx.user_speech_end_time).num_milliseconds())
            .unwrap_or(0);

        self.emit(
            &ctx.session_id,
            "response_end",
            json!({
                "turnId": ctx.turn_id,
                "metrics": {
                    "totalLatencyMs": total_ms,
                    "asrLatencyMs": asr_ms,
                    "ragLatencyMs": rag_ms,
                    "llmLatencyMs": llm_ms,
                    "ttsLatencyMs": tts_ms,
                },
            }),
        )
        .await;

        let latencies = TurnLatencies {
            asr_ms: Some(asr_ms),
            rag_ms,
            llm_ms: Some(llm_ms),
            tts_ms,
            total_ms: Some(total_ms),
        };

        let costs = domain::TurnCosts {
            asr_usd: None,
            rag_usd: None,
            llm_usd: outcome
                .llm_total_tokens
                .map(|tokens| (tokens as f64 / 1000.0) * self.config.llm_cost_per_1k_tokens_usd),
            tts_usd: None,
            lipsync_usd: None,
        };

        let turn = Turn {
            id: ctx.turn_id.clone(),
            session_id: ctx.session_id.clone(),
            timestamp: Utc::now(),
            user_transcript: ctx.transcript.clone(),
            transcript_confidence: ctx.transcript_confidence,
            retrieved_chunks: retrieved_chunks.iter().map(|c| c.text.clone()).collect(),
            llm_response: outcome.llm_response.clone(),
            latencies: latencies.clone(),
            costs,
        };

        if let Err(err) = self.session_store.append_turn(&ctx.session_id, turn).await {
            tracing::warn!(session_id = %ctx.session_id, %err, "failed to append completed turn to session history");
        }

        if let Some(archiver) = &self.archiver {
            archiver
                .archive(ArchivedTurn {
                    id: ctx.turn_id.clone(),
                    session_id: ctx.session_id.clone(),
                    user_id: ctx.user_id.clone(),
                    created_at: Utc::now(),
                    user_transcript: ctx.transcript.clone(),
                    transcript_confidence: ctx.transcript_confidence,
                    retrieved_chunks: retrieved_chunks.iter().map(|c| c.text.clone()).collect(),
                    llm_response: outcome.llm_response,
                    latencies,
                })
                .await;
        }
    }

    async fn emit(&self, session_id: &str, kind: &str, data: serde_json::Value) {
        match domain::MessageEnvelope::new(kind, Some(session_id.to_string()), Some(data), Utc::now().timestamp_millis())
        {
            Ok(envelope) => self.registry.send_to_session(session_id, &envelope).await,
            Err(err) => tracing::error!(%err, kind, "failed to construct outbound envelope"),
        }
    }

    async fn emit_error(&self, session_id: &str, error_code: &str, message: String, recoverable: bool) {
        self.emit(
            session_id,
            "error",
            json!({"errorCode": error_code, "errorMessage": message, "recoverable": recoverable}),
        )
        .await;
    }
}

struct TurnOutcome {
    llm_response: String,
    llm_start: DateTime<Utc>,
    llm_end: DateTime<Utc>,
    llm_first_token_time: Option<DateTime<Utc>>,
    first_audio_chunk_time: Option<DateTime<Utc>>,
    llm_total_tokens: Option<i64>,
}

/// Spec §4.H sentence boundary rule: after right-trimming whitespace, the
/// buffer ends with one of `. ! ? 。 ！ ？`.
fn sentence_complete(buffer: &str) -> bool {
    matches!(
        buffer.trim_end().chars().last(),
        Some('.') | Some('!') | Some('?') | Some('。') | Some('！') | Some('？')
    )
}

fn build_messages(history: &[Turn], retrieved: &[RetrievedChunk], transcript: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() * 2 + 2);

    if !retrieved.is_empty() {
        let context = retrieved.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join("\n\n");
        messages.push(ChatMessage {
            role: MessageRole::System,
            content: Some(serde_json::Value::String(format!("Relevant context:\n{context}"))),
            name: None,
        });
    }

    for turn in history {
        messages.push(ChatMessage {
            role: MessageRole::User,
            content: Some(serde_json::Value::String(turn.user_transcript.clone())),
            name: None,
        });
        if !turn.llm_response.is_empty() {
            messages.push(ChatMessage {
                role: MessageRole::Assistant,
                content: Some(serde_json::Value::String(turn.llm_response.clone())),
                name: None,
            });
        }
    }

    messages.push(ChatMessage {
        role: MessageRole::User,
        content: Some(serde_json::Value::String(transcript.to_string())),
        name: None,
    });

    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use inference_providers::{MockAsrClient, MockLipsyncClient, MockLlmClient, MockRagClient, MockTtsClient};
    use std::sync::Mutex as StdMutex;

    fn test_config() -> Arc<GatewayConfig> {
        Arc::new(GatewayConfig::default())
    }

    fn orchestrator(
        llm_response: &str,
        lipsync_frames_per_call: usize,
    ) -> (Arc<TurnOrchestrator>, Arc<SessionStore>, Arc<ConnectionRegistry>) {
        let session_store = Arc::new(SessionStore::new(300));
        let registry = Arc::new(ConnectionRegistry::new());
        let orchestrator = TurnOrchestrator::new(
            session_store.clone(),
            registry.clone(),
            Arc::new(MockAsrClient::new("hello there")),
            Arc::new(MockRagClient::empty()),
            Arc::new(MockLlmClient::new(llm_response)),
            Arc::new(MockTtsClient::new(vec![0u8; 4])),
            Arc::new(MockLipsyncClient { frames_per_call: lipsync_frames_per_call }),
            None,
            test_config(),
        );
        (orchestrator, session_store, registry)
    }

    struct RecordingSink {
        kinds: StdMutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self { kinds: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl crate::gateway::registry::ConnectionSink for RecordingSink {
        async fn send(&self, envelope: &domain::MessageEnvelope) -> Result<(), String> {
            self.kinds.lock().unwrap().push(envelope.kind.clone());
            Ok(())
        }
        async fn close(&self, _code: u16, _reason: String) {}
        fn is_open(&self) -> bool {
            true
        }
    }

    #[test]
    fn sentence_boundary_matches_spec_punctuation_set() {
        assert!(sentence_complete("Hi there.  "));
        assert!(sentence_complete("Really?"));
        assert!(sentence_complete("神奇。"));
        assert!(!sentence_complete("Hi there"));
        assert!(!sentence_complete(""));
    }

    #[tokio::test]
    async fn full_turn_emits_start_audio_video_and_end_in_order() {
        let (orchestrator, session_store, registry) = orchestrator("Hi there. How are you?", 3);
        let session = session_store.create("user-1".to_string(), Some("conn-1".to_string())).await;
        let sink = Arc::new(RecordingSink::new());
        registry
            .register(crate::gateway::registry::Connection::new(
                "conn-1".to_string(),
                "user-1".to_string(),
                Some(session.id.clone()),
                sink.clone(),
            ))
            .await;

        orchestrator.ingest_audio_chunk(&session.id, vec![0u8; 160]).await;
        orchestrator.finalize_utterance(&session.id, "user-1").await;

        // Give the spawned pipeline task a chance to run to completion.
        for _ in 0..50 {
            if sink.kinds.lock().unwrap().iter().any(|k| k == "response_end") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let kinds = sink.kinds.lock().unwrap().clone();
        assert!(kinds.contains(&"transcript".to_string()));
        let start_idx = kinds.iter().position(|k| k == "response_start").unwrap();
        let end_idx = kinds.iter().position(|k| k == "response_end").unwrap();
        assert!(start_idx < end_idx);
        assert!(kinds.iter().any(|k| k == "response_audio"));
        assert!(kinds.iter().any(|k| k == "response_video"));

        let history = session_store.recent_history(&session.id, 10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].user_transcript, "hello there");
    }

    #[tokio::test]
    async fn cancel_turn_prevents_response_end() {
        let (orchestrator, session_store, registry) = orchestrator("A very long reply with no terminal punctuation", 1);
        let session = session_store.create("user-1".to_string(), Some("conn-1".to_string())).await;
        let sink = Arc::new(RecordingSink::new());
        registry
            .register(crate::gateway::registry::Connection::new(
                "conn-1".to_string(),
                "user-1".to_string(),
                Some(session.id.clone()),
                sink.clone(),
            ))
            .await;

        orchestrator.ingest_audio_chunk(&session.id, vec![0u8; 160]).await;
        orchestrator.finalize_utterance(&session.id, "user-1").await;
        orchestrator.cancel_turn(&session.id).await;

        tokio::time::sleep(Duration::from_millis(100)).await;

        let kinds = sink.kinds.lock().unwrap().clone();
        assert!(!kinds.contains(&"response_end".to_string()));
        assert!(!orchestrator.has_active_turn(&session.id).await);
    }
}
