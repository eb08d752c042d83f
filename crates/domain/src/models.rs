//! Session and Turn domain records (spec §3). These are plain data: the
//! Session Store and Turn Orchestrator own the logic that mutates them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::state_machine::ConversationState;

/// Per-stage latency breakdown for one turn (spec §3). `total_ms` is always
/// >= the max of the individual stage latencies.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TurnLatencies {
    pub asr_ms: Option<i64>,
    pub rag_ms: Option<i64>,
    pub llm_ms: Option<i64>,
    pub tts_ms: Option<i64>,
    pub total_ms: Option<i64>,
}

/// Per-stage cost breakdown for one turn (spec §3: Turn carries "per-stage
/// costs" alongside per-stage latencies). Only the LLM stage's external
/// interface (spec §6) exposes a usage payload the core can price; ASR/RAG/
/// TTS/LIPSYNC responses carry no billing signal in the normative wire
/// shapes, so those fields stay `None` rather than being estimated.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TurnCosts {
    pub asr_usd: Option<f64>,
    pub rag_usd: Option<f64>,
    pub llm_usd: Option<f64>,
    pub tts_usd: Option<f64>,
    pub lipsync_usd: Option<f64>,
}

impl TurnCosts {
    pub fn total(&self) -> f64 {
        [self.asr_usd, self.rag_usd, self.llm_usd, self.tts_usd, self.lipsync_usd]
            .into_iter()
            .flatten()
            .sum()
    }
}

/// One user-utterance -> cloned-response exchange (spec §3). Created by the
/// orchestrator on the first audio frame of a turn, committed to history
/// exactly once, never modified afterward.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub user_transcript: String,
    pub transcript_confidence: f32,
    /// May be empty if RAG failed and the fallback fired (spec §3).
    pub retrieved_chunks: Vec<String>,
    pub llm_response: String,
    pub latencies: TurnLatencies,
    pub costs: TurnCosts,
}

/// Persistent record of one conversation (spec §3). Created at
/// authentication; mutated only by the state-machine transition routine and
/// by turn completion; destroyed by explicit end, expiry sweep, or idle
/// timeout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    /// The connection currently bound to this session; `None` while
    /// reconnecting.
    pub connection_id: Option<String>,
    pub state: ConversationState,
    /// Append-only during a session.
    pub conversation_history: Vec<Turn>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

impl Session {
    pub fn new(user_id: String, connection_id: Option<String>, ttl: chrono::Duration) -> Self {
        let now = Utc::now();
        Self {
            id: format!("sess_{}", Uuid::new_v4().simple()),
            user_id,
            connection_id,
            state: ConversationState::Idle,
            conversation_history: Vec::new(),
            created_at: now,
            last_activity_at: now,
            expires_at: now + ttl,
            metadata: HashMap::new(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Slides `expires_at` forward by `ttl` and bumps `last_activity_at`
    /// (spec §4.D: "every mutation slides expiresAt forward by SESSION_TTL").
    pub fn touch(&mut self, ttl: chrono::Duration, now: DateTime<Utc>) {
        self.last_activity_at = now;
        self.expires_at = now + ttl;
    }
}
