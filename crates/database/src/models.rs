use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Row shape for the persistent turn archive (spec §1: "the persistent
/// session/turn archive (treated as a repository interface)"). A `Turn` row
/// is written once, after `completeTurn` (spec §4.H), and never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRow {
    pub id: Uuid,
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub user_transcript: String,
    pub transcript_confidence: f32,
    pub retrieved_chunks: Vec<String>,
    pub llm_response: String,
    pub asr_ms: Option<i64>,
    pub rag_ms: Option<i64>,
    pub llm_ms: Option<i64>,
    pub tts_ms: Option<i64>,
    pub total_ms: Option<i64>,
}
