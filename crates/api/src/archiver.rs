//! Adapter wiring the orchestrator's `TurnArchiver` capability trait to the
//! concrete `database::TurnArchiveRepository`. Lives here rather than in
//! `services` because `database` already depends on `services` (for
//! `RepositoryError`), so the concrete archive write has to be assembled one
//! layer up (spec §1, §9).

use std::sync::Arc;

use async_trait::async_trait;
use database::{Database, TurnRow};
use services::gateway::{ArchivedTurn, TurnArchiver};
use uuid::Uuid;

pub struct DatabaseArchiver {
    database: Arc<Database>,
}

impl DatabaseArchiver {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl TurnArchiver for DatabaseArchiver {
    /// Best-effort: a failed archive write is logged and otherwise ignored,
    /// since the gateway's hot path has already completed the turn.
    async fn archive(&self, turn: ArchivedTurn) {
        let row = to_row(turn);
        if let Err(err) = self.database.turns.archive(row).await {
            tracing::warn!(%err, "failed to archive turn");
        }
    }
}

fn to_row(turn: ArchivedTurn) -> TurnRow {
    let id = turn
        .id
        .strip_prefix("turn_")
        .and_then(|rest| Uuid::parse_str(rest).ok())
        .unwrap_or_else(Uuid::new_v4);

    TurnRow {
        id,
        session_id: turn.session_id,
        user_id: turn.user_id,
        created_at: turn.created_at,
        user_transcript: turn.user_transcript,
        transcript_confidence: turn.transcript_confidence,
        retrieved_chunks: turn.retrieved_chunks,
        llm_response: turn.llm_response,
        asr_ms: turn.latencies.asr_ms,
        rag_ms: turn.latencies.rag_ms,
        llm_ms: turn.latencies.llm_ms,
        tts_ms: turn.latencies.tts_ms,
        total_ms: turn.latencies.total_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domain::TurnLatencies;

    #[tokio::test]
    async fn archive_writes_through_to_the_repository() {
        let database = Arc::new(Database::in_memory());
        let archiver = DatabaseArchiver::new(database.clone());

        archiver
            .archive(ArchivedTurn {
                id: format!("turn_{}", Uuid::new_v4().simple()),
                session_id: "sess-1".to_string(),
                user_id: "user-1".to_string(),
                created_at: Utc::now(),
                user_transcript: "hello".to_string(),
                transcript_confidence: 0.9,
                retrieved_chunks: vec![],
                llm_response: "hi".to_string(),
                latencies: TurnLatencies::default(),
            })
            .await;

        let rows = database.turns.list_by_session("sess-1").await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
