use async_trait::async_trait;
use services::common::RepositoryError;
use uuid::Uuid;

use crate::models::TurnRow;
use crate::pool::DbPool;
use crate::repositories::utils::map_db_error;

/// Persistent archive for completed turns (spec §1, §3). The gateway's core
/// treats this purely as a repository interface: the orchestrator writes a
/// row once, after `completeTurn`, and never reads it back on the hot path.
#[async_trait]
pub trait TurnArchiveRepository: Send + Sync {
    async fn archive(&self, row: TurnRow) -> Result<(), RepositoryError>;
    async fn list_by_session(&self, session_id: &str) -> Result<Vec<TurnRow>, RepositoryError>;
}

pub struct PgTurnArchiveRepository {
    pool: DbPool,
}

impl PgTurnArchiveRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TurnArchiveRepository for PgTurnArchiveRepository {
    async fn archive(&self, row: TurnRow) -> Result<(), RepositoryError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| RepositoryError::PoolError(anyhow::anyhow!(e)))?;

        client
            .execute(
                r#"
                INSERT INTO turns (
                    id, session_id, user_id, created_at, user_transcript,
                    transcript_confidence, retrieved_chunks, llm_response,
                    asr_ms, rag_ms, llm_ms, tts_ms, total_ms
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
                &[
                    &row.id,
                    &row.session_id,
                    &row.user_id,
                    &row.created_at,
                    &row.user_transcript,
                    &row.transcript_confidence,
                    &row.retrieved_chunks,
                    &row.llm_response,
                    &row.asr_ms,
                    &row.rag_ms,
                    &row.llm_ms,
                    &row.tts_ms,
                    &row.total_ms,
                ],
            )
            .await
            .map_err(map_db_error)?;

        Ok(())
    }

    async fn list_by_session(&self, session_id: &str) -> Result<Vec<TurnRow>, RepositoryError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| RepositoryError::PoolError(anyhow::anyhow!(e)))?;

        let rows = client
            .query(
                "SELECT * FROM turns WHERE session_id = $1 ORDER BY created_at ASC",
                &[&session_id],
            )
            .await
            .map_err(map_db_error)?;

        rows.into_iter().map(row_to_turn).collect()
    }
}

fn row_to_turn(row: tokio_postgres::Row) -> Result<TurnRow, RepositoryError> {
    Ok(TurnRow {
        id: row.try_get("id").map_err(|e| RepositoryError::DataConversionError(e.into()))?,
        session_id: row
            .try_get("session_id")
            .map_err(|e| RepositoryError::DataConversionError(e.into()))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| RepositoryError::DataConversionError(e.into()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| RepositoryError::DataConversionError(e.into()))?,
        user_transcript: row
            .try_get("user_transcript")
            .map_err(|e| RepositoryError::DataConversionError(e.into()))?,
        transcript_confidence: row
            .try_get("transcript_confidence")
            .map_err(|e| RepositoryError::DataConversionError(e.into()))?,
        retrieved_chunks: row
            .try_get("retrieved_chunks")
            .map_err(|e| RepositoryError::DataConversionError(e.into()))?,
        llm_response: row
            .try_get("llm_response")
            .map_err(|e| RepositoryError::DataConversionError(e.into()))?,
        asr_ms: row.try_get("asr_ms").ok(),
        rag_ms: row.try_get("rag_ms").ok(),
        llm_ms: row.try_get("llm_ms").ok(),
        tts_ms: row.try_get("tts_ms").ok(),
        total_ms: row.try_get("total_ms").ok(),
    })
}

/// In-memory archive used by tests and by `use_mock` deployments (spec
/// Non-goals: storage engine work is out of scope for this core, so the mock
/// is the path most callers exercise).
#[derive(Default)]
pub struct InMemoryTurnArchiveRepository {
    rows: tokio::sync::Mutex<Vec<TurnRow>>,
}

#[async_trait]
impl TurnArchiveRepository for InMemoryTurnArchiveRepository {
    async fn archive(&self, row: TurnRow) -> Result<(), RepositoryError> {
        self.rows.lock().await.push(row);
        Ok(())
    }

    async fn list_by_session(&self, session_id: &str) -> Result<Vec<TurnRow>, RepositoryError> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }
}
