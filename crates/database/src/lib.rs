pub mod mock;
pub mod models;
pub mod pool;
pub mod repositories;
pub mod shutdown_coordinator;

pub use models::TurnRow;
pub use pool::{DatabaseConfig, DbPool};
pub use repositories::{InMemoryTurnArchiveRepository, PgTurnArchiveRepository, TurnArchiveRepository};
pub use shutdown_coordinator::{ShutdownCoordinator, ShutdownStage, ShutdownStageResult};

use std::sync::Arc;

pub use mock::create_mock_database;

/// Owns the turn archive pool and repository. This is deliberately thin: the
/// gateway's hot path never touches it directly, only the orchestrator's
/// best-effort archive write after a turn completes.
pub struct Database {
    pub turns: Arc<dyn TurnArchiveRepository>,
    pool: Option<DbPool>,
}

impl Database {
    /// Wrap a live Postgres pool.
    pub fn new(pool: DbPool) -> Self {
        Self {
            turns: Arc::new(PgTurnArchiveRepository::new(pool.clone())),
            pool: Some(pool),
        }
    }

    /// Connect using the given parameters.
    pub async fn from_config(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = pool::create_pool(config).await?;
        Ok(Self::new(pool))
    }

    /// In-memory archive, used when `use_mock` is set or no database is
    /// configured at all.
    pub fn in_memory() -> Self {
        Self {
            turns: Arc::new(InMemoryTurnArchiveRepository::default()),
            pool: None,
        }
    }

    pub fn pool(&self) -> Option<&DbPool> {
        self.pool.as_ref()
    }
}
