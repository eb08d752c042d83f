use crate::Database;
use anyhow::Result;
use std::env;

/// Create a mock database for testing. If `TEST_DATABASE_URL` is set, runs
/// against a real Postgres instance (useful for exercising the archive
/// repository's SQL); otherwise falls back to the in-memory archive.
pub async fn create_mock_database() -> Result<Database> {
    if let Ok(database_url) = env::var("TEST_DATABASE_URL") {
        let (_client, connection) =
            tokio_postgres::connect(&database_url, tokio_postgres::NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                eprintln!("connection error: {}", e);
            }
        });

        let config = database_url.parse::<tokio_postgres::Config>()?;
        let mgr_config = deadpool_postgres::ManagerConfig {
            recycling_method: deadpool_postgres::RecyclingMethod::Fast,
        };
        let mgr =
            deadpool_postgres::Manager::from_config(config, tokio_postgres::NoTls, mgr_config);
        let pool = deadpool_postgres::Pool::builder(mgr).max_size(1).build()?;

        return Ok(Database::new(pool));
    }

    Ok(Database::in_memory())
}
