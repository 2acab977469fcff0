use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, Pool, Postgres};

use crate::error::Result;

pub type DbPool = Pool<Postgres>;

/// Establish a Postgres connection pool with sensible defaults for the loader.
pub async fn connect(database_url: &str) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Connect with exponential backoff. The warehouse container may still be
/// starting when the scheduler invokes the loader.
pub async fn connect_with_retry(database_url: &str, attempts: u32) -> Result<DbPool> {
    for attempt in 1..attempts {
        match connect(database_url).await {
            Ok(pool) => return Ok(pool),
            Err(err) => {
                let wait = Duration::from_secs(2u64.saturating_pow(attempt.min(5)));
                tracing::warn!(
                    attempt,
                    attempts,
                    wait_secs = wait.as_secs(),
                    error = %err,
                    "warehouse not ready, retrying"
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
    connect(database_url).await
}

/// Run database migrations embedded at compile-time.
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
