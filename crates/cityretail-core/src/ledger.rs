use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tokio::task;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::{EtlError, Result};
use crate::types::Entity;

// "CTYRETL" — fixed advisory lock key shared by every loader process.
const RUN_LOCK_KEY: i64 = 0x43_54_59_52_45_54_4C;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    Running,
    Succeeded,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Running => "RUNNING",
            RunOutcome::Succeeded => "SUCCEEDED",
            RunOutcome::Failed => "FAILED",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "SUCCEEDED" => RunOutcome::Succeeded,
            "FAILED" => RunOutcome::Failed,
            _ => RunOutcome::Running,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    Pending,
    Committed,
    Skipped,
    Failed,
}

/// Ordered per-entity commit record, finalized with the run. A retried run
/// uses the previous entry to resume from the first failed entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityStatus {
    pub entity: Entity,
    pub status: CommitStatus,
}

/// One row of the `etl_runs` ledger.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub run_id: Uuid,
    pub mode: String,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub entity_status: Vec<EntityStatus>,
    pub stats: Option<serde_json::Value>,
    pub source_fingerprints: Option<BTreeMap<String, String>>,
}

impl LedgerEntry {
    pub fn committed_entities(&self) -> Vec<Entity> {
        self.entity_status
            .iter()
            .filter(|s| s.status == CommitStatus::Committed)
            .map(|s| s.entity)
            .collect()
    }
}

/// Exclusive run lock. Held for the whole run; a second loader process fails
/// fast with `ConcurrentRunDetected` before touching the warehouse.
pub struct RunLock {
    conn: Option<sqlx::pool::PoolConnection<sqlx::Postgres>>,
}

impl RunLock {
    pub async fn acquire(pool: &DbPool) -> Result<Self> {
        let mut conn = pool.acquire().await?;
        let row = sqlx::query("SELECT pg_try_advisory_lock($1) AS acquired")
            .bind(RUN_LOCK_KEY)
            .fetch_one(conn.as_mut())
            .await?;
        let acquired: bool = row.try_get("acquired")?;
        if !acquired {
            return Err(EtlError::ConcurrentRunDetected);
        }
        Ok(Self { conn: Some(conn) })
    }

    pub async fn release(mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(RUN_LOCK_KEY)
                .execute(conn.as_mut())
                .await?;
        }
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            task::spawn(async move {
                if let Err(err) = sqlx::query("SELECT pg_advisory_unlock($1)")
                    .bind(RUN_LOCK_KEY)
                    .execute(conn.as_mut())
                    .await
                {
                    tracing::warn!("failed to release run lock in drop: {err}");
                }
            });
        }
    }
}

/// Open a ledger entry in the RUNNING state before any stage executes.
pub async fn open_run(pool: &DbPool, run_id: Uuid, mode: &str) -> Result<()> {
    sqlx::query(
        r#"
            INSERT INTO etl_runs (run_id, mode, outcome)
            VALUES ($1, $2, 'RUNNING')
        "#,
    )
    .bind(run_id)
    .bind(mode)
    .execute(pool)
    .await?;
    Ok(())
}

/// Finalize the ledger entry. Only a SUCCEEDED entry advances the incremental
/// watermark; FAILED entries leave the previous window in place.
pub async fn finalize_run(
    pool: &DbPool,
    run_id: Uuid,
    outcome: RunOutcome,
    entity_status: &[EntityStatus],
    stats: serde_json::Value,
    source_fingerprints: &BTreeMap<String, String>,
) -> Result<()> {
    sqlx::query(
        r#"
            UPDATE etl_runs
            SET outcome = $1,
                finished_at = now(),
                entity_status = $2,
                stats = $3,
                source_fingerprints = $4
            WHERE run_id = $5
        "#,
    )
    .bind(outcome.as_str())
    .bind(serde_json::to_value(entity_status)?)
    .bind(stats)
    .bind(serde_json::to_value(source_fingerprints)?)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

fn entry_from_row(row: sqlx::postgres::PgRow) -> Result<LedgerEntry> {
    let entity_status: serde_json::Value = row.try_get("entity_status")?;
    let source_fingerprints: Option<serde_json::Value> = row.try_get("source_fingerprints")?;
    let outcome: String = row.try_get("outcome")?;
    Ok(LedgerEntry {
        run_id: row.try_get("run_id")?,
        mode: row.try_get("mode")?,
        outcome: RunOutcome::parse(&outcome),
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        entity_status: serde_json::from_value(entity_status)?,
        stats: row.try_get("stats")?,
        source_fingerprints: source_fingerprints
            .map(serde_json::from_value)
            .transpose()?,
    })
}

async fn fetch_entry(pool: &DbPool, filter: &str) -> Result<Option<LedgerEntry>> {
    let query = format!(
        "SELECT run_id, mode, outcome, started_at, finished_at, \
                entity_status, stats, source_fingerprints \
         FROM etl_runs {filter} ORDER BY started_at DESC LIMIT 1"
    );
    let row = sqlx::query(&query).fetch_optional(pool).await?;
    row.map(entry_from_row).transpose()
}

/// The most recent finalized run of any outcome, used for retry resume.
pub async fn last_finished_run(pool: &DbPool) -> Result<Option<LedgerEntry>> {
    fetch_entry(pool, "WHERE outcome IN ('SUCCEEDED', 'FAILED')").await
}

/// The incremental watermark: the most recent successful run, if any.
pub async fn last_successful_run(pool: &DbPool) -> Result<Option<LedgerEntry>> {
    fetch_entry(pool, "WHERE outcome = 'SUCCEEDED'").await
}
