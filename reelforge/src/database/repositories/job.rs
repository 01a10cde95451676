//! Job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{ClaimedJobRow, FailureRow, JobCounts, JobDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::{DAY_MS, now_ms};
use crate::{Error, Result};

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<JobDbModel>;
    /// Insert or replace the row for `id` as a fresh pending job.
    async fn upsert_job(&self, id: &str, data: &str) -> Result<()>;
    /// Atomically move the oldest pending job to processing and return it.
    async fn claim_next_pending_job(&self) -> Result<Option<ClaimedJobRow>>;
    async fn mark_completed(&self, id: &str) -> Result<()>;
    /// Increment attempts and move the job to failed or back to pending.
    async fn record_failure(&self, id: &str, error: &str, max_retries: u32) -> Result<FailureRow>;
    /// Move a processing job back to pending without touching attempts.
    async fn release_job(&self, id: &str) -> Result<bool>;
    async fn count_pending_jobs(&self) -> Result<u64>;
    async fn get_job_counts_by_status(&self) -> Result<JobCounts>;
    async fn reset_stale_processing_jobs(&self, updated_before_ms: i64) -> Result<u64>;
    async fn cleanup_old_jobs(&self, retention_days: u32) -> Result<u64>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn upsert_job(&self, id: &str, data: &str) -> Result<()> {
        retry_on_sqlite_busy("upsert_job", || async {
            let now = now_ms();
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO jobs (id, status, data, error, attempts, created_at, updated_at)
                VALUES (?, 'pending', ?, NULL, 0, ?, ?)
                "#,
            )
            .bind(id)
            .bind(data)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn claim_next_pending_job(&self) -> Result<Option<ClaimedJobRow>> {
        retry_on_sqlite_busy("claim_next_pending_job", || async {
            // Single statement: the select and the transition cannot interleave
            // with another claim.
            let claimed = sqlx::query_as::<_, ClaimedJobRow>(
                r#"
                UPDATE jobs
                SET status = 'processing', updated_at = ?
                WHERE id = (
                    SELECT id FROM jobs
                    WHERE status = 'pending'
                    ORDER BY created_at ASC, rowid ASC
                    LIMIT 1
                )
                AND status = 'pending'
                RETURNING id, data, attempts
                "#,
            )
            .bind(now_ms())
            .fetch_optional(&self.pool)
            .await?;
            Ok(claimed)
        })
        .await
    }

    async fn mark_completed(&self, id: &str) -> Result<()> {
        let result = retry_on_sqlite_busy("mark_completed", || async {
            Ok(
                sqlx::query("UPDATE jobs SET status = 'completed', updated_at = ? WHERE id = ?")
                    .bind(now_ms())
                    .bind(id)
                    .execute(&self.pool)
                    .await?,
            )
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Job", id));
        }
        Ok(())
    }

    async fn record_failure(&self, id: &str, error: &str, max_retries: u32) -> Result<FailureRow> {
        retry_on_sqlite_busy("record_failure", || async {
            // Right-hand sides see the pre-update row, RETURNING sees the new one.
            sqlx::query_as::<_, FailureRow>(
                r#"
                UPDATE jobs SET
                    attempts = attempts + 1,
                    status = CASE WHEN attempts + 1 >= ? THEN 'failed' ELSE 'pending' END,
                    error = ?,
                    updated_at = ?
                WHERE id = ?
                RETURNING attempts, status
                "#,
            )
            .bind(i64::from(max_retries))
            .bind(error)
            .bind(now_ms())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
        })
        .await
    }

    async fn release_job(&self, id: &str) -> Result<bool> {
        let result = retry_on_sqlite_busy("release_job", || async {
            Ok(sqlx::query(
                "UPDATE jobs SET status = 'pending', updated_at = ? WHERE id = ? AND status = 'processing'",
            )
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_pending_jobs(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn get_job_counts_by_status(&self) -> Result<JobCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = JobCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match status.as_str() {
                "pending" => counts.pending = count,
                "processing" => counts.processing = count,
                "completed" => counts.completed = count,
                "failed" => counts.failed = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn reset_stale_processing_jobs(&self, updated_before_ms: i64) -> Result<u64> {
        let result = retry_on_sqlite_busy("reset_stale_processing_jobs", || async {
            Ok(sqlx::query(
                "UPDATE jobs SET status = 'pending', updated_at = ? WHERE status = 'processing' AND updated_at < ?",
            )
            .bind(now_ms())
            .bind(updated_before_ms)
            .execute(&self.pool)
            .await?)
        })
        .await?;
        Ok(result.rows_affected())
    }

    async fn cleanup_old_jobs(&self, retention_days: u32) -> Result<u64> {
        let cutoff = now_ms() - i64::from(retention_days) * DAY_MS;
        let result = retry_on_sqlite_busy("cleanup_old_jobs", || async {
            Ok(sqlx::query(
                "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND updated_at < ?",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?)
        })
        .await?;
        Ok(result.rows_affected())
    }
}
