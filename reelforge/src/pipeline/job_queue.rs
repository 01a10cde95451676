//! Database-backed job queue implementation.
//!
//! The queue owns the job state machine:
//!
//! ```text
//! enqueue ──► pending ──dequeue──► processing ──complete──► completed
//!                ▲                     │
//!                ├──────release────────┤
//!                └──fail (budget left)─┤
//!                                      └──fail (exhausted)──► failed
//! ```
//!
//! Payloads are stored as JSON text and only deserialized by the consumer.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::database::models::{JobCounts, JobDbModel, JobStatus};
use crate::database::repositories::JobRepository;
use crate::database::time::now_ms;

/// A job claimed for execution.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: String,
    /// Raw serialized payload.
    pub data: String,
    /// Failed executions before this one.
    pub attempts: u32,
}

impl ClaimedJob {
    /// Deserialize the payload into the consumer's type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// Result of recording a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Budget left; the job is pending again.
    Requeued { attempts: u32 },
    /// Budget exhausted; the job is terminally failed.
    Exhausted { attempts: u32 },
}

impl FailOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Requeued { attempts } | Self::Exhausted { attempts } => *attempts,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// The job queue service.
pub struct JobQueue {
    repository: Arc<dyn JobRepository>,
}

impl JobQueue {
    /// Create a job queue backed by the given repository.
    pub fn new(repository: Arc<dyn JobRepository>) -> Self {
        Self { repository }
    }

    /// Insert or replace a job as pending with a fresh retry budget.
    pub async fn enqueue<T: Serialize + ?Sized>(&self, id: &str, payload: &T) -> Result<()> {
        let data = serde_json::to_string(payload)?;
        self.repository.upsert_job(id, &data).await?;
        debug!(job_id = %id, "Job enqueued");
        Ok(())
    }

    /// Claim the oldest pending job, if any.
    pub async fn dequeue(&self) -> Result<Option<ClaimedJob>> {
        let claimed = self.repository.claim_next_pending_job().await?;
        Ok(claimed.map(|row| ClaimedJob {
            id: row.id,
            data: row.data,
            attempts: row.attempts.clamp(0, i64::from(u32::MAX)) as u32,
        }))
    }

    /// Mark a job as completed.
    pub async fn complete(&self, job_id: &str) -> Result<()> {
        self.repository.mark_completed(job_id).await?;
        debug!(job_id = %job_id, "Job completed");
        Ok(())
    }

    /// Record a failed execution against the job's retry budget.
    pub async fn fail(&self, job_id: &str, error: &str, max_retries: u32) -> Result<FailOutcome> {
        let row = self
            .repository
            .record_failure(job_id, error, max_retries)
            .await?;
        let attempts = row.attempts.clamp(0, i64::from(u32::MAX)) as u32;

        if JobStatus::parse(&row.status) == Some(JobStatus::Failed) {
            error!(job_id = %job_id, attempts, error = %error, "Job failed permanently");
            Ok(FailOutcome::Exhausted { attempts })
        } else {
            warn!(job_id = %job_id, attempts, error = %error, "Job failed, will retry");
            Ok(FailOutcome::Requeued { attempts })
        }
    }

    /// Hand a claimed job back to the queue without charging an attempt.
    pub async fn release(&self, job_id: &str) -> Result<bool> {
        let released = self.repository.release_job(job_id).await?;
        if released {
            debug!(job_id = %job_id, "Job released back to pending");
        }
        Ok(released)
    }

    /// Job counts per status.
    pub async fn stats(&self) -> Result<JobCounts> {
        self.repository.get_job_counts_by_status().await
    }

    pub async fn pending_count(&self) -> Result<u64> {
        self.repository.count_pending_jobs().await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<JobDbModel> {
        self.repository.get_job(job_id).await
    }

    /// Delete terminal jobs not updated within the retention window.
    pub async fn cleanup(&self, retention_days: u32) -> Result<u64> {
        let deleted = self.repository.cleanup_old_jobs(retention_days).await?;
        info!(deleted, retention_days, "Queue cleanup completed");
        Ok(deleted)
    }

    /// Requeue jobs stuck in processing for longer than `stale_after`.
    ///
    /// Rows end up stuck when the process dies between dequeue and
    /// complete/fail. Attempts are left untouched.
    pub async fn recover_stale(&self, stale_after: Duration) -> Result<u64> {
        let stale_ms = i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms().saturating_sub(stale_ms);
        let recovered = self.repository.reset_stale_processing_jobs(cutoff).await?;
        if recovered > 0 {
            info!(recovered, "Requeued stale processing jobs");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxJobRepository;
    use crate::database::test_pool;
    use serde::Deserialize;
    use std::collections::HashSet;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        n: u32,
    }

    async fn queue() -> JobQueue {
        JobQueue::new(Arc::new(SqlxJobRepository::new(test_pool().await)))
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_in_creation_order() {
        let queue = queue().await;
        for n in 0..5 {
            queue
                .enqueue(&format!("job-{n}"), &Payload { n })
                .await
                .unwrap();
        }

        for n in 0..5 {
            let job = queue.dequeue().await.unwrap().unwrap();
            assert_eq!(job.id, format!("job-{n}"));
            assert_eq!(job.attempts, 0);
            assert_eq!(job.payload::<Payload>().unwrap(), Payload { n });
        }
        assert!(queue.dequeue().await.unwrap().is_none());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.processing, 5);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_concurrent_dequeue_never_duplicates() {
        let queue = Arc::new(queue().await);
        for n in 0..20 {
            queue.enqueue(&format!("job-{n}"), &Payload { n }).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(job) = queue.dequeue().await.unwrap() {
                    ids.push(job.id);
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id.clone()), "job {id} dequeued twice");
            }
        }
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn test_fail_respects_retry_budget() {
        let queue = queue().await;
        queue.enqueue("a", &Payload { n: 1 }).await.unwrap();

        // attempts 0 -> 1
        queue.dequeue().await.unwrap().unwrap();
        let outcome = queue.fail("a", "first", 3).await.unwrap();
        assert_eq!(outcome, FailOutcome::Requeued { attempts: 1 });

        // attempts 1 -> 2, still pending
        let job = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        let outcome = queue.fail("a", "second", 3).await.unwrap();
        assert_eq!(outcome, FailOutcome::Requeued { attempts: 2 });
        let row = queue.get_job("a").await.unwrap();
        assert_eq!(row.job_status(), Some(JobStatus::Pending));
        assert_eq!(row.attempts, 2);

        // attempts 2 -> 3, terminal
        let job = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        let outcome = queue.fail("a", "third", 3).await.unwrap();
        assert!(outcome.is_exhausted());
        let row = queue.get_job("a").await.unwrap();
        assert_eq!(row.job_status(), Some(JobStatus::Failed));
        assert_eq!(row.error.as_deref(), Some("third"));

        // terminal jobs are never re-admitted
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requeued_job_goes_behind_nothing_else() {
        let queue = queue().await;
        queue.enqueue("a", &Payload { n: 1 }).await.unwrap();
        queue.enqueue("b", &Payload { n: 2 }).await.unwrap();

        let a = queue.dequeue().await.unwrap().unwrap();
        queue.fail(&a.id, "boom", 3).await.unwrap();

        // created_at is unchanged by fail, so "a" is still the oldest pending row
        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, "a");
        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, "b");
    }

    #[tokio::test]
    async fn test_release_keeps_attempts() {
        let queue = queue().await;
        queue.enqueue("a", &Payload { n: 1 }).await.unwrap();
        queue.dequeue().await.unwrap().unwrap();
        queue.fail("a", "boom", 3).await.unwrap();

        let job = queue.dequeue().await.unwrap().unwrap();
        assert!(queue.release(&job.id).await.unwrap());

        let again = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn test_recover_stale_requeues_processing_rows() {
        let queue = queue().await;
        queue.enqueue("a", &Payload { n: 1 }).await.unwrap();
        queue.dequeue().await.unwrap().unwrap();

        // Not stale yet.
        assert_eq!(queue.recover_stale(Duration::from_secs(3600)).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.recover_stale(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(queue.pending_count().await.unwrap(), 1);
    }
}
