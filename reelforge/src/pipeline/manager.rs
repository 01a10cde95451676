//! Batch orchestrator.
//!
//! One [`Orchestrator::run`] resolves the run configuration, loads the work
//! list, enqueues it and drains the queue in rounds:
//!
//! - a round claims every pending job up front, so jobs requeued by a failure
//!   are never picked up by the round that failed them
//! - claimed jobs run through the [`ConcurrencyLimiter`] and the round waits
//!   for all of them
//! - with `retry_within_run`, another round starts after a backoff while jobs
//!   are pending and the previous round executed at least one job

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::handler::{JobHandler, RunConfig, RunConfigSource};
use super::job_queue::{ClaimedJob, JobQueue};
use super::limiter::ConcurrencyLimiter;
use super::processor::STATUS_ERROR;
use super::resilience::{CircuitBreaker, RetryConfig};
use crate::Result;
use crate::fields;
use crate::records::{RecordSink, WorkItem, WorkItemSource};
use crate::utils::http_client::preview;

/// Longest error message written back to a record.
const MAX_RECORD_ERROR_CHARS: usize = 500;

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Failed executions before a job becomes terminally failed.
    pub max_retries: u32,
    /// Keep draining rounds until requeued jobs are retried or exhausted.
    pub retry_within_run: bool,
    /// Age after which a `processing` row is considered abandoned.
    pub stale_after: Duration,
    /// Backoff between rounds.
    pub round_backoff: RetryConfig,
    /// Table failure diagnostics are written to.
    pub record_table: String,
    /// Finished jobs older than this are pruned when a run ends. `None`
    /// keeps them.
    pub retention_days: Option<u32>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_within_run: true,
            stale_after: Duration::from_secs(2 * 60 * 60),
            round_backoff: RetryConfig::default(),
            record_table: crate::records::airtable::GENERATION_TABLE.to_string(),
            retention_days: Some(7),
        }
    }
}

/// Aggregate counts for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Work items loaded for this run.
    pub total: usize,
    /// Executions that ran the handler.
    pub processed: usize,
    pub succeeded: usize,
    /// Failed executions, including ones that were requeued.
    pub failed: usize,
    /// Claims released untouched because the circuit breaker was open.
    pub skipped: usize,
    pub rounds: u32,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Complete: {} loaded | {} processed | {} success | {} failed | {} skipped | {}s",
            self.total,
            self.processed,
            self.succeeded,
            self.failed,
            self.skipped,
            self.elapsed.as_secs_f64().round() as u64
        )
    }
}

/// Result of one job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Execution {
    Succeeded,
    Failed { exhausted: bool },
    Skipped,
}

/// Everything a spawned execution needs.
#[derive(Clone)]
struct Executor {
    queue: Arc<JobQueue>,
    breaker: Arc<CircuitBreaker>,
    sink: Arc<dyn RecordSink>,
    handler: Arc<dyn JobHandler>,
    run_config: Arc<RunConfig>,
    max_retries: u32,
    record_table: Arc<str>,
}

impl Executor {
    async fn execute(self, job: ClaimedJob) -> Result<Execution> {
        if !self.breaker.can_proceed() {
            warn!(job_id = %job.id, "Circuit breaker open, skipping job");
            self.queue.release(&job.id).await?;
            return Ok(Execution::Skipped);
        }

        let started = Instant::now();
        let outcome = match job.payload::<WorkItem>() {
            Ok(item) => self.handler.handle(&item, &self.run_config).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.breaker.record_success();
                self.queue.complete(&job.id).await?;
                debug!(
                    job_id = %job.id,
                    duration_secs = started.elapsed().as_secs_f64(),
                    "Job execution succeeded"
                );
                Ok(Execution::Succeeded)
            }
            Err(e) => {
                let message = e.to_string();
                error!(job_id = %job.id, attempts = job.attempts, error = %message, "Job failed");
                self.breaker.record_failure();
                let result = self.queue.fail(&job.id, &message, self.max_retries).await?;
                self.report_failure(&job.id, &message).await;
                Ok(Execution::Failed {
                    exhausted: result.is_exhausted(),
                })
            }
        }
    }

    /// Write the failure back to the record. Errors here are logged and
    /// dropped so they never replace the job's own outcome.
    async fn report_failure(&self, record_id: &str, message: &str) {
        let updates = fields! {
            "Error_Message" => preview(message, MAX_RECORD_ERROR_CHARS),
        };
        if let Err(e) = self
            .sink
            .update_record(&self.record_table, record_id, updates)
            .await
        {
            debug!(record_id, error = %e, "Failed to save error message");
        }

        if let Err(e) = self
            .sink
            .update_record(&self.record_table, record_id, fields! { "Status" => STATUS_ERROR })
            .await
        {
            debug!(record_id, error = %e, "Failed to save error status");
        }
    }
}

/// Composes the job queue, limiter, breaker and collaborators into one run.
pub struct Orchestrator {
    queue: Arc<JobQueue>,
    limiter: Arc<ConcurrencyLimiter>,
    breaker: Arc<CircuitBreaker>,
    config_source: Arc<dyn RunConfigSource>,
    work_source: Arc<dyn WorkItemSource>,
    sink: Arc<dyn RecordSink>,
    handler: Arc<dyn JobHandler>,
    config: OrchestratorConfig,
}

/// Collaborators the orchestrator calls out to.
pub struct Collaborators {
    pub config_source: Arc<dyn RunConfigSource>,
    pub work_source: Arc<dyn WorkItemSource>,
    pub sink: Arc<dyn RecordSink>,
    pub handler: Arc<dyn JobHandler>,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<JobQueue>,
        limiter: Arc<ConcurrencyLimiter>,
        breaker: Arc<CircuitBreaker>,
        collaborators: Collaborators,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            queue,
            limiter,
            breaker,
            config_source: collaborators.config_source,
            work_source: collaborators.work_source,
            sink: collaborators.sink,
            handler: collaborators.handler,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Run one batch end to end, then prune old finished jobs.
    ///
    /// Failing to resolve the configuration or load the work list aborts
    /// before any job is dispatched. Individual job failures never abort.
    /// Pruning runs whether or not the batch succeeded.
    pub async fn run(&self) -> Result<RunSummary> {
        let result = self.process().await;
        if let Some(days) = self.config.retention_days
            && let Err(e) = self.queue.cleanup(days).await
        {
            warn!(error = %e, retention_days = days, "Queue cleanup failed");
        }
        result
    }

    async fn process(&self) -> Result<RunSummary> {
        let started = Instant::now();
        info!("Processor starting");

        let run_config = Arc::new(self.config_source.resolve().await?);
        let items = self.work_source.load_work_items().await?;

        let recovered = self.queue.recover_stale(self.config.stale_after).await?;
        if recovered > 0 {
            warn!(recovered, "Recovered jobs abandoned by a previous run");
        }

        for item in &items {
            self.queue.enqueue(&item.id, item).await?;
        }

        let mut summary = RunSummary {
            total: items.len(),
            ..Default::default()
        };
        info!(total = summary.total, "Records enqueued");

        let executor = Executor {
            queue: self.queue.clone(),
            breaker: self.breaker.clone(),
            sink: self.sink.clone(),
            handler: self.handler.clone(),
            run_config,
            max_retries: self.config.max_retries,
            record_table: Arc::from(self.config.record_table.as_str()),
        };

        loop {
            let jobs = self.claim_pending().await?;
            if jobs.is_empty() {
                break;
            }
            summary.rounds += 1;
            let round = summary.rounds;
            info!(round, jobs = jobs.len(), "Starting round");

            let executed = self.run_round(&executor, jobs, &mut summary).await;

            if !self.config.retry_within_run || executed == 0 {
                break;
            }
            if self.queue.pending_count().await? == 0 {
                break;
            }

            let delay = self.config.round_backoff.delay_for_attempt(round);
            info!(
                round,
                delay_ms = delay.as_millis() as u64,
                "Retrying requeued jobs after backoff"
            );
            tokio::time::sleep(delay).await;
        }

        summary.elapsed = started.elapsed();
        info!(
            total = summary.processed,
            success = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            rounds = summary.rounds,
            time = %format!("{}s", summary.elapsed.as_secs_f64().round() as u64),
            "Processing complete"
        );
        Ok(summary)
    }

    /// Claim every pending job.
    async fn claim_pending(&self) -> Result<Vec<ClaimedJob>> {
        let mut jobs = Vec::new();
        while let Some(job) = self.queue.dequeue().await? {
            jobs.push(job);
        }
        Ok(jobs)
    }

    /// Execute one round and fold the outcomes into `summary`. Returns how
    /// many jobs actually ran the handler.
    async fn run_round(
        &self,
        executor: &Executor,
        jobs: Vec<ClaimedJob>,
        summary: &mut RunSummary,
    ) -> usize {
        let mut tasks = JoinSet::new();
        for job in jobs {
            let limiter = self.limiter.clone();
            let executor = executor.clone();
            let job_id = job.id.clone();
            tasks.spawn(async move { (job_id, limiter.run(executor.execute(job)).await) });
        }

        let mut executed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Execution::Succeeded))) => {
                    executed += 1;
                    summary.processed += 1;
                    summary.succeeded += 1;
                }
                Ok((job_id, Ok(Execution::Failed { exhausted }))) => {
                    executed += 1;
                    summary.processed += 1;
                    summary.failed += 1;
                    if exhausted {
                        debug!(job_id = %job_id, "Job exhausted its retry budget");
                    }
                }
                Ok((_, Ok(Execution::Skipped))) => summary.skipped += 1,
                Ok((job_id, Err(e))) => {
                    // Queue bookkeeping failed; the row stays in processing
                    // until the stale sweep picks it up.
                    error!(job_id = %job_id, error = %e, "Job bookkeeping failed");
                    executed += 1;
                    summary.processed += 1;
                    summary.failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "Job task panicked");
                    summary.processed += 1;
                    summary.failed += 1;
                }
            }
        }
        executed
    }
}
