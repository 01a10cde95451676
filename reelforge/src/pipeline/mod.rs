//! Batch pipeline for generation jobs.
//!
//! The pipeline is responsible for:
//! - Persisting jobs and their retry state in a database-backed queue
//! - Bounding how many jobs execute at once
//! - Pausing new executions while external providers keep failing
//! - Running the scrape, image and video workflow for each record

mod handler;
mod job_queue;
mod limiter;
mod manager;
mod processor;
mod resilience;

pub use handler::{JobHandler, ProviderConfigSource, RunConfig, RunConfigSource};
pub use job_queue::{ClaimedJob, FailOutcome, JobQueue};
pub use limiter::{ConcurrencyLimiter, LimiterStats};
pub use manager::{Collaborators, Orchestrator, OrchestratorConfig, RunSummary};
pub use processor::{
    GenerationFields, GenerationProcessor, IMAGE_PROMPT, STATUS_COMPLETE, STATUS_ERROR,
    STATUS_PROCESSING,
};
pub use resilience::{CircuitBreaker, CircuitState, RetryConfig};
