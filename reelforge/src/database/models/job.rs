//! Job database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Job database model.
/// One row per unit of batch work, keyed by the external record id.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    /// Status: pending, processing, completed, failed
    pub status: String,
    /// Serialized payload, opaque to the store
    pub data: String,
    /// Last recorded failure message
    pub error: Option<String>,
    /// Number of failed executions so far
    pub attempts: i64,
    /// Unix epoch milliseconds when the job was (re-)enqueued
    pub created_at: i64,
    /// Unix epoch milliseconds of the last transition
    pub updated_at: i64,
}

impl JobDbModel {
    /// Parsed status, if the stored value is known.
    pub fn job_status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }
}

/// Job status values.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job is queued and waiting to be dequeued.
    Pending,
    /// Job has been dequeued and is being executed.
    Processing,
    /// Job finished successfully.
    Completed,
    /// Job failed after exhausting retries.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Snapshot returned when a pending job is claimed for execution.
#[derive(Debug, Clone, FromRow)]
pub struct ClaimedJobRow {
    pub id: String,
    pub data: String,
    pub attempts: i64,
}

/// Outcome of recording a failed execution.
#[derive(Debug, Clone, FromRow)]
pub struct FailureRow {
    pub attempts: i64,
    pub status: String,
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}
