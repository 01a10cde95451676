#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use reelforge::database::repositories::{SqlxJobRepository, SqlxRotationRepository};
use reelforge::database::{DbPool, init_pool, run_migrations};
use reelforge::pipeline::{JobHandler, JobQueue, RetryConfig, RunConfig, RunConfigSource};
use reelforge::providers::{
    GeneratedImage, GeneratedVideo, ImageGenerator, ImageRequest, VideoGenerator, VideoRequest,
};
use reelforge::records::{FieldUpdates, RecordSink, RunSettings, WorkItem, WorkItemSource};
use reelforge::{Error, Result};

/// File-backed database in a temp dir. Keep the `TempDir` alive.
pub async fn test_db() -> (TempDir, DbPool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!(
        "sqlite:{}?mode=rwc",
        dir.path().join("reelforge.db").display()
    );
    let pool = init_pool(&url).await.unwrap();
    run_migrations(&pool).await.unwrap();
    (dir, pool)
}

pub fn job_queue(pool: &DbPool) -> Arc<JobQueue> {
    Arc::new(JobQueue::new(Arc::new(SqlxJobRepository::new(pool.clone()))))
}

pub fn rotation_repository(pool: &DbPool) -> Arc<SqlxRotationRepository> {
    Arc::new(SqlxRotationRepository::new(pool.clone()))
}

pub fn no_backoff() -> RetryConfig {
    RetryConfig {
        initial_delay_ms: 0,
        max_delay_ms: 0,
        backoff_multiplier: 1.0,
        use_jitter: false,
    }
}

pub fn work_item(id: &str) -> WorkItem {
    WorkItem {
        id: id.to_string(),
        fields: json!({ "Link": format!("https://www.tiktok.com/@user/video/{id}") }),
    }
}

struct NoopImages;

#[async_trait]
impl ImageGenerator for NoopImages {
    fn name(&self) -> &'static str {
        "noop images"
    }

    async fn generate(&self, _request: &ImageRequest) -> Result<Vec<GeneratedImage>> {
        Ok(vec![GeneratedImage {
            url: "https://img.test/0.png".into(),
        }])
    }
}

struct NoopVideo;

#[async_trait]
impl VideoGenerator for NoopVideo {
    fn name(&self) -> &'static str {
        "noop video"
    }

    async fn generate(&self, _request: &VideoRequest) -> Result<GeneratedVideo> {
        Ok(GeneratedVideo {
            url: "https://video.test/out.mp4".into(),
        })
    }
}

/// Resolves a fixed configuration, or fails with a configuration error.
pub struct StaticConfigSource {
    pub fail: bool,
}

#[async_trait]
impl RunConfigSource for StaticConfigSource {
    async fn resolve(&self) -> Result<RunConfig> {
        if self.fail {
            return Err(Error::config("Unknown API_Provider: Replicate"));
        }
        Ok(RunConfig {
            settings: RunSettings::default(),
            image_generator: Arc::new(NoopImages),
            video_generator: Arc::new(NoopVideo),
        })
    }
}

pub struct StaticWorkSource(pub Vec<WorkItem>);

#[async_trait]
impl WorkItemSource for StaticWorkSource {
    async fn load_work_items(&self) -> Result<Vec<WorkItem>> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub updates: Mutex<Vec<(String, FieldUpdates)>>,
}

impl RecordingSink {
    /// Values written to `field` for `record_id`, oldest first.
    pub fn values(&self, record_id: &str, field: &str) -> Vec<serde_json::Value> {
        self.updates
            .lock()
            .iter()
            .filter(|(id, _)| id == record_id)
            .filter_map(|(_, fields)| fields.get(field).cloned())
            .collect()
    }
}

#[async_trait]
impl RecordSink for RecordingSink {
    async fn update_record(&self, _table: &str, id: &str, fields: FieldUpdates) -> Result<()> {
        self.updates.lock().push((id.to_string(), fields));
        Ok(())
    }
}

/// Fails each listed job a set number of times before succeeding, and tracks
/// how many executions overlap.
#[derive(Default)]
pub struct ScriptedHandler {
    failures: DashMap<String, u32>,
    pub delay: Duration,
    calls: DashMap<String, u32>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedHandler {
    pub fn failing(self, id: &str, times: u32) -> Self {
        self.failures.insert(id.to_string(), times);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self, id: &str) -> u32 {
        self.calls.get(id).map(|c| *c).unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.iter().map(|entry| *entry.value()).sum()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn handle(&self, item: &WorkItem, _config: &RunConfig) -> Result<()> {
        *self.calls.entry(item.id.clone()).or_insert(0) += 1;

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let should_fail = match self.failures.get_mut(&item.id) {
            Some(mut remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if should_fail {
            return Err(Error::provider("Wavespeed", "upstream returned 502"));
        }
        Ok(())
    }
}
