//! Job handler trait and the run configuration it receives.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::Result;
use crate::providers::{ImageGenerator, ProviderFactory, VideoGenerator};
use crate::records::{RunSettings, SettingsSource, WorkItem};

/// Everything a handler needs for one run: the operator's settings and the
/// generators they select.
#[derive(Clone)]
pub struct RunConfig {
    pub settings: RunSettings,
    pub image_generator: Arc<dyn ImageGenerator>,
    pub video_generator: Arc<dyn VideoGenerator>,
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("settings", &self.settings)
            .field("image_generator", &self.image_generator.name())
            .field("video_generator", &self.video_generator.name())
            .finish()
    }
}

/// Resolves the run configuration. Failure aborts the run before any job
/// is dispatched.
#[async_trait]
pub trait RunConfigSource: Send + Sync {
    async fn resolve(&self) -> Result<RunConfig>;
}

/// Executes one job. Returning `Err` charges the job's retry budget.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, item: &WorkItem, config: &RunConfig) -> Result<()>;
}

/// Reads settings from a [`SettingsSource`] and builds the matching
/// generators.
pub struct ProviderConfigSource {
    settings: Arc<dyn SettingsSource>,
    factory: ProviderFactory,
}

impl ProviderConfigSource {
    pub fn new(settings: Arc<dyn SettingsSource>, factory: ProviderFactory) -> Self {
        Self { settings, factory }
    }
}

#[async_trait]
impl RunConfigSource for ProviderConfigSource {
    async fn resolve(&self) -> Result<RunConfig> {
        let settings = self.settings.load_settings().await?;
        let image_generator = self
            .factory
            .image_generator(settings.api_provider, settings.image_model)?;
        let video_generator = self.factory.video_generator(settings.api_provider)?;

        info!(
            api_provider = %settings.api_provider,
            image_model = %settings.image_model,
            image_api = image_generator.name(),
            video_api = video_generator.name(),
            num_images = settings.num_images,
            video_resolution = %settings.video_resolution,
            "Configuration loaded"
        );

        Ok(RunConfig {
            settings,
            image_generator,
            video_generator,
        })
    }
}
