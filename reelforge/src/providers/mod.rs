//! External generation and scraping providers.
//!
//! Image and video generation sit behind [`ImageGenerator`] and
//! [`VideoGenerator`]. The concrete implementation is picked by
//! [`ProviderFactory`] from the run's [`ApiProvider`] and [`ImageModel`].
//! Every outbound call takes its API key from the rotation manager under a
//! compound key such as `fal:image`.

pub mod fal;
pub mod scraper;
pub mod wavespeed;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::credentials::{KeyPool, KeyRotationManager, RotatingKey};
use crate::{Error, Result};

/// Generation API vendor selected for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum ApiProvider {
    #[strum(to_string = "FAL.ai", serialize = "fal", ascii_case_insensitive)]
    Fal,
    #[strum(to_string = "Wavespeed", ascii_case_insensitive)]
    Wavespeed,
}

impl ApiProvider {
    /// Prefix of this vendor's rotation keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fal => "fal",
            Self::Wavespeed => "wavespeed",
        }
    }

    /// Rotation key for one media kind, e.g. `wavespeed:video`.
    pub fn rotation_key(&self, kind: MediaKind) -> String {
        format!("{}:{}", self.as_str(), kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// Image model selected for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum ImageModel {
    #[strum(serialize = "Seedream 4.0")]
    Seedream40,
    #[strum(serialize = "Seedream 4.5")]
    Seedream45,
    #[strum(serialize = "Nanobanana Pro")]
    NanobananaPro,
}

impl ImageModel {
    /// Parse a configured label; unknown labels select Seedream 4.5.
    pub fn from_label(label: &str) -> Self {
        Self::from_str(label.trim()).unwrap_or(Self::Seedream45)
    }
}

/// Input for one image generation call.
#[derive(Debug, Clone, Serialize)]
pub struct ImageRequest {
    pub prompt: String,
    /// Reference images: HTTP URLs or `data:` URIs.
    pub ref_image_urls: Vec<String>,
    pub num_images: u32,
    pub enable_nsfw: bool,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub url: String,
}

/// Input for one video generation call.
#[derive(Debug, Clone, Serialize)]
pub struct VideoRequest {
    pub video_url: String,
    pub image_url: String,
    pub resolution: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedVideo {
    pub url: String,
}

/// Generates still images from reference images and a prompt.
///
/// An empty result is an error, never `Ok(vec![])`.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &'static str;
    async fn generate(&self, request: &ImageRequest) -> Result<Vec<GeneratedImage>>;
}

/// Animates a reference image along a source video.
#[async_trait]
pub trait VideoGenerator: Send + Sync {
    fn name(&self) -> &'static str;
    async fn generate(&self, request: &VideoRequest) -> Result<GeneratedVideo>;
}

/// Back-off schedule for polling asynchronous generation jobs.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    /// Wait before the n-th poll; the last entry repeats.
    pub intervals: Vec<Duration>,
    pub max_polls: u32,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            intervals: [5, 10, 15, 20, 30]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
            max_polls: 100,
        }
    }
}

impl PollSchedule {
    pub fn delay(&self, poll: u32) -> Duration {
        let idx = (poll as usize).min(self.intervals.len().saturating_sub(1));
        self.intervals.get(idx).copied().unwrap_or(Duration::ZERO)
    }
}

/// Builds generators for the selected vendor and model.
#[derive(Clone)]
pub struct ProviderFactory {
    client: reqwest::Client,
    rotation: Arc<KeyRotationManager>,
    fal_keys: KeyPool,
    wavespeed_keys: KeyPool,
    poll: PollSchedule,
}

impl ProviderFactory {
    pub fn new(
        client: reqwest::Client,
        rotation: Arc<KeyRotationManager>,
        fal_keys: KeyPool,
        wavespeed_keys: KeyPool,
    ) -> Self {
        Self {
            client,
            rotation,
            fal_keys,
            wavespeed_keys,
            poll: PollSchedule::default(),
        }
    }

    pub fn with_poll_schedule(mut self, poll: PollSchedule) -> Self {
        self.poll = poll;
        self
    }

    fn key(&self, provider: ApiProvider, kind: MediaKind) -> Result<RotatingKey> {
        let pool = match provider {
            ApiProvider::Fal => &self.fal_keys,
            ApiProvider::Wavespeed => &self.wavespeed_keys,
        };
        if pool.is_empty() {
            return Err(Error::NoCredentials(provider.to_string()));
        }
        Ok(RotatingKey::new(
            self.rotation.clone(),
            provider.rotation_key(kind),
            pool.clone(),
        ))
    }

    pub fn image_generator(
        &self,
        provider: ApiProvider,
        model: ImageModel,
    ) -> Result<Arc<dyn ImageGenerator>> {
        let key = self.key(provider, MediaKind::Image)?;
        Ok(match provider {
            ApiProvider::Fal => Arc::new(fal::FalImageGenerator::new(
                self.client.clone(),
                key,
                model,
            )),
            ApiProvider::Wavespeed => Arc::new(wavespeed::WavespeedImageGenerator::new(
                self.client.clone(),
                key,
                model,
            )),
        })
    }

    pub fn video_generator(&self, provider: ApiProvider) -> Result<Arc<dyn VideoGenerator>> {
        let key = self.key(provider, MediaKind::Video)?;
        Ok(match provider {
            ApiProvider::Fal => Arc::new(fal::FalVideoGenerator::new(
                self.client.clone(),
                key,
                self.poll.clone(),
            )),
            ApiProvider::Wavespeed => Arc::new(wavespeed::WavespeedVideoGenerator::new(
                self.client.clone(),
                key,
                self.poll.clone(),
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxRotationRepository;
    use crate::database::test_pool;

    #[test]
    fn test_provider_labels() {
        assert_eq!(ApiProvider::from_str("FAL.ai").unwrap(), ApiProvider::Fal);
        assert_eq!(ApiProvider::from_str("fal").unwrap(), ApiProvider::Fal);
        assert_eq!(
            ApiProvider::from_str("wavespeed").unwrap(),
            ApiProvider::Wavespeed
        );
        assert!(ApiProvider::from_str("replicate").is_err());
        assert_eq!(ApiProvider::Fal.to_string(), "FAL.ai");
        assert_eq!(
            ApiProvider::Wavespeed.rotation_key(MediaKind::Video),
            "wavespeed:video"
        );
    }

    #[test]
    fn test_image_model_fallback() {
        assert_eq!(ImageModel::from_label("Seedream 4.0"), ImageModel::Seedream40);
        assert_eq!(
            ImageModel::from_label("Nanobanana Pro"),
            ImageModel::NanobananaPro
        );
        assert_eq!(ImageModel::from_label("Flux"), ImageModel::Seedream45);
    }

    #[test]
    fn test_poll_schedule_repeats_last_interval() {
        let schedule = PollSchedule::default();
        assert_eq!(schedule.delay(0), Duration::from_secs(5));
        assert_eq!(schedule.delay(3), Duration::from_secs(20));
        assert_eq!(schedule.delay(4), Duration::from_secs(30));
        assert_eq!(schedule.delay(99), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_factory_selects_by_provider_and_model() {
        let rotation = Arc::new(KeyRotationManager::new(Arc::new(
            SqlxRotationRepository::new(test_pool().await),
        )));
        let client =
            crate::utils::http_client::build_http_client(Duration::from_secs(5), 1).unwrap();
        let factory = ProviderFactory::new(
            client,
            rotation,
            KeyPool::new(vec!["fal-key".into()], 1),
            KeyPool::default(),
        );

        let image = factory
            .image_generator(ApiProvider::Fal, ImageModel::NanobananaPro)
            .unwrap();
        assert_eq!(image.name(), "FAL.ai Nanobanana Pro");
        let video = factory.video_generator(ApiProvider::Fal).unwrap();
        assert_eq!(video.name(), "FAL.ai WAN 2.2 Animate");

        let err = factory.video_generator(ApiProvider::Wavespeed).err().unwrap();
        assert!(matches!(err, Error::NoCredentials(_)));
    }
}
