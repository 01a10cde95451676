//! Scrape, image and video generation workflow for one record.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::handler::{JobHandler, RunConfig};
use crate::fields;
use crate::providers::scraper::MediaScraper;
use crate::providers::{ApiProvider, ImageRequest, VideoRequest};
use crate::records::{Attachment, RecordSink, WorkItem};
use crate::utils::media::url_to_data_uri;
use crate::{Error, Result};

/// Prompt for swapping the person on the cover with the character.
pub const IMAGE_PROMPT: &str = "Replace the person on the first image by the person from the second image. Keep the exact same pose, clothing style, and background. The result should look like the person from the second image is in the scene from the first image.";

/// Frame size assumed for uploaded source videos.
const DEFAULT_WIDTH: u32 = 720;
const DEFAULT_HEIGHT: u32 = 1280;

pub const STATUS_PROCESSING: &str = "Processing";
pub const STATUS_COMPLETE: &str = "Complete";
pub const STATUS_ERROR: &str = "Error";

/// The record fields the workflow reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationFields {
    #[serde(rename = "Link", default)]
    pub link: Option<String>,
    #[serde(rename = "Source_Video", default)]
    pub source_video: Vec<Attachment>,
    #[serde(rename = "AI_Character", default)]
    pub ai_character: Vec<Attachment>,
    #[serde(rename = "Cover_Image", default)]
    pub cover_image: Vec<Attachment>,
    #[serde(rename = "Generated_Images", default)]
    pub generated_images: Vec<Attachment>,
}

impl GenerationFields {
    pub fn from_item(item: &WorkItem) -> Result<Self> {
        if item.fields.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(item.fields.clone())?)
    }
}

/// Where the source video and cover come from.
#[derive(Debug)]
struct Source {
    video_url: String,
    cover_url: Option<String>,
    width: u32,
    height: u32,
}

/// Runs the full generation workflow for one record, writing intermediate
/// results back so a retry resumes where the last attempt stopped.
pub struct GenerationProcessor {
    sink: Arc<dyn RecordSink>,
    scraper: Arc<dyn MediaScraper>,
    client: reqwest::Client,
    table: String,
}

impl GenerationProcessor {
    pub fn new(
        sink: Arc<dyn RecordSink>,
        scraper: Arc<dyn MediaScraper>,
        client: reqwest::Client,
        table: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            scraper,
            client,
            table: table.into(),
        }
    }

    async fn resolve_source(&self, record_id: &str, fields: &GenerationFields) -> Result<Source> {
        if let Some(video) = fields.source_video.first() {
            return Ok(Source {
                video_url: video.url.clone(),
                cover_url: fields.cover_image.first().map(|c| c.url.clone()),
                width: DEFAULT_WIDTH,
                height: DEFAULT_HEIGHT,
            });
        }

        let link = fields
            .link
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Error::validation("No Link or Source_Video provided"))?;

        let scraped = self.scraper.scrape(link).await?;

        let mut updates = fields! {
            "Source_Video" => [Attachment::from_url(&scraped.video_url)],
        };
        if let Some(cover) = &scraped.cover_url {
            updates.insert(
                "Cover_Image".to_string(),
                serde_json::json!([Attachment::from_url(cover)]),
            );
        }
        self.sink.update_record(&self.table, record_id, updates).await?;

        Ok(Source {
            video_url: scraped.video_url,
            cover_url: scraped
                .cover_url
                .or_else(|| fields.cover_image.first().map(|c| c.url.clone())),
            width: scraped.width,
            height: scraped.height,
        })
    }

    async fn generate_images(
        &self,
        record_id: &str,
        config: &RunConfig,
        cover_url: &str,
        character_url: &str,
        source: &Source,
    ) -> Result<Vec<Attachment>> {
        // FAL takes inline data URIs, Wavespeed only HTTP URLs.
        let ref_image_urls = match config.settings.api_provider {
            ApiProvider::Fal => vec![
                url_to_data_uri(&self.client, cover_url).await?,
                url_to_data_uri(&self.client, character_url).await?,
            ],
            ApiProvider::Wavespeed => vec![cover_url.to_string(), character_url.to_string()],
        };

        let request = ImageRequest {
            prompt: IMAGE_PROMPT.to_string(),
            ref_image_urls,
            num_images: config.settings.num_images,
            enable_nsfw: config.settings.enable_nsfw,
            width: source.width,
            height: source.height,
        };

        let images = config.image_generator.generate(&request).await?;
        if images.is_empty() {
            return Err(Error::provider(
                config.image_generator.name(),
                "returned no images",
            ));
        }

        let attachments: Vec<Attachment> = images
            .into_iter()
            .map(|img| Attachment::from_url(img.url))
            .collect();
        self.sink
            .update_record(
                &self.table,
                record_id,
                fields! { "Generated_Images" => &attachments },
            )
            .await?;
        Ok(attachments)
    }

    /// Best-effort status update; bases without a `Status` field reject it.
    async fn set_status(&self, record_id: &str, status: &str) {
        if let Err(e) = self
            .sink
            .update_record(&self.table, record_id, fields! { "Status" => status })
            .await
        {
            debug!(record_id, status, error = %e, "Status update skipped");
        }
    }
}

#[async_trait]
impl JobHandler for GenerationProcessor {
    async fn handle(&self, item: &WorkItem, config: &RunConfig) -> Result<()> {
        let record_id = item.id.as_str();
        info!(record_id, "Processing job");

        self.set_status(record_id, STATUS_PROCESSING).await;

        let fields = GenerationFields::from_item(item)?;
        let character_url = fields
            .ai_character
            .first()
            .map(|a| a.url.clone())
            .ok_or_else(|| Error::validation("AI_Character is required"))?;

        let source = self.resolve_source(record_id, &fields).await?;
        let cover_url = source.cover_url.clone().ok_or_else(|| {
            Error::validation(
                "No cover image available. Please upload a video with a cover or use a TikTok/Instagram link.",
            )
        })?;

        let images = if fields.generated_images.is_empty() {
            self.generate_images(record_id, config, &cover_url, &character_url, &source)
                .await?
        } else {
            debug!(record_id, count = fields.generated_images.len(), "Reusing generated images");
            fields.generated_images.clone()
        };

        let image_url = images
            .first()
            .map(|a| a.url.clone())
            .ok_or_else(|| Error::validation("No generated image to animate"))?;

        let video = config
            .video_generator
            .generate(&VideoRequest {
                video_url: source.video_url.clone(),
                image_url,
                resolution: config.settings.video_resolution.clone(),
            })
            .await?;

        self.sink
            .update_record(
                &self.table,
                record_id,
                fields! {
                    "Output_Video" => [Attachment::from_url(video.url)],
                    "Error_Message" => "",
                },
            )
            .await?;

        self.set_status(record_id, STATUS_COMPLETE).await;
        info!(record_id, "Job completed successfully");
        Ok(())
    }
}
