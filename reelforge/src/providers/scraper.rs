//! Source video scraping through Apify actors.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::utils::http_client::ensure_success;
use crate::utils::media::{Platform, detect_platform};
use crate::{Error, Result};

const PROVIDER: &str = "Apify";
const BASE_URL: &str = "https://api.apify.com/v2";

const TIKTOK_ACTOR: &str = "clockworks~tiktok-video-scraper";
const INSTAGRAM_ACTOR: &str = "apify~instagram-api-scraper";

/// A scraped source video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapedVideo {
    pub video_url: String,
    pub cover_url: Option<String>,
    pub width: u32,
    pub height: u32,
}

/// Resolves a social media link to its video and cover.
#[async_trait]
pub trait MediaScraper: Send + Sync {
    async fn scrape(&self, link: &str) -> Result<ScrapedVideo>;
}

/// How long to wait for an actor run.
#[derive(Debug, Clone)]
pub struct RunPolling {
    pub interval: Duration,
    pub max_polls: u32,
}

impl Default for RunPolling {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_polls: 60,
        }
    }
}

pub struct ApifyScraper {
    client: reqwest::Client,
    token: String,
    polling: RunPolling,
}

#[derive(Debug, Deserialize)]
struct RunEnvelope {
    data: RunData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunData {
    id: String,
    #[serde(default)]
    default_dataset_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl ApifyScraper {
    pub fn new(client: reqwest::Client, token: impl Into<String>) -> Self {
        Self {
            client,
            token: token.into(),
            polling: RunPolling::default(),
        }
    }

    pub fn with_polling(mut self, polling: RunPolling) -> Self {
        self.polling = polling;
        self
    }

    fn actor_input(platform: Platform, link: &str) -> (&'static str, Value) {
        match platform {
            Platform::TikTok => (
                TIKTOK_ACTOR,
                json!({
                    "postURLs": [link],
                    "shouldDownloadVideos": true,
                    "shouldDownloadCovers": true,
                }),
            ),
            Platform::Instagram => (
                INSTAGRAM_ACTOR,
                json!({
                    "directUrls": [link],
                    "resultsType": "posts",
                    "resultsLimit": 1,
                }),
            ),
        }
    }

    /// Start an actor run and wait until it leaves `READY`/`RUNNING`.
    /// Returns the dataset holding the results.
    async fn run_actor(&self, actor: &str, input: &Value) -> Result<String> {
        let response = self
            .client
            .post(format!("{BASE_URL}/acts/{actor}/runs"))
            .query(&[("token", self.token.as_str())])
            .json(input)
            .send()
            .await?;
        let response = ensure_success(PROVIDER, "run failed", response).await?;
        let run: RunEnvelope = response.json().await?;
        let run_id = run.data.id;
        let dataset_id = run
            .data
            .default_dataset_id
            .ok_or_else(|| Error::provider(PROVIDER, "run has no dataset"))?;

        debug!(actor, run_id = %run_id, "Actor run started");

        let mut status = run.data.status.unwrap_or_else(|| "RUNNING".to_string());
        let mut polls = 0;
        while status == "RUNNING" || status == "READY" {
            tokio::time::sleep(self.polling.interval).await;
            polls += 1;
            if polls > self.polling.max_polls {
                return Err(Error::provider(PROVIDER, "run timed out"));
            }

            let response = self
                .client
                .get(format!("{BASE_URL}/actor-runs/{run_id}"))
                .query(&[("token", self.token.as_str())])
                .send()
                .await?;
            let response = ensure_success(PROVIDER, "status check failed", response).await?;
            let run: RunEnvelope = response.json().await?;
            status = run.data.status.unwrap_or_default();
        }

        if status != "SUCCEEDED" {
            return Err(Error::provider(
                PROVIDER,
                format!("run failed with status: {status}"),
            ));
        }
        Ok(dataset_id)
    }

    async fn first_item(&self, dataset_id: &str) -> Result<Option<Value>> {
        let response = self
            .client
            .get(format!("{BASE_URL}/datasets/{dataset_id}/items"))
            .query(&[("token", self.token.as_str())])
            .send()
            .await?;
        let response = ensure_success(PROVIDER, "dataset read failed", response).await?;
        let items: Vec<Value> = response.json().await?;
        Ok(items.into_iter().next())
    }
}

#[async_trait]
impl MediaScraper for ApifyScraper {
    async fn scrape(&self, link: &str) -> Result<ScrapedVideo> {
        let platform = detect_platform(link).ok_or_else(|| {
            Error::validation("Unsupported platform. Only TikTok and Instagram are supported.")
        })?;
        info!(%platform, link, "Fetching source video");

        let (actor, input) = Self::actor_input(platform, link);
        let dataset_id = self.run_actor(actor, &input).await?;
        let item = self.first_item(&dataset_id).await?.ok_or_else(|| {
            Error::provider(PROVIDER, format!("no results from {platform} scraper"))
        })?;

        let video = match platform {
            Platform::TikTok => extract_tiktok(&item),
            Platform::Instagram => extract_instagram(&item),
        }?;
        info!(%platform, width = video.width, height = video.height, "Source video fetched");
        Ok(video)
    }
}

/// First non-empty string among JSON pointers into `item`.
fn first_str(item: &Value, pointers: &[&str]) -> Option<String> {
    pointers
        .iter()
        .filter_map(|p| item.pointer(p).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// First positive integer among JSON pointers into `item`.
fn first_dimension(item: &Value, pointers: &[&str]) -> Option<u32> {
    pointers
        .iter()
        .filter_map(|p| item.pointer(p).and_then(Value::as_u64))
        .find(|v| *v > 0)
        .and_then(|v| u32::try_from(v).ok())
}

fn extract_tiktok(item: &Value) -> Result<ScrapedVideo> {
    let video_url = first_str(
        item,
        &[
            "/mediaUrls/0",
            "/videoMeta/downloadAddr",
            "/videoMeta/originalDownloadAddr",
            "/videoMeta/playAddr",
        ],
    )
    .ok_or_else(|| {
        Error::provider(
            PROVIDER,
            "no video URL in TikTok response, video may be private or unavailable",
        )
    })?;

    let cover_url = first_str(
        item,
        &[
            "/videoMeta/coverUrl",
            "/videoMeta/originalCoverUrl",
            "/videoMeta/originCover",
            "/videoMeta/dynamicCover",
            "/coverUrl",
            "/authorMeta/avatar",
        ],
    );

    Ok(ScrapedVideo {
        video_url,
        cover_url,
        width: first_dimension(item, &["/videoMeta/width"]).unwrap_or(720),
        height: first_dimension(item, &["/videoMeta/height"]).unwrap_or(1280),
    })
}

fn extract_instagram(item: &Value) -> Result<ScrapedVideo> {
    let video_url = first_str(
        item,
        &[
            "/videoUrl",
            "/video_url",
            "/videoPlaybackUrl",
            "/video/url",
            "/media/video_versions/0/url",
        ],
    )
    .ok_or_else(|| {
        Error::provider(
            PROVIDER,
            "no video URL in Instagram response, post may not be a reel",
        )
    })?;

    let cover_url = first_str(
        item,
        &[
            "/displayUrl",
            "/thumbnailUrl",
            "/thumbnail_url",
            "/previewUrl",
            "/imageUrl",
            "/image_versions2/candidates/0/url",
        ],
    );

    Ok(ScrapedVideo {
        video_url,
        cover_url,
        width: first_dimension(
            item,
            &["/dimensions/width", "/videoWidth", "/width", "/original_width"],
        )
        .unwrap_or(1080),
        height: first_dimension(
            item,
            &["/dimensions/height", "/videoHeight", "/height", "/original_height"],
        )
        .unwrap_or(1920),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_tiktok_prefers_media_urls() {
        let item = json!({
            "mediaUrls": ["https://cdn/v.mp4"],
            "videoMeta": {
                "downloadAddr": "https://tiktok/dl",
                "coverUrl": "https://cdn/c.jpg",
                "width": 576,
                "height": 1024
            }
        });
        let video = extract_tiktok(&item).unwrap();
        assert_eq!(video.video_url, "https://cdn/v.mp4");
        assert_eq!(video.cover_url.as_deref(), Some("https://cdn/c.jpg"));
        assert_eq!((video.width, video.height), (576, 1024));
    }

    #[test]
    fn test_extract_tiktok_defaults_and_fallbacks() {
        let item = json!({
            "mediaUrls": [],
            "videoMeta": { "playAddr": "https://tiktok/play" },
            "authorMeta": { "avatar": "https://avatar" }
        });
        let video = extract_tiktok(&item).unwrap();
        assert_eq!(video.video_url, "https://tiktok/play");
        assert_eq!(video.cover_url.as_deref(), Some("https://avatar"));
        assert_eq!((video.width, video.height), (720, 1280));

        assert!(extract_tiktok(&json!({"videoMeta": {}})).is_err());
    }

    #[test]
    fn test_extract_instagram() {
        let item = json!({
            "videoUrl": "https://ig/v.mp4",
            "displayUrl": "https://ig/d.jpg",
            "dimensions": { "width": 0, "height": 0 },
            "videoWidth": 720
        });
        let video = extract_instagram(&item).unwrap();
        assert_eq!(video.video_url, "https://ig/v.mp4");
        assert_eq!(video.cover_url.as_deref(), Some("https://ig/d.jpg"));
        assert_eq!((video.width, video.height), (720, 1920));

        assert!(extract_instagram(&json!({"displayUrl": "x"})).is_err());
    }

    #[test]
    fn test_actor_selection() {
        let (actor, input) = ApifyScraper::actor_input(Platform::TikTok, "https://tiktok.com/x");
        assert_eq!(actor, TIKTOK_ACTOR);
        assert_eq!(input["postURLs"][0], "https://tiktok.com/x");

        let (actor, input) =
            ApifyScraper::actor_input(Platform::Instagram, "https://instagram.com/reel/x");
        assert_eq!(actor, INSTAGRAM_ACTOR);
        assert_eq!(input["resultsLimit"], 1);
    }
}
