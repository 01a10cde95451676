//! FAL.ai image edit and WAN animate clients.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{
    GeneratedImage, GeneratedVideo, ImageGenerator, ImageModel, ImageRequest, PollSchedule,
    VideoGenerator, VideoRequest,
};
use crate::credentials::RotatingKey;
use crate::utils::http_client::{ensure_success, preview};
use crate::utils::media::aspect_ratio;
use crate::{Error, Result};

const PROVIDER: &str = "FAL";
const SYNC_BASE_URL: &str = "https://fal.run";
const QUEUE_BASE_URL: &str = "https://queue.fal.run";

const IMAGE_TIMEOUT: Duration = Duration::from_secs(300);
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(60);
const STATUS_TIMEOUT: Duration = Duration::from_secs(30);

/// Nano Banana Pro rejects larger batches.
const NANOBANANA_MAX_IMAGES: u32 = 4;

fn auth_header(key: &str) -> String {
    format!("Key {key}")
}

/// Image edits through FAL's synchronous endpoints.
pub struct FalImageGenerator {
    client: reqwest::Client,
    key: RotatingKey,
    model: ImageModel,
}

impl FalImageGenerator {
    pub fn new(client: reqwest::Client, key: RotatingKey, model: ImageModel) -> Self {
        Self { client, key, model }
    }

    fn endpoint(&self) -> String {
        let path = match self.model {
            ImageModel::Seedream40 => "fal-ai/bytedance/seedream/v4/edit",
            ImageModel::Seedream45 => "fal-ai/bytedance/seedream/v4.5/edit",
            ImageModel::NanobananaPro => "fal-ai/nano-banana-pro/edit",
        };
        format!("{SYNC_BASE_URL}/{path}")
    }

    fn request_body(&self, request: &ImageRequest) -> Value {
        match self.model {
            ImageModel::Seedream40 | ImageModel::Seedream45 => json!({
                "prompt": request.prompt,
                "image_urls": request.ref_image_urls,
                "num_images": request.num_images,
                "image_size": { "width": request.width, "height": request.height },
                "enable_safety_checker": !request.enable_nsfw,
            }),
            ImageModel::NanobananaPro => json!({
                "prompt": request.prompt,
                "image_urls": request.ref_image_urls,
                "num_images": request.num_images.min(NANOBANANA_MAX_IMAGES),
                "aspect_ratio": aspect_ratio(request.width, request.height),
                "resolution": "2K",
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    images: Vec<GeneratedImage>,
}

#[async_trait]
impl ImageGenerator for FalImageGenerator {
    fn name(&self) -> &'static str {
        match self.model {
            ImageModel::Seedream40 => "FAL.ai Seedream 4.0",
            ImageModel::Seedream45 => "FAL.ai Seedream 4.5",
            ImageModel::NanobananaPro => "FAL.ai Nanobanana Pro",
        }
    }

    async fn generate(&self, request: &ImageRequest) -> Result<Vec<GeneratedImage>> {
        let key = self.key.next().await?;
        info!(
            generator = self.name(),
            num_images = request.num_images,
            width = request.width,
            height = request.height,
            "Generating images"
        );

        let response = self
            .client
            .post(self.endpoint())
            .header(reqwest::header::AUTHORIZATION, auth_header(&key))
            .timeout(IMAGE_TIMEOUT)
            .json(&self.request_body(request))
            .send()
            .await?;
        let response = ensure_success(PROVIDER, "API error", response).await?;
        let body: ImagesResponse = response.json().await?;

        if body.images.is_empty() {
            return Err(Error::provider(PROVIDER, "returned no images"));
        }
        info!(count = body.images.len(), "Images generated successfully");
        Ok(body.images)
    }
}

/// WAN 2.2 animate-replace through FAL's queue API.
pub struct FalVideoGenerator {
    client: reqwest::Client,
    key: RotatingKey,
    poll: PollSchedule,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct VideoResult {
    video: Option<GeneratedVideo>,
}

impl FalVideoGenerator {
    pub fn new(client: reqwest::Client, key: RotatingKey, poll: PollSchedule) -> Self {
        Self { client, key, poll }
    }

    fn request_body(request: &VideoRequest) -> Value {
        let resolution = if request.resolution.is_empty() {
            "480p"
        } else {
            request.resolution.as_str()
        };
        json!({
            "video_url": request.video_url,
            "image_url": request.image_url,
            "resolution": resolution,
            "guidance_scale": 1,
            "num_inference_steps": 20,
            "enable_safety_checker": false,
        })
    }

    /// One status check. Transport errors and non-2xx answers count as
    /// "not done yet".
    async fn poll_status(&self, key: &str, request_id: &str) -> Option<StatusResponse> {
        let url = format!("{QUEUE_BASE_URL}/fal-ai/wan/requests/{request_id}/status");
        let response = self
            .client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, auth_header(key))
            .timeout(STATUS_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
            Ok(resp) => {
                debug!(request_id, status = resp.status().as_u16(), "Status check rejected");
                None
            }
            Err(e) => {
                debug!(request_id, error = %e, "Status check failed");
                None
            }
        }
    }

    async fn fetch_result(&self, key: &str, request_id: &str) -> Result<GeneratedVideo> {
        let url = format!("{QUEUE_BASE_URL}/fal-ai/wan/requests/{request_id}");
        let response = self
            .client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, auth_header(key))
            .send()
            .await?;
        let response = ensure_success(PROVIDER, "failed to get result", response).await?;
        let result: VideoResult = response.json().await?;
        result
            .video
            .filter(|v| !v.url.is_empty())
            .ok_or_else(|| Error::provider(PROVIDER, "returned no video URL in result"))
    }
}

#[async_trait]
impl VideoGenerator for FalVideoGenerator {
    fn name(&self) -> &'static str {
        "FAL.ai WAN 2.2 Animate"
    }

    async fn generate(&self, request: &VideoRequest) -> Result<GeneratedVideo> {
        let key = self.key.next().await?;
        info!(resolution = %request.resolution, "Generating video with FAL WAN Animate");

        let response = self
            .client
            .post(format!("{QUEUE_BASE_URL}/fal-ai/wan/v2.2-14b/animate/replace"))
            .header(reqwest::header::AUTHORIZATION, auth_header(&key))
            .timeout(SUBMIT_TIMEOUT)
            .json(&Self::request_body(request))
            .send()
            .await?;
        let response = ensure_success(PROVIDER, "submit error", response).await?;
        let submitted: SubmitResponse = response.json().await?;
        let request_id = submitted
            .request_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::provider(PROVIDER, "did not return request_id"))?;

        info!(request_id = %request_id, "Video generation job submitted");

        for poll in 0..self.poll.max_polls {
            tokio::time::sleep(self.poll.delay(poll)).await;

            let Some(status) = self.poll_status(&key, &request_id).await else {
                continue;
            };

            match status.status.as_str() {
                "COMPLETED" => {
                    let video = self.fetch_result(&key, &request_id).await?;
                    info!(request_id = %request_id, "Video generated successfully");
                    return Ok(video);
                }
                "FAILED" => {
                    let reason = status
                        .error
                        .map(|e| match e {
                            Value::String(s) => s,
                            other => other.to_string(),
                        })
                        .unwrap_or_else(|| "Unknown error".to_string());
                    return Err(Error::provider(
                        PROVIDER,
                        format!("job failed: {}", preview(&reason, 500)),
                    ));
                }
                other => debug!(request_id = %request_id, poll, status = other, "Video still running"),
            }
        }

        Err(Error::provider(PROVIDER, "job timed out"))
    }
}
