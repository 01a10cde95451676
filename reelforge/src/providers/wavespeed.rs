//! Wavespeed image edit and WAN animate clients.
//!
//! Wavespeed wraps every answer in `{code, message, data}` and only accepts
//! HTTP reference URLs.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{
    GeneratedImage, GeneratedVideo, ImageGenerator, ImageModel, ImageRequest, PollSchedule,
    VideoGenerator, VideoRequest,
};
use crate::credentials::RotatingKey;
use crate::utils::http_client::{ensure_success, preview};
use crate::utils::media::{aspect_ratio, scale_to_min_pixels};
use crate::{Error, Result};

const PROVIDER: &str = "Wavespeed";
const BASE_URL: &str = "https://api.wavespeed.ai/api/v3";

const IMAGE_TIMEOUT: Duration = Duration::from_secs(300);
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(60);

fn bearer(key: &str) -> String {
    format!("Bearer {key}")
}

/// Response envelope shared by every Wavespeed endpoint.
#[derive(Debug, Deserialize)]
struct Envelope {
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl Envelope {
    fn into_data(self) -> Result<Value> {
        if let Some(data) = &self.data {
            if data.get("status").and_then(Value::as_str) == Some("failed")
                || data.get("error").is_some_and(|e| !e.is_null() && e != "")
            {
                return Err(Error::provider(
                    PROVIDER,
                    value_text(data.get("error")).unwrap_or_else(|| "Generation failed".into()),
                ));
            }
        }
        if self.code != Some(200) {
            return Err(Error::provider(
                PROVIDER,
                self.message.unwrap_or_else(|| "Unknown error".into()),
            ));
        }
        Ok(self.data.unwrap_or(Value::Null))
    }
}

fn value_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Image edits through Wavespeed's synchronous mode.
pub struct WavespeedImageGenerator {
    client: reqwest::Client,
    key: RotatingKey,
    model: ImageModel,
}

impl WavespeedImageGenerator {
    pub fn new(client: reqwest::Client, key: RotatingKey, model: ImageModel) -> Self {
        Self { client, key, model }
    }

    fn endpoint(&self) -> String {
        let path = match self.model {
            ImageModel::Seedream40 => "bytedance/seedream-v4/edit",
            ImageModel::Seedream45 => "bytedance/seedream-v4.5/edit",
            ImageModel::NanobananaPro => "google/nano-banana-pro/edit",
        };
        format!("{BASE_URL}/{path}")
    }

    fn request_body(&self, request: &ImageRequest) -> Result<Value> {
        let images: Vec<&str> = request
            .ref_image_urls
            .iter()
            .map(String::as_str)
            .filter(|url| !url.starts_with("data:"))
            .collect();
        if images.is_empty() {
            return Err(Error::validation("Wavespeed requires HTTP image URLs"));
        }

        Ok(match self.model {
            ImageModel::Seedream40 | ImageModel::Seedream45 => {
                let (width, height) = scale_to_min_pixels(request.width, request.height);
                json!({
                    "prompt": request.prompt,
                    "images": images,
                    "size": format!("{width}*{height}"),
                    "enable_sync_mode": true,
                })
            }
            ImageModel::NanobananaPro => json!({
                "prompt": request.prompt,
                "images": images,
                "aspect_ratio": aspect_ratio(request.width, request.height),
                "resolution": "2k",
                "enable_sync_mode": true,
            }),
        })
    }
}

#[async_trait]
impl ImageGenerator for WavespeedImageGenerator {
    fn name(&self) -> &'static str {
        match self.model {
            ImageModel::Seedream40 => "Wavespeed Seedream 4.0",
            ImageModel::Seedream45 => "Wavespeed Seedream 4.5",
            ImageModel::NanobananaPro => "Wavespeed Nanobanana Pro",
        }
    }

    async fn generate(&self, request: &ImageRequest) -> Result<Vec<GeneratedImage>> {
        let body = self.request_body(request)?;
        let key = self.key.next().await?;
        info!(
            generator = self.name(),
            num_images = request.num_images,
            "Generating images"
        );

        let response = self
            .client
            .post(self.endpoint())
            .header(reqwest::header::AUTHORIZATION, bearer(&key))
            .timeout(IMAGE_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        let response = ensure_success(PROVIDER, "API error", response).await?;
        let envelope: Envelope = response.json().await?;
        let data = envelope.into_data()?;

        let outputs = string_list(data.get("outputs"));
        if outputs.is_empty() {
            return Err(Error::provider(PROVIDER, "returned no images"));
        }
        info!(count = outputs.len(), "Images generated successfully");
        Ok(outputs.into_iter().map(|url| GeneratedImage { url }).collect())
    }
}

/// WAN 2.2 animate in replace mode, submitted then polled.
pub struct WavespeedVideoGenerator {
    client: reqwest::Client,
    key: RotatingKey,
    poll: PollSchedule,
}

impl WavespeedVideoGenerator {
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
            "image": request.image_url,
            "video": request.video_url,
            "mode": "replace",
            "resolution": resolution,
            "seed": -1,
        })
    }
}

/// Outcome of one prediction status check.
#[derive(Debug, PartialEq, Eq)]
enum PollOutcome {
    Pending,
    Completed(String),
    Failed(String),
}

/// Interpret a prediction result. The video URL has shown up under several
/// shapes, so all of them are checked.
fn interpret_prediction(body: &Value) -> Result<PollOutcome> {
    let data = body.get("data");
    let status = body
        .get("status")
        .or_else(|| data.and_then(|d| d.get("status")))
        .and_then(Value::as_str)
        .unwrap_or_default();

    match status {
        "completed" => {
            let url = string_list(body.get("outputs"))
                .into_iter()
                .next()
                .or_else(|| string_list(data.and_then(|d| d.get("outputs"))).into_iter().next())
                .or_else(|| value_text(data.and_then(|d| d.get("video"))))
                .or_else(|| value_text(body.get("video")));

            match url {
                Some(url) => Ok(PollOutcome::Completed(url)),
                None => {
                    warn!(
                        body = preview(&body.to_string(), 500),
                        "Prediction completed without a video URL"
                    );
                    Err(Error::provider(PROVIDER, "returned no video URL"))
                }
            }
        }
        "failed" => Ok(PollOutcome::Failed(
            value_text(body.get("error"))
                .or_else(|| value_text(data.and_then(|d| d.get("error"))))
                .unwrap_or_else(|| "Unknown error".into()),
        )),
        _ => Ok(PollOutcome::Pending),
    }
}

#[async_trait]
impl VideoGenerator for WavespeedVideoGenerator {
    fn name(&self) -> &'static str {
        "Wavespeed WAN 2.2 Animate"
    }

    async fn generate(&self, request: &VideoRequest) -> Result<GeneratedVideo> {
        let key = self.key.next().await?;
        info!(resolution = %request.resolution, "Generating video with Wavespeed WAN Animate");

        let response = self
            .client
            .post(format!("{BASE_URL}/wavespeed-ai/wan-2.2/animate"))
            .header(reqwest::header::AUTHORIZATION, bearer(&key))
            .timeout(SUBMIT_TIMEOUT)
            .json(&Self::request_body(request))
            .send()
            .await?;
        let response = ensure_success(PROVIDER, "submit error", response).await?;
        let envelope: Envelope = response.json().await?;
        let data = envelope.into_data()?;
        let request_id = value_text(data.get("id"))
            .ok_or_else(|| Error::provider(PROVIDER, "did not return request ID"))?;

        info!(request_id = %request_id, "Video generation job submitted");

        let result_url = format!("{BASE_URL}/predictions/{request_id}/result");
        for poll in 0..self.poll.max_polls {
            tokio::time::sleep(self.poll.delay(poll)).await;

            let response = match self
                .client
                .get(&result_url)
                .header(reqwest::header::AUTHORIZATION, bearer(&key))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => resp,
                Ok(resp) => {
                    debug!(request_id = %request_id, status = resp.status().as_u16(), "Status check rejected");
                    continue;
                }
                Err(e) => {
                    debug!(request_id = %request_id, error = %e, "Status check failed");
                    continue;
                }
            };
            let Ok(body) = response.json::<Value>().await else {
                continue;
            };

            match interpret_prediction(&body)? {
                PollOutcome::Completed(url) => {
                    info!(request_id = %request_id, "Video generated successfully");
                    return Ok(GeneratedVideo { url });
                }
                PollOutcome::Failed(reason) => {
                    return Err(Error::provider(PROVIDER, format!("job failed: {reason}")));
                }
                PollOutcome::Pending => {
                    debug!(request_id = %request_id, poll, "Video still running")
                }
            }
        }

        Err(Error::provider(PROVIDER, "job timed out"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{KeyPool, KeyRotationManager};
    use crate::database::repositories::SqlxRotationRepository;
    use crate::database::test_pool;
    use std::sync::Arc;

    async fn generator(model: ImageModel) -> WavespeedImageGenerator {
        let rotation = Arc::new(KeyRotationManager::new(Arc::new(
            SqlxRotationRepository::new(test_pool().await),
        )));
        let key = RotatingKey::new(rotation, "wavespeed:image", KeyPool::new(vec!["k".into()], 1));
        let client =
            crate::utils::http_client::build_http_client(Duration::from_secs(5), 1).unwrap();
        WavespeedImageGenerator::new(client, key, model)
    }

    fn request(refs: &[&str]) -> ImageRequest {
        ImageRequest {
            prompt: "swap".into(),
            ref_image_urls: refs.iter().map(|s| s.to_string()).collect(),
            num_images: 4,
            enable_nsfw: false,
            width: 720,
            height: 1280,
        }
    }

    #[tokio::test]
    async fn test_seedream_upscales_and_drops_data_uris() {
        let generator = generator(ImageModel::Seedream40).await;
        assert_eq!(
            generator.endpoint(),
            "https://api.wavespeed.ai/api/v3/bytedance/seedream-v4/edit"
        );
        let body = generator
            .request_body(&request(&["data:image/png;base64,AA", "https://x/a.png"]))
            .unwrap();
        assert_eq!(body["images"], json!(["https://x/a.png"]));
        assert_eq!(body["size"], "1080*1920");
        assert_eq!(body["enable_sync_mode"], true);
    }

    #[tokio::test]
    async fn test_rejects_data_uri_only_input() {
        let generator = generator(ImageModel::NanobananaPro).await;
        let err = generator
            .request_body(&request(&["data:image/png;base64,AA"]))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_envelope_errors() {
        let ok: Envelope =
            serde_json::from_str(r#"{"code":200,"data":{"outputs":["https://o"]}}"#).unwrap();
        let data = ok.into_data().unwrap();
        assert_eq!(string_list(data.get("outputs")), vec!["https://o"]);

        let bad: Envelope = serde_json::from_str(r#"{"code":400,"message":"nope"}"#).unwrap();
        assert_eq!(
            bad.into_data().unwrap_err().to_string(),
            "Wavespeed error: nope"
        );

        let failed: Envelope =
            serde_json::from_str(r#"{"code":200,"data":{"status":"failed","error":"nsfw"}}"#)
                .unwrap();
        assert_eq!(
            failed.into_data().unwrap_err().to_string(),
            "Wavespeed error: nsfw"
        );
    }

    #[test]
    fn test_interpret_prediction_shapes() {
        let pending = json!({"status": "processing"});
        assert_eq!(interpret_prediction(&pending).unwrap(), PollOutcome::Pending);

        let top = json!({"status": "completed", "outputs": ["https://a"]});
        assert_eq!(
            interpret_prediction(&top).unwrap(),
            PollOutcome::Completed("https://a".into())
        );

        let nested = json!({"data": {"status": "completed", "outputs": ["https://b"]}});
        assert_eq!(
            interpret_prediction(&nested).unwrap(),
            PollOutcome::Completed("https://b".into())
        );

        let video = json!({"status": "completed", "data": {"video": "https://c"}});
        assert_eq!(
            interpret_prediction(&video).unwrap(),
            PollOutcome::Completed("https://c".into())
        );

        let failed = json!({"status": "failed", "data": {"error": "oom"}});
        assert_eq!(
            interpret_prediction(&failed).unwrap(),
            PollOutcome::Failed("oom".into())
        );

        let empty = json!({"status": "completed"});
        assert!(interpret_prediction(&empty).is_err());
    }
}
