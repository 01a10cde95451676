//! Helpers for source links and reference images.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use strum::{Display, EnumString};
use url::Url;

use crate::{Error, Result};

/// Minimum pixel count Wavespeed Seedream accepts for an output size.
pub const MIN_OUTPUT_PIXELS: u64 = 2_073_600;

/// Platforms a source link can be scraped from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Platform {
    TikTok,
    Instagram,
}

/// Detect the platform of a link from its host.
pub fn detect_platform(link: &str) -> Option<Platform> {
    let url = Url::parse(link.trim()).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let matches = |domain: &str| host == domain || host.ends_with(&format!(".{domain}"));

    if matches("tiktok.com") {
        Some(Platform::TikTok)
    } else if matches("instagram.com") {
        Some(Platform::Instagram)
    } else {
        None
    }
}

/// Bucket a width/height pair into the aspect ratio labels image models accept.
pub fn aspect_ratio(width: u32, height: u32) -> &'static str {
    if width == 0 || height == 0 {
        return "1:1";
    }
    let ratio = f64::from(width) / f64::from(height);
    if ratio > 1.7 {
        "16:9"
    } else if ratio > 1.4 {
        "3:2"
    } else if ratio > 1.2 {
        "4:3"
    } else if ratio < 0.6 {
        "9:16"
    } else if ratio < 0.75 {
        "2:3"
    } else if ratio < 0.85 {
        "3:4"
    } else {
        "1:1"
    }
}

/// Scale up so the area reaches [`MIN_OUTPUT_PIXELS`], keeping the aspect
/// ratio and rounding each side up to a multiple of 8. Larger sizes are
/// returned unchanged.
pub fn scale_to_min_pixels(width: u32, height: u32) -> (u32, u32) {
    let pixels = u64::from(width) * u64::from(height);
    if pixels == 0 || pixels >= MIN_OUTPUT_PIXELS {
        return (width, height);
    }

    let scale = (MIN_OUTPUT_PIXELS as f64 / pixels as f64).sqrt();
    let round8 = |v: u32| ((f64::from(v) * scale).ceil() as u32).div_ceil(8) * 8;
    (round8(width), round8(height))
}

/// Download an image and inline it as a `data:` URI. `data:` inputs are
/// returned as-is.
pub async fn url_to_data_uri(client: &reqwest::Client, url: &str) -> Result<String> {
    if url.starts_with("data:") {
        return Ok(url.to_string());
    }

    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(Error::Other(format!(
            "Failed to fetch image: {}",
            response.status().as_u16()
        )));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("image/jpeg")
        .to_string();
    let bytes = response.bytes().await?;

    Ok(format!(
        "data:{};base64,{}",
        content_type,
        STANDARD.encode(&bytes)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_platform() {
        assert_eq!(
            detect_platform("https://www.tiktok.com/@user/video/123"),
            Some(Platform::TikTok)
        );
        assert_eq!(
            detect_platform("https://vm.tiktok.com/ZMabc/"),
            Some(Platform::TikTok)
        );
        assert_eq!(
            detect_platform("https://www.instagram.com/reel/abc/"),
            Some(Platform::Instagram)
        );
        assert_eq!(detect_platform("https://youtube.com/watch?v=1"), None);
        assert_eq!(detect_platform("https://nottiktok.com/x"), None);
        assert_eq!(detect_platform("not a url"), None);
    }

    #[test]
    fn test_aspect_ratio_buckets() {
        assert_eq!(aspect_ratio(720, 1280), "9:16");
        assert_eq!(aspect_ratio(1920, 1080), "16:9");
        assert_eq!(aspect_ratio(1000, 1000), "1:1");
        assert_eq!(aspect_ratio(1200, 1600), "3:4");
        assert_eq!(aspect_ratio(1024, 768), "4:3");
        assert_eq!(aspect_ratio(0, 10), "1:1");
    }

    #[test]
    fn test_scale_to_min_pixels() {
        let (w, h) = scale_to_min_pixels(720, 1280);
        assert_eq!(w % 8, 0);
        assert_eq!(h % 8, 0);
        assert!(u64::from(w) * u64::from(h) >= MIN_OUTPUT_PIXELS);
        assert_eq!((w, h), (1080, 1920));

        assert_eq!(scale_to_min_pixels(2048, 2048), (2048, 2048));
    }

    #[tokio::test]
    async fn test_data_uri_passthrough() {
        let client =
            crate::utils::http_client::build_http_client(std::time::Duration::from_secs(5), 1)
                .unwrap();
        let uri = "data:image/png;base64,AAAA";
        assert_eq!(url_to_data_uri(&client, uri).await.unwrap(), uri);
    }
}
