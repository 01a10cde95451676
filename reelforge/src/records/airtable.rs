//! Airtable REST client.

use std::str::FromStr;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use super::{FieldUpdates, RecordSink, RunSettings, SettingsSource, WorkItem, WorkItemSource};
use crate::providers::{ApiProvider, ImageModel};
use crate::utils::http_client::preview;
use crate::{Error, Result};

const PROVIDER: &str = "Airtable";
const BASE_URL: &str = "https://api.airtable.com/v0";

pub const GENERATION_TABLE: &str = "Generation";
pub const CONFIGURATION_TABLE: &str = "Configuration";

/// Records with a source, a character, no output yet and not already claimed.
const GENERATION_FILTER: &str = r#"AND(OR({Link} != "", {Source_Video} != ""), {AI_Character} != "", {Output_Video} = "", {Status} != "Processing")"#;
/// Same filter for bases without a `Status` field.
const GENERATION_FILTER_NO_STATUS: &str =
    r#"AND(OR({Link} != "", {Source_Video} != ""), {AI_Character} != "", {Output_Video} = "")"#;

#[derive(Debug, Clone, Deserialize)]
pub struct AirtableRecord {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    records: Vec<AirtableRecord>,
    #[serde(default)]
    offset: Option<String>,
}

pub struct AirtableClient {
    client: reqwest::Client,
    token: String,
    base_id: String,
}

impl AirtableClient {
    pub fn new(client: reqwest::Client, token: impl Into<String>, base_id: impl Into<String>) -> Self {
        Self {
            client,
            token: token.into(),
            base_id: base_id.into(),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!(
            "{BASE_URL}/{}/{}",
            self.base_id,
            urlencoding::encode(table)
        )
    }

    /// All records of `table` matching `filter`, following pagination.
    pub async fn fetch_records(&self, table: &str, filter: &str) -> Result<Vec<AirtableRecord>> {
        let mut records = Vec::new();
        let mut offset: Option<String> = None;

        loop {
            let mut query: Vec<(&str, &str)> = Vec::new();
            if !filter.is_empty() {
                query.push(("filterByFormula", filter));
            }
            if let Some(offset) = offset.as_deref() {
                query.push(("offset", offset));
            }

            let response = self
                .client
                .get(self.table_url(table))
                .bearer_auth(&self.token)
                .query(&query)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::provider(
                    PROVIDER,
                    format!("{}: {}", status.as_u16(), preview(&body, 500)),
                ));
            }

            let page: ListResponse = response.json().await?;
            records.extend(page.records);
            match page.offset {
                Some(next) if !next.is_empty() => offset = Some(next),
                _ => break,
            }
        }

        debug!(table, count = records.len(), "Fetched records");
        Ok(records)
    }
}

#[async_trait]
impl RecordSink for AirtableClient {
    async fn update_record(&self, table: &str, id: &str, fields: FieldUpdates) -> Result<()> {
        debug!(
            table,
            record_id = id,
            fields = ?fields.keys().collect::<Vec<_>>(),
            "Updating record"
        );

        let response = self
            .client
            .patch(format!("{}/{}", self.table_url(table), id))
            .bearer_auth(&self.token)
            .json(&json!({ "fields": fields }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(
                table,
                record_id = id,
                status = status.as_u16(),
                error = preview(&body, 500),
                "Record update failed"
            );
            return Err(Error::provider(
                PROVIDER,
                format!("update {}: {}", status.as_u16(), preview(&body, 500)),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkItemSource for AirtableClient {
    async fn load_work_items(&self) -> Result<Vec<WorkItem>> {
        info!("Loading records");
        let records = match self.fetch_records(GENERATION_TABLE, GENERATION_FILTER).await {
            Ok(records) => records,
            Err(e) if is_missing_status_field(&e) => {
                warn!(error = %e, "Status field unavailable, loading without it");
                self.fetch_records(GENERATION_TABLE, GENERATION_FILTER_NO_STATUS)
                    .await?
            }
            Err(e) => return Err(e),
        };

        info!(count = records.len(), "Records loaded");
        Ok(records
            .into_iter()
            .map(|r| WorkItem {
                id: r.id,
                fields: Value::Object(r.fields),
            })
            .collect())
    }
}

#[async_trait]
impl SettingsSource for AirtableClient {
    async fn load_settings(&self) -> Result<RunSettings> {
        info!("Loading configuration");
        let records = self.fetch_records(CONFIGURATION_TABLE, "").await?;
        let first = records.into_iter().next().ok_or_else(|| {
            Error::config(format!("No configuration found in {CONFIGURATION_TABLE} table"))
        })?;
        settings_from_fields(&first.fields)
    }
}

fn is_missing_status_field(err: &Error) -> bool {
    let text = err.to_string();
    text.contains("Unknown field names") || text.contains("Status") || text.contains("status")
}

/// Read run settings from a configuration record, applying defaults for
/// blank fields.
pub fn settings_from_fields(fields: &Map<String, Value>) -> Result<RunSettings> {
    let defaults = RunSettings::default();
    let text = |name: &str| {
        fields
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };

    let api_provider = match text("API_Provider") {
        Some(label) => ApiProvider::from_str(label).unwrap_or_else(|_| {
            warn!(api_provider = label, "Unknown API_Provider, using Wavespeed");
            ApiProvider::Wavespeed
        }),
        None => defaults.api_provider,
    };

    let num_images = match fields.get("num_images") {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|n| *n > 0)
    .unwrap_or(defaults.num_images);

    Ok(RunSettings {
        api_provider,
        image_model: text("Image_Model")
            .map(ImageModel::from_label)
            .unwrap_or(defaults.image_model),
        num_images,
        video_resolution: text("Video_Resolution")
            .map(str::to_string)
            .unwrap_or(defaults.video_resolution),
        enable_nsfw: fields
            .get("Enable_NSFW")
            .and_then(Value::as_bool)
            .unwrap_or(defaults.enable_nsfw),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_settings_defaults() {
        let settings = settings_from_fields(&Map::new()).unwrap();
        assert_eq!(settings, RunSettings::default());
        assert_eq!(settings.api_provider, ApiProvider::Fal);
        assert_eq!(settings.image_model, ImageModel::Seedream45);
        assert_eq!(settings.num_images, 4);
        assert_eq!(settings.video_resolution, "480p");
        assert!(!settings.enable_nsfw);
    }

    #[test]
    fn test_settings_from_record() {
        let settings = settings_from_fields(&fields(json!({
            "API_Provider": "Wavespeed",
            "Image_Model": "Nanobanana Pro",
            "num_images": 2,
            "Video_Resolution": "720p",
            "Enable_NSFW": true
        })))
        .unwrap();
        assert_eq!(settings.api_provider, ApiProvider::Wavespeed);
        assert_eq!(settings.image_model, ImageModel::NanobananaPro);
        assert_eq!(settings.num_images, 2);
        assert_eq!(settings.video_resolution, "720p");
        assert!(settings.enable_nsfw);
    }

    #[test]
    fn test_unknown_provider_falls_back_to_wavespeed() {
        let settings =
            settings_from_fields(&fields(json!({"API_Provider": "Replicate"}))).unwrap();
        assert_eq!(settings.api_provider, ApiProvider::Wavespeed);
    }

    #[test]
    fn test_oversized_num_images_uses_default() {
        let settings =
            settings_from_fields(&fields(json!({"num_images": 4_294_967_298u64}))).unwrap();
        assert_eq!(settings.num_images, 4);
    }

    #[test]
    fn test_missing_status_detection() {
        let err = Error::provider(PROVIDER, r#"422: {"error":{"type":"INVALID_FILTER_BY_FORMULA","message":"Unknown field names: status"}}"#);
        assert!(is_missing_status_field(&err));
        let err = Error::provider(PROVIDER, "401: unauthorized");
        assert!(!is_missing_status_field(&err));
    }

    #[test]
    fn test_table_url_encodes_name() {
        let client = AirtableClient::new(
            crate::utils::http_client::build_http_client(std::time::Duration::from_secs(5), 1)
                .unwrap(),
            "token",
            "app123",
        );
        assert_eq!(
            client.table_url("My Table"),
            "https://api.airtable.com/v0/app123/My%20Table"
        );
    }
}
