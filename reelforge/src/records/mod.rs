//! External record store contracts.
//!
//! The orchestrator only sees these traits; [`airtable::AirtableClient`] is the
//! production implementation.

pub mod airtable;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;
use crate::providers::{ApiProvider, ImageModel};

/// One external record queued for processing. `fields` passes through the
/// job queue untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    #[serde(default)]
    pub fields: Value,
}

/// A file attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl Attachment {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filename: None,
        }
    }
}

/// Field updates for one record.
pub type FieldUpdates = Map<String, Value>;

/// Run-level settings chosen by the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    pub api_provider: ApiProvider,
    pub image_model: ImageModel,
    pub num_images: u32,
    pub video_resolution: String,
    pub enable_nsfw: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            api_provider: ApiProvider::Fal,
            image_model: ImageModel::Seedream45,
            num_images: 4,
            video_resolution: "480p".to_string(),
            enable_nsfw: false,
        }
    }
}

/// Supplies the operator's run settings.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn load_settings(&self) -> Result<RunSettings>;
}

/// Supplies the items to process in a run.
#[async_trait]
pub trait WorkItemSource: Send + Sync {
    async fn load_work_items(&self) -> Result<Vec<WorkItem>>;
}

/// Accepts field updates for records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn update_record(&self, table: &str, id: &str, fields: FieldUpdates) -> Result<()>;
}

/// Build a [`FieldUpdates`] map from `"Field" => value` pairs.
#[macro_export]
macro_rules! fields {
    ($($name:expr => $value:expr),* $(,)?) => {{
        let mut map = $crate::records::FieldUpdates::new();
        $(map.insert(($name).to_string(), ::serde_json::json!($value));)*
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_macro() {
        let updates = crate::fields! {
            "Status" => "Error",
            "Output_Video" => [Attachment::from_url("https://v")],
        };
        assert_eq!(updates["Status"], "Error");
        assert_eq!(updates["Output_Video"][0]["url"], "https://v");
        assert!(updates["Output_Video"][0].get("filename").is_none());
    }

    #[test]
    fn test_work_item_roundtrips_fields_untouched() {
        let item: WorkItem = serde_json::from_str(
            r#"{"id":"rec1","fields":{"Link":"https://tiktok.com/x","Extra":[1,2]}}"#,
        )
        .unwrap();
        assert_eq!(item.fields["Extra"][1], 2);
        let text = serde_json::to_string(&item).unwrap();
        let back: WorkItem = serde_json::from_str(&text).unwrap();
        assert_eq!(back, item);
    }
}
