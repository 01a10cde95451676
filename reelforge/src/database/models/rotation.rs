//! Credential rotation database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Rotation progress for one logical provider key.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct RotationStateDbModel {
    /// Provider key, e.g. `fal:image`
    pub provider: String,
    /// 0-based index into the provider's key list
    pub current_index: i64,
    /// Calls issued against the key at `current_index` since the last rotation
    pub current_count: i64,
    /// Unix epoch milliseconds of the last update
    pub updated_at: i64,
}

impl RotationStateDbModel {
    /// Fresh state for a provider that has not been used yet.
    pub fn initial(provider: impl Into<String>, now_ms: i64) -> Self {
        Self {
            provider: provider.into(),
            current_index: 0,
            current_count: 0,
            updated_at: now_ms,
        }
    }
}
