//! Provider credential handling.
//!
//! - [`KeyPool`]: the interchangeable API keys configured for one provider
//! - [`KeyRotationManager`]: durable round-robin selection over a pool
//! - [`RotatingKey`]: a pool bound to a rotation key, handed to provider clients

mod rotation;

pub use rotation::{KeyRotationManager, RotationStats};

use std::sync::Arc;

use crate::Result;

/// Ordered API keys for one provider and how many calls each key serves
/// before rotating. `requests_per_key == 0` disables rotation.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct KeyPool {
    pub keys: Vec<String>,
    pub requests_per_key: u32,
}

impl KeyPool {
    pub fn new(keys: Vec<String>, requests_per_key: u32) -> Self {
        Self {
            keys,
            requests_per_key,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

// Keys never end up in logs.
impl std::fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPool")
            .field("keys", &format_args!("<{} redacted>", self.keys.len()))
            .field("requests_per_key", &self.requests_per_key)
            .finish()
    }
}

/// A key pool bound to its rotation key, e.g. `fal:image`.
#[derive(Clone)]
pub struct RotatingKey {
    rotation: Arc<KeyRotationManager>,
    rotation_key: String,
    pool: KeyPool,
}

impl RotatingKey {
    pub fn new(
        rotation: Arc<KeyRotationManager>,
        rotation_key: impl Into<String>,
        pool: KeyPool,
    ) -> Self {
        Self {
            rotation,
            rotation_key: rotation_key.into(),
            pool,
        }
    }

    /// Key to use for the next outbound call.
    pub async fn next(&self) -> Result<String> {
        self.rotation
            .get_next_key(&self.rotation_key, &self.pool.keys, self.pool.requests_per_key)
            .await
    }

    pub fn rotation_key(&self) -> &str {
        &self.rotation_key
    }
}

impl std::fmt::Debug for RotatingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingKey")
            .field("rotation_key", &self.rotation_key)
            .field("pool", &self.pool)
            .finish()
    }
}
