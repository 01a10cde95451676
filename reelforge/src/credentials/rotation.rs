//! Durable round-robin API key rotation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::database::models::RotationStateDbModel;
use crate::database::repositories::RotationRepository;
use crate::database::time::{ms_to_datetime, now_ms};
use crate::{Error, Result};

/// Rotation progress for one provider, with a 1-indexed key number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationStats {
    pub provider: String,
    pub current_key: u64,
    pub request_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl From<RotationStateDbModel> for RotationStats {
    fn from(state: RotationStateDbModel) -> Self {
        Self {
            provider: state.provider,
            current_key: state.current_index.max(0) as u64 + 1,
            request_count: state.current_count.max(0) as u64,
            updated_at: ms_to_datetime(state.updated_at),
        }
    }
}

/// Hands out one of several equivalent keys per provider, moving to the next
/// key after `requests_per_key` calls. Progress is persisted so it survives
/// restarts.
pub struct KeyRotationManager {
    repository: Arc<dyn RotationRepository>,
    /// Serializes read-modify-write of one provider's state.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyRotationManager {
    pub fn new(repository: Arc<dyn RotationRepository>) -> Self {
        Self {
            repository,
            locks: DashMap::new(),
        }
    }

    fn provider_lock(&self, provider: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Key to use for the next call against `provider`.
    ///
    /// A single key is returned directly without touching stored state.
    pub async fn get_next_key(
        &self,
        provider: &str,
        keys: &[String],
        requests_per_key: u32,
    ) -> Result<String> {
        match keys {
            [] => return Err(Error::NoCredentials(provider.to_string())),
            [only] => return Ok(only.clone()),
            _ => {}
        }

        let lock = self.provider_lock(provider);
        let _guard = lock.lock().await;

        let now = now_ms();
        let mut state = self
            .repository
            .get_state(provider)
            .await?
            .unwrap_or_else(|| RotationStateDbModel::initial(provider, now));

        let len = keys.len() as i64;
        // The key list may have shrunk since the state was written.
        let index = state.current_index.rem_euclid(len);
        let key = keys[index as usize].clone();

        let mut count = state.current_count.max(0) + 1;
        let mut next_index = index;
        if requests_per_key > 0 && count >= i64::from(requests_per_key) {
            next_index = (index + 1) % len;
            count = 0;
            debug!(
                provider = %provider,
                key_number = next_index + 1,
                total_keys = len,
                "Rotating API key"
            );
        }

        state.current_index = next_index;
        state.current_count = count;
        state.updated_at = now;
        self.repository.save_state(&state).await?;

        Ok(key)
    }

    /// Rotation progress of every provider that has used more than one key.
    pub async fn stats(&self) -> Result<Vec<RotationStats>> {
        let states = self.repository.list_states().await?;
        Ok(states.into_iter().map(RotationStats::from).collect())
    }

    /// Rewind one provider to its first key.
    pub async fn reset(&self, provider: &str) -> Result<bool> {
        let lock = self.provider_lock(provider);
        let _guard = lock.lock().await;
        let existed = self.repository.reset_state(provider).await?;
        if existed {
            info!(provider = %provider, "Reset key rotation");
        }
        Ok(existed)
    }

    /// Forget rotation progress for every provider.
    pub async fn reset_all(&self) -> Result<u64> {
        let deleted = self.repository.delete_all().await?;
        info!(providers = deleted, "Reset all key rotation state");
        Ok(deleted)
    }
}
