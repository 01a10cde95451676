//! Credential rotation state repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::RotationStateDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;

/// Rotation state repository trait.
#[async_trait]
pub trait RotationRepository: Send + Sync {
    async fn get_state(&self, provider: &str) -> Result<Option<RotationStateDbModel>>;
    async fn save_state(&self, state: &RotationStateDbModel) -> Result<()>;
    async fn list_states(&self) -> Result<Vec<RotationStateDbModel>>;
    /// Rewind a provider to its first key. Returns whether a row existed.
    async fn reset_state(&self, provider: &str) -> Result<bool>;
    async fn delete_all(&self) -> Result<u64>;
}

/// SQLx implementation of RotationRepository.
pub struct SqlxRotationRepository {
    pool: SqlitePool,
}

impl SqlxRotationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RotationRepository for SqlxRotationRepository {
    async fn get_state(&self, provider: &str) -> Result<Option<RotationStateDbModel>> {
        let state = sqlx::query_as::<_, RotationStateDbModel>(
            "SELECT * FROM api_rotation WHERE provider = ?",
        )
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }

    async fn save_state(&self, state: &RotationStateDbModel) -> Result<()> {
        retry_on_sqlite_busy("save_rotation_state", || async {
            sqlx::query(
                r#"
                INSERT INTO api_rotation (provider, current_index, current_count, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(provider) DO UPDATE SET
                    current_index = excluded.current_index,
                    current_count = excluded.current_count,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&state.provider)
            .bind(state.current_index)
            .bind(state.current_count)
            .bind(state.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn list_states(&self) -> Result<Vec<RotationStateDbModel>> {
        let states = sqlx::query_as::<_, RotationStateDbModel>(
            "SELECT * FROM api_rotation ORDER BY provider",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(states)
    }

    async fn reset_state(&self, provider: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE api_rotation SET current_index = 0, current_count = 0, updated_at = ? WHERE provider = ?",
        )
        .bind(now_ms())
        .bind(provider)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM api_rotation")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
