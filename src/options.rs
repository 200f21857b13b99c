//! Persisted configuration bag (`options` table).

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use crate::settings::OPTION_KEYS;

pub struct OptionsStore {
    pool: SqlitePool,
}

impl OptionsStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn load_all(&self) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query("SELECT option_key, value FROM options ORDER BY option_key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("option_key"), row.get("value")))
            .collect())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT value FROM options WHERE option_key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Set a recognized option.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        if !OPTION_KEYS.contains(&key) {
            bail!(
                "Unknown option '{}'. Known options: {}",
                key,
                OPTION_KEYS.join(", ")
            );
        }
        sqlx::query(
            r#"
            INSERT INTO options (option_key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(option_key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove an option. Returns `true` if it was set.
    pub async fn unset(&self, key: &str) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM options WHERE option_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn options() -> OptionsStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:").unwrap())
            .await
            .unwrap();
        crate::migrate::migrate_pool(&pool).await.unwrap();
        OptionsStore::new(pool)
    }

    #[tokio::test]
    async fn set_get_unset() {
        let opts = options().await;
        opts.set("llm_provider", "openai").await.unwrap();
        opts.set("llm_provider", "anthropic").await.unwrap();
        assert_eq!(opts.get("llm_provider").await.unwrap().as_deref(), Some("anthropic"));
        assert_eq!(opts.load_all().await.unwrap().len(), 1);

        assert!(opts.unset("llm_provider").await.unwrap());
        assert!(!opts.unset("llm_provider").await.unwrap());
        assert!(opts.get("llm_provider").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_keys_are_rejected() {
        let opts = options().await;
        assert!(opts.set("llm_temperature", "0.2").await.is_err());
    }
}
