use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

use crate::error::BoothError;

#[derive(Clone)]
pub struct LocalStorage {
    pool: SqlitePool,
}

impl LocalStorage {
    pub async fn init(database_url: &str) -> Result<Self, BoothError> {
        // every pooled connection to :memory: would open its own database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS local_storage (\
                key TEXT PRIMARY KEY,\
                value TEXT NOT NULL,\
                updated_at TEXT NOT NULL\
            );",
        )
        .execute(&pool)
        .await?;

        info!("Local storage ready at {}", database_url);
        Ok(LocalStorage { pool })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, BoothError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM local_storage WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), BoothError> {
        sqlx::query(
            "INSERT INTO local_storage (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update<T, F>(&self, key: &str, apply: F) -> Result<T, BoothError>
    where
        F: FnOnce(Option<String>) -> Result<(Option<String>, T), BoothError>,
    {
        let mut tx = self.pool.begin().await?;
        let current =
            sqlx::query_scalar::<_, String>("SELECT value FROM local_storage WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

        let (next, output) = apply(current)?;
        if let Some(next) = next {
            sqlx::query(
                "INSERT INTO local_storage (key, value, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )
            .bind(key)
            .bind(next)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(output)
    }

    pub async fn health_check(&self) -> Result<(), BoothError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_overwrites() {
        let storage = LocalStorage::init("sqlite::memory:").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), None);
        storage.set("k", "one").await.unwrap();
        storage.set("k", "two").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap().as_deref(), Some("two"));
        storage.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn failed_update_leaves_value_untouched() {
        let storage = LocalStorage::init("sqlite::memory:").await.unwrap();
        storage.set("k", "kept").await.unwrap();
        let result: Result<(), _> = storage
            .update("k", |_| Err(BoothError::Storage("boom".to_string())))
            .await;
        assert!(result.is_err());
        assert_eq!(storage.get("k").await.unwrap().as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn update_sees_current_value() {
        let storage = LocalStorage::init("sqlite::memory:").await.unwrap();
        storage.set("n", "1").await.unwrap();
        let previous = storage
            .update("n", |current| Ok((Some("2".to_string()), current)))
            .await
            .unwrap();
        assert_eq!(previous.as_deref(), Some("1"));
        assert_eq!(storage.get("n").await.unwrap().as_deref(), Some("2"));
    }
}
