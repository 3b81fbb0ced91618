use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::PgPoolOptions;
use tbac_contracts::{LAST_UPDATED_KEY, SETTINGS_KEY};

use crate::store::{SettingsStore, StoreError, StoredSettings};

/// Settings store backed by a Postgres table shared by every node.
#[derive(Clone)]
pub struct PgSettingsStore {
    pool: sqlx::PgPool,
    timeout: Duration,
}

impl PgSettingsStore {
    pub async fn connect(db_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(Self { pool, timeout })
    }

    pub async fn connect_and_migrate(db_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let store = Self::connect(db_url, timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: sqlx::PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        tokio::time::timeout(self.timeout, sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for PgSettingsStore {
    async fn read(&self) -> Result<StoredSettings, StoreError> {
        let rows = tokio::time::timeout(
            self.timeout,
            sqlx::query(
                "SELECT setting_key, setting_value FROM tbac_plugin_settings WHERE setting_key IN ($1, $2)",
            )
            .bind(SETTINGS_KEY)
            .bind(LAST_UPDATED_KEY)
            .fetch_all(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        let mut stored = StoredSettings::default();
        for row in rows {
            let key: String = row.try_get("setting_key")?;
            let value: String = row.try_get("setting_value")?;
            match key.as_str() {
                SETTINGS_KEY => stored.payload = Some(value),
                LAST_UPDATED_KEY => stored.version = value.trim().parse::<i64>().ok(),
                _ => {}
            }
        }

        Ok(stored)
    }

    async fn write(&self, payload: &str, version: i64) -> Result<bool, StoreError> {
        let version = version.to_string();

        tokio::time::timeout(self.timeout, async {
            let mut tx = self.pool.begin().await?;

            for (key, value) in [(SETTINGS_KEY, payload), (LAST_UPDATED_KEY, version.as_str())] {
                sqlx::query(
                    "INSERT INTO tbac_plugin_settings (setting_key, setting_value, updated_at) VALUES ($1, $2, now()) ON CONFLICT (setting_key) DO UPDATE SET setting_value = EXCLUDED.setting_value, updated_at = now()",
                )
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok::<(), sqlx::Error>(())
        })
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(true)
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
