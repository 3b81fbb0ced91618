use std::sync::Mutex;

use async_trait::async_trait;

/// The two entries of the shared settings store, read together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredSettings {
    pub version: Option<i64>,
    pub payload: Option<String>,
}

#[derive(Debug)]
pub enum StoreError {
    Timeout,
    Sqlx(sqlx::Error),
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout => write!(f, "settings store operation timed out"),
            StoreError::Sqlx(err) => write!(f, "settings store sql error: {}", err),
            StoreError::Unavailable(reason) => {
                write!(f, "settings store unavailable: {}", reason)
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Sqlx(value)
    }
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn read(&self) -> Result<StoredSettings, StoreError>;

    /// Writes payload and version as one unit. `Ok(false)` means the store
    /// answered but did not acknowledge the write.
    async fn write(&self, payload: &str, version: i64) -> Result<bool, StoreError>;
}

/// Single-node store; useful for tests and for running without a database.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    inner: Mutex<StoredSettings>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites both entries verbatim, bypassing the write path.
    pub fn replace(&self, stored: StoredSettings) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *inner = stored;
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn read(&self) -> Result<StoredSettings, StoreError> {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(inner.clone())
    }

    async fn write(&self, payload: &str, version: i64) -> Result<bool, StoreError> {
        self.replace(StoredSettings {
            version: Some(version),
            payload: Some(payload.to_string()),
        });
        Ok(true)
    }
}
