//! Storage abstraction for JSON persistence
//!
//! Every stored document lives in `<config_dir>/.storage/<key>` wrapped in a
//! version envelope:
//!
//! ```json
//! {
//!   "version": 1,
//!   "minor_version": 1,
//!   "key": "core.config_entries",
//!   "data": { ... }
//! }
//! ```
//!
//! Writes go to `<key>.tmp` first and are renamed into place.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Migration required for {key}: from {from} to {to}")]
    MigrationRequired { key: String, from: u32, to: u32 },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Version envelope around stored data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile<T> {
    pub version: u32,
    pub minor_version: u32,
    pub key: String,
    pub data: T,
}

/// Types persisted under a fixed key and version
pub trait Storable: Serialize + DeserializeOwned {
    const KEY: &'static str;
    const VERSION: u32;
    const MINOR_VERSION: u32;

    /// Upgrade data written by an older major version
    ///
    /// The default refuses, which surfaces as [`StorageError::MigrationRequired`].
    fn migrate(_data: serde_json::Value, from_version: u32) -> StorageResult<Self> {
        Err(StorageError::MigrationRequired {
            key: Self::KEY.to_string(),
            from: from_version,
            to: Self::VERSION,
        })
    }
}

/// Handle on the `.storage/` directory
#[derive(Debug, Clone)]
pub struct Storage {
    storage_dir: PathBuf,
}

impl Storage {
    /// Create a storage handle under the given config directory
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: config_dir.as_ref().join(".storage"),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn file_path(&self, key: &str) -> PathBuf {
        self.storage_dir.join(key)
    }

    pub async fn exists(&self, key: &str) -> bool {
        fs::try_exists(self.file_path(key)).await.unwrap_or(false)
    }

    /// Load a [`Storable`], migrating older major versions
    ///
    /// Returns `None` when nothing has been stored yet.
    pub async fn load<T: Storable>(&self) -> StorageResult<Option<T>> {
        let path = self.file_path(T::KEY);
        if !self.exists(T::KEY).await {
            debug!("Storage file not found: {}", T::KEY);
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        let envelope: StorageFile<serde_json::Value> = serde_json::from_str(&content)?;

        if envelope.version != T::VERSION {
            debug!(
                "Migrating {} from v{} to v{}",
                T::KEY,
                envelope.version,
                T::VERSION
            );
            return T::migrate(envelope.data, envelope.version).map(Some);
        }

        if envelope.minor_version < T::MINOR_VERSION {
            warn!(
                "Storage {} has older minor version ({} < {})",
                T::KEY,
                envelope.minor_version,
                T::MINOR_VERSION
            );
        }

        let data = serde_json::from_value(envelope.data)?;
        debug!(
            "Loaded storage file: {} (v{}.{})",
            T::KEY,
            envelope.version,
            envelope.minor_version
        );
        Ok(Some(data))
    }

    /// Save a [`Storable`] atomically
    pub async fn save<T: Storable>(&self, data: &T) -> StorageResult<()> {
        fs::create_dir_all(&self.storage_dir).await?;

        let envelope = StorageFile {
            version: T::VERSION,
            minor_version: T::MINOR_VERSION,
            key: T::KEY.to_string(),
            data,
        };
        let content = serde_json::to_string_pretty(&envelope)?;

        let path = self.file_path(T::KEY);
        let temp_path = self.file_path(&format!("{}.tmp", T::KEY));
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(
            "Saved storage file: {} (v{}.{})",
            T::KEY,
            T::VERSION,
            T::MINOR_VERSION
        );
        Ok(())
    }
}
