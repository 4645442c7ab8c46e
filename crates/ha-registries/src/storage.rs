//! Versioned JSON persistence in the `.storage/` directory
//!
//! Every persisted collection implements [`Storable`], which fixes its file
//! key and schema version. Files are wrapped in a version envelope:
//!
//! ```json
//! {
//!   "version": 1,
//!   "minor_version": 1,
//!   "key": "core.entity_registry",
//!   "data": { ... }
//! }
//! ```

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported version for {key}: expected {expected}, found {found}")]
    VersionMismatch {
        key: String,
        expected: u32,
        found: u32,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A collection that is persisted under a fixed storage key
pub trait Storable: Serialize + DeserializeOwned {
    /// File name inside `.storage/`
    const KEY: &'static str;
    /// Major version; a mismatch refuses to load
    const VERSION: u32;
    /// Minor version; older files load with a warning
    const MINOR_VERSION: u32;
}

/// On-disk envelope around the stored data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile<T> {
    pub version: u32,
    pub minor_version: u32,
    pub key: String,
    pub data: T,
}

/// Handle to a `.storage/` directory
#[derive(Debug, Clone)]
pub struct Storage {
    storage_dir: PathBuf,
}

impl Storage {
    /// Create a storage handle below the given config directory
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: config_dir.as_ref().join(".storage"),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.storage_dir.join(key)
    }

    /// Load a collection, `None` if it was never saved
    pub async fn load<T: Storable>(&self) -> StorageResult<Option<StorageFile<T>>> {
        let path = self.file_path(T::KEY);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(key = T::KEY, "Storage file not found");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let file: StorageFile<T> = serde_json::from_str(&content)?;
        if file.version != T::VERSION {
            return Err(StorageError::VersionMismatch {
                key: T::KEY.to_string(),
                expected: T::VERSION,
                found: file.version,
            });
        }
        if file.minor_version < T::MINOR_VERSION {
            warn!(
                "Storage {} has older minor version ({} < {})",
                T::KEY,
                file.minor_version,
                T::MINOR_VERSION
            );
        }

        debug!(key = T::KEY, "Loaded storage file (v{}.{})", file.version, file.minor_version);
        Ok(Some(file))
    }

    /// Save a collection
    ///
    /// Writes to a temp file first, then renames it over the old file.
    pub async fn save<T: Storable>(&self, data: &T) -> StorageResult<()> {
        fs::create_dir_all(&self.storage_dir).await?;

        let file = StorageFile {
            version: T::VERSION,
            minor_version: T::MINOR_VERSION,
            key: T::KEY.to_string(),
            data,
        };
        let content = serde_json::to_string_pretty(&file)?;

        let path = self.file_path(T::KEY);
        let temp_path = self.file_path(&format!("{}.tmp", T::KEY));
        fs::write(&temp_path, content).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(key = T::KEY, "Saved storage file");
        Ok(())
    }

    /// Delete a collection's file if present
    pub async fn remove<T: Storable>(&self) -> StorageResult<()> {
        match fs::remove_file(self.file_path(T::KEY)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Marker {
        name: String,
    }

    impl Storable for Marker {
        const KEY: &'static str = "test.marker";
        const VERSION: u32 = 1;
        const MINOR_VERSION: u32 = 2;
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());
        let marker = Marker {
            name: "kitchen".to_string(),
        };

        storage.save(&marker).await.unwrap();
        assert!(storage.storage_dir().join("test.marker").exists());
        assert!(!storage.storage_dir().join("test.marker.tmp").exists());

        let file = storage.load::<Marker>().await.unwrap().unwrap();
        assert_eq!(file.data, marker);
        assert_eq!(file.key, "test.marker");
        assert_eq!((file.version, file.minor_version), (1, 2));
    }

    #[tokio::test]
    async fn test_load_missing() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());
        assert!(storage.load::<Marker>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_major_version_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());
        std::fs::create_dir_all(storage.storage_dir()).unwrap();
        std::fs::write(
            storage.storage_dir().join("test.marker"),
            r#"{"version": 2, "minor_version": 1, "key": "test.marker", "data": {"name": "x"}}"#,
        )
        .unwrap();

        let result = storage.load::<Marker>().await;
        assert!(matches!(
            result,
            Err(StorageError::VersionMismatch { found: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());
        storage
            .save(&Marker {
                name: "x".to_string(),
            })
            .await
            .unwrap();

        storage.remove::<Marker>().await.unwrap();
        assert!(storage.load::<Marker>().await.unwrap().is_none());
        // Removing twice is fine
        storage.remove::<Marker>().await.unwrap();
    }
}
