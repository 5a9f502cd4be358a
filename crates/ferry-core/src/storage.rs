//! Key/value backing stores for persisted state
//!
//! History and configuration are persisted as JSON strings under fixed keys
//! ([`HISTORY_KEY`], [`CONFIG_KEY`]). Two stores are provided:
//!
//! - [`FileStorage`]: one `<key>.json` file per key inside a directory,
//!   written atomically (temp file + rename).
//! - [`MemoryStorage`]: process-local, used by tests and dry runs.

use dashmap::DashMap;
use std::borrow::Cow;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Key under which the history array is stored
pub const HISTORY_KEY: &str = "transfer-history";

/// Key under which the transfer configuration is stored
pub const CONFIG_KEY: &str = "transfer-config";

/// Backing store errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Key contains characters that cannot be mapped to a file name
    #[error("Invalid storage key: {0}")]
    InvalidKey(Cow<'static, str>),

    /// Underlying I/O failed
    #[error("I/O error for key '{key}': {source}")]
    Io {
        /// Key being accessed
        key: String,
        /// Source error
        #[source]
        source: io::Error,
    },
}

impl From<StorageError> for crate::error::OrchestratorError {
    fn from(err: StorageError) -> Self {
        crate::error::OrchestratorError::Storage(Cow::Owned(err.to_string()))
    }
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Synchronous string key/value store
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Read the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Replace the value stored under `key`
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete the value stored under `key`; missing keys are not an error
    fn remove(&self, key: &str) -> Result<()>;
}

fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(Cow::Owned(key.to_string())))
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, String>,
}

impl MemoryStorage {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.entries.remove(key);
        Ok(())
    }
}

/// Directory-backed store, one JSON file per key
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Use `dir` as the storage directory, creating it if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            key: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// Storage directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `key`
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        let path = self.path_for(key);
        let tmp = self.dir.join(format!(".{key}.json.tmp"));

        let io_err = |source| StorageError::Io {
            key: key.to_string(),
            source,
        };
        fs::write(&tmp, value).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;

        debug!("Persisted {} bytes to {}", value.len(), path.display());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}
