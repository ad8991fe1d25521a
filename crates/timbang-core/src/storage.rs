//! Persistent storage for license bindings.
//!
//! A binding remembers which scale a license was last connected to so that
//! [`crate::ScaleSession::auto_connect`] can reconnect without scanning.
//! Two backends are provided:
//!
//! - [`MemoryBindingStore`] keeps bindings for the lifetime of the process
//! - [`JsonFileBindingStore`] mirrors them into a single JSON document

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::debug;

use crate::types::{LicenseBinding, LicenseKey};

/// File name of the bindings document inside the data directory.
pub const BINDINGS_FILE_NAME: &str = "bindings.json";

/// Errors that can occur in a binding store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to read the bindings file.
    #[error("Failed to read bindings from {}: {source}", path.display())]
    ReadError {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write the bindings file.
    #[error("Failed to write bindings to {}: {source}", path.display())]
    WriteError {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to create the data directory.
    #[error("Failed to create directory {}: {source}", path.display())]
    CreateDirError {
        /// Directory path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The bindings file is not valid JSON.
    #[error("Failed to parse bindings in {}: {source}", path.display())]
    ParseError {
        /// File path.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Bindings could not be serialised.
    #[error("Failed to serialize bindings: {0}")]
    SerializeError(#[from] serde_json::Error),

    /// No platform data directory could be determined.
    #[error("Cannot determine data directory")]
    NoDataDir,
}

/// Result type for binding store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Associative store of [`LicenseBinding`]s keyed by license.
///
/// `put` overwrites. There is no per-key delete.
pub trait BindingStore: Send + Sync {
    /// Look up the binding for a license.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn get(&self, license_key: &LicenseKey) -> StoreResult<Option<LicenseBinding>>;

    /// Insert or overwrite the binding for `binding.license_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    fn put(&self, binding: LicenseBinding) -> StoreResult<()>;

    /// Remove every binding.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    fn clear(&self) -> StoreResult<()>;

    /// Number of stored bindings.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn len(&self) -> StoreResult<usize>;

    /// Returns `true` if no bindings are stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

type BindingMap = BTreeMap<LicenseKey, LicenseBinding>;

fn lock(map: &Mutex<BindingMap>) -> MutexGuard<'_, BindingMap> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process binding store.
#[derive(Debug, Default)]
pub struct MemoryBindingStore {
    bindings: Mutex<BindingMap>,
}

impl MemoryBindingStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BindingStore for MemoryBindingStore {
    fn get(&self, license_key: &LicenseKey) -> StoreResult<Option<LicenseBinding>> {
        Ok(lock(&self.bindings).get(license_key).cloned())
    }

    fn put(&self, binding: LicenseBinding) -> StoreResult<()> {
        lock(&self.bindings).insert(binding.license_key.clone(), binding);
        Ok(())
    }

    fn clear(&self) -> StoreResult<()> {
        lock(&self.bindings).clear();
        Ok(())
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(lock(&self.bindings).len())
    }
}

/// Binding store backed by a JSON file.
///
/// The file is read once on open and rewritten in full on every mutation.
#[derive(Debug)]
pub struct JsonFileBindingStore {
    path: PathBuf,
    bindings: Mutex<BindingMap>,
}

impl JsonFileBindingStore {
    /// Open the store at `path`, loading existing bindings if the file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let bindings = if path.exists() {
            let content =
                std::fs::read_to_string(&path).map_err(|source| StoreError::ReadError {
                    path: path.clone(),
                    source,
                })?;
            serde_json::from_str(&content).map_err(|source| StoreError::ParseError {
                path: path.clone(),
                source,
            })?
        } else {
            BindingMap::new()
        };
        debug!(path = %path.display(), count = bindings.len(), "Opened binding store");

        Ok(Self {
            path,
            bindings: Mutex::new(bindings),
        })
    }

    /// Open the store at the platform default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be determined or the
    /// existing file is unreadable.
    pub fn open_default() -> StoreResult<Self> {
        Self::open(default_bindings_path().ok_or(StoreError::NoDataDir)?)
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, bindings: &BindingMap) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDirError {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let content = serde_json::to_string_pretty(bindings)?;
        std::fs::write(&self.path, content).map_err(|source| StoreError::WriteError {
            path: self.path.clone(),
            source,
        })
    }
}

impl BindingStore for JsonFileBindingStore {
    fn get(&self, license_key: &LicenseKey) -> StoreResult<Option<LicenseBinding>> {
        Ok(lock(&self.bindings).get(license_key).cloned())
    }

    fn put(&self, binding: LicenseBinding) -> StoreResult<()> {
        let mut bindings = lock(&self.bindings);
        let previous = bindings.insert(binding.license_key.clone(), binding.clone());
        if let Err(e) = self.persist(&bindings) {
            // Keep memory and disk in agreement.
            match previous {
                Some(previous) => bindings.insert(binding.license_key, previous),
                None => bindings.remove(&binding.license_key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn clear(&self) -> StoreResult<()> {
        let mut bindings = lock(&self.bindings);
        bindings.clear();
        self.persist(&bindings)
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(lock(&self.bindings).len())
    }
}

/// Get the default data directory.
///
/// Returns `~/.local/share/timbang` on Linux (platform equivalents elsewhere).
#[must_use]
pub fn default_data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "timbang").map(|dirs| dirs.data_dir().to_path_buf())
}

/// Get the default path of the bindings file.
#[must_use]
pub fn default_bindings_path() -> Option<PathBuf> {
    default_data_dir().map(|dir| dir.join(BINDINGS_FILE_NAME))
}
