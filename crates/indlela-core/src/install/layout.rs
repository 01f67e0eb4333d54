//! On-disk cache layout.
//!
//! ```text
//! {cacheDir}/
//!   {modelId}/
//!     {version}/
//!       <artifact files>
//!       .ready            sentinel, written last
//!       .lock             cross-process lock file
//!     active              pointer to a version directory
//!   models.json           index of installed models
//! ```
//!
//! A version directory lacking `.ready` is invalid and garbage-collected
//! at startup, together with orphaned `*.tmp.*` files and `.stage/` trees.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;

pub const READY_SENTINEL: &str = ".ready";
pub const LOCK_FILE: &str = ".lock";
pub const STAGE_DIR: &str = ".stage";
pub const ACTIVE_POINTER: &str = "active";
pub const INDEX_FILE: &str = "models.json";

/// Path helper over the cache root.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        self.root.join(model_id)
    }

    pub fn version_dir(&self, model_id: &str, version: &str) -> PathBuf {
        self.model_dir(model_id).join(version)
    }

    pub fn sentinel(&self, model_id: &str, version: &str) -> PathBuf {
        self.version_dir(model_id, version).join(READY_SENTINEL)
    }

    pub fn lock_file(&self, model_id: &str, version: &str) -> PathBuf {
        self.version_dir(model_id, version).join(LOCK_FILE)
    }

    pub fn stage_dir(&self, model_id: &str, version: &str) -> PathBuf {
        self.version_dir(model_id, version).join(STAGE_DIR)
    }

    pub fn active_pointer(&self, model_id: &str) -> PathBuf {
        self.model_dir(model_id).join(ACTIVE_POINTER)
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// A version is installed iff its readiness sentinel exists.
    pub fn is_ready(&self, model_id: &str, version: &str) -> bool {
        self.sentinel(model_id, version).exists()
    }

    /// Version the `active` pointer names, if any.
    pub fn active_version(&self, model_id: &str) -> Option<String> {
        let raw = std::fs::read_to_string(self.active_pointer(model_id)).ok()?;
        let version = raw.trim().to_string();
        if version.is_empty() {
            None
        } else {
            Some(version)
        }
    }

    /// Point `active` at a version directory.
    pub fn set_active(&self, model_id: &str, version: &str) -> Result<()> {
        std::fs::write(self.active_pointer(model_id), version)?;
        Ok(())
    }

    /// Delete leftovers of interrupted installs and any version directory
    /// that never reached readiness. Called once at startup.
    pub fn recover(&self) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        for model_entry in std::fs::read_dir(&self.root)? {
            let model_entry = model_entry?;
            if !model_entry.file_type()?.is_dir() {
                continue;
            }
            for version_entry in std::fs::read_dir(model_entry.path())? {
                let version_entry = version_entry?;
                if !version_entry.file_type()?.is_dir() {
                    continue;
                }
                let version_dir = version_entry.path();
                clean_install_leftovers(&version_dir)?;
                if !version_dir.join(READY_SENTINEL).exists() {
                    warn!(dir = %version_dir.display(), "removing version without readiness sentinel");
                    std::fs::remove_dir_all(&version_dir)?;
                }
            }
        }
        Ok(())
    }

    /// Recursive size of a version directory.
    pub fn dir_size(path: &Path) -> Result<u64> {
        let mut size = 0;
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_file() {
                size += metadata.len();
            } else if metadata.is_dir() {
                size += Self::dir_size(&entry.path())?;
            }
        }
        Ok(size)
    }
}

/// Remove `*.tmp.*` files and the `.stage/` tree inside a version directory.
pub(crate) fn clean_install_leftovers(version_dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(version_dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == STAGE_DIR && path.is_dir() {
            debug!(dir = %path.display(), "removing orphaned stage directory");
            std::fs::remove_dir_all(&path)?;
        } else if name.contains(".tmp.") && path.is_file() {
            debug!(file = %path.display(), "removing orphaned temp file");
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}
