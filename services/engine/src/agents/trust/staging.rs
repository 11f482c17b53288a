//! Certificate staging
//!
//! Certificates are written to a local temporary file before being copied
//! into a target. The guard removes the file when it goes out of scope, even
//! when the copy fails or the worker panics.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use super::error::{Result, TrustError};

/// RAII guard for a staged certificate file.
///
/// # Example
///
/// ```rust
/// use stepca_trust_engine::agents::trust::staging::StagedFile;
///
/// let staged = StagedFile::in_temp_dir("root", "-----BEGIN CERTIFICATE-----\n...").unwrap();
/// let path = staged.path().to_path_buf();
/// assert!(path.exists());
/// drop(staged);
/// assert!(!path.exists());
/// ```
pub struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    /// Write `content` to a uniquely named file in `dir`.
    pub fn new(dir: &Path, stem: &str, content: &str) -> Result<Self> {
        let path = dir.join(format!("stepca-{}-{}.crt", stem, Uuid::new_v4()));
        fs::write(&path, content).map_err(|e| {
            TrustError::Command(format!("failed to stage certificate at {}: {}", path.display(), e))
        })?;

        debug!(path = ?path, "Staged certificate");
        Ok(Self { path })
    }

    /// Stage in the system temporary directory.
    pub fn in_temp_dir(stem: &str, content: &str) -> Result<Self> {
        Self::new(&std::env::temp_dir(), stem, content)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.path.exists() {
            match fs::remove_file(&self.path) {
                Ok(_) => debug!(path = ?self.path, "Removed staged certificate"),
                Err(e) => warn!(
                    path = ?self.path,
                    error = %e,
                    "Failed to remove staged certificate"
                ),
            }
        }
    }
}
