//! Locally persisted version identifier

use std::io::Write;
use std::path::{Path, PathBuf};

use super::{UpdateError, Version};

/// Plain-text file holding the installed version (`1.0.5`, no prefix)
#[derive(Debug, Clone)]
pub struct VersionStore {
    path: PathBuf,
}

impl VersionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored version; missing or malformed files yield `None`
    pub fn read(&self) -> Option<Version> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                tracing::debug!(path = %self.path.display(), "version file unreadable: {}", e);
                return None;
            }
        };

        let version = Version::parse(&content);
        if version.is_none() {
            tracing::warn!(
                path = %self.path.display(),
                "version file is malformed, treating installed version as unknown"
            );
        }
        version
    }

    /// Replace the stored version
    ///
    /// The new value is written to a temporary file in the same directory and
    /// renamed over the old one, so readers see either the old or the new
    /// value, never a truncated file.
    pub fn write(&self, version: Version) -> Result<(), UpdateError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .map_err(|e| UpdateError::from_io("create version directory", &e))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".VERSION")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|e| UpdateError::from_io("create temporary version file", &e))?;

        tmp.write_all(version.to_string().as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| UpdateError::from_io("write temporary version file", &e))?;

        tmp.persist(&self.path)
            .map_err(|e| UpdateError::from_io("replace version file", &e.error))?;

        tracing::info!(path = %self.path.display(), version = %version, "recorded installed version");
        Ok(())
    }
}
