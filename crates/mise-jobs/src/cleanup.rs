//! Removal of per-import working directories.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use mise_core::{defaults, Error, ImportCleanup, Result};

/// Deletes `<root>/<import_id>` once an import is finished.
#[derive(Debug, Clone)]
pub struct DirectoryCleanup {
    root: PathBuf,
}

impl DirectoryCleanup {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory from `IMPORT_WORK_DIR` (default `./uploads/imports`).
    pub fn from_env() -> Self {
        let root = std::env::var("IMPORT_WORK_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| defaults::IMPORT_WORK_DIR.to_string());
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for an import. Ids that could escape the root are rejected.
    pub fn import_dir(&self, import_id: &str) -> Result<PathBuf> {
        let trimmed = import_id.trim();
        if trimmed.is_empty()
            || trimmed == "."
            || trimmed.contains("..")
            || trimmed.contains('/')
            || trimmed.contains('\\')
        {
            return Err(Error::Validation(format!("invalid import id: {import_id:?}")));
        }
        Ok(self.root.join(trimmed))
    }
}

#[async_trait]
impl ImportCleanup for DirectoryCleanup {
    async fn cleanup_import_directory(&self, import_id: &str) -> Result<bool> {
        let dir = self.import_dir(import_id)?;
        if !tokio::fs::try_exists(&dir).await? {
            debug!(path = %dir.display(), "Import directory already gone");
            return Ok(false);
        }
        tokio::fs::remove_dir_all(&dir).await?;
        debug!(path = %dir.display(), "Removed import directory");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_removes_existing_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("import-1");
        std::fs::create_dir_all(dir.join("images")).unwrap();
        std::fs::write(dir.join("images/a.jpg"), b"jpeg").unwrap();

        let cleanup = DirectoryCleanup::new(root.path());
        assert!(cleanup.cleanup_import_directory("import-1").await.unwrap());
        assert!(!dir.exists());
        assert!(root.path().exists());
    }

    #[tokio::test]
    async fn test_missing_directory_is_not_an_error() {
        let root = tempfile::tempdir().unwrap();
        let cleanup = DirectoryCleanup::new(root.path());
        assert!(!cleanup.cleanup_import_directory("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_escaping_ids() {
        let root = tempfile::tempdir().unwrap();
        let cleanup = DirectoryCleanup::new(root.path());
        for id in ["", "..", "../etc", "a/b", "a\\b", "."] {
            let err = cleanup.cleanup_import_directory(id).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "accepted {id:?}");
        }
        assert!(root.path().exists());
    }
}
