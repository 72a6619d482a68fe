use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};

pub mod filesystem;

pub use filesystem::FilesystemStorage;

/// Error type for scratch storage operations
#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    Path(String),
    Config(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "IO error: {}", e),
            StorageError::Path(e) => write!(f, "Path error: {}", e),
            StorageError::Config(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Scratch space for retrieved instances and manifests
///
/// Directories handed out here outlive the retrieve that created them: the
/// local-import collaborator owns them once the files are delivered.
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    fn base_path(&self) -> &Path;

    fn subpath_str(&self, path: &str) -> PathBuf {
        self.base_path().join(path)
    }

    /// Ensure a directory exists under the storage root
    fn ensure_dir_str(&self, path: &str) -> StorageResult<PathBuf> {
        let full_path = self.subpath_str(path);
        std::fs::create_dir_all(&full_path)?;
        Ok(full_path)
    }

    /// Fresh, uniquely named directory for one retrieve (`{prefix}{uuid}`)
    fn task_dir(&self, prefix: &str) -> StorageResult<PathBuf> {
        let name = format!("{}{}", prefix, uuid::Uuid::new_v4().simple());
        self.ensure_dir_str(&name)
    }

    /// Per-series folder inside a task directory
    fn series_dir(&self, task_dir: &Path, series_uid: &str) -> StorageResult<PathBuf> {
        if series_uid.is_empty() || series_uid.contains(['/', '\\']) || series_uid.contains("..") {
            return Err(StorageError::Path(format!(
                "invalid series folder name '{}'",
                series_uid
            )));
        }
        let dir = task_dir.join(series_uid);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Persist a manifest as `wado_*.xml` under the `manifests` folder
    fn write_manifest(&self, xml: &str) -> StorageResult<PathBuf> {
        let parent = self.ensure_dir_str("manifests")?;
        let mut file = tempfile::Builder::new()
            .prefix("wado_")
            .suffix(".xml")
            .tempfile_in(&parent)?;
        file.write_all(xml.as_bytes())?;
        file.flush()?;
        let (_, path) = file.keep().map_err(|e| StorageError::Io(e.error))?;
        Ok(path)
    }

    /// Write bytes to a file at the given path relative to the root
    async fn write_file_str(&self, path: &str, contents: &[u8]) -> StorageResult<PathBuf> {
        let full_path = self.subpath_str(path);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full_path, contents).await?;
        Ok(full_path)
    }

    /// Remove a file or directory; absent paths are fine
    async fn remove(&self, path: &Path) -> StorageResult<()> {
        if !path.exists() {
            return Ok(());
        }
        if !path.starts_with(self.base_path()) {
            return Err(StorageError::Path(format!(
                "{} is outside the storage root",
                path.display()
            )));
        }
        if path.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }
}
