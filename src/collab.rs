//! Collaborators outside the retrieval pipeline: what receives the retrieved
//! files and who hears about progress and errors.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

use crate::scheduler::Progress;

/// Imports DICOM files from a local folder into the viewer model
#[async_trait]
pub trait LocalImport: Send + Sync {
    async fn import(&self, folders: Vec<PathBuf>);
}

/// Loads manifests describing remote instances
#[async_trait]
pub trait RemoteManifestLoader: Send + Sync {
    async fn load(&self, xml_paths: Vec<PathBuf>);
}

/// Receives retrieve feedback. Every method has a no-op default.
pub trait RetrieveListener: Send + Sync {
    fn on_progress(&self, _progress: Progress) {}

    fn on_cancel_requested(&self) {}

    /// One call per failed retrieve; `title` is the transport name
    fn on_error(&self, _message: &str, _title: &str) {}
}

/// Regular files below a folder, sorted
pub fn collect_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// Import that only reports what it was given
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingImport;

#[async_trait]
impl LocalImport for LoggingImport {
    async fn import(&self, folders: Vec<PathBuf>) {
        for folder in folders {
            let files = collect_files(&folder);
            tracing::info!("{} files ready for import in {}", files.len(), folder.display());
            for file in files {
                tracing::debug!("  {}", file.display());
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingManifestLoader;

#[async_trait]
impl RemoteManifestLoader for LoggingManifestLoader {
    async fn load(&self, xml_paths: Vec<PathBuf>) {
        for path in xml_paths {
            tracing::info!("manifest ready: {}", path.display());
        }
    }
}

/// Listener writing progress and errors to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl RetrieveListener for LoggingListener {
    fn on_progress(&self, progress: Progress) {
        tracing::info!(
            "{}% ({} done, {} failed, {} remaining)",
            progress.percent,
            progress.completed,
            progress.failed,
            progress.remaining
        );
    }

    fn on_cancel_requested(&self) {
        tracing::warn!("retrieve cancellation requested");
    }

    fn on_error(&self, message: &str, title: &str) {
        tracing::error!("{}: {}", title, message);
    }
}
