//! Native filesystem for the local workspaces, using tokio::fs.

use async_trait::async_trait;
use claim_core::fs::{FileEntry, FileStat, FileSystem, FsError, Result};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;

/// Filesystem rooted at the workspace home directory
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve `path` below the base. Anything but plain segments is refused.
    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path.trim_matches('/'));
        if rel.as_os_str().is_empty() {
            return Ok(self.base_path.clone());
        }
        if !rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(FsError::InvalidPath(path.to_string()));
        }
        Ok(self.base_path.join(rel))
    }
}

fn map_io(err: io::Error, path: &Path) -> FsError {
    let shown = path.display().to_string();
    match err.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(shown),
        io::ErrorKind::PermissionDenied => FsError::PermissionDenied(shown),
        _ => FsError::Io(format!("{}: {}", shown, err)),
    }
}

pub(crate) fn mtime_millis(modified: io::Result<SystemTime>) -> u64 {
    modified
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path)?;
        fs::read(&full_path).await.map_err(|e| map_io(e, &full_path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path)?;
        if full_path.is_dir() {
            return Err(FsError::IsDirectory(full_path.display().to_string()));
        }

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(e, parent))?;
        }

        fs::write(&full_path, content)
            .await
            .map_err(|e| map_io(e, &full_path))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let full_path = self.full_path(path)?;
        let mut entries = Vec::new();

        let mut dir = fs::read_dir(&full_path)
            .await
            .map_err(|e| map_io(e, &full_path))?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| map_io(e, &full_path))? {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .map_err(|e| map_io(e, &entry.path()))?;
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir,
            });
        }

        Ok(entries)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path)?;
        fs::try_exists(&full_path)
            .await
            .map_err(|e| map_io(e, &full_path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let full_path = self.full_path(path)?;
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_io(e, &full_path))?;

        Ok(FileStat {
            mtime_millis: mtime_millis(metadata.modified()),
            size: metadata.len(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        fs::create_dir_all(&full_path)
            .await
            .map_err(|e| map_io(e, &full_path))
    }
}
