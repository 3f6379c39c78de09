//! Backend over a locally mounted copy of the namespace root.
//!
//! The mount only counts as reachable when its root is a non-empty directory:
//! an unmounted drive letter often leaves an empty placeholder behind.

use crate::native_fs::mtime_millis;
use async_trait::async_trait;
use claim_core::backend::{Backend, BackendError, BackendKind, RemoteEntry, Result};
use claim_core::folder::FolderId;
use claim_core::fs::is_confined;
use claim_core::marker::MARKER_FILE;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

pub struct MountBackend {
    root: PathBuf,
}

impl MountBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn folder_path(&self, folder: &FolderId) -> PathBuf {
        self.root.join(folder.as_str())
    }

    fn marker_path(&self, folder: &FolderId) -> PathBuf {
        self.folder_path(folder).join(MARKER_FILE)
    }

    fn file_path(&self, folder: &FolderId, path: &str) -> Result<PathBuf> {
        let rel = path.trim_matches('/');
        if !is_confined(rel) {
            return Err(BackendError::PermissionDenied(format!(
                "{} leaves {}",
                path,
                self.folder_path(folder).display()
            )));
        }
        Ok(rel
            .split('/')
            .fold(self.folder_path(folder), |acc, segment| acc.join(segment)))
    }
}

fn map_io(err: io::Error, path: &Path) -> BackendError {
    let shown = path.display().to_string();
    match err.kind() {
        io::ErrorKind::NotFound => BackendError::NotFound(shown),
        io::ErrorKind::PermissionDenied => BackendError::PermissionDenied(shown),
        io::ErrorKind::AlreadyExists => BackendError::AlreadyExists(shown),
        _ => BackendError::Io(format!("{}: {}", shown, err)),
    }
}

/// Write `content` into a file that was just created at `path`.
///
/// On failure the file is removed again, so a half-written marker never
/// makes the folder look claimed.
async fn fill_new_file<W>(mut file: W, path: &Path, content: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut written = file.write_all(content).await;
    if written.is_ok() {
        written = file.flush().await;
    }
    drop(file);

    if let Err(e) = written {
        if let Err(cleanup) = fs::remove_file(path).await {
            warn!("Could not remove partial {}: {}", path.display(), cleanup);
        }
        return Err(map_io(e, path));
    }
    Ok(())
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| map_io(e, parent))?;
    }
    Ok(())
}

#[async_trait]
impl Backend for MountBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mount
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn probe(&self) -> Result<()> {
        let unreachable = |why: &str| {
            BackendError::Unreachable(format!("{} {}", self.root.display(), why))
        };

        let metadata = fs::metadata(&self.root)
            .await
            .map_err(|_| unreachable("does not exist"))?;
        if !metadata.is_dir() {
            return Err(unreachable("is not a directory"));
        }

        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|e| unreachable(&format!("cannot be listed ({})", e)))?;
        match dir.next_entry().await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(unreachable("is empty")),
            Err(e) => Err(unreachable(&format!("cannot be listed ({})", e))),
        }
    }

    async fn list_children(&self) -> Result<Vec<String>> {
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|e| map_io(e, &self.root))?;

        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| map_io(e, &self.root))? {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        Ok(names)
    }

    async fn read_marker(&self, folder: &FolderId) -> Result<Option<Vec<u8>>> {
        let path = self.marker_path(folder);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io(e, &path)),
        }
    }

    async fn write_marker(&self, folder: &FolderId, content: &[u8]) -> Result<()> {
        let path = self.marker_path(folder);
        ensure_parent(&path).await?;
        fs::write(&path, content).await.map_err(|e| map_io(e, &path))
    }

    async fn create_marker(&self, folder: &FolderId, content: &[u8]) -> Result<bool> {
        let path = self.marker_path(folder);
        ensure_parent(&path).await?;

        let file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!("Marker already present: {}", path.display());
                return Ok(false);
            }
            Err(e) => return Err(map_io(e, &path)),
        };
        fill_new_file(file, &path, content).await?;
        Ok(true)
    }

    async fn list_files(&self, folder: &FolderId) -> Result<Vec<RemoteEntry>> {
        let base = self.folder_path(folder);
        let mut entries = Vec::new();
        let mut pending = vec![(base.clone(), String::new())];

        while let Some((dir_path, rel)) = pending.pop() {
            let mut dir = fs::read_dir(&dir_path)
                .await
                .map_err(|e| map_io(e, &dir_path))?;

            while let Some(entry) = dir.next_entry().await.map_err(|e| map_io(e, &dir_path))? {
                let name = entry.file_name().to_string_lossy().to_string();
                let rel_path = if rel.is_empty() {
                    name
                } else {
                    format!("{}/{}", rel, name)
                };
                let metadata = entry
                    .metadata()
                    .await
                    .map_err(|e| map_io(e, &entry.path()))?;

                if metadata.is_dir() {
                    pending.push((entry.path(), rel_path.clone()));
                }
                entries.push(RemoteEntry {
                    path: rel_path,
                    mtime_millis: mtime_millis(metadata.modified()),
                    size: metadata.len(),
                    is_dir: metadata.is_dir(),
                });
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn fetch(&self, folder: &FolderId, path: &str) -> Result<Vec<u8>> {
        let full = self.file_path(folder, path)?;
        fs::read(&full).await.map_err(|e| map_io(e, &full))
    }

    async fn store(&self, folder: &FolderId, path: &str, content: &[u8]) -> Result<()> {
        let full = self.file_path(folder, path)?;
        ensure_parent(&full).await?;
        fs::write(&full, content).await.map_err(|e| map_io(e, &full))
    }
}
