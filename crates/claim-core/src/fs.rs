//! FileSystem trait abstraction for the local workspace side of a sync.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in claim-agent) - Uses tokio::fs under the workspace home root
//!
//! Paths are `/`-separated and relative to the implementation's root.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Path leaves its root: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Modification time in milliseconds since epoch
    pub mtime_millis: u64,
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Local workspace filesystem.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;
}

/// Join workspace path segments with `/`, ignoring empty segments.
pub fn join(base: &str, rest: &str) -> String {
    let base = base.trim_matches('/');
    let rest = rest.trim_matches('/');
    match (base.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{}/{}", base, rest),
    }
}

/// Whether `path` is a plain relative path that stays below whatever root it
/// is joined onto: no leading slash, no empty, `.` or `..` segments, no
/// backslashes.
pub fn is_confined(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('\\')
        && path
            .split('/')
            .all(|segment| !matches!(segment, "" | "." | ".."))
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    dirs: RwLock<BTreeSet<String>>,
    /// Tracks file modification times (path -> mtime in ms)
    mtimes: RwLock<BTreeMap<String, u64>>,
    /// Paths whose writes fail with PermissionDenied
    read_only: RwLock<BTreeSet<String>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert(String::new()); // Root directory
        Self {
            files: RwLock::new(BTreeMap::new()),
            dirs: RwLock::new(dirs),
            mtimes: RwLock::new(BTreeMap::new()),
            read_only: RwLock::new(BTreeSet::new()),
        }
    }

    /// Set a specific mtime for testing timestamp comparisons
    pub fn set_mtime(&self, path: &str, mtime: u64) {
        let path = Self::normalize_path(path);
        self.mtimes.write().unwrap().insert(path, mtime);
    }

    /// Make writes to `path` fail.
    pub fn deny_writes(&self, path: &str) {
        let path = Self::normalize_path(path);
        self.read_only.write().unwrap().insert(path);
    }

    /// Snapshot of every file path currently stored.
    pub fn file_paths(&self) -> Vec<String> {
        self.files.read().unwrap().keys().cloned().collect()
    }

    fn current_time_ms() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn parent_path(path: &str) -> Option<String> {
        let normalized = Self::normalize_path(path);
        if normalized.is_empty() {
            None
        } else {
            match normalized.rfind('/') {
                Some(pos) => Some(normalized[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }

    fn insert_dir_chain(dirs: &mut BTreeSet<String>, path: &str) {
        let mut current = Some(path.to_string());
        while let Some(dir) = current {
            if dir.is_empty() || !dirs.insert(dir.clone()) {
                break;
            }
            current = Self::parent_path(&dir);
        }
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap();
        files
            .get(&path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        if self.read_only.read().unwrap().contains(&path) {
            return Err(FsError::PermissionDenied(path));
        }
        if self.dirs.read().unwrap().contains(&path) {
            return Err(FsError::IsDirectory(path));
        }

        if let Some(parent) = Self::parent_path(&path) {
            Self::insert_dir_chain(&mut self.dirs.write().unwrap(), &parent);
        }

        self.files
            .write()
            .unwrap()
            .insert(path.clone(), content.to_vec());
        self.mtimes
            .write()
            .unwrap()
            .insert(path, Self::current_time_ms());
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        let dirs = self.dirs.read().unwrap();
        if !dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }

        let mut entries = Vec::new();
        let mut seen = BTreeSet::new();

        for file_path in self.files.read().unwrap().keys() {
            if let Some(rest) = file_path.strip_prefix(&prefix) {
                if !rest.contains('/') && seen.insert(rest.to_string()) {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: false,
                    });
                }
            }
        }

        for dir_path in dirs.iter() {
            if let Some(rest) = dir_path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') && seen.insert(rest.to_string()) {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: true,
                    });
                }
            }
        }

        Ok(entries)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap();
        let dirs = self.dirs.read().unwrap();
        Ok(files.contains_key(&path) || dirs.contains(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = Self::normalize_path(path);

        if let Some(content) = self.files.read().unwrap().get(&path) {
            let mtime = self.mtimes.read().unwrap().get(&path).copied().unwrap_or(0);
            return Ok(FileStat {
                mtime_millis: mtime,
                size: content.len() as u64,
                is_dir: false,
            });
        }

        if self.dirs.read().unwrap().contains(&path) {
            return Ok(FileStat {
                mtime_millis: 0,
                size: 0,
                is_dir: true,
            });
        }

        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        Self::insert_dir_chain(&mut self.dirs.write().unwrap(), &path);
        Ok(())
    }
}

// Lets one filesystem be shared between a workspace and assertions in tests
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_fs_write_creates_parents() {
        let fs = InMemoryFs::new();

        fs.write("user1/case_a/scan.nrrd", b"voxels").await.unwrap();

        assert!(fs.exists("user1").await.unwrap());
        assert!(fs.exists("user1/case_a").await.unwrap());
        assert_eq!(fs.read("user1/case_a/scan.nrrd").await.unwrap(), b"voxels");

        let entries = fs.list("user1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "case_a");
        assert!(entries[0].is_dir);
    }

    #[tokio::test]
    async fn test_inmemory_fs_list_missing_dir() {
        let fs = InMemoryFs::new();
        assert!(matches!(fs.list("nope").await, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_inmemory_fs_stat_and_mtime_override() {
        let fs = InMemoryFs::new();
        fs.write("a.txt", b"abc").await.unwrap();
        fs.set_mtime("a.txt", 42);

        let stat = fs.stat("a.txt").await.unwrap();
        assert_eq!(stat.mtime_millis, 42);
        assert_eq!(stat.size, 3);
        assert!(!stat.is_dir);
    }

    #[tokio::test]
    async fn test_inmemory_fs_denied_write() {
        let fs = InMemoryFs::new();
        fs.deny_writes("locked.txt");
        assert!(matches!(
            fs.write("locked.txt", b"x").await,
            Err(FsError::PermissionDenied(_))
        ));
        assert!(!fs.exists("locked.txt").await.unwrap());
    }

    #[test]
    fn test_join() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("user1/", "/case"), "user1/case");
        assert_eq!(join("user1", ""), "user1");
    }

    #[test]
    fn test_is_confined() {
        assert!(is_confined("case_a/seg.nrrd"));
        assert!(is_confined("notes..txt"));

        assert!(!is_confined(""));
        assert!(!is_confined("/etc/passwd"));
        assert!(!is_confined("../../escaped.txt"));
        assert!(!is_confined("case_a/../../x"));
        assert!(!is_confined("./a"));
        assert!(!is_confined("a//b"));
        assert!(!is_confined("..\\x"));
    }
}
