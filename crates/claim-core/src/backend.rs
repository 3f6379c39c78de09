//! Backend trait: uniform access to the shared namespace holding user folders.
//!
//! Implementations:
//! - `InMemoryBackend` - For testing, with injectable failures
//! - `MountBackend` (in claim-agent) - A locally mounted copy of the bucket
//! - `S3Backend` (in claim-agent) - The object store itself
//!
//! Every path handed to a backend is relative to its namespace root, i.e.
//! `user3/taken_by.txt` rather than `ibd_root/user3/taken_by.txt`.

use crate::folder::FolderId;
use crate::marker::MARKER_FILE;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    PermissionDenied(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Backend error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Which kind of storage a backend talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    S3,
    Mount,
    Memory,
}

impl BackendKind {
    /// Short lowercase label, used in sync flags and tracking records.
    pub fn label(&self) -> &'static str {
        match self {
            BackendKind::S3 => "s3",
            BackendKind::Mount => "mount",
            BackendKind::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A file (or directory placeholder) below a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Path relative to the folder, `/`-separated
    pub path: String,
    /// Modification time in milliseconds since epoch (0 if unknown)
    pub mtime_millis: u64,
    /// Size in bytes
    pub size: u64,
    /// Directory placeholder (an S3 key ending in `/`)
    pub is_dir: bool,
}

impl RemoteEntry {
    /// Whether this entry is a claim marker rather than working data.
    pub fn is_marker(&self) -> bool {
        self.path == MARKER_FILE || self.path.ends_with(&format!("/{}", MARKER_FILE))
    }
}

/// Shared storage holding the `user<N>` folders.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Human-readable location (bucket URI, mount path) for logs.
    fn describe(&self) -> String;

    /// Cheap reachability check. `Ok(())` means enumeration may proceed.
    async fn probe(&self) -> Result<()>;

    /// Names of the immediate child folders of the namespace root.
    async fn list_children(&self) -> Result<Vec<String>>;

    /// Read a folder's marker. `Ok(None)` when absent.
    async fn read_marker(&self, folder: &FolderId) -> Result<Option<Vec<u8>>>;

    /// Write a folder's marker, replacing whatever is there.
    async fn write_marker(&self, folder: &FolderId, content: &[u8]) -> Result<()>;

    /// Write a folder's marker only if none exists.
    ///
    /// Returns `Ok(false)` when a marker was already present. Backends without
    /// a conditional write should emulate it as closely as they can.
    async fn create_marker(&self, folder: &FolderId, content: &[u8]) -> Result<bool>;

    /// Every entry below a folder, recursively.
    async fn list_files(&self, folder: &FolderId) -> Result<Vec<RemoteEntry>>;

    /// Read one file below a folder.
    async fn fetch(&self, folder: &FolderId, path: &str) -> Result<Vec<u8>>;

    /// Write one file below a folder.
    async fn store(&self, folder: &FolderId, path: &str, content: &[u8]) -> Result<()>;
}

/// Ordered list of backends, primary first.
#[derive(Clone, Default)]
pub struct BackendChain {
    backends: Vec<Arc<dyn Backend>>,
}

impl BackendChain {
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Self {
        Self { backends }
    }

    pub fn push(&mut self, backend: Arc<dyn Backend>) {
        self.backends.push(backend);
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Backend>> {
        self.backends.iter()
    }

    /// The first backend whose probe succeeds.
    pub async fn first_reachable(&self) -> Option<Arc<dyn Backend>> {
        for backend in &self.backends {
            match backend.probe().await {
                Ok(()) => {
                    debug!(backend = %backend.kind(), "Backend reachable: {}", backend.describe());
                    return Some(Arc::clone(backend));
                }
                Err(e) => {
                    warn!(backend = %backend.kind(), "Backend unavailable ({}): {}", backend.describe(), e);
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    content: Vec<u8>,
    mtime_millis: u64,
}

/// Failure injection for `InMemoryBackend`.
#[derive(Debug, Default)]
struct Faults {
    unreachable: bool,
    list_error: bool,
    denied_markers: BTreeSet<String>,
    failing_marker_writes: BTreeSet<String>,
    failing_fetches: BTreeSet<String>,
}

/// In-memory backend for testing.
///
/// Objects are keyed by their path below the namespace root. Every marker
/// write attempt is recorded so tests can assert which folders were touched.
pub struct InMemoryBackend {
    kind: BackendKind,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    /// Folders that exist without any objects (like empty mount directories)
    empty_folders: RwLock<BTreeSet<String>>,
    faults: RwLock<Faults>,
    marker_writes: Mutex<Vec<String>>,
    clock: Mutex<u64>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_kind(BackendKind::Memory)
    }

    /// An in-memory backend that reports itself as `kind`.
    pub fn with_kind(kind: BackendKind) -> Self {
        Self {
            kind,
            objects: RwLock::new(BTreeMap::new()),
            empty_folders: RwLock::new(BTreeSet::new()),
            faults: RwLock::new(Faults::default()),
            marker_writes: Mutex::new(Vec::new()),
            clock: Mutex::new(1_000),
        }
    }

    /// Create an empty folder.
    pub fn add_folder(&self, name: &str) {
        self.empty_folders.write().unwrap().insert(name.to_string());
    }

    /// Put a file at `path` (relative to the namespace root).
    pub fn put(&self, path: &str, content: &[u8]) {
        let mtime_millis = self.tick();
        self.objects.write().unwrap().insert(
            path.trim_matches('/').to_string(),
            StoredObject {
                content: content.to_vec(),
                mtime_millis,
            },
        );
    }

    /// Put a directory placeholder key (`path/`).
    pub fn put_dir_placeholder(&self, path: &str) {
        let key = format!("{}/", path.trim_matches('/'));
        self.objects.write().unwrap().insert(
            key,
            StoredObject {
                content: Vec::new(),
                mtime_millis: 0,
            },
        );
    }

    /// Override the modification time of an object.
    pub fn set_mtime(&self, path: &str, mtime_millis: u64) {
        if let Some(obj) = self.objects.write().unwrap().get_mut(path.trim_matches('/')) {
            obj.mtime_millis = mtime_millis;
        }
    }

    /// Raw content of an object, if present.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects
            .read()
            .unwrap()
            .get(path.trim_matches('/'))
            .map(|o| o.content.clone())
    }

    /// Make probe and every operation fail as unreachable.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.faults.write().unwrap().unreachable = unreachable;
    }

    /// Probe succeeds but enumeration fails.
    pub fn fail_listing(&self) {
        self.faults.write().unwrap().list_error = true;
    }

    /// Reading this folder's marker fails with access denied.
    pub fn deny_marker_read(&self, folder: &str) {
        self.faults
            .write()
            .unwrap()
            .denied_markers
            .insert(folder.to_string());
    }

    /// Writing this folder's marker fails.
    pub fn fail_marker_write(&self, folder: &str) {
        self.faults
            .write()
            .unwrap()
            .failing_marker_writes
            .insert(folder.to_string());
    }

    /// Fetching this path (relative to the namespace root) fails.
    pub fn fail_fetch(&self, path: &str) {
        self.faults
            .write()
            .unwrap()
            .failing_fetches
            .insert(path.trim_matches('/').to_string());
    }

    /// Folders whose marker a write was attempted on, in order.
    pub fn marker_writes(&self) -> Vec<String> {
        self.marker_writes.lock().unwrap().clone()
    }

    fn tick(&self) -> u64 {
        let mut clock = self.clock.lock().unwrap();
        *clock += 1;
        *clock
    }

    fn check_reachable(&self) -> Result<()> {
        if self.faults.read().unwrap().unreachable {
            return Err(BackendError::Unreachable("in-memory backend offline".into()));
        }
        Ok(())
    }

    fn marker_key(folder: &FolderId) -> String {
        format!("{}/{}", folder, MARKER_FILE)
    }

    fn record_marker_write(&self, folder: &FolderId) -> Result<()> {
        self.marker_writes.lock().unwrap().push(folder.to_string());
        if self
            .faults
            .read()
            .unwrap()
            .failing_marker_writes
            .contains(folder.as_str())
        {
            return Err(BackendError::PermissionDenied(Self::marker_key(folder)));
        }
        Ok(())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.kind)
    }

    async fn probe(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn list_children(&self) -> Result<Vec<String>> {
        self.check_reachable()?;
        if self.faults.read().unwrap().list_error {
            return Err(BackendError::PermissionDenied("list".into()));
        }

        let mut names: BTreeSet<String> = self.empty_folders.read().unwrap().clone();
        for key in self.objects.read().unwrap().keys() {
            if let Some((first, _)) = key.split_once('/') {
                names.insert(first.to_string());
            }
        }
        Ok(names.into_iter().collect())
    }

    async fn read_marker(&self, folder: &FolderId) -> Result<Option<Vec<u8>>> {
        self.check_reachable()?;
        let key = Self::marker_key(folder);
        if self
            .faults
            .read()
            .unwrap()
            .denied_markers
            .contains(folder.as_str())
        {
            return Err(BackendError::PermissionDenied(key));
        }
        Ok(self.get(&key))
    }

    async fn write_marker(&self, folder: &FolderId, content: &[u8]) -> Result<()> {
        self.check_reachable()?;
        self.record_marker_write(folder)?;
        self.put(&Self::marker_key(folder), content);
        Ok(())
    }

    async fn create_marker(&self, folder: &FolderId, content: &[u8]) -> Result<bool> {
        self.check_reachable()?;
        self.record_marker_write(folder)?;
        let key = Self::marker_key(folder);
        if self.get(&key).is_some() {
            return Ok(false);
        }
        self.put(&key, content);
        Ok(true)
    }

    async fn list_files(&self, folder: &FolderId) -> Result<Vec<RemoteEntry>> {
        self.check_reachable()?;
        let prefix = format!("{}/", folder);
        let objects = self.objects.read().unwrap();
        Ok(objects
            .iter()
            .filter_map(|(key, obj)| {
                let rest = key.strip_prefix(&prefix)?;
                if rest.is_empty() {
                    return None;
                }
                Some(RemoteEntry {
                    path: rest.trim_end_matches('/').to_string(),
                    mtime_millis: obj.mtime_millis,
                    size: obj.content.len() as u64,
                    is_dir: rest.ends_with('/'),
                })
            })
            .collect())
    }

    async fn fetch(&self, folder: &FolderId, path: &str) -> Result<Vec<u8>> {
        self.check_reachable()?;
        let key = format!("{}/{}", folder, path.trim_matches('/'));
        if self.faults.read().unwrap().failing_fetches.contains(&key) {
            return Err(BackendError::PermissionDenied(key));
        }
        self.get(&key).ok_or(BackendError::NotFound(key))
    }

    async fn store(&self, folder: &FolderId, path: &str, content: &[u8]) -> Result<()> {
        self.check_reachable()?;
        self.put(&format!("{}/{}", folder, path.trim_matches('/')), content);
        Ok(())
    }
}
