//! One-way mirror of a claimed folder from a backend into the local workspace.
//!
//! A file is transferred when the local copy is missing or strictly older
//! than the remote one. Directory placeholders and claim markers are never
//! copied. Entries whose path would leave the folder are reported as failures.
//! One failed file does not stop the rest.

use crate::backend::{Backend, BackendError, RemoteEntry};
use crate::folder::FolderId;
use crate::fs::{self, FileSystem, FsError};
use tracing::{debug, info, warn};

/// A file that could not be mirrored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorFailure {
    pub path: String,
    pub error: String,
}

/// Counts from one mirror run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorReport {
    pub transferred: usize,
    pub skipped: usize,
    pub failed: Vec<MirrorFailure>,
}

impl MirrorReport {
    /// Number of eligible remote files seen (transferred + skipped + failed).
    pub fn total(&self) -> usize {
        self.transferred + self.skipped + self.failed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Whether a remote entry is working data that belongs in the workspace.
pub fn is_mirrorable(entry: &RemoteEntry) -> bool {
    !entry.is_dir && !entry.is_marker() && !entry.path.is_empty()
}

/// Mirror `folder` from `backend` into `local_root` on `local`.
///
/// Fails only when the remote listing itself fails.
pub async fn mirror<F>(
    backend: &dyn Backend,
    folder: &FolderId,
    local: &F,
    local_root: &str,
) -> Result<MirrorReport, BackendError>
where
    F: FileSystem + ?Sized,
{
    info!(folder = %folder, backend = %backend.kind(), "Mirroring into {}", local_root);

    if let Err(e) = local.mkdir(local_root).await {
        warn!("Could not create local workspace {}: {}", local_root, e);
    }

    let entries = backend.list_files(folder).await?;
    let mut report = MirrorReport::default();

    for entry in entries.iter().filter(|e| is_mirrorable(e)) {
        if !fs::is_confined(&entry.path) {
            warn!("Refusing to mirror {}: path leaves the folder", entry.path);
            report.failed.push(MirrorFailure {
                path: entry.path.clone(),
                error: FsError::InvalidPath(entry.path.clone()).to_string(),
            });
            continue;
        }
        let dest = fs::join(local_root, &entry.path);

        if is_up_to_date(local, &dest, entry).await {
            debug!("Up to date: {}", entry.path);
            report.skipped += 1;
            continue;
        }

        match transfer(backend, folder, local, entry, &dest).await {
            Ok(()) => {
                debug!("Downloaded: {}", entry.path);
                report.transferred += 1;
            }
            Err(error) => {
                warn!("Failed to download {}: {}", entry.path, error);
                report.failed.push(MirrorFailure {
                    path: entry.path.clone(),
                    error,
                });
            }
        }
    }

    if report.is_clean() {
        info!(
            folder = %folder,
            "Mirror complete: {} downloaded, {} up to date",
            report.transferred, report.skipped
        );
    } else {
        warn!(
            folder = %folder,
            "Mirror completed with issues: {} downloaded, {} up to date, {} failed",
            report.transferred,
            report.skipped,
            report.failed.len()
        );
    }
    Ok(report)
}

async fn is_up_to_date<F>(local: &F, dest: &str, entry: &RemoteEntry) -> bool
where
    F: FileSystem + ?Sized,
{
    match local.stat(dest).await {
        Ok(stat) => !stat.is_dir && stat.mtime_millis >= entry.mtime_millis,
        Err(FsError::NotFound(_)) => false,
        Err(e) => {
            debug!("Could not stat {}: {}", dest, e);
            false
        }
    }
}

async fn transfer<F>(
    backend: &dyn Backend,
    folder: &FolderId,
    local: &F,
    entry: &RemoteEntry,
    dest: &str,
) -> Result<(), String>
where
    F: FileSystem + ?Sized,
{
    let content = backend
        .fetch(folder, &entry.path)
        .await
        .map_err(|e| e.to_string())?;
    local.write(dest, &content).await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::fs::InMemoryFs;

    fn folder() -> FolderId {
        "user1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_missing_files_are_downloaded() {
        let backend = InMemoryBackend::new();
        backend.put("user1/case_a/scan.nii.gz", b"scan");
        backend.put("user1/notes.txt", b"notes");
        let local = InMemoryFs::new();

        let report = mirror(&backend, &folder(), &local, "user1").await.unwrap();

        assert_eq!(report.transferred, 2);
        assert_eq!(report.skipped, 0);
        assert_eq!(local.read("user1/case_a/scan.nii.gz").await.unwrap(), b"scan");
        assert_eq!(local.read("user1/notes.txt").await.unwrap(), b"notes");
    }

    #[tokio::test]
    async fn test_newer_remote_is_retransferred() {
        let backend = InMemoryBackend::new();
        backend.put("user1/seg.nrrd", b"v2");
        backend.set_mtime("user1/seg.nrrd", 5_000);
        let local = InMemoryFs::new();
        local.write("user1/seg.nrrd", b"v1").await.unwrap();
        local.set_mtime("user1/seg.nrrd", 4_000);

        let report = mirror(&backend, &folder(), &local, "user1").await.unwrap();

        assert_eq!(report.transferred, 1);
        assert_eq!(local.read("user1/seg.nrrd").await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_older_or_equal_remote_is_skipped() {
        let backend = InMemoryBackend::new();
        backend.put("user1/older.nrrd", b"remote");
        backend.set_mtime("user1/older.nrrd", 3_000);
        backend.put("user1/equal.nrrd", b"remote");
        backend.set_mtime("user1/equal.nrrd", 4_000);

        let local = InMemoryFs::new();
        local.write("user1/older.nrrd", b"local").await.unwrap();
        local.set_mtime("user1/older.nrrd", 4_000);
        local.write("user1/equal.nrrd", b"local").await.unwrap();
        local.set_mtime("user1/equal.nrrd", 4_000);

        let report = mirror(&backend, &folder(), &local, "user1").await.unwrap();

        assert_eq!(report.transferred, 0);
        assert_eq!(report.skipped, 2);
        assert_eq!(local.read("user1/older.nrrd").await.unwrap(), b"local");
        assert_eq!(local.read("user1/equal.nrrd").await.unwrap(), b"local");
    }

    #[tokio::test]
    async fn test_markers_and_placeholders_are_not_counted() {
        let backend = InMemoryBackend::new();
        backend.put_dir_placeholder("user1/case_a");
        backend.put("user1/taken_by.txt", b"alice");
        backend.put("user1/case_a/a.nrrd", b"a");
        backend.put("user1/case_a/b.nrrd", b"b");
        let local = InMemoryFs::new();
        local.write("user1/case_a/b.nrrd", b"b").await.unwrap();
        local.set_mtime("user1/case_a/b.nrrd", u64::MAX);

        let report = mirror(&backend, &folder(), &local, "user1").await.unwrap();

        assert_eq!(report.transferred + report.skipped, 2);
        assert_eq!(report.total(), 2);
        assert!(!local.exists("user1/taken_by.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_single_failure_does_not_abort() {
        let backend = InMemoryBackend::new();
        backend.put("user1/a.nrrd", b"a");
        backend.put("user1/b.nrrd", b"b");
        backend.put("user1/c.nrrd", b"c");
        backend.fail_fetch("user1/b.nrrd");
        let local = InMemoryFs::new();

        let report = mirror(&backend, &folder(), &local, "user1").await.unwrap();

        assert_eq!(report.transferred, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].path, "b.nrrd");
        assert_eq!(report.total(), 3);
        assert!(local.exists("user1/c.nrrd").await.unwrap());
    }

    #[tokio::test]
    async fn test_escaping_paths_are_rejected() {
        let backend = InMemoryBackend::new();
        backend.put("user1/ok.txt", b"ok");
        backend.put("user1/../../escaped.txt", b"evil");
        backend.put("user1/case_a/../../../x.txt", b"evil");
        let local = InMemoryFs::new();

        let report = mirror(&backend, &folder(), &local, "user1").await.unwrap();

        assert_eq!(report.transferred, 1);
        let mut rejected: Vec<&str> = report.failed.iter().map(|f| f.path.as_str()).collect();
        rejected.sort();
        assert_eq!(rejected, vec!["../../escaped.txt", "case_a/../../../x.txt"]);
        assert_eq!(local.file_paths(), vec!["user1/ok.txt"]);
    }

    #[tokio::test]
    async fn test_local_write_failure_is_counted() {
        let backend = InMemoryBackend::new();
        backend.put("user1/a.nrrd", b"a");
        let local = InMemoryFs::new();
        local.deny_writes("user1/a.nrrd");

        let report = mirror(&backend, &folder(), &local, "user1").await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_listing_failure_is_an_error() {
        let backend = InMemoryBackend::new();
        backend.set_unreachable(true);
        let local = InMemoryFs::new();

        assert!(mirror(&backend, &folder(), &local, "user1").await.is_err());
    }

    #[tokio::test]
    async fn test_second_run_skips_everything() {
        let backend = InMemoryBackend::new();
        backend.put("user1/a.nrrd", b"a");
        backend.set_mtime("user1/a.nrrd", 1);
        let local = InMemoryFs::new();

        let first = mirror(&backend, &folder(), &local, "user1").await.unwrap();
        let second = mirror(&backend, &folder(), &local, "user1").await.unwrap();

        assert_eq!(first.transferred, 1);
        assert_eq!(second.transferred, 0);
        assert_eq!(second.skipped, 1);
    }
}
