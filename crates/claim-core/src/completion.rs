//! Upload of completed cases from a folder workspace back to the backend.
//!
//! A case is a direct subdirectory of the workspace holding the completion
//! flag. Only the artifacts a [`CompletionFilter`] accepts are uploaded, to
//! `<folder>/<case>/<name>` on the first reachable backend. Progress is kept
//! in the workspace's tracking document so finished cases are not resent.

use crate::backend::{Backend, BackendChain, BackendKind};
use crate::folder::FolderId;
use crate::fs::{self, FileSystem, FsError};
use crate::tracking::{SyncSession, SyncTracking, TRACKING_FILE};
use chrono::{DateTime, Utc};
use glob::Pattern;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Marks a case as finished by the labeler.
pub const COMPLETION_FLAG: &str = "01_labeling_complete.txt";

/// Written next to the uploaded artifacts.
pub const SYNC_TIMESTAMP_FILE: &str = "completion_sync_timestamp.txt";

/// Local flags left in a case after a successful upload.
pub const SYNC_FLAG_PREFIX: &str = "02_synced_to_";

const INCLUDE_PATTERNS: &[&str] = &[
    COMPLETION_FLAG,
    "*_organs_*_ibd.nrrd",
    "*.yaml",
    "screenshot.png",
    "*_backup.nrrd",
    "slicer.yaml",
];

const EXCLUDE_PATTERNS: &[&str] = &[
    "intestine_train_*.nii.gz",
    "organs_*_ibd.nii.gz",
    "*.tmp",
    "*.temp",
    "02_synced_to_*",
];

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("No backend reachable for completion upload")]
    NoBackendReachable,

    #[error("Could not scan workspace: {0}")]
    Scan(#[from] FsError),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

pub type Result<T> = std::result::Result<T, CompletionError>;

/// Decides which top-level files of a case are completion artifacts.
pub trait CompletionFilter: Send + Sync {
    fn accepts(&self, file_name: &str) -> bool;
}

/// Include/exclude filter over file names. Excludes win.
#[derive(Debug, Clone)]
pub struct GlobCompletionFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl GlobCompletionFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let include = include
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let exclude = exclude
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { include, exclude })
    }

    /// The standard artifact set for `folder`'s cases.
    pub fn for_folder(folder: &FolderId) -> Result<Self> {
        let mut include: Vec<String> = INCLUDE_PATTERNS.iter().map(|p| p.to_string()).collect();
        include.push(format!(
            "{}_organs_*_ibd.nrrd",
            Pattern::escape(folder.as_str())
        ));
        let exclude: Vec<String> = EXCLUDE_PATTERNS.iter().map(|p| p.to_string()).collect();
        Self::new(&include, &exclude)
    }
}

impl CompletionFilter for GlobCompletionFilter {
    fn accepts(&self, file_name: &str) -> bool {
        if self.exclude.iter().any(|p| p.matches(file_name)) {
            return false;
        }
        self.include.iter().any(|p| p.matches(file_name))
    }
}

/// Outcome of one completion upload run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionReport {
    /// Label of the backend used, if any case needed it
    pub sync_mode: Option<String>,
    pub total_cases: usize,
    pub synced_cases: Vec<String>,
    pub skipped_cases: Vec<String>,
    pub failed_cases: Vec<String>,
    pub files_uploaded: usize,
}

impl CompletionReport {
    pub fn is_success(&self) -> bool {
        self.failed_cases.is_empty()
    }
}

/// Names of the completed cases in `workspace`, sorted.
///
/// A missing workspace has no cases.
pub async fn find_completed_cases<F>(fs: &F, workspace: &str) -> Result<Vec<String>>
where
    F: FileSystem + ?Sized,
{
    let entries = match fs.list(workspace).await {
        Ok(entries) => entries,
        Err(FsError::NotFound(_)) => {
            warn!("Workspace not found: {}", workspace);
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut cases = Vec::new();
    for entry in entries.into_iter().filter(|e| e.is_dir) {
        let flag = fs::join(&fs::join(workspace, &entry.name), COMPLETION_FLAG);
        if fs.exists(&flag).await.unwrap_or(false) {
            debug!("Found completed case: {}", entry.name);
            cases.push(entry.name);
        }
    }
    cases.sort();
    Ok(cases)
}

/// Upload every completed case of `folder` found in `workspace`.
pub async fn sync_completed_cases<F>(
    chain: &BackendChain,
    fs: &F,
    folder: &FolderId,
    workspace: &str,
    filter: &dyn CompletionFilter,
    now: DateTime<Utc>,
) -> Result<CompletionReport>
where
    F: FileSystem + ?Sized,
{
    let cases = find_completed_cases(fs, workspace).await?;
    info!(folder = %folder, "Found {} completed cases", cases.len());
    if cases.is_empty() {
        return Ok(CompletionReport::default());
    }

    let backend = chain
        .first_reachable()
        .await
        .ok_or(CompletionError::NoBackendReachable)?;
    let mode = backend.kind().label();
    info!(folder = %folder, "Uploading completed cases via {}", backend.describe());

    let tracking_path = fs::join(workspace, TRACKING_FILE);
    let mut tracking = SyncTracking::load(fs, &tracking_path).await;

    let mut report = CompletionReport {
        sync_mode: Some(mode.to_string()),
        total_cases: cases.len(),
        ..Default::default()
    };

    for case in &cases {
        let case_dir = fs::join(workspace, case);
        if already_synced(fs, &case_dir, tracking.last_synced(case)).await {
            debug!("Case {} already synced", case);
            report.skipped_cases.push(case.clone());
            continue;
        }

        let uploaded = upload_case(backend.as_ref(), fs, folder, &case_dir, case, filter, now).await;
        if uploaded > 0 {
            let flag = fs::join(&case_dir, &sync_flag_name(mode));
            let note = format!("Synced to {} at {}", mode, now.to_rfc3339());
            if let Err(e) = fs.write(&flag, note.as_bytes()).await {
                warn!("Could not write sync flag for {}: {}", case, e);
            }
            tracking.record_success(case, mode, now);
            report.files_uploaded += uploaded;
            report.synced_cases.push(case.clone());
        } else {
            tracking.record_failure(case, mode, now);
            report.failed_cases.push(case.clone());
        }
    }

    tracking.push_session(SyncSession {
        timestamp: now.to_rfc3339(),
        sync_mode: mode.to_string(),
        total_cases: report.total_cases,
        synced_cases: report.synced_cases.len(),
        failed_cases: report.failed_cases.len(),
    });
    if let Err(e) = tracking.save(fs, &tracking_path).await {
        warn!("Error saving sync tracking: {}", e);
    }

    info!(
        folder = %folder,
        "Completion sync ({}): {}/{} cases synced, {} already synced, {} failed",
        mode,
        report.synced_cases.len(),
        report.total_cases,
        report.skipped_cases.len(),
        report.failed_cases.len()
    );
    Ok(report)
}

fn sync_flag_name(mode: &str) -> String {
    format!("{}{}.txt", SYNC_FLAG_PREFIX, mode)
}

async fn already_synced<F>(fs: &F, case_dir: &str, last_synced: f64) -> bool
where
    F: FileSystem + ?Sized,
{
    let completed_at = match fs.stat(&fs::join(case_dir, COMPLETION_FLAG)).await {
        Ok(stat) => stat.mtime_millis as f64 / 1000.0,
        Err(_) => 0.0,
    };
    if completed_at > last_synced {
        return false;
    }
    for kind in [BackendKind::S3, BackendKind::Mount] {
        let flag = fs::join(case_dir, &sync_flag_name(kind.label()));
        if fs.exists(&flag).await.unwrap_or(false) {
            return true;
        }
    }
    false
}

/// Upload the accepted artifacts of one case. Returns how many made it.
async fn upload_case<F>(
    backend: &dyn Backend,
    fs: &F,
    folder: &FolderId,
    case_dir: &str,
    case: &str,
    filter: &dyn CompletionFilter,
    now: DateTime<Utc>,
) -> usize
where
    F: FileSystem + ?Sized,
{
    let entries = match fs.list(case_dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Could not list case {}: {}", case, e);
            return 0;
        }
    };

    let mut names: Vec<String> = entries
        .into_iter()
        .filter(|e| !e.is_dir)
        .map(|e| e.name)
        .filter(|name| {
            let keep = filter.accepts(name);
            if !keep {
                debug!("Excluding: {}/{}", case, name);
            }
            keep
        })
        .collect();
    names.sort();

    let mut uploaded = 0;
    for name in &names {
        let content = match fs.read(&fs::join(case_dir, name)).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read {}/{}: {}", case, name, e);
                continue;
            }
        };
        match backend.store(folder, &fs::join(case, name), &content).await {
            Ok(()) => {
                debug!("Uploaded: {}/{}", case, name);
                uploaded += 1;
            }
            Err(e) => warn!("Failed to upload {}/{}: {}", case, name, e),
        }
    }

    if uploaded > 0 {
        let stamp = format!(
            "Case {} completion artifacts synced by {} at {}\nFiles synced: {}",
            case,
            folder,
            now.to_rfc3339(),
            uploaded
        );
        let key = fs::join(case, SYNC_TIMESTAMP_FILE);
        if let Err(e) = backend.store(folder, &key, stamp.as_bytes()).await {
            warn!("Could not create sync timestamp for {}: {}", case, e);
        }
    }
    info!("Case {}: {} files uploaded", case, uploaded);
    uploaded
}
