//! The agent's user-facing flows: assign, complete and probe.

use crate::config::AgentConfig;
use crate::config_patch::patch_config_file;
use crate::mount::MountBackend;
use crate::native_fs::NativeFs;
use crate::s3::S3Backend;
use chrono::{DateTime, Utc};
use claim_core::completion::{self, CompletionError, CompletionReport, GlobCompletionFilter};
use claim_core::fs::{self as core_fs, FileSystem};
use claim_core::marker::{ClaimMarker, MARKER_FILE};
use claim_core::mirror::{MirrorReport, mirror};
use claim_core::resolver::{AssignmentResolver, AssignmentSource, ResolveError};
use claim_core::tracking::{SyncTracking, TRACKING_FILE};
use claim_core::{Backend, BackendChain, BackendKind, FolderId, Identity};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Completion(#[from] CompletionError),
}

/// What `assign` produced.
#[derive(Debug)]
pub struct AssignOutcome {
    pub folder: FolderId,
    pub source: AssignmentSource,
    pub backend: BackendKind,
    /// Local workspace of the folder
    pub workspace: PathBuf,
    /// `None` when the remote listing failed outright
    pub mirror: Option<MirrorReport>,
    /// Set when a configured YAML file could not be updated
    pub output_dir_fallback: bool,
}

/// Reachability of one configured backend.
#[derive(Debug, Clone)]
pub struct ProbeStatus {
    pub kind: BackendKind,
    pub location: String,
    pub error: Option<String>,
}

impl ProbeStatus {
    pub fn is_reachable(&self) -> bool {
        self.error.is_none()
    }
}

/// One agent run for the current identity.
pub struct Session {
    config: AgentConfig,
    identity: Identity,
    chain: BackendChain,
    fs: NativeFs,
}

impl Session {
    pub fn new(config: AgentConfig, identity: Identity, chain: BackendChain) -> Self {
        let fs = NativeFs::new(config.home_root.clone());
        Self {
            config,
            identity,
            chain,
            fs,
        }
    }

    /// Session over the configured backends: S3 first (unless disabled), then the mount.
    pub async fn from_config(config: AgentConfig, identity: Identity) -> Self {
        let chain = build_chain(&config).await;
        Self::new(config, identity, chain)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Find or claim a folder, then prepare its local workspace.
    pub async fn assign(&self, now: DateTime<Utc>) -> Result<AssignOutcome, SessionError> {
        if self.identity.is_unknown() {
            warn!("No identity found in the environment, using {}", self.identity);
        }

        let mut resolver = AssignmentResolver::new(self.chain.clone(), self.identity.clone())
            .with_mode(self.config.claim_mode);
        let assignment = resolver.resolve().await?;
        let folder = assignment.folder.clone();
        let workspace_rel = folder.as_str();

        let marker = ClaimMarker::mirror(&folder, &self.identity, now).render();
        let marker_path = core_fs::join(workspace_rel, MARKER_FILE);
        if let Err(e) = self.fs.write(&marker_path, marker.as_bytes()).await {
            warn!("Could not write local claim marker: {}", e);
        }

        let mirror_report =
            match mirror(assignment.backend.as_ref(), &folder, &self.fs, workspace_rel).await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(folder = %folder, "Mirror failed: {}", e);
                    None
                }
            };
        self.record_mirror(&folder, assignment.backend.kind(), mirror_report.as_ref(), now)
            .await;

        let workspace = self.config.workspace_dir(&folder);
        let mut output_dir_fallback = false;
        if let Some(config_file) = &self.config.config_file {
            if let Err(e) = patch_config_file(config_file, &workspace).await {
                warn!("Could not update {}: {}", config_file.display(), e);
                output_dir_fallback = true;
            }
        }

        info!(
            folder = %folder,
            identity = %self.identity,
            "Assignment ready at {}",
            workspace.display()
        );
        Ok(AssignOutcome {
            folder,
            source: assignment.source,
            backend: assignment.backend.kind(),
            workspace,
            mirror: mirror_report,
            output_dir_fallback,
        })
    }

    async fn record_mirror(
        &self,
        folder: &FolderId,
        kind: BackendKind,
        report: Option<&MirrorReport>,
        now: DateTime<Utc>,
    ) {
        let path = core_fs::join(folder.as_str(), TRACKING_FILE);
        let mut tracking = SyncTracking::load(&self.fs, &path).await;
        match report {
            Some(r) if r.is_clean() => tracking.record_success(folder.as_str(), kind.label(), now),
            _ => tracking.record_failure(folder.as_str(), kind.label(), now),
        }
        if let Err(e) = tracking.save(&self.fs, &path).await {
            warn!("Error saving sync tracking: {}", e);
        }
    }

    /// Upload the completed cases of `folder`'s workspace.
    pub async fn complete(
        &self,
        folder: &FolderId,
        now: DateTime<Utc>,
    ) -> Result<CompletionReport, SessionError> {
        let filter = GlobCompletionFilter::for_folder(folder)?;
        let report = completion::sync_completed_cases(
            &self.chain,
            &self.fs,
            folder,
            folder.as_str(),
            &filter,
            now,
        )
        .await?;
        Ok(report)
    }

    /// Probe every configured backend in order.
    pub async fn probe(&self) -> Vec<ProbeStatus> {
        let mut statuses = Vec::with_capacity(self.chain.len());
        for backend in self.chain.iter() {
            let error = backend.probe().await.err().map(|e| e.to_string());
            statuses.push(ProbeStatus {
                kind: backend.kind(),
                location: backend.describe(),
                error,
            });
        }
        statuses
    }
}

/// The configured backends in failover order.
pub async fn build_chain(config: &AgentConfig) -> BackendChain {
    let mut chain = BackendChain::default();
    if let Some(settings) = &config.s3 {
        let s3: Arc<dyn Backend> = Arc::new(S3Backend::connect(settings).await);
        chain.push(s3);
    }
    chain.push(Arc::new(MountBackend::new(config.mount_path.clone())));
    chain
}
