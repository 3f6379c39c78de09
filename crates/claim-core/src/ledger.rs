//! Claim ledger: reads and writes the per-folder claim marker on a backend.
//!
//! The ledger is advisory. A claim is only as strong as the backend's write
//! primitive: `ClaimMode::Exclusive` uses a create-if-absent write and so
//! narrows the check-then-write window, `ClaimMode::Overwrite` replaces any
//! marker blindly.

use crate::backend::{Backend, BackendError};
use crate::folder::FolderId;
use crate::identity::Identity;
use crate::marker::ClaimMarker;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// What a folder's marker says about it.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimStatus {
    /// No marker: the folder can be claimed.
    Available,
    /// A readable marker exists.
    Claimed(ClaimMarker),
    /// A marker exists (or may exist) but could not be read. Counts as
    /// claimed so an unreadable folder is never handed out twice.
    Unreadable(String),
}

impl ClaimStatus {
    pub fn is_claimed(&self) -> bool {
        !matches!(self, ClaimStatus::Available)
    }

    /// Owner named by the marker, if one could be recovered.
    pub fn owner(&self) -> Option<&Identity> {
        match self {
            ClaimStatus::Claimed(marker) => marker.owner.as_ref(),
            _ => None,
        }
    }

    pub fn is_owned_by(&self, identity: &Identity) -> bool {
        self.owner() == Some(identity)
    }
}

/// How a claim is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaimMode {
    /// Create the marker only if it does not exist yet.
    #[default]
    Exclusive,
    /// Write the marker unconditionally (last writer wins).
    Overwrite,
}

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The marker was written for us.
    Claimed,
    /// An exclusive write found a marker already in place.
    AlreadyTaken,
    /// The write failed.
    Failed(String),
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed)
    }
}

/// Marker access for one backend.
pub struct ClaimLedger<'a> {
    backend: &'a dyn Backend,
    mode: ClaimMode,
}

impl<'a> ClaimLedger<'a> {
    pub fn new(backend: &'a dyn Backend, mode: ClaimMode) -> Self {
        Self { backend, mode }
    }

    pub fn mode(&self) -> ClaimMode {
        self.mode
    }

    /// Look up who, if anyone, holds `folder`.
    pub async fn status(&self, folder: &FolderId) -> ClaimStatus {
        match self.backend.read_marker(folder).await {
            Ok(None) | Err(BackendError::NotFound(_)) => {
                debug!(folder = %folder, "Folder is available");
                ClaimStatus::Available
            }
            Ok(Some(bytes)) => match ClaimMarker::from_bytes(&bytes) {
                Ok(marker) => {
                    debug!(
                        folder = %folder,
                        owner = marker.owner.as_ref().map(|o| o.as_str()).unwrap_or("<none>"),
                        "Folder is taken"
                    );
                    ClaimStatus::Claimed(marker)
                }
                Err(e) => {
                    warn!(folder = %folder, "Unreadable claim marker: {}", e);
                    ClaimStatus::Unreadable(e.to_string())
                }
            },
            Err(e) => {
                warn!(folder = %folder, "Could not read claim marker: {}", e);
                ClaimStatus::Unreadable(e.to_string())
            }
        }
    }

    /// Write a claim on `folder` for `identity`. Never retries.
    pub async fn claim(
        &self,
        folder: &FolderId,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> ClaimOutcome {
        let content = ClaimMarker::remote(identity, now).render();
        let result = match self.mode {
            ClaimMode::Exclusive => self.backend.create_marker(folder, content.as_bytes()).await,
            ClaimMode::Overwrite => self
                .backend
                .write_marker(folder, content.as_bytes())
                .await
                .map(|()| true),
        };

        match result {
            Ok(true) => {
                info!(folder = %folder, identity = %identity, "Claimed folder on {}", self.backend.kind());
                ClaimOutcome::Claimed
            }
            Ok(false) | Err(BackendError::AlreadyExists(_)) => {
                warn!(folder = %folder, "Folder was claimed by someone else first");
                ClaimOutcome::AlreadyTaken
            }
            Err(e) => {
                warn!(folder = %folder, "Failed to claim folder: {}", e);
                ClaimOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    fn folder(name: &str) -> FolderId {
        name.parse().unwrap()
    }

    #[tokio::test]
    async fn test_absent_marker_is_available() {
        let backend = InMemoryBackend::new();
        backend.add_folder("user1");
        let ledger = ClaimLedger::new(&backend, ClaimMode::Exclusive);

        let status = ledger.status(&folder("user1")).await;
        assert_eq!(status, ClaimStatus::Available);
        assert!(!status.is_claimed());
    }

    #[tokio::test]
    async fn test_present_marker_reports_owner() {
        let backend = InMemoryBackend::new();
        backend.put("user2/taken_by.txt", b"Alice\nClaimed at: 2024-01-01T00:00:00");
        let ledger = ClaimLedger::new(&backend, ClaimMode::Exclusive);

        let status = ledger.status(&folder("user2")).await;
        assert!(status.is_claimed());
        assert!(status.is_owned_by(&Identity::new("alice")));
    }

    #[tokio::test]
    async fn test_denied_marker_counts_as_claimed() {
        let backend = InMemoryBackend::new();
        backend.add_folder("user1");
        backend.deny_marker_read("user1");
        let ledger = ClaimLedger::new(&backend, ClaimMode::Exclusive);

        let status = ledger.status(&folder("user1")).await;
        assert!(matches!(status, ClaimStatus::Unreadable(_)));
        assert!(status.is_claimed());
        assert!(status.owner().is_none());
    }

    #[tokio::test]
    async fn test_garbled_marker_counts_as_claimed() {
        let backend = InMemoryBackend::new();
        backend.put("user1/taken_by.txt", &[0xff, 0x00, 0xfe]);
        let ledger = ClaimLedger::new(&backend, ClaimMode::Exclusive);

        assert!(ledger.status(&folder("user1")).await.is_claimed());
    }

    #[tokio::test]
    async fn test_claim_writes_remote_format() {
        let backend = InMemoryBackend::new();
        backend.add_folder("user4");
        let ledger = ClaimLedger::new(&backend, ClaimMode::Exclusive);

        let outcome = ledger
            .claim(&folder("user4"), &Identity::new("bob"), Utc::now())
            .await;
        assert!(outcome.is_claimed());

        let written = String::from_utf8(backend.get("user4/taken_by.txt").unwrap()).unwrap();
        assert!(written.starts_with("bob\nClaimed at: "));
    }

    #[tokio::test]
    async fn test_exclusive_claim_does_not_overwrite() {
        let backend = InMemoryBackend::new();
        backend.put("user1/taken_by.txt", b"alice");
        let ledger = ClaimLedger::new(&backend, ClaimMode::Exclusive);

        let outcome = ledger
            .claim(&folder("user1"), &Identity::new("bob"), Utc::now())
            .await;
        assert_eq!(outcome, ClaimOutcome::AlreadyTaken);
        assert_eq!(backend.get("user1/taken_by.txt").unwrap(), b"alice");
    }

    #[tokio::test]
    async fn test_overwrite_claim_replaces_marker() {
        let backend = InMemoryBackend::new();
        backend.put("user1/taken_by.txt", b"alice");
        let ledger = ClaimLedger::new(&backend, ClaimMode::Overwrite);

        let outcome = ledger
            .claim(&folder("user1"), &Identity::new("bob"), Utc::now())
            .await;
        assert!(outcome.is_claimed());
        let status = ledger.status(&folder("user1")).await;
        assert!(status.is_owned_by(&Identity::new("bob")));
    }

    #[tokio::test]
    async fn test_failed_write_reports_failure() {
        let backend = InMemoryBackend::new();
        backend.add_folder("user1");
        backend.fail_marker_write("user1");
        let ledger = ClaimLedger::new(&backend, ClaimMode::Exclusive);

        let outcome = ledger
            .claim(&folder("user1"), &Identity::new("bob"), Utc::now())
            .await;
        assert!(matches!(outcome, ClaimOutcome::Failed(_)));
        assert!(backend.get("user1/taken_by.txt").is_none());
    }
}
