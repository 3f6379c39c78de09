//! Assignment resolver: finds the folder an identity already holds, or claims
//! the first free one.
//!
//! For each backend in chain order:
//!
//! 1. Probe and enumerate `user<N>` folders (ascending N).
//! 2. `SearchingOwn`: the first folder whose marker names this identity wins.
//!    Re-running for the same identity lands on the same folder.
//! 3. `SearchingAvailable`: the first folder without a marker is claimed. A
//!    failed claim moves on to the next free folder, never retries.
//! 4. Nothing found: fall through to the next backend.
//!
//! Only when every backend is exhausted does the run end in `Failed`.
//!
//! Two resolvers racing for the same folder can both observe it free. With
//! `ClaimMode::Exclusive` the backend's create-if-absent write turns the loser
//! into `AlreadyTaken`; with `ClaimMode::Overwrite` the last writer wins and
//! the other run is not told.

use crate::backend::{Backend, BackendChain};
use crate::folder::{FolderId, collect_folder_ids};
use crate::identity::Identity;
use crate::ledger::{ClaimLedger, ClaimMode, ClaimOutcome};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("No backend is reachable")]
    NoBackendReachable,

    #[error("No user folders found on any reachable backend")]
    NoFoldersConfigured,

    #[error("All {folders} user folder(s) are claimed")]
    NoneAvailable { folders: usize },
}

/// Where the resolver is in its run. `Assigned` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolverState {
    #[default]
    SearchingOwn,
    SearchingAvailable,
    Assigned,
    Failed,
}

/// How the assigned folder was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentSource {
    /// The identity already held this folder.
    Existing,
    /// The folder was free and has just been claimed.
    NewClaim,
}

/// A resolved folder together with the backend it lives on.
#[derive(Clone)]
pub struct Assignment {
    pub folder: FolderId,
    pub source: AssignmentSource,
    pub backend: Arc<dyn Backend>,
}

impl fmt::Debug for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assignment")
            .field("folder", &self.folder)
            .field("source", &self.source)
            .field("backend", &self.backend.kind())
            .finish()
    }
}

/// Outcome of searching a single backend.
enum BackendOutcome {
    Assigned(FolderId, AssignmentSource),
    Unreachable,
    NoFolders,
    AllClaimed(usize),
}

/// Resolves a folder for one identity across an ordered set of backends.
pub struct AssignmentResolver {
    chain: BackendChain,
    identity: Identity,
    mode: ClaimMode,
    state: ResolverState,
}

impl AssignmentResolver {
    pub fn new(chain: BackendChain, identity: Identity) -> Self {
        Self {
            chain,
            identity,
            mode: ClaimMode::default(),
            state: ResolverState::default(),
        }
    }

    pub fn with_mode(mut self, mode: ClaimMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// State reached by the last run, `SearchingOwn` before any run.
    pub fn state(&self) -> ResolverState {
        self.state
    }

    /// Run the search. Terminal: a failure is not retried internally.
    pub async fn resolve(&mut self) -> Result<Assignment, ResolveError> {
        info!(identity = %self.identity, backends = self.chain.len(), "Resolving user folder");
        self.transition(ResolverState::SearchingOwn);

        let mut saw_empty = false;
        let mut claimed_total: Option<usize> = None;

        let chain = self.chain.clone();
        for backend in chain.iter() {
            match self.search_backend(backend.as_ref()).await {
                BackendOutcome::Assigned(folder, source) => {
                    self.transition(ResolverState::Assigned);
                    info!(folder = %folder, backend = %backend.kind(), "Assigned {:?}", source);
                    return Ok(Assignment {
                        folder,
                        source,
                        backend: Arc::clone(backend),
                    });
                }
                BackendOutcome::Unreachable => {}
                BackendOutcome::NoFolders => saw_empty = true,
                BackendOutcome::AllClaimed(count) => {
                    claimed_total = Some(claimed_total.unwrap_or(0).max(count));
                }
            }
        }

        self.transition(ResolverState::Failed);
        let err = match (claimed_total, saw_empty) {
            (Some(folders), _) => ResolveError::NoneAvailable { folders },
            (None, true) => ResolveError::NoFoldersConfigured,
            (None, false) => ResolveError::NoBackendReachable,
        };
        warn!(identity = %self.identity, "Assignment failed: {}", err);
        Err(err)
    }

    async fn search_backend(&mut self, backend: &dyn Backend) -> BackendOutcome {
        let kind = backend.kind();

        if let Err(e) = backend.probe().await {
            warn!(backend = %kind, "Skipping {}: {}", backend.describe(), e);
            return BackendOutcome::Unreachable;
        }

        let folders = match backend.list_children().await {
            Ok(names) => collect_folder_ids(names),
            Err(e) => {
                warn!(backend = %kind, "Failed to list user folders: {}", e);
                return BackendOutcome::Unreachable;
            }
        };

        if folders.is_empty() {
            warn!(backend = %kind, "No user folders on {}", backend.describe());
            return BackendOutcome::NoFolders;
        }
        debug!(backend = %kind, count = folders.len(), "Found user folders");

        let ledger = ClaimLedger::new(backend, self.mode);

        self.transition(ResolverState::SearchingOwn);
        for folder in &folders {
            if ledger.status(folder).await.is_owned_by(&self.identity) {
                info!(folder = %folder, "Found existing assignment");
                return BackendOutcome::Assigned(folder.clone(), AssignmentSource::Existing);
            }
        }

        self.transition(ResolverState::SearchingAvailable);
        for folder in &folders {
            if ledger.status(folder).await.is_claimed() {
                continue;
            }
            match ledger.claim(folder, &self.identity, Utc::now()).await {
                ClaimOutcome::Claimed => {
                    return BackendOutcome::Assigned(folder.clone(), AssignmentSource::NewClaim);
                }
                ClaimOutcome::AlreadyTaken | ClaimOutcome::Failed(_) => continue,
            }
        }

        warn!(backend = %kind, "All {} user folder(s) are claimed", folders.len());
        BackendOutcome::AllClaimed(folders.len())
    }

    fn transition(&mut self, to: ResolverState) {
        if self.state != to {
            debug!(identity = %self.identity, "Resolver state {:?} -> {:?}", self.state, to);
        }
        self.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendKind, InMemoryBackend};
    use crate::ledger::ClaimStatus;

    fn chain_of(backends: &[&Arc<InMemoryBackend>]) -> BackendChain {
        BackendChain::new(
            backends
                .iter()
                .map(|b| Arc::clone(*b) as Arc<dyn Backend>)
                .collect(),
        )
    }

    fn marker_for(owner: &str) -> Vec<u8> {
        format!("{}\nClaimed at: 2024-01-01T00:00:00", owner).into_bytes()
    }

    #[tokio::test]
    async fn test_existing_claim_is_rediscovered_without_writes() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.add_folder("user1");
        backend.put("user2/taken_by.txt", &marker_for("alice"));
        backend.add_folder("user3");

        let mut resolver = AssignmentResolver::new(chain_of(&[&backend]), Identity::new("alice"));
        let assignment = resolver.resolve().await.unwrap();

        assert_eq!(assignment.folder.as_str(), "user2");
        assert_eq!(assignment.source, AssignmentSource::Existing);
        assert!(backend.marker_writes().is_empty());
    }

    #[tokio::test]
    async fn test_owner_match_is_case_insensitive() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.put("user5/taken_by.txt", &marker_for("ALICE"));

        let mut resolver = AssignmentResolver::new(chain_of(&[&backend]), Identity::new("Alice"));
        assert_eq!(resolver.resolve().await.unwrap().folder.as_str(), "user5");
    }

    #[tokio::test]
    async fn test_own_claim_beats_lower_free_folder() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.add_folder("user1");
        backend.put("user9/taken_by.txt", &marker_for("alice"));

        let mut resolver = AssignmentResolver::new(chain_of(&[&backend]), Identity::new("alice"));
        let assignment = resolver.resolve().await.unwrap();
        assert_eq!(assignment.folder.as_str(), "user9");
        assert!(backend.marker_writes().is_empty());
    }

    #[tokio::test]
    async fn test_first_free_folder_after_claimed_ones() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.put("user1/taken_by.txt", &marker_for("bob"));
        backend.put("user2/taken_by.txt", &marker_for("carol"));
        backend.put("user3/taken_by.txt", &marker_for("dave"));
        backend.add_folder("user4");

        let mut resolver = AssignmentResolver::new(chain_of(&[&backend]), Identity::new("alice"));
        let assignment = resolver.resolve().await.unwrap();

        assert_eq!(assignment.folder.as_str(), "user4");
        assert_eq!(assignment.source, AssignmentSource::NewClaim);
        assert_eq!(backend.marker_writes(), vec!["user4"]);
    }

    #[tokio::test]
    async fn test_ascending_tie_break() {
        let backend = Arc::new(InMemoryBackend::new());
        // Insertion order deliberately reversed
        backend.add_folder("user10");
        backend.add_folder("user2");
        backend.add_folder("user1");

        let mut resolver = AssignmentResolver::new(chain_of(&[&backend]), Identity::new("alice"));
        assert_eq!(resolver.resolve().await.unwrap().folder.as_str(), "user1");
    }

    #[tokio::test]
    async fn test_resolve_twice_is_idempotent() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.add_folder("user1");
        backend.add_folder("user2");

        let mut resolver = AssignmentResolver::new(chain_of(&[&backend]), Identity::new("alice"));
        let first = resolver.resolve().await.unwrap();
        let second = resolver.resolve().await.unwrap();

        assert_eq!(first.folder, second.folder);
        assert_eq!(first.source, AssignmentSource::NewClaim);
        assert_eq!(second.source, AssignmentSource::Existing);
        assert_eq!(backend.marker_writes(), vec!["user1"]);
    }

    #[tokio::test]
    async fn test_failed_claim_moves_to_next_free_folder() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.add_folder("user1");
        backend.add_folder("user2");
        backend.fail_marker_write("user1");

        let mut resolver = AssignmentResolver::new(chain_of(&[&backend]), Identity::new("alice"));
        let assignment = resolver.resolve().await.unwrap();

        assert_eq!(assignment.folder.as_str(), "user2");
        assert_eq!(backend.marker_writes(), vec!["user1", "user2"]);
    }

    #[tokio::test]
    async fn test_unreadable_marker_is_not_claimed_over() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.add_folder("user1");
        backend.add_folder("user2");
        backend.deny_marker_read("user1");

        let mut resolver = AssignmentResolver::new(chain_of(&[&backend]), Identity::new("alice"));
        assert_eq!(resolver.resolve().await.unwrap().folder.as_str(), "user2");
        assert_eq!(backend.marker_writes(), vec!["user2"]);
    }

    #[tokio::test]
    async fn test_unreachable_primary_fails_over() {
        let primary = Arc::new(InMemoryBackend::with_kind(BackendKind::S3));
        primary.add_folder("user1");
        primary.set_unreachable(true);
        let fallback = Arc::new(InMemoryBackend::with_kind(BackendKind::Mount));
        fallback.add_folder("user1");

        let mut resolver =
            AssignmentResolver::new(chain_of(&[&primary, &fallback]), Identity::new("alice"));
        let assignment = resolver.resolve().await.unwrap();

        assert_eq!(assignment.backend.kind(), BackendKind::Mount);
        assert_eq!(assignment.folder.as_str(), "user1");
        assert!(primary.marker_writes().is_empty());
        assert_eq!(fallback.marker_writes(), vec!["user1"]);
    }

    #[tokio::test]
    async fn test_listing_failure_fails_over() {
        let primary = Arc::new(InMemoryBackend::with_kind(BackendKind::S3));
        primary.fail_listing();
        let fallback = Arc::new(InMemoryBackend::with_kind(BackendKind::Mount));
        fallback.add_folder("user3");

        let mut resolver =
            AssignmentResolver::new(chain_of(&[&primary, &fallback]), Identity::new("alice"));
        let assignment = resolver.resolve().await.unwrap();
        assert_eq!(assignment.backend.kind(), BackendKind::Mount);
        assert_eq!(assignment.folder.as_str(), "user3");
    }

    #[tokio::test]
    async fn test_all_claimed_on_primary_falls_back() {
        let primary = Arc::new(InMemoryBackend::with_kind(BackendKind::S3));
        primary.put("user1/taken_by.txt", &marker_for("bob"));
        let fallback = Arc::new(InMemoryBackend::with_kind(BackendKind::Mount));
        fallback.add_folder("user1");
        fallback.add_folder("user2");
        fallback.put("user1/taken_by.txt", &marker_for("bob"));

        let mut resolver =
            AssignmentResolver::new(chain_of(&[&primary, &fallback]), Identity::new("alice"));
        let assignment = resolver.resolve().await.unwrap();
        assert_eq!(assignment.backend.kind(), BackendKind::Mount);
        assert_eq!(assignment.folder.as_str(), "user2");
    }

    #[tokio::test]
    async fn test_no_folders_anywhere() {
        let primary = Arc::new(InMemoryBackend::new());
        let fallback = Arc::new(InMemoryBackend::new());
        fallback.add_folder("shared");

        let mut resolver =
            AssignmentResolver::new(chain_of(&[&primary, &fallback]), Identity::new("alice"));
        assert_eq!(
            resolver.resolve().await.unwrap_err(),
            ResolveError::NoFoldersConfigured
        );
    }

    #[tokio::test]
    async fn test_all_claimed_is_distinct_from_empty() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.put("user1/taken_by.txt", &marker_for("bob"));
        backend.put("user2/taken_by.txt", &marker_for("carol"));

        let mut resolver = AssignmentResolver::new(chain_of(&[&backend]), Identity::new("alice"));
        assert_eq!(
            resolver.resolve().await.unwrap_err(),
            ResolveError::NoneAvailable { folders: 2 }
        );
        assert!(backend.marker_writes().is_empty());
    }

    #[tokio::test]
    async fn test_nothing_reachable() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.add_folder("user1");
        backend.set_unreachable(true);

        let mut resolver = AssignmentResolver::new(chain_of(&[&backend]), Identity::new("alice"));
        assert_eq!(
            resolver.resolve().await.unwrap_err(),
            ResolveError::NoBackendReachable
        );

        let mut empty = AssignmentResolver::new(BackendChain::default(), Identity::new("alice"));
        assert_eq!(
            empty.resolve().await.unwrap_err(),
            ResolveError::NoBackendReachable
        );
    }

    #[tokio::test]
    async fn test_state_ends_assigned_or_failed() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.add_folder("user1");

        let mut resolver = AssignmentResolver::new(chain_of(&[&backend]), Identity::new("alice"));
        assert_eq!(resolver.state(), ResolverState::SearchingOwn);
        resolver.resolve().await.unwrap();
        assert_eq!(resolver.state(), ResolverState::Assigned);

        let mut other = AssignmentResolver::new(chain_of(&[&backend]), Identity::new("bob"));
        other.resolve().await.unwrap_err();
        assert_eq!(other.state(), ResolverState::Failed);

        // A later run starts over and can still succeed
        backend.add_folder("user2");
        other.resolve().await.unwrap();
        assert_eq!(other.state(), ResolverState::Assigned);
    }

    /// Two sessions that both saw `user1` free. The exclusive write makes the
    /// second one lose cleanly; the overwrite write lets it steal the folder.
    #[tokio::test]
    async fn test_concurrent_claim_race_window() {
        let folder: FolderId = "user1".parse().unwrap();

        let backend = InMemoryBackend::new();
        backend.add_folder("user1");
        let exclusive = ClaimLedger::new(&backend, ClaimMode::Exclusive);
        assert_eq!(exclusive.status(&folder).await, ClaimStatus::Available);
        assert!(exclusive.claim(&folder, &Identity::new("alice"), Utc::now()).await.is_claimed());
        assert_eq!(
            exclusive.claim(&folder, &Identity::new("bob"), Utc::now()).await,
            ClaimOutcome::AlreadyTaken
        );
        assert!(exclusive.status(&folder).await.is_owned_by(&Identity::new("alice")));

        let backend = InMemoryBackend::new();
        backend.add_folder("user1");
        let overwrite = ClaimLedger::new(&backend, ClaimMode::Overwrite);
        assert!(overwrite.claim(&folder, &Identity::new("alice"), Utc::now()).await.is_claimed());
        assert!(overwrite.claim(&folder, &Identity::new("bob"), Utc::now()).await.is_claimed());
        // Alice believes she holds user1, but the marker now names bob
        assert!(overwrite.status(&folder).await.is_owned_by(&Identity::new("bob")));
    }
}
