//! claim-core: exclusive assignment of shared `user<N>` folders.
//!
//! This crate provides the core functionality for:
//! - Enumerating `user<N>` folders and reading/writing their claim markers
//! - Resolving which folder belongs to the current identity, with failover
//!   from a primary backend to a secondary one
//! - Mirroring a claimed folder into a local workspace
//! - Uploading completed cases and tracking what has been synced
//! - Backend and FileSystem trait abstractions with in-memory test doubles

pub mod backend;
pub mod completion;
pub mod folder;
pub mod fs;
pub mod identity;
pub mod ledger;
pub mod marker;
pub mod mirror;
pub mod resolver;
pub mod tracking;

pub use backend::{Backend, BackendChain, BackendError, BackendKind, InMemoryBackend, RemoteEntry};
pub use completion::{CompletionFilter, CompletionReport, GlobCompletionFilter};
pub use folder::{FolderId, FolderIdError};
pub use fs::{FileEntry, FileStat, FileSystem, FsError, InMemoryFs};
pub use identity::Identity;
pub use ledger::{ClaimLedger, ClaimMode, ClaimOutcome, ClaimStatus};
pub use marker::{ClaimMarker, MarkerFormat};
pub use mirror::{MirrorReport, mirror};
pub use resolver::{Assignment, AssignmentResolver, AssignmentSource, ResolveError, ResolverState};
pub use tracking::{SyncRecord, SyncSession, SyncTracking};
