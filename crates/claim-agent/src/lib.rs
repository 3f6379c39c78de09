//! claim-agent library: Exposes the agent's components for testing.
//!
//! This is a thin library layer over the binary, allowing integration tests
//! to drive whole sessions against on-disk mounts.

pub mod config;
pub mod config_patch;
pub mod mount;
pub mod native_fs;
pub mod s3;
pub mod session;

// Re-export key types for convenience
pub use config::{AgentConfig, ClaimModeArg, ConfigArgs, ConfigError, S3Settings};
pub use config_patch::{PatchError, patch_config_file};
pub use mount::MountBackend;
pub use native_fs::NativeFs;
pub use s3::S3Backend;
pub use session::{AssignOutcome, ProbeStatus, Session, SessionError, build_chain};
