//! Agent configuration: command-line arguments with environment fallbacks.

use claim_core::{ClaimMode, FolderId};
use clap::ValueEnum;
use std::path::PathBuf;

pub const DEFAULT_BUCKET: &str = "hoda2-ibd-sample-cases-us-west-2";
pub const DEFAULT_PREFIX: &str = "ibd_root";
pub const DEFAULT_REGION: &str = "us-west-2";
pub const DEFAULT_MOUNT_PATH: &str = "C:/s3_bucket/ibd_root";
pub const DEFAULT_HOME_ROOT: &str = "C:/AppStreamUsers";

/// Claim write strategy as accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClaimModeArg {
    /// Create the marker only if absent
    Exclusive,
    /// Replace any existing marker
    Overwrite,
}

impl From<ClaimModeArg> for ClaimMode {
    fn from(arg: ClaimModeArg) -> Self {
        match arg {
            ClaimModeArg::Exclusive => ClaimMode::Exclusive,
            ClaimModeArg::Overwrite => ClaimMode::Overwrite,
        }
    }
}

/// Raw configuration arguments, shared by every subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Bucket holding the user folders
    #[arg(long, env = "CLAIM_BUCKET", default_value = DEFAULT_BUCKET)]
    pub bucket: String,

    /// Namespace root inside the bucket
    #[arg(long, env = "CLAIM_PREFIX", default_value = DEFAULT_PREFIX)]
    pub prefix: String,

    /// AWS region of the bucket
    #[arg(long, env = "AWS_DEFAULT_REGION", default_value = DEFAULT_REGION)]
    pub region: String,

    /// Custom S3 endpoint (e.g. a local MinIO)
    #[arg(long, env = "AWS_ENDPOINT_URL")]
    pub endpoint_url: Option<String>,

    /// Locally mounted copy of the namespace root
    #[arg(long, env = "CLAIM_MOUNT_PATH", default_value = DEFAULT_MOUNT_PATH)]
    pub mount_path: String,

    /// Local directory holding per-folder workspaces (supports ~)
    #[arg(long, env = "CLAIM_HOME_ROOT", default_value = DEFAULT_HOME_ROOT)]
    pub home_root: String,

    /// YAML configuration file to point at the assigned workspace
    #[arg(long, env = "CLAIM_CONFIG_FILE")]
    pub config_file: Option<String>,

    /// How claims are written
    #[arg(long, value_enum, default_value_t = ClaimModeArg::Exclusive)]
    pub claim_mode: ClaimModeArg,

    /// Skip the object store and use only the mount
    #[arg(long)]
    pub no_s3: bool,
}

/// S3 connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub bucket: String,
    pub prefix: String,
    pub region: String,
    pub endpoint_url: Option<String>,
}

/// Validated agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// `None` when the object store is disabled
    pub s3: Option<S3Settings>,
    pub mount_path: PathBuf,
    pub home_root: PathBuf,
    pub config_file: Option<PathBuf>,
    pub claim_mode: ClaimMode,
}

impl AgentConfig {
    pub fn from_args(args: &ConfigArgs) -> Result<Self, ConfigError> {
        let s3 = if args.no_s3 {
            None
        } else {
            Some(S3Settings {
                bucket: non_empty("bucket", &args.bucket)?,
                prefix: args.prefix.trim().trim_matches('/').to_string(),
                region: non_empty("region", &args.region)?,
                endpoint_url: args
                    .endpoint_url
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            })
        };

        Ok(Self {
            s3,
            mount_path: expand_tilde(&non_empty("mount path", &args.mount_path)?),
            home_root: expand_tilde(&non_empty("home root", &args.home_root)?),
            config_file: args
                .config_file
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(expand_tilde),
            claim_mode: args.claim_mode.into(),
        })
    }

    /// Local workspace of `folder`.
    pub fn workspace_dir(&self, folder: &FolderId) -> PathBuf {
        self.home_root.join(folder.as_str())
    }
}

fn non_empty(name: &'static str, value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Empty(name));
    }
    Ok(trimmed.to_string())
}

/// Expand ~ or ~/ prefix to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
}
