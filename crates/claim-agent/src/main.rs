//! claim-agent: Assigns a shared `user<N>` folder to the signed-in user.
//!
//! Logs go to stderr. Stdout only carries `KEY=value` lines for the calling
//! launcher script to evaluate.

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use claim_agent::config::{AgentConfig, ConfigArgs};
use claim_agent::session::Session;
use claim_core::{AssignmentSource, FolderId, Identity};

#[derive(Parser, Debug)]
#[command(name = "claim-agent")]
#[command(about = "Claim and prepare a shared user folder")]
struct Args {
    #[command(flatten)]
    config: ConfigArgs,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Find or claim a folder and mirror it locally
    Assign,
    /// Upload completed cases of a folder workspace
    Complete {
        /// Folder to upload, e.g. user3
        folder: String,
    },
    /// Report which backends are reachable
    Probe,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,claim_agent=debug,claim_core=debug"
    } else {
        "info,aws_config=warn,aws_smithy_runtime=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(args).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

/// Returns whether the command succeeded.
async fn run(args: Args) -> Result<bool> {
    let config = AgentConfig::from_args(&args.config)?;
    let identity = Identity::from_env();
    info!("Identity: {}", identity);

    let session = Session::from_config(config, identity).await;

    match args.command {
        Command::Assign => {
            let outcome = session.assign(Utc::now()).await?;
            match outcome.source {
                AssignmentSource::Existing => info!("Reusing folder {}", outcome.folder),
                AssignmentSource::NewClaim => info!("Claimed folder {}", outcome.folder),
            }
            if let Some(report) = &outcome.mirror {
                info!(
                    "Mirrored {} files ({} up to date, {} failed)",
                    report.transferred,
                    report.skipped,
                    report.failed.len()
                );
            }

            let workspace = outcome.workspace.to_string_lossy().replace('\\', "/");
            println!("ASSIGNED_USER={}", outcome.folder);
            println!("USER_HOME_DIR={}", workspace);
            if outcome.output_dir_fallback {
                println!("USER_OUTPUT_DIR={}", workspace);
            }
            Ok(true)
        }
        Command::Complete { folder } => {
            let folder: FolderId = folder.parse()?;
            let report = session.complete(&folder, Utc::now()).await?;
            if !report.is_success() {
                warn!("Cases not synced: {}", report.failed_cases.join(", "));
            }
            Ok(report.is_success())
        }
        Command::Probe => {
            let statuses = session.probe().await;
            for status in &statuses {
                match &status.error {
                    None => println!("{}\treachable\t{}", status.kind, status.location),
                    Some(e) => println!("{}\tunreachable\t{}\t{}", status.kind, status.location, e),
                }
            }
            Ok(statuses.iter().any(|s| s.is_reachable()))
        }
    }
}
