//! Operator tool for a resumable upload work directory.
//!
//! ```text
//! resumable-admin [--config <path>] list <owner>
//! resumable-admin [--config <path>] info <owner> <filename> <upload_id>
//! resumable-admin [--config <path>] delete <owner> <filename> <upload_id>
//! resumable-admin [--config <path>] checksum <file>
//! ```
//!
//! Results are printed to stdout as JSON.

mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use resumable_engine::Resumables;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "resumable-admin")]
#[command(about = "Inspect and clean up resumable upload sessions")]
#[command(version)]
struct Cli {
    /// Config file path (default: ~/.config/resumable/admin.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// List an owner's active uploads
    List { owner: String },
    /// Show one active upload
    Info {
        owner: String,
        filename: String,
        upload_id: String,
    },
    /// Delete an active upload and its staged data
    Delete {
        owner: String,
        filename: String,
        upload_id: String,
    },
    /// SHA-256 of a file, e.g. a finalised artifact
    Checksum { path: PathBuf },
}

fn run(resumables: &Resumables, command: Command) -> anyhow::Result<serde_json::Value> {
    let value = match command {
        Command::List { owner } => serde_json::to_value(resumables.list_all(&owner))?,
        Command::Info {
            owner,
            filename,
            upload_id,
        } => serde_json::to_value(resumables.info(&owner, &filename, &upload_id)?)?,
        Command::Delete {
            owner,
            filename,
            upload_id,
        } => {
            let deleted = resumables.delete(&owner, &filename, &upload_id)?;
            serde_json::json!({ "upload_id": upload_id, "deleted": deleted })
        }
        Command::Checksum { path } => {
            let sha256 = resumables.store().checksum(&path)?;
            serde_json::json!({ "path": path, "sha256": sha256 })
        }
    };
    Ok(value)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(work_dir = %config.work_dir.display(), "configuration loaded");

    let resumables = Resumables::with_options(&config.work_dir, &config.engine)?;
    let output = run(&resumables, cli.command)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
