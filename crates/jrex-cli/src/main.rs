use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use jrex_sync::{
    check_from_config, run_from_config, ConfigOverrides, RunConfig, RunMode, RunOutcome,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jrex")]
#[command(about = "Reconcile the published journal snapshot with the source database")]
struct Cli {
    /// YAML config file; environment variables and flags override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass (the default).
    Sync(SyncArgs),
    /// Verify source and sink connectivity, then exit.
    Check,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// "full" re-fetches everything; "inc" resumes past the snapshot watermark.
    #[arg(long)]
    mode: Option<RunMode>,

    /// Snapshot file name in the sink container.
    #[arg(long)]
    snapshot_name: Option<String>,

    /// Sink container id.
    #[arg(long)]
    container: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let Cli { config, command } = Cli::parse();

    match command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let overrides = ConfigOverrides {
                config_path: config,
                mode: args.mode,
                snapshot_name: args.snapshot_name,
                container_id: args.container,
            };
            let run_config = RunConfig::load(&overrides)?;
            match run_from_config(run_config).await? {
                RunOutcome::Uploaded(summary) => println!(
                    "sync complete: run_id={} mode={:?} fetched={} rows={} bytes={} sha256={} -> {}",
                    summary.run_id,
                    summary.mode,
                    summary.fetched_rows,
                    summary.snapshot_rows,
                    summary.snapshot_bytes,
                    summary.snapshot_sha256,
                    summary.snapshot_name
                ),
                RunOutcome::NoNewData => {
                    println!("sync complete: no new journal records; snapshot left unchanged")
                }
            }
        }
        Commands::Check => {
            let overrides = ConfigOverrides {
                config_path: config,
                ..ConfigOverrides::default()
            };
            let run_config = RunConfig::load(&overrides)?;
            check_from_config(run_config).await?;
            println!("source and sink are both reachable");
        }
    }

    Ok(())
}
