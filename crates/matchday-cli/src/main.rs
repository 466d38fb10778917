use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "matchday")]
#[command(about = "Reconcile one upstream match feed into the shared event store")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, merge, expire and persist once.
    Sync,
    /// Print a markdown overview of a store file.
    Report {
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose {
        "debug,hyper=warn,reqwest=warn"
    } else {
        "info,hyper=warn,reqwest=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = matchday_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run={} owner={} fetched={} accepted={} inserted={} updated={} expired={} total={} changed={}",
                summary.run_code,
                summary.owner,
                summary.fetched_items,
                summary.accepted,
                summary.reconcile.merge.inserted,
                summary.reconcile.merge.updated,
                summary.reconcile.expiry.expired,
                summary.total_entries(),
                summary.changed
            );
            if summary.total_entries() == 0 {
                tracing::warn!(store = %summary.store_path, "store is empty after sync");
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Report { store } => {
            let path = match store {
                Some(path) => path,
                None => matchday_sync::SyncConfig::from_env()?.store_path,
            };
            println!("{}", matchday_sync::report_store_markdown(&path).await?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
