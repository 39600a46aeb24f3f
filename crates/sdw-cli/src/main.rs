use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use sdw_storage::PgDealStore;
use sdw_sync::SyncConfig;

#[derive(Debug, Parser)]
#[command(name = "sdw-cli")]
#[command(about = "Switch Deal Watch command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass, across all active sources or one by name.
    Sync {
        #[arg(long)]
        source: Option<String>,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
    /// Apply database migrations.
    Migrate,
    /// Load or update sources from a YAML registry file.
    ImportSources { path: PathBuf },
    /// Print per-source and overall health classification.
    Health,
    /// Print a digest of recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { source: None }) {
        Commands::Sync { source: None } => {
            let summary = sdw_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} sources={} deactivated={} conflicts_resolved={} reports={}",
                summary.run_id,
                summary.sources_synced,
                summary.deactivated,
                summary.conflicts_auto_resolved,
                summary.reports_dir.as_deref().unwrap_or("-"),
            );
        }
        Commands::Sync { source: Some(name) } => {
            let outcome = sdw_sync::run_source_once_from_env(&name).await?;
            println!(
                "sync complete: source={} status={} found={} added={} updated={}",
                outcome.source_name,
                outcome.status.as_str(),
                outcome.found,
                outcome.added,
                outcome.updated,
            );
            for error in &outcome.errors {
                eprintln!("  error: {error}");
            }
        }
        Commands::Schedule => {
            sdw_sync::run_scheduler_from_env().await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgDealStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::ImportSources { path } => {
            let config = SyncConfig::from_env();
            let store = PgDealStore::connect(&config.database_url).await?;
            let summary = sdw_sync::import_sources(&store, &path).await?;
            println!(
                "registry imported: {} added, {} updated",
                summary.added, summary.updated
            );
        }
        Commands::Health => {
            let config = SyncConfig::from_env();
            let store = PgDealStore::connect(&config.database_url).await?;
            let system = sdw_health::check_system_health(&store, Utc::now()).await?;
            println!("overall: {}", system.severity.as_str());
            for source in &system.sources {
                println!(
                    "  {}: {} (success rate {:.0}%, avg found {:.1}, consecutive failures {})",
                    source.source_name,
                    source.severity.as_str(),
                    source.success_rate * 100.0,
                    source.average_deals_found,
                    source.consecutive_failures,
                );
                for issue in &source.issues {
                    println!("    - {issue}");
                }
            }
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            let digest = sdw_sync::report_recent_runs(&config.workspace_root, runs)?;
            println!("{digest}");
        }
    }

    Ok(())
}
