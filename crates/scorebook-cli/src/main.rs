use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scorebook_core::Table;
use scorebook_storage::{row_counts, CompletionTracker, StagingCoordinator};
use scorebook_sync::{recent_runs_markdown, PipelineOrchestrator, RunStatus, SyncConfig};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "scorebook")]
#[command(about = "Incremental sports-records sync with staged promotion")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once.
    Sync {
        /// Ignore the incremental window and reprocess terminal records.
        #[arg(long)]
        full_refresh: bool,
    },
    /// Show tracked state, production row counts, backups and recent runs.
    Status {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Discard all completion history. Requires --yes.
    ResetState {
        #[arg(long)]
        yes: bool,
    },
    /// Run the pipeline on the configured cron until interrupted.
    Schedule,
}

fn init_logging(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);
    let mut config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync { full_refresh: false }) {
        Commands::Sync { full_refresh } => {
            config.full_refresh |= full_refresh;
            let outcome = PipelineOrchestrator::from_config(config)?.run_once().await?;
            let reports = outcome
                .reports_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_default();
            match &outcome.status {
                RunStatus::Completed => {
                    println!(
                        "sync complete: run_id={} matches={} reports={}",
                        outcome.run_id,
                        outcome.final_counts.get(&Table::Matches).copied().unwrap_or(0),
                        reports
                    );
                }
                RunStatus::Failed { step, error } => {
                    eprintln!(
                        "sync failed at {step}: {error}\nproduction unchanged; run_id={} reports={}",
                        outcome.run_id, reports
                    );
                    std::process::exit(1);
                }
            }
        }
        Commands::Status { runs } => {
            let tracker = CompletionTracker::load(&config.state_file, config.cadence)?;
            let stats = tracker.stats();
            let layout = config.layout();
            println!("state file: {}", config.state_file.display());
            println!("  series tracked: {}", stats.series_tracked);
            println!("  terminal ids:   {}", stats.terminal_ids);
            println!("  cadence:        {}", config.cadence);
            println!("production: {}", layout.production.display());
            for (table, count) in row_counts(&layout.production).await? {
                println!("  {table}: {count}");
            }
            let backups = StagingCoordinator::new(layout).list_backups().await?;
            println!("backups: {}", backups.len());
            if let Some(latest) = backups.first() {
                println!("  latest: {}", latest.display());
            }
            println!();
            println!("{}", recent_runs_markdown(&config.reports_dir, runs)?);
        }
        Commands::ResetState { yes } => {
            if !yes {
                anyhow::bail!("refusing to discard completion history without --yes");
            }
            let mut tracker = CompletionTracker::load(&config.state_file, config.cadence)?;
            tracker.reset()?;
            println!("completion state reset: {}", config.state_file.display());
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let orchestrator = Arc::new(PipelineOrchestrator::from_config(config)?);
            let Some(sched) = orchestrator.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}
