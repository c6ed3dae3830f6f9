use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tracing::info;

use placesync::{
    bootstrap, generate, init_tracing, AppConfig, DedupEngine, DirectoryClient, Scheduler,
    SyncOptions, SyncOrchestrator,
};

#[derive(Parser)]
#[command(name = "placesync", about = "Grid-based place discovery sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one sweep of the metro grid now.
    Sync {
        /// Stop after this many grid points.
        #[arg(long)]
        limit: Option<usize>,
        /// Cap the number of results accepted per tile.
        #[arg(long)]
        per_tile: Option<usize>,
    },
    /// Reconcile duplicate canonical places (exact pass, then fuzzy pass).
    Dedup,
    /// Run the weekly/daily/hourly cadences until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    let data_dir = config.data_dir.clone().unwrap_or_else(|| "data".to_string());
    let context = bootstrap(&data_dir, &config.database_file_name)
        .context("failed to open the canonical store")?;
    let db = Arc::new(Mutex::new(context.connection));

    match cli.command {
        Command::Sync { limit, per_tile } => {
            let client = DirectoryClient::new(&config)?;
            let orchestrator = SyncOrchestrator::new(db, client, &config);
            let points = generate(&config.bounding_box, config.grid_spacing_km);

            let mut options = SyncOptions::from_config(&config);
            options.point_limit = limit;
            options.per_tile_result_limit = per_tile;

            // Per-tile failures are already in the report; they never turn
            // into a non-zero exit.
            if let Some(report) = orchestrator.try_run(&points, &options, None).await? {
                info!(
                    processed = report.processed,
                    skipped = report.skipped,
                    found = report.found,
                    failed = report.failed,
                    "sync finished"
                );
            }
        }
        Command::Dedup => {
            let engine = DedupEngine::new(db);
            let report = engine.run()?;
            info!(
                exact = report.exact_merged,
                fuzzy = report.fuzzy_merged,
                distinct = report.kept_distinct,
                "dedup finished"
            );
        }
        Command::Schedule => {
            let client = DirectoryClient::new(&config)?;
            let orchestrator = Arc::new(SyncOrchestrator::new(db, client, &config));
            let scheduler = Arc::new(Scheduler::new(orchestrator, &config));

            let cancel = Arc::new(AtomicBool::new(false));
            let handles = scheduler.spawn(Arc::clone(&cancel));
            info!("scheduler running; press Ctrl-C to stop");

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            cancel.store(true, Ordering::SeqCst);
            for handle in handles {
                handle.abort();
            }
            info!("scheduler stopped");
        }
    }

    Ok(())
}
