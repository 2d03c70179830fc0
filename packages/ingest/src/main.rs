#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the MOT history loader.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use mot_loader_cli_utils::{IndicatifProgress, MultiProgress};
use mot_loader_database::{DbPool, ledger, open_pool, schema};
use mot_loader_ingest::config::{Overrides, Settings};
use mot_loader_ingest::delta::{DeltaOptions, run_delta};
use mot_loader_ingest::retry::retry_failed;
use mot_loader_ingest::{PipelineContext, discover_local, run_files};
use mot_loader_ingest_models::{ImportStatus, LoadStrategy, RunSummary, VehicleWriteMode};
use mot_loader_remote::{Credentials, RemoteClient};

#[derive(Parser)]
#[command(name = "mot_loader", about = "MOT history bulk and delta loader")]
struct Cli {
    /// `DuckDB` file (falls back to `MOT_DATABASE`)
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    /// Maximum pooled connections (falls back to `POOL_SIZE`)
    #[arg(long, global = true)]
    pool_size: Option<u32>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunArgs {
    /// How records are written: `row-batch` or `bulk-copy`
    #[arg(long)]
    strategy: Option<LoadStrategy>,
    /// Vehicle conflict handling: `initial` (insert-only) or `delta` (upsert)
    #[arg(long)]
    mode: Option<VehicleWriteMode>,
    /// Records per row batch (falls back to `BATCH_SIZE`)
    #[arg(long)]
    batch_size: Option<usize>,
    /// Files processed concurrently (falls back to `MAX_WORKERS`)
    #[arg(long)]
    max_workers: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every `*.json.gz` file under a local directory
    Load {
        /// Directory to scan (falls back to `DATA_DIR`)
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Fetch and load new files from the MOT history API
    Delta {
        /// Also fetch full-dataset archives
        #[arg(long)]
        include_bulk: bool,
        /// Where downloads are kept (falls back to `DOWNLOAD_DIR`)
        #[arg(long)]
        download_dir: Option<PathBuf>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Reprocess every file the import ledger marks as failed
    Retry {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        download_dir: Option<PathBuf>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Show import ledger and table counts
    Status,
    /// Create the database schema and exit
    Init,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        let mut overrides = Overrides {
            database: self.database.clone(),
            pool_size: self.pool_size,
            ..Overrides::default()
        };

        let (data_dir, download_dir, run) = match &self.command {
            Commands::Load { data_dir, run } => (data_dir.clone(), None, Some(run)),
            Commands::Delta {
                download_dir, run, ..
            } => (None, download_dir.clone(), Some(run)),
            Commands::Retry {
                data_dir,
                download_dir,
                run,
            } => (data_dir.clone(), download_dir.clone(), Some(run)),
            Commands::Status | Commands::Init => (None, None, None),
        };

        overrides.data_dir = data_dir;
        overrides.download_dir = download_dir;
        if let Some(run) = run {
            overrides.batch_size = run.batch_size;
            overrides.max_workers = run.max_workers;
            overrides.strategy = run.strategy;
            overrides.mode = run.mode;
        }
        if matches!(self.command, Commands::Delta { .. }) && overrides.mode.is_none() {
            overrides.mode = Some(VehicleWriteMode::Delta);
        }

        overrides
    }
}

fn context(pool: DbPool, settings: &Settings, multi: &MultiProgress) -> Arc<PipelineContext> {
    let progress = IndicatifProgress::files_bar(multi, "Discovering files");
    Arc::new(
        PipelineContext::new(pool, settings.ingest)
            .with_work_dir(settings.download_dir.join(".work"))
            .with_progress(progress),
    )
}

fn print_status(pool: &DbPool) -> Result<(), Box<dyn std::error::Error>> {
    let conn = pool.get()?;

    println!("{:<12} FILES", "STATUS");
    println!("{}", "-".repeat(24));
    for (status, count) in ledger::counts_by_status(&conn)? {
        println!("{:<12} {count}", status.as_ref());
    }

    let failed = ledger::list_by_status(&conn, ImportStatus::Failed)?;
    if !failed.is_empty() {
        println!();
        println!("Failed files:");
        for name in failed {
            println!("  {name}");
        }
    }

    let counts = schema::table_counts(&conn)?;
    println!();
    println!("{:<12} ROWS", "TABLE");
    println!("{}", "-".repeat(24));
    println!("{:<12} {}", "vehicles", counts.vehicles);
    println!("{:<12} {}", "mot_tests", counts.mot_tests);
    println!("{:<12} {}", "defects", counts.defects);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let totals = summary.totals();
    println!(
        "Files: {} attempted, {} succeeded, {} failed, {} skipped",
        summary.attempted(),
        summary.succeeded(),
        summary.failed(),
        summary.skipped.len()
    );
    println!(
        "Vehicles: {} inserted, {} failed | Tests: {} inserted, {} failed | Defects: {} inserted, {} failed, {} orphaned",
        totals.vehicles.succeeded,
        totals.vehicles.failed,
        totals.tests.succeeded,
        totals.tests.failed,
        totals.defects.succeeded,
        totals.defects.failed,
        totals.defects_orphaned(),
    );
    for name in summary.failed_files() {
        println!("  FAILED    {name}");
    }
    for name in &summary.missing {
        println!("  MISSING   {name}");
    }
    for name in &summary.downloaded {
        println!("  FETCHED   {name}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = mot_loader_cli_utils::init_logger();
    let cli = Cli::parse();
    let settings = Settings::resolve(cli.overrides())?;

    let pool = open_pool(&settings.database, settings.pool_size)?;

    let summary = match cli.command {
        Commands::Init => {
            log::info!("Schema ready at {}", settings.database.display());
            return Ok(());
        }
        Commands::Status => {
            print_status(&pool)?;
            return Ok(());
        }
        Commands::Load { .. } => {
            let files = discover_local(&settings.data_dir)?;
            run_files(context(pool, &settings, &multi), files).await?
        }
        Commands::Retry { .. } => {
            let roots = vec![settings.data_dir.clone(), settings.download_dir.clone()];
            retry_failed(context(pool, &settings, &multi), &roots).await?
        }
        Commands::Delta { include_bulk, .. } => {
            let client = RemoteClient::new(Credentials::from_env()?)?;
            let options = DeltaOptions {
                include_bulk,
                download_dir: settings.download_dir.clone(),
            };
            run_delta(context(pool, &settings, &multi), &client, &options).await?
        }
    };

    print_summary(&summary);
    Ok(())
}
