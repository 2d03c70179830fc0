//! Ingestion coordinator.
//!
//! Filters candidate files through the ledger, suspends secondary indexes,
//! runs up to `max_workers` file workers at a time on the blocking pool,
//! rebuilds the indexes, and aggregates the outcomes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt as _;
use mot_loader_database::{DbError, DbPool, schema};
use mot_loader_ingest_models::{FileOutcome, FileStats, ImportStatus, RunSummary};
use mot_loader_remote::archive;

use crate::worker::{self, file_key};
use crate::{IngestError, PipelineContext};

/// Lists the `*.json.gz` files under `dir`, sorted by path.
///
/// # Errors
///
/// Returns [`IngestError`] if the directory cannot be read.
pub fn discover_local(dir: &Path) -> Result<Vec<PathBuf>, IngestError> {
    let files = archive::find_json_gz(dir)?;
    log::info!("Found {} source file(s) in {}", files.len(), dir.display());
    Ok(files)
}

/// Splits `paths` into files to process and the names of files the ledger
/// already marks completed.
///
/// # Errors
///
/// Returns [`IngestError::Db`] if the ledger cannot be read.
pub fn partition_eligible(
    ctx: &PipelineContext,
    paths: Vec<PathBuf>,
) -> Result<(Vec<PathBuf>, Vec<String>), IngestError> {
    let mut eligible = Vec::new();
    let mut skipped = Vec::new();

    for path in paths {
        let key = file_key(&path);
        if eligible.iter().any(|p: &PathBuf| file_key(p) == key) {
            log::warn!("Ignoring duplicate file name {key} at {}", path.display());
            continue;
        }
        match ctx.status_of(&key)? {
            Some(status) if !status.is_eligible() => {
                log::info!("Skipping {key}: already {status}");
                skipped.push(key);
            }
            _ => eligible.push(path),
        }
    }

    Ok((eligible, skipped))
}

/// Secondary indexes dropped for the lifetime of a worker pool.
///
/// [`IndexSuspension::restore`] rebuilds them. If the guard is dropped
/// without that call, the rebuild happens in `Drop`. Either way it runs
/// exactly once.
pub struct IndexSuspension {
    pool: DbPool,
    restored: bool,
}

impl IndexSuspension {
    /// Drops the secondary indexes.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the indexes cannot be dropped.
    pub fn begin(pool: DbPool) -> Result<Self, DbError> {
        let conn = pool.get()?;
        schema::suspend_indexes(&conn)?;
        drop(conn);
        Ok(Self {
            pool,
            restored: false,
        })
    }

    fn rebuild(&mut self) -> Result<(), DbError> {
        self.restored = true;
        let start = Instant::now();
        let conn = self.pool.get()?;
        schema::restore_indexes(&conn)?;
        log::info!(
            "Secondary indexes rebuilt in {:.1}s",
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Rebuilds the indexes.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the rebuild fails. It is not attempted again.
    pub fn restore(mut self) -> Result<(), DbError> {
        self.rebuild()
    }
}

impl Drop for IndexSuspension {
    fn drop(&mut self) {
        if !self.restored
            && let Err(e) = self.rebuild()
        {
            log::error!("Failed to rebuild secondary indexes: {e}");
        }
    }
}

/// Runs the eligible subset of `paths` through the worker pool.
///
/// Per-file failures are reported in the summary, never as an error.
///
/// # Errors
///
/// Returns [`IngestError`] only for setup failures: the ledger cannot be
/// read or the indexes cannot be suspended.
pub async fn run_files(
    ctx: Arc<PipelineContext>,
    paths: Vec<PathBuf>,
) -> Result<RunSummary, IngestError> {
    let start = Instant::now();
    let (eligible, skipped) = partition_eligible(&ctx, paths)?;

    let mut summary = RunSummary {
        skipped,
        ..RunSummary::default()
    };

    if eligible.is_empty() {
        log::info!("No eligible files to process");
    } else {
        log::info!(
            "Processing {} file(s) with up to {} worker(s) ({} strategy, {} mode)",
            eligible.len(),
            ctx.config.max_workers,
            ctx.config.strategy,
            ctx.config.mode,
        );
        ctx.progress.set_total(eligible.len() as u64);

        let suspension = IndexSuspension::begin(ctx.pool.clone())?;

        summary.outcomes = futures::stream::iter(eligible)
            .map(|path| dispatch(Arc::clone(&ctx), path))
            .buffer_unordered(ctx.config.max_workers.max(1))
            .collect()
            .await;

        if let Err(e) = suspension.restore() {
            log::error!("Failed to rebuild secondary indexes: {e}");
        }
    }

    summary.table_counts = match ctx.conn().and_then(|conn| schema::table_counts(&conn)) {
        Ok(counts) => Some(counts),
        Err(e) => {
            log::warn!("Could not count table rows: {e}");
            None
        }
    };
    summary.elapsed = start.elapsed();

    log_summary(&summary);
    ctx.progress.finish(format!(
        "{} succeeded, {} failed",
        summary.succeeded(),
        summary.failed()
    ));

    Ok(summary)
}

async fn dispatch(ctx: Arc<PipelineContext>, path: PathBuf) -> FileOutcome {
    let start = Instant::now();
    let filename = file_key(&path);
    let worker_ctx = Arc::clone(&ctx);

    let outcome =
        match tokio::task::spawn_blocking(move || worker::process_file(&worker_ctx, &path)).await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("[{filename}] worker aborted: {e}");
                if let Err(record_err) = ctx.record(&filename, ImportStatus::Failed) {
                    log::error!("[{filename}] could not record FAILED: {record_err}");
                }
                FileOutcome {
                    filename,
                    status: ImportStatus::Failed,
                    stats: FileStats::default(),
                    error: Some(e.to_string()),
                    elapsed: start.elapsed(),
                }
            }
        };

    ctx.progress.inc(1);
    ctx.progress.set_message(outcome.filename.clone());
    outcome
}

/// Logs the end-of-run report.
pub fn log_summary(summary: &RunSummary) {
    let totals = summary.totals();

    log::info!(
        "Run finished in {:.1}s: {} attempted, {} succeeded, {} failed, {} skipped",
        summary.elapsed.as_secs_f64(),
        summary.attempted(),
        summary.succeeded(),
        summary.failed(),
        summary.skipped.len(),
    );
    log::info!(
        "  records: {} decoded, {} malformed, {} without registration",
        totals.records_decoded,
        totals.lines_malformed,
        totals.lines_missing_key,
    );
    log::info!(
        "  vehicles: {} written, {} skipped, {} failed",
        totals.vehicles.succeeded,
        totals.vehicles.skipped,
        totals.vehicles.failed,
    );
    log::info!(
        "  tests: {} written, {} skipped, {} failed",
        totals.tests.succeeded,
        totals.tests.skipped,
        totals.tests.failed,
    );
    log::info!(
        "  defects: {} written, {} orphaned, {} failed",
        totals.defects.succeeded,
        totals.defects_orphaned(),
        totals.defects.failed,
    );

    if let Some(counts) = summary.table_counts {
        log::info!(
            "  table rows: {} vehicles, {} tests, {} defects",
            counts.vehicles,
            counts.mot_tests,
            counts.defects,
        );
    }

    for name in summary.completed_files() {
        log::debug!("  completed: {name}");
    }
    for outcome in summary.outcomes.iter().filter(|o| !o.succeeded()) {
        log::warn!(
            "  failed: {} ({})",
            outcome.filename,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    for name in &summary.missing {
        log::warn!("  missing: {name}");
    }
}
