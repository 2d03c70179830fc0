//! Per-file worker.
//!
//! Drives one file through `STARTED -> (COMPLETED | FAILED)`. Malformed
//! lines are logged and skipped; anything else that goes wrong stops this
//! file only and is reported through the returned [`FileOutcome`].

use std::path::Path;
use std::time::Instant;

use mot_loader_decoder::{DecodeError, decode_line, open_lines};
use mot_loader_ingest_models::{FileOutcome, FileStats, ImportStatus};

use crate::{IngestError, PipelineContext, strategy};

/// Ledger key of a local file: its base name.
#[must_use]
pub fn file_key(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |n| n.to_string_lossy().into_owned(),
    )
}

/// Processes one source file to a terminal ledger status.
///
/// Never returns an error: every failure is folded into the outcome and
/// recorded as [`ImportStatus::Failed`] in the ledger.
#[must_use]
pub fn process_file(ctx: &PipelineContext, path: &Path) -> FileOutcome {
    let start = Instant::now();
    let filename = file_key(path);
    let mut stats = FileStats::default();

    log::info!("[{filename}] processing");

    let (status, error) = match run(ctx, path, &filename, &mut stats) {
        Ok(()) => (ImportStatus::Completed, None),
        Err(e) => {
            log::error!("[{filename}] failed: {e}");
            if let Err(record_err) = ctx.record(&filename, ImportStatus::Failed) {
                log::error!("[{filename}] could not record FAILED: {record_err}");
            }
            (ImportStatus::Failed, Some(e.to_string()))
        }
    };

    let elapsed = start.elapsed();
    if status == ImportStatus::Completed {
        log::info!(
            "[{filename}] completed in {:.1}s: {} records ({} malformed, {} without registration), \
             vehicles {} written / {} skipped / {} failed, tests {} written / {} failed, \
             defects {} written / {} orphaned / {} failed",
            elapsed.as_secs_f64(),
            stats.records_decoded,
            stats.lines_malformed,
            stats.lines_missing_key,
            stats.vehicles.succeeded,
            stats.vehicles.skipped,
            stats.vehicles.failed,
            stats.tests.succeeded,
            stats.tests.failed,
            stats.defects.succeeded,
            stats.defects_orphaned(),
            stats.defects.failed,
        );
    }

    FileOutcome {
        filename,
        status,
        stats,
        error,
        elapsed,
    }
}

fn run(
    ctx: &PipelineContext,
    path: &Path,
    filename: &str,
    stats: &mut FileStats,
) -> Result<(), IngestError> {
    ctx.record(filename, ImportStatus::Started)?;

    let lines = open_lines(path)?;
    let mut sink = strategy::open(ctx, filename)?;

    for line in lines {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::error!(
                    "[{filename}] stream failed after line {}: {e}",
                    stats.lines_read
                );
                return Err(e.into());
            }
        };

        stats.lines_read += 1;
        if line.is_blank() {
            continue;
        }

        match decode_line(&line.bytes) {
            Ok(record) => {
                stats.records_decoded += 1;
                sink.push(record, stats)?;
            }
            Err(DecodeError::MissingKey) => {
                stats.lines_missing_key += 1;
                log::warn!(
                    "[{filename}] line {}: skipping record without registration",
                    line.number
                );
            }
            Err(e @ DecodeError::Malformed(_)) => {
                stats.lines_malformed += 1;
                log::warn!("[{filename}] line {}: {e}", line.number);
            }
        }
    }

    sink.finish(stats)?;
    ctx.record(filename, ImportStatus::Completed)?;
    Ok(())
}
