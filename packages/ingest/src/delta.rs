//! Remote delta flow: list, download, extract, load.
//!
//! Files are handled one at a time in listing order. Each download gets a
//! `DOWNLOADED` ledger entry under its own key before its contents run
//! through the coordinator.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use mot_loader_ingest_models::{FileOutcome, FileStats, ImportStatus, RunSummary};
use mot_loader_remote::download::download_file;
use mot_loader_remote::{FileListing, RemoteClient, RemoteFile, archive};

use crate::archive::ExtractedArchive;
use crate::{IngestError, PipelineContext, coordinator};

/// Options for one delta run.
#[derive(Debug, Clone)]
pub struct DeltaOptions {
    /// Also fetch full-dataset archives.
    pub include_bulk: bool,
    /// Where downloads are kept between runs.
    pub download_dir: PathBuf,
}

/// Listing entries still to be processed, plus the names passed over.
#[derive(Debug, Default)]
pub struct Selection<'a> {
    pub pending: Vec<&'a RemoteFile>,
    pub skipped: Vec<String>,
}

/// Picks the files to fetch: bulk archives only when requested, and
/// nothing whose ledger key is already completed.
///
/// # Errors
///
/// Returns [`IngestError::Db`] if the ledger cannot be read.
pub fn select<'a>(
    ctx: &PipelineContext,
    listing: &'a FileListing,
    include_bulk: bool,
) -> Result<Selection<'a>, IngestError> {
    let mut selection = Selection::default();

    if !include_bulk {
        for file in listing.bulk.iter().chain(listing.delta.iter().filter(|f| f.is_bulk())) {
            log::info!("[{}] skipping bulk file", file.ledger_key());
            selection.skipped.push(file.ledger_key().to_string());
        }
    }

    for file in listing.candidates(include_bulk) {
        let key = file.ledger_key();
        if selection.pending.iter().any(|p| p.ledger_key() == key) {
            continue;
        }
        match ctx.status_of(key)? {
            Some(status) if !status.is_eligible() => {
                log::info!("[{key}] skipping: already {status}");
                selection.skipped.push(key.to_string());
            }
            _ => selection.pending.push(file),
        }
    }

    Ok(selection)
}

/// Runs the full remote flow.
///
/// A failed download or archive marks that file FAILED and moves on.
///
/// # Errors
///
/// Returns [`IngestError`] if the token or listing cannot be fetched, or
/// the ledger cannot be written.
pub async fn run_delta(
    ctx: Arc<PipelineContext>,
    client: &RemoteClient,
    options: &DeltaOptions,
) -> Result<RunSummary, IngestError> {
    let start = Instant::now();
    let token = client.fetch_token().await?;
    let listing = client.list_files(&token).await?;

    let selection = select(&ctx, &listing, options.include_bulk)?;
    log::info!(
        "{} file(s) to fetch, {} skipped",
        selection.pending.len(),
        selection.skipped.len()
    );

    let mut summary = RunSummary {
        skipped: selection.skipped,
        ..RunSummary::default()
    };

    for file in selection.pending {
        let key = file.ledger_key().to_string();
        let dest = options.download_dir.join(&key);

        if dest.is_file() {
            log::info!("[{key}] already downloaded");
        } else {
            let started = Instant::now();
            if let Err(e) = download_file(client.http(), &file.download_url, &dest).await {
                log::error!("[{key}] download failed: {e}");
                ctx.record(&key, ImportStatus::Failed)?;
                summary.outcomes.push(failed_outcome(&key, &e, started));
                continue;
            }
            summary.downloaded.push(key.clone());
        }
        ctx.record(&key, ImportStatus::Downloaded)?;

        let started = Instant::now();
        match load_download(&ctx, &dest).await {
            Ok(run) => summary.absorb(run),
            Err(e) => {
                log::error!("[{key}] failed: {e}");
                ctx.record(&key, ImportStatus::Failed)?;
                summary.outcomes.push(failed_outcome(&key, &e, started));
            }
        }
    }

    summary.elapsed = start.elapsed();
    log::info!(
        "Delta run finished in {:.1}s: {} downloaded, {} skipped, {} succeeded, {} failed",
        summary.elapsed.as_secs_f64(),
        summary.downloaded.len(),
        summary.skipped.len(),
        summary.succeeded(),
        summary.failed(),
    );
    Ok(summary)
}

/// Loads one downloaded file: a zip archive is extracted and its inner
/// files run; anything else runs as a single source file.
async fn load_download(
    ctx: &Arc<PipelineContext>,
    path: &Path,
) -> Result<RunSummary, IngestError> {
    if !archive::is_zip(path)? {
        return coordinator::run_files(Arc::clone(ctx), vec![path.to_path_buf()]).await;
    }

    let zip_path = path.to_path_buf();
    let parent = ctx.work_dir().map(Path::to_path_buf);
    let extracted = tokio::task::spawn_blocking(move || {
        ExtractedArchive::extract(&zip_path, parent.as_deref())
    })
    .await??;

    let run = coordinator::run_files(Arc::clone(ctx), extracted.inputs().to_vec()).await?;
    extracted.settle(ctx, &run)?;
    Ok(run)
}

fn failed_outcome(key: &str, error: &dyn std::fmt::Display, started: Instant) -> FileOutcome {
    FileOutcome {
        filename: key.to_string(),
        status: ImportStatus::Failed,
        stats: FileStats::default(),
        error: Some(error.to_string()),
        elapsed: started.elapsed(),
    }
}
