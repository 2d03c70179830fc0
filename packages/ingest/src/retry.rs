//! Re-runs every file the ledger marks failed.
//!
//! Failed names are located by base name under the search roots
//! (recursively). Zip archives are extracted again and their inner files
//! rerun; the archive key is then settled from the inner outcomes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use mot_loader_database::ledger;
use mot_loader_ingest_models::{ImportStatus, RunSummary};
use mot_loader_remote::archive;

use crate::archive::ExtractedArchive;
use crate::{IngestError, PipelineContext, coordinator};

/// Resubmits all FAILED files found under `roots`.
///
/// Names with no file on disk are listed in [`RunSummary::missing`].
///
/// # Errors
///
/// Returns [`IngestError`] for setup failures: the ledger cannot be read,
/// a search root cannot be scanned, or an archive cannot be extracted.
pub async fn retry_failed(
    ctx: Arc<PipelineContext>,
    roots: &[PathBuf],
) -> Result<RunSummary, IngestError> {
    let failed = {
        let conn = ctx.conn()?;
        ledger::list_by_status(&conn, ImportStatus::Failed)?
    };

    if failed.is_empty() {
        log::info!("No failed files to retry");
        return Ok(RunSummary::default());
    }
    log::info!("Retrying {} failed file(s)", failed.len());

    let roots: Vec<&Path> = roots.iter().map(PathBuf::as_path).collect();
    let mut inputs = Vec::new();
    let mut archives = Vec::new();
    let mut not_found = Vec::new();

    for name in failed {
        match archive::find_by_name(&roots, &name)? {
            None => not_found.push(name),
            Some(path) if archive::is_zip(&path)? => {
                let parent = ctx.work_dir().map(Path::to_path_buf);
                let extracted = tokio::task::spawn_blocking(move || {
                    ExtractedArchive::extract(&path, parent.as_deref())
                })
                .await??;
                inputs.extend(extracted.inputs().iter().cloned());
                archives.push(extracted);
            }
            Some(path) => {
                log::info!("[{name}] found at {}", path.display());
                inputs.push(path);
            }
        }
    }

    // Inner files of a re-extracted archive are not on disk between runs.
    let missing: Vec<String> = not_found
        .into_iter()
        .filter(|name| !archives.iter().any(|a| a.inner_keys().contains(name)))
        .collect();
    for name in &missing {
        log::warn!("[{name}] not found under any search root");
    }

    let mut summary = coordinator::run_files(Arc::clone(&ctx), inputs).await?;
    for extracted in archives {
        extracted.settle(&ctx, &summary)?;
    }
    summary.missing = missing;

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use mot_loader_ingest_models::LoadStrategy;

    use super::*;
    use crate::test_support::{context, lines, write_gz, write_truncated_gz};

    fn shared() -> (tempfile::TempDir, Arc<PipelineContext>) {
        let (dir, ctx) = context(LoadStrategy::RowBatch, 25);
        (dir, Arc::new(ctx))
    }

    fn failed_names(ctx: &PipelineContext) -> Vec<String> {
        ledger::list_by_status(&ctx.conn().unwrap(), ImportStatus::Failed).unwrap()
    }

    #[tokio::test]
    async fn repaired_file_converges_to_completed() {
        let (dir, ctx) = shared();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        let path = data.join("flaky.json.gz");

        write_truncated_gz(&path, &lines("F", 400));
        let first = coordinator::run_files(Arc::clone(&ctx), vec![path.clone()])
            .await
            .unwrap();
        assert_eq!(first.failed(), 1);
        assert_eq!(failed_names(&ctx), vec!["flaky.json.gz"]);

        write_gz(&path, &lines("F", 400));
        let summary = retry_failed(Arc::clone(&ctx), &[data]).await.unwrap();

        assert_eq!(summary.succeeded(), 1);
        assert!(summary.missing.is_empty());
        assert!(failed_names(&ctx).is_empty());
        assert_eq!(
            ctx.status_of("flaky.json.gz").unwrap(),
            Some(ImportStatus::Completed)
        );
        assert_eq!(summary.table_counts.unwrap().vehicles, 400);
    }

    #[tokio::test]
    async fn reports_missing_files() {
        let (dir, ctx) = shared();
        ctx.record("gone.json.gz", ImportStatus::Failed).unwrap();

        let summary = retry_failed(Arc::clone(&ctx), &[dir.path().to_path_buf()])
            .await
            .unwrap();

        assert_eq!(summary.attempted(), 0);
        assert_eq!(summary.missing, vec!["gone.json.gz"]);
        assert_eq!(failed_names(&ctx), vec!["gone.json.gz"]);
    }

    #[tokio::test]
    async fn failed_archive_is_extracted_and_settled() {
        let (dir, ctx) = shared();
        let downloads = dir.path().join("downloads");
        std::fs::create_dir_all(&downloads).unwrap();

        let inner = dir.path().join("inner.json.gz");
        write_gz(&inner, &lines("Z", 15));
        let zip_path = downloads.join("delta-9.zip");
        let mut zip_writer = zip::ZipWriter::new(std::fs::File::create(&zip_path).unwrap());
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        zip_writer.start_file("inner.json.gz", options).unwrap();
        zip_writer.write_all(&std::fs::read(&inner).unwrap()).unwrap();
        zip_writer.finish().unwrap();
        std::fs::remove_file(&inner).unwrap();

        ctx.record("delta-9.zip", ImportStatus::Failed).unwrap();
        ctx.record("inner.json.gz", ImportStatus::Failed).unwrap();

        let summary = retry_failed(Arc::clone(&ctx), &[downloads]).await.unwrap();

        assert_eq!(summary.completed_files(), vec!["inner.json.gz"]);
        assert!(summary.missing.is_empty());
        assert_eq!(
            ctx.status_of("delta-9.zip").unwrap(),
            Some(ImportStatus::Completed)
        );
        assert!(failed_names(&ctx).is_empty());
    }
}
