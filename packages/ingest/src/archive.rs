//! Zip archives as pipeline inputs.
//!
//! A downloaded archive has its own ledger key next to the keys of the
//! `.json.gz` files inside it. The archive is settled after its inner
//! files have run: completed when all of them completed, failed otherwise.

use std::path::{Path, PathBuf};

use mot_loader_ingest_models::{ImportStatus, RunSummary};
use mot_loader_remote::archive;
use tempfile::TempDir;

use crate::worker::file_key;
use crate::{IngestError, PipelineContext};

/// An archive unpacked into a temporary directory.
///
/// The directory is removed when this value is dropped.
pub struct ExtractedArchive {
    key: String,
    dir: TempDir,
    inputs: Vec<PathBuf>,
}

impl ExtractedArchive {
    /// Extracts `zip_path` into a new temporary directory under `parent`
    /// (or the system temp directory) and collects its `.json.gz` files.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] if the directory cannot be created or the
    /// archive cannot be read.
    pub fn extract(zip_path: &Path, parent: Option<&Path>) -> Result<Self, IngestError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("mot-extract-");
        let dir = match parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };

        archive::extract_zip(zip_path, dir.path())?;
        let inputs = archive::find_json_gz(dir.path())?;
        if inputs.is_empty() {
            log::warn!("{} contains no .json.gz files", zip_path.display());
        }

        Ok(Self {
            key: file_key(zip_path),
            dir,
            inputs,
        })
    }

    /// Ledger key of the archive itself.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// The extracted `.json.gz` files, sorted.
    #[must_use]
    pub fn inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    /// Ledger keys of the extracted files.
    #[must_use]
    pub fn inner_keys(&self) -> Vec<String> {
        self.inputs.iter().map(|p| file_key(p)).collect()
    }

    /// Status the archive earns from a run over its inputs.
    ///
    /// Inner files skipped as already completed count as completed.
    #[must_use]
    pub fn status_after(&self, summary: &RunSummary) -> ImportStatus {
        let completed = summary.completed_files();
        let all_done = self.inner_keys().iter().all(|key| {
            completed.contains(&key.as_str()) || summary.skipped.iter().any(|s| s == key)
        });
        if all_done {
            ImportStatus::Completed
        } else {
            ImportStatus::Failed
        }
    }

    /// Records the archive's terminal status and removes the extracted
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Db`] if the ledger write fails.
    pub fn settle(self, ctx: &PipelineContext, summary: &RunSummary) -> Result<ImportStatus, IngestError> {
        let status = self.status_after(summary);
        ctx.record(&self.key, status)?;
        log::info!("[{}] archive {status}", self.key);
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use mot_loader_ingest_models::{FileOutcome, FileStats};

    use super::*;

    fn write_zip(path: &Path, names: &[&str]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip_writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for name in names {
            zip_writer.start_file(*name, options).unwrap();
            zip_writer.write_all(b"payload").unwrap();
        }
        zip_writer.finish().unwrap();
    }

    fn outcome(name: &str, status: ImportStatus) -> FileOutcome {
        FileOutcome {
            filename: name.to_string(),
            status,
            stats: FileStats::default(),
            error: None,
            elapsed: std::time::Duration::ZERO,
        }
    }

    #[test]
    fn extracts_inputs_and_cleans_up_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("delta-1.zip");
        write_zip(&zip_path, &["b.json.gz", "a.json.gz", "notes.txt"]);

        let extracted = ExtractedArchive::extract(&zip_path, Some(tmp.path())).unwrap();
        assert_eq!(extracted.key(), "delta-1.zip");
        assert_eq!(extracted.inner_keys(), vec!["a.json.gz", "b.json.gz"]);

        let dir = extracted.dir().to_path_buf();
        assert!(dir.exists());
        drop(extracted);
        assert!(!dir.exists());
    }

    #[test]
    fn archive_completes_only_when_every_inner_file_does() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("delta-2.zip");
        write_zip(&zip_path, &["a.json.gz", "b.json.gz"]);
        let extracted = ExtractedArchive::extract(&zip_path, None).unwrap();

        let partial = RunSummary {
            outcomes: vec![
                outcome("a.json.gz", ImportStatus::Completed),
                outcome("b.json.gz", ImportStatus::Failed),
            ],
            ..RunSummary::default()
        };
        assert_eq!(extracted.status_after(&partial), ImportStatus::Failed);

        let done = RunSummary {
            outcomes: vec![outcome("a.json.gz", ImportStatus::Completed)],
            skipped: vec!["b.json.gz".to_string()],
            ..RunSummary::default()
        };
        assert_eq!(extracted.status_after(&done), ImportStatus::Completed);
    }
}
