#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Ingestion configuration, ledger status, progress, and result types.

pub mod progress;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

pub use progress::{NullProgress, ProgressCallback, null_progress};

/// Default number of records per row batch.
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// Default number of files processed concurrently.
pub const DEFAULT_MAX_WORKERS: usize = 3;

/// Default number of pooled database connections.
pub const DEFAULT_POOL_SIZE: u32 = 20;

/// Lifecycle status of a source file in the import ledger.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportStatus {
    /// A worker has claimed the file; data may be partially written.
    Started,
    /// The file was fetched from the remote API but not yet loaded.
    Downloaded,
    /// Every record of the file is durably committed.
    Completed,
    /// Processing stopped with an error. Eligible for retry.
    Failed,
}

impl ImportStatus {
    /// Whether a file whose last status is `self` should be processed
    /// (again). Only [`ImportStatus::Completed`] is terminal.
    #[must_use]
    pub const fn is_eligible(self) -> bool {
        !matches!(self, Self::Completed)
    }
}

/// How records reach storage.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LoadStrategy {
    /// Fixed-size batches, one set-valued upsert per entity per batch.
    #[default]
    RowBatch,
    /// Whole-file CSV artifacts loaded in one transaction.
    BulkCopy,
}

/// Conflict handling for vehicle rows.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum VehicleWriteMode {
    /// Insert-only: vehicles already stored are skipped.
    #[default]
    Initial,
    /// Upsert: stored vehicles are refreshed from the incoming record.
    Delta,
}

/// Tuning and strategy selection for one ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Records per row batch. Ignored by [`LoadStrategy::BulkCopy`].
    pub batch_size: usize,
    /// Maximum number of files in flight.
    pub max_workers: usize,
    pub strategy: LoadStrategy,
    pub mode: VehicleWriteMode,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_workers: DEFAULT_MAX_WORKERS,
            strategy: LoadStrategy::default(),
            mode: VehicleWriteMode::default(),
        }
    }
}

/// Outcome counts of one write against one entity table.
///
/// `skipped` means "deliberately not written": existing vehicles in
/// initial mode, tests without a completed date, and defects whose parent
/// test could not be resolved (orphans).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCounts {
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl WriteCounts {
    /// Counts for a write that failed as a whole.
    #[must_use]
    pub const fn all_failed(n: u64) -> Self {
        Self {
            succeeded: 0,
            failed: n,
            skipped: 0,
        }
    }

    pub const fn merge(&mut self, other: Self) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// Per-file statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    /// Physical lines read from the stream, blank lines included.
    pub lines_read: u64,
    /// Lines that decoded to a vehicle record.
    pub records_decoded: u64,
    /// Lines skipped because they were not valid JSON.
    pub lines_malformed: u64,
    /// Lines skipped because the record had no registration.
    pub lines_missing_key: u64,
    pub vehicles: WriteCounts,
    pub tests: WriteCounts,
    /// `skipped` counts orphaned defects.
    pub defects: WriteCounts,
}

impl FileStats {
    /// Adds `other` into `self`.
    pub const fn merge(&mut self, other: &Self) {
        self.lines_read += other.lines_read;
        self.records_decoded += other.records_decoded;
        self.lines_malformed += other.lines_malformed;
        self.lines_missing_key += other.lines_missing_key;
        self.vehicles.merge(other.vehicles);
        self.tests.merge(other.tests);
        self.defects.merge(other.defects);
    }

    /// Defects dropped because their parent test was never resolved.
    #[must_use]
    pub const fn defects_orphaned(&self) -> u64 {
        self.defects.skipped
    }
}

/// Terminal result of one file worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    /// Ledger key (base name) of the file.
    pub filename: String,
    /// Either [`ImportStatus::Completed`] or [`ImportStatus::Failed`].
    pub status: ImportStatus,
    pub stats: FileStats,
    /// Error message when the file failed.
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl FileOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == ImportStatus::Completed
    }
}

/// Row counts of the entity tables after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub vehicles: u64,
    pub mot_tests: u64,
    pub defects: u64,
}

/// Aggregate of a coordinator run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// One entry per dispatched file, in completion order.
    pub outcomes: Vec<FileOutcome>,
    /// Candidates not dispatched because the ledger marks them completed.
    pub skipped: Vec<String>,
    /// Files fetched from the remote API during this run.
    pub downloaded: Vec<String>,
    /// Failed ledger entries with no file on disk (retry runs only).
    pub missing: Vec<String>,
    /// Entity row counts after the pool drained.
    pub table_counts: Option<TableCounts>,
    pub elapsed: Duration,
}

impl RunSummary {
    /// Number of files handed to a worker.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.attempted() - self.succeeded()
    }

    /// Names of files that reached [`ImportStatus::Completed`].
    #[must_use]
    pub fn completed_files(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.succeeded())
            .map(|o| o.filename.as_str())
            .collect()
    }

    /// Names of files that reached [`ImportStatus::Failed`].
    #[must_use]
    pub fn failed_files(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| o.filename.as_str())
            .collect()
    }

    /// Sum of all per-file statistics.
    #[must_use]
    pub fn totals(&self) -> FileStats {
        let mut totals = FileStats::default();
        for outcome in &self.outcomes {
            totals.merge(&outcome.stats);
        }
        totals
    }

    /// Folds another run (e.g. one archive's inner files) into this one.
    pub fn absorb(&mut self, other: Self) {
        self.outcomes.extend(other.outcomes);
        self.skipped.extend(other.skipped);
        self.downloaded.extend(other.downloaded);
        self.missing.extend(other.missing);
        if other.table_counts.is_some() {
            self.table_counts = other.table_counts;
        }
    }
}
