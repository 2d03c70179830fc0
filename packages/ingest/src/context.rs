//! Shared state handed to every pipeline component.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mot_loader_database::{DbError, DbPool, PooledConn, ledger};
use mot_loader_ingest_models::{ImportStatus, IngestConfig, ProgressCallback, null_progress};

/// Connection pool, run configuration, and progress sink for one run.
///
/// Wrapped in an [`Arc`] and cloned into each worker task.
///
/// Workers decode and stage in parallel but write to storage one at a
/// time through [`PipelineContext::write_lock`]: `DuckDB` aborts
/// concurrent transactions that touch the same keys, and files routinely
/// share registrations.
#[derive(Clone)]
pub struct PipelineContext {
    pub pool: DbPool,
    writer: Arc<Mutex<()>>,
    pub config: IngestConfig,
    /// Parent directory for bulk-copy artifacts and extracted archives.
    /// `None` uses the system temp directory.
    pub work_dir: Option<PathBuf>,
    pub progress: Arc<dyn ProgressCallback>,
}

impl PipelineContext {
    #[must_use]
    pub fn new(pool: DbPool, config: IngestConfig) -> Self {
        Self {
            pool,
            writer: Arc::new(Mutex::new(())),
            config,
            work_dir: None,
            progress: null_progress(),
        }
    }

    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    /// Checks a connection out of the pool.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Pool`] if no connection becomes available.
    pub fn conn(&self) -> Result<PooledConn, DbError> {
        Ok(self.pool.get()?)
    }

    /// Takes the storage write lock, shared by every clone of this
    /// context. Hold it for the duration of one batch or one bulk load.
    pub fn write_lock(&self) -> MutexGuard<'_, ()> {
        // Guards `()`: poisoning leaves no state to repair.
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a ledger transition on a freshly checked-out connection.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if no connection is available or the upsert
    /// fails.
    pub fn record(&self, filename: &str, status: ImportStatus) -> Result<(), DbError> {
        let conn = self.conn()?;
        ledger::record_transition(&conn, filename, status)
    }

    /// Current ledger status of `filename`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lookup fails.
    pub fn status_of(&self, filename: &str) -> Result<Option<ImportStatus>, DbError> {
        let conn = self.conn()?;
        Ok(ledger::status_of(&conn, filename)?.map(|entry| entry.status))
    }
}
