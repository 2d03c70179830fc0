//! Insertion strategies.
//!
//! Both strategies consume one file's decoded records through the same
//! [`InsertionStrategy`] contract. Each instance is owned by a single
//! worker and lives for exactly one file.

use mot_loader_database::bulk_copy::{self, BulkArtifacts};
use mot_loader_database::row_batch;
use mot_loader_ingest_models::{FileStats, LoadStrategy};
use mot_loader_vehicle_models::VehicleRecord;

use crate::{IngestError, PipelineContext};

/// Sink for the decoded records of one file.
pub trait InsertionStrategy {
    /// Accepts one record. May write to storage.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] on a failure that must stop the file.
    fn push(&mut self, record: VehicleRecord, stats: &mut FileStats) -> Result<(), IngestError>;

    /// Writes everything still pending. The file may be marked completed
    /// only after this returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] on a failure that must stop the file.
    fn finish(self: Box<Self>, stats: &mut FileStats) -> Result<(), IngestError>;
}

/// Creates the configured strategy for one file.
///
/// # Errors
///
/// Returns [`IngestError`] if the strategy cannot allocate its staging
/// resources.
pub fn open<'a>(
    ctx: &'a PipelineContext,
    filename: &str,
) -> Result<Box<dyn InsertionStrategy + 'a>, IngestError> {
    Ok(match ctx.config.strategy {
        LoadStrategy::RowBatch => Box::new(RowBatch::new(ctx, filename)),
        LoadStrategy::BulkCopy => Box::new(BulkCopy::new(ctx, filename)?),
    })
}

/// Buffers records and writes them in fixed-size batches.
///
/// Each batch takes the context's write lock, checks out one pooled
/// connection, and writes vehicles, then tests, then defects, so a defect's parent row is always committed
/// before the defect's lookup runs. Statement failures are counted in
/// the file's stats; only a pool failure stops the file.
pub struct RowBatch<'a> {
    ctx: &'a PipelineContext,
    filename: String,
    buffer: Vec<VehicleRecord>,
    batches: u64,
}

impl<'a> RowBatch<'a> {
    #[must_use]
    pub fn new(ctx: &'a PipelineContext, filename: &str) -> Self {
        let batch_size = ctx.config.batch_size.max(1);
        Self {
            ctx,
            filename: filename.to_string(),
            buffer: Vec::with_capacity(batch_size),
            batches: 0,
        }
    }

    fn flush(&mut self, stats: &mut FileStats) -> Result<(), IngestError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let writing = self.ctx.write_lock();
        let conn = self.ctx.conn()?;
        let vehicles = row_batch::upsert_vehicles(&conn, &self.buffer, self.ctx.config.mode);
        let tests = row_batch::upsert_tests(&conn, &self.buffer);
        let defects = row_batch::upsert_defects(&conn, &self.buffer);
        drop(conn);
        drop(writing);

        self.batches += 1;
        log::debug!(
            "[{}] batch {}: {} records, vehicles {}/{} written, tests {}, defects {} ({} orphaned)",
            self.filename,
            self.batches,
            self.buffer.len(),
            vehicles.succeeded,
            vehicles.succeeded + vehicles.failed + vehicles.skipped,
            tests.succeeded,
            defects.succeeded,
            defects.skipped,
        );

        stats.vehicles.merge(vehicles);
        stats.tests.merge(tests);
        stats.defects.merge(defects);
        self.buffer.clear();
        Ok(())
    }
}

impl InsertionStrategy for RowBatch<'_> {
    fn push(&mut self, record: VehicleRecord, stats: &mut FileStats) -> Result<(), IngestError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.ctx.config.batch_size.max(1) {
            self.flush(stats)?;
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>, stats: &mut FileStats) -> Result<(), IngestError> {
        self.flush(stats)
    }
}

/// Stages the whole file as CSV artifacts and loads them in one
/// transaction at the end.
///
/// Any failure rolls the file back entirely.
pub struct BulkCopy<'a> {
    ctx: &'a PipelineContext,
    filename: String,
    artifacts: BulkArtifacts,
}

impl<'a> BulkCopy<'a> {
    /// # Errors
    ///
    /// Returns [`IngestError::Db`] if the artifact directory cannot be
    /// created.
    pub fn new(ctx: &'a PipelineContext, filename: &str) -> Result<Self, IngestError> {
        let artifacts = BulkArtifacts::create(ctx.work_dir())?;
        log::debug!(
            "[{filename}] staging artifacts in {}",
            artifacts.dir().display()
        );
        Ok(Self {
            ctx,
            filename: filename.to_string(),
            artifacts,
        })
    }
}

impl InsertionStrategy for BulkCopy<'_> {
    fn push(&mut self, record: VehicleRecord, _stats: &mut FileStats) -> Result<(), IngestError> {
        self.artifacts.push(&record)?;
        Ok(())
    }

    fn finish(self: Box<Self>, stats: &mut FileStats) -> Result<(), IngestError> {
        let Self {
            ctx,
            filename,
            artifacts,
        } = *self;

        let staged = artifacts.staged();
        log::info!(
            "[{filename}] bulk loading {} vehicles, {} tests, {} defects",
            staged.vehicles,
            staged.tests,
            staged.defects,
        );

        let counts = {
            let _writing = ctx.write_lock();
            let mut conn = ctx.conn()?;
            bulk_copy::load(&mut conn, artifacts, ctx.config.mode)?
        };

        stats.vehicles.merge(counts.vehicles);
        stats.tests.merge(counts.tests);
        stats.defects.merge(counts.defects);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mot_loader_database::schema::table_counts;
    use mot_loader_ingest_models::{TableCounts, VehicleWriteMode};

    use super::*;
    use crate::test_support::{context, record};

    fn feed(ctx: &PipelineContext, records: Vec<VehicleRecord>) -> FileStats {
        let mut stats = FileStats::default();
        let mut strategy = open(ctx, "test.json.gz").unwrap();
        for r in records {
            strategy.push(r, &mut stats).unwrap();
        }
        strategy.finish(&mut stats).unwrap();
        stats
    }

    fn records() -> Vec<VehicleRecord> {
        (0..7)
            .map(|i| record(&format!("REG{i}"), &[("2024-01-02 10:00:00", 2)]))
            .collect()
    }

    #[test]
    fn row_batch_flushes_partial_final_batch() {
        let (_dir, ctx) = context(LoadStrategy::RowBatch, 3);
        let stats = feed(&ctx, records());

        assert_eq!(stats.vehicles.succeeded, 7);
        assert_eq!(stats.tests.succeeded, 7);
        assert_eq!(stats.defects.succeeded, 14);

        let conn = ctx.conn().unwrap();
        assert_eq!(
            table_counts(&conn).unwrap(),
            TableCounts {
                vehicles: 7,
                mot_tests: 7,
                defects: 14,
            }
        );
    }

    #[test]
    fn strategies_produce_the_same_rows() {
        let (_a, row_ctx) = context(LoadStrategy::RowBatch, 2);
        let (_b, bulk_ctx) = context(LoadStrategy::BulkCopy, 2);

        let row_stats = feed(&row_ctx, records());
        let bulk_stats = feed(&bulk_ctx, records());

        assert_eq!(row_stats.vehicles.succeeded, bulk_stats.vehicles.succeeded);
        assert_eq!(row_stats.defects.succeeded, bulk_stats.defects.succeeded);
        assert_eq!(
            table_counts(&row_ctx.conn().unwrap()).unwrap(),
            table_counts(&bulk_ctx.conn().unwrap()).unwrap()
        );
    }

    #[test]
    fn delta_mode_refreshes_vehicles_in_both_strategies() {
        for strategy in [LoadStrategy::RowBatch, LoadStrategy::BulkCopy] {
            let (_dir, mut ctx) = context(strategy, 10);
            feed(&ctx, vec![record("AB1", &[])]);

            ctx.config.mode = VehicleWriteMode::Delta;
            let mut updated = record("AB1", &[]);
            updated.make = Some("UPDATED".to_string());
            feed(&ctx, vec![updated]);

            let conn = ctx.conn().unwrap();
            let make: String = conn
                .query_row("SELECT make FROM vehicles WHERE registration = 'AB1'", [], |r| {
                    r.get(0)
                })
                .unwrap();
            assert_eq!(make, "UPDATED", "{strategy}");
        }
    }
}
