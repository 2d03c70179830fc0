//! Set-based bulk loading through CSV artifacts.
//!
//! A whole file's records are streamed into three headerless CSV files
//! (vehicles, tests, defects) inside a temporary directory. Defect rows
//! carry their parent test's natural key `(registration, completed_date)`
//! because no test id exists yet. [`load`] then runs one transaction:
//!
//! 1. `INSERT ... SELECT FROM read_csv(...)` for vehicles and tests, each
//!    deduplicated on its natural key (last row wins)
//! 2. `COPY` the defects artifact into a temporary staging table
//! 3. join the staged defects to `mot_tests` on the natural key and upsert
//!    the resolved rows into `defects`
//! 4. drop the staging table and commit
//!
//! Any failure rolls the whole file back. The temporary directory is
//! removed when the [`BulkArtifacts`] value is dropped, on every path.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use duckdb::Connection;
use mot_loader_ingest_models::{VehicleWriteMode, WriteCounts};
use mot_loader_vehicle_models::VehicleRecord;
use tempfile::TempDir;

use crate::DbError;

const VEHICLE_COLUMNS: &str = "{'seq': 'BIGINT', 'registration': 'VARCHAR', \
    'first_used_date': 'TIMESTAMP', 'registration_date': 'TIMESTAMP', \
    'manufacture_date': 'TIMESTAMP', 'primary_colour': 'VARCHAR', \
    'secondary_colour': 'VARCHAR', 'engine_size': 'BIGINT', 'model': 'VARCHAR', \
    'make': 'VARCHAR', 'fuel_type': 'VARCHAR', 'last_mot_test_date': 'TIMESTAMP', \
    'last_update_timestamp': 'TIMESTAMP', 'data_source': 'VARCHAR', \
    'last_update_date': 'TIMESTAMP', 'modification': 'VARCHAR'}";

const TEST_COLUMNS: &str = "{'seq': 'BIGINT', 'registration': 'VARCHAR', \
    'completed_date': 'TIMESTAMP', 'expiry_date': 'TIMESTAMP', \
    'test_result': 'VARCHAR', 'odometer_value': 'BIGINT', \
    'odometer_unit': 'VARCHAR', 'odometer_result_type': 'VARCHAR'}";

/// Dialect of every artifact, as `read_csv` named parameters. The column
/// list is always explicit, so nothing is sniffed.
const CSV_OPTIONS: &str = "header = false, auto_detect = false, delim = ',', quote = '\"', \
    escape = '\"', timestampformat = '%Y-%m-%d %H:%M:%S'";

/// The same dialect as `COPY` options.
const COPY_OPTIONS: &str = "FORMAT csv, HEADER false, DELIMITER ',', QUOTE '\"', ESCAPE '\"', \
    TIMESTAMPFORMAT '%Y-%m-%d %H:%M:%S'";

type CsvWriter = csv::Writer<BufWriter<File>>;

fn csv_writer(path: &Path) -> Result<CsvWriter, DbError> {
    Ok(csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(BufWriter::new(File::create(path)?)))
}

/// Quotes a path as a SQL string literal.
fn sql_path(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', "''"))
}

fn to_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// Counts gathered while staging, before anything touches the database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagedCounts {
    pub vehicles: u64,
    pub tests: u64,
    /// Tests without a completed date; never staged.
    pub tests_undated: u64,
    pub defects: u64,
    /// Defects under undated tests; never staged.
    pub defects_unkeyed: u64,
}

/// Write results of one [`load`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkLoadCounts {
    pub vehicles: WriteCounts,
    pub tests: WriteCounts,
    /// `skipped` holds defects that did not join to a stored test.
    pub defects: WriteCounts,
}

/// The three CSV artifacts of one source file.
pub struct BulkArtifacts {
    dir: TempDir,
    vehicles: CsvWriter,
    tests: CsvWriter,
    defects: CsvWriter,
    seq: i64,
    staged: StagedCounts,
}

impl BulkArtifacts {
    /// Creates empty artifacts in a fresh temporary directory under
    /// `parent`, or under the system temp directory when `None`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the directory or files cannot be created.
    pub fn create(parent: Option<&Path>) -> Result<Self, DbError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("mot-bulk-");
        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };

        Ok(Self {
            vehicles: csv_writer(&dir.path().join("vehicles.csv"))?,
            tests: csv_writer(&dir.path().join("tests.csv"))?,
            defects: csv_writer(&dir.path().join("defects.csv"))?,
            dir,
            seq: 0,
            staged: StagedCounts::default(),
        })
    }

    /// Directory holding the artifacts.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    #[must_use]
    pub const fn staged(&self) -> StagedCounts {
        self.staged
    }

    /// Appends one vehicle, its tests, and their defects.
    ///
    /// Every vehicle row and every test row gets its own `seq`, rising in
    /// file order; defects carry their test's. Deduplication keeps the
    /// highest `seq` per key.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if an artifact write fails.
    pub fn push(&mut self, v: &VehicleRecord) -> Result<(), DbError> {
        let seq = self.next_seq();
        self.vehicles.serialize((
            seq,
            &v.registration,
            v.first_used_date.as_deref(),
            v.registration_date.as_deref(),
            v.manufacture_date.as_deref(),
            v.primary_colour.as_deref(),
            v.secondary_colour.as_deref(),
            v.engine_size,
            v.model.as_deref(),
            v.make.as_deref(),
            v.fuel_type.as_deref(),
            v.last_mot_test_date.as_deref(),
            v.last_update_timestamp.as_deref(),
            v.data_source.as_deref(),
            v.last_update_date.as_deref(),
            v.modification.as_deref(),
        ))?;
        self.staged.vehicles += 1;

        for t in &v.tests {
            let Some(completed) = t.completed_date.as_deref() else {
                self.staged.tests_undated += 1;
                self.staged.defects_unkeyed += to_u64(t.defects.len());
                continue;
            };

            let seq = self.next_seq();
            self.tests.serialize((
                seq,
                &v.registration,
                completed,
                t.expiry_date.as_deref(),
                t.test_result.as_deref(),
                t.odometer_value,
                t.odometer_unit.as_deref(),
                t.odometer_result_type.as_deref(),
            ))?;
            self.staged.tests += 1;

            for (ordinal, d) in t.defects.iter().enumerate() {
                self.defects.serialize((
                    seq,
                    &v.registration,
                    completed,
                    ordinal,
                    d.dangerous,
                    d.text.as_deref(),
                    d.defect_type.as_deref(),
                ))?;
                self.staged.defects += 1;
            }
        }

        Ok(())
    }

    const fn next_seq(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    fn flush(&mut self) -> Result<(), DbError> {
        self.vehicles.flush()?;
        self.tests.flush()?;
        self.defects.flush()?;
        Ok(())
    }
}

/// Stages the defects artifact and upserts the rows that join to a stored
/// test. Returns `(orphaned, written)`.
fn load_defects(tx: &duckdb::Transaction<'_>, defects_csv: &str) -> Result<(i64, usize), DbError> {
    tx.execute_batch(&format!(
        "CREATE OR REPLACE TEMP TABLE staging_defects (
            seq BIGINT,
            registration VARCHAR,
            completed_date TIMESTAMP,
            ordinal INTEGER,
            dangerous BOOLEAN,
            text VARCHAR,
            type VARCHAR
         );
         COPY staging_defects FROM {defects_csv} ({COPY_OPTIONS});"
    ))?;

    let orphaned: i64 = tx.query_row(
        "SELECT COUNT(*) FROM staging_defects s
         WHERE NOT EXISTS (
            SELECT 1 FROM mot_tests mt
            WHERE mt.registration = s.registration
              AND mt.completed_date = s.completed_date
         )",
        [],
        |row| row.get(0),
    )?;

    let written = tx.execute(
        "INSERT INTO defects (mot_test_id, ordinal, dangerous, text, type)
         SELECT mot_test_id, ordinal, dangerous, text, type
         FROM (
            SELECT DISTINCT ON (mt.id, s.ordinal)
                mt.id AS mot_test_id, s.ordinal, s.dangerous, s.text, s.type
            FROM staging_defects s
            JOIN mot_tests mt
              ON mt.registration = s.registration
             AND mt.completed_date = s.completed_date
            ORDER BY mt.id, s.ordinal, s.seq DESC
         ) AS resolved
         ON CONFLICT (mot_test_id, ordinal) DO UPDATE SET
            dangerous = EXCLUDED.dangerous,
            text = EXCLUDED.text,
            type = EXCLUDED.type",
        [],
    )?;

    tx.execute_batch("DROP TABLE staging_defects")?;
    Ok((orphaned, written))
}

/// Loads the artifacts in one transaction.
///
/// The artifacts are consumed; their directory is deleted when this
/// returns, whether it succeeded or not.
///
/// # Errors
///
/// Returns [`DbError`] if any stage fails. The transaction is rolled back
/// and no rows of this file remain.
pub fn load(
    conn: &mut Connection,
    mut artifacts: BulkArtifacts,
    mode: VehicleWriteMode,
) -> Result<BulkLoadCounts, DbError> {
    artifacts.flush()?;
    let staged = artifacts.staged;

    let vehicles_csv = sql_path(&artifacts.path("vehicles.csv"));
    let tests_csv = sql_path(&artifacts.path("tests.csv"));
    let defects_csv = sql_path(&artifacts.path("defects.csv"));

    let tx = conn.transaction()?;

    let vehicle_conflict = match mode {
        VehicleWriteMode::Initial => "ON CONFLICT (registration) DO NOTHING",
        VehicleWriteMode::Delta => {
            "ON CONFLICT (registration) DO UPDATE SET
                first_used_date = EXCLUDED.first_used_date,
                registration_date = EXCLUDED.registration_date,
                manufacture_date = EXCLUDED.manufacture_date,
                primary_colour = EXCLUDED.primary_colour,
                secondary_colour = EXCLUDED.secondary_colour,
                engine_size = EXCLUDED.engine_size,
                model = EXCLUDED.model,
                make = EXCLUDED.make,
                fuel_type = EXCLUDED.fuel_type,
                last_mot_test_date = EXCLUDED.last_mot_test_date,
                last_update_timestamp = EXCLUDED.last_update_timestamp,
                data_source = EXCLUDED.data_source,
                last_update_date = EXCLUDED.last_update_date,
                modification = EXCLUDED.modification"
        }
    };

    // `read_csv` rejects a zero-byte artifact, so empty ones are not read.
    let vehicles_written = if staged.vehicles == 0 {
        0
    } else {
        tx.execute(
            &format!(
                "INSERT INTO vehicles (
                    registration, first_used_date, registration_date, manufacture_date,
                    primary_colour, secondary_colour, engine_size, model, make, fuel_type,
                    last_mot_test_date, last_update_timestamp, data_source, last_update_date,
                    modification
                 )
                 SELECT
                    registration, first_used_date, registration_date, manufacture_date,
                    primary_colour, secondary_colour, engine_size, model, make, fuel_type,
                    last_mot_test_date, last_update_timestamp, data_source, last_update_date,
                    modification
                 FROM (
                    SELECT DISTINCT ON (registration) *
                    FROM read_csv({vehicles_csv}, {CSV_OPTIONS}, columns = {VEHICLE_COLUMNS})
                    ORDER BY registration, seq DESC
                 ) AS staged
                 {vehicle_conflict}"
            ),
            [],
        )?
    };

    let tests_written = if staged.tests == 0 {
        0
    } else {
        tx.execute(
            &format!(
                "INSERT INTO mot_tests (
                    registration, completed_date, expiry_date, test_result,
                    odometer_value, odometer_unit, odometer_result_type
                 )
                 SELECT
                    registration, completed_date, expiry_date, test_result,
                    odometer_value, odometer_unit, odometer_result_type
                 FROM (
                    SELECT DISTINCT ON (registration, completed_date) *
                    FROM read_csv({tests_csv}, {CSV_OPTIONS}, columns = {TEST_COLUMNS})
                    ORDER BY registration, completed_date, seq DESC
                 ) AS staged
                 ON CONFLICT (registration, completed_date) DO UPDATE SET
                    expiry_date = EXCLUDED.expiry_date,
                    test_result = EXCLUDED.test_result,
                    odometer_value = EXCLUDED.odometer_value,
                    odometer_unit = EXCLUDED.odometer_unit,
                    odometer_result_type = EXCLUDED.odometer_result_type"
            ),
            [],
        )?
    };

    let (orphaned, defects_written) = if staged.defects == 0 {
        (0, 0)
    } else {
        load_defects(&tx, &defects_csv)?
    };

    tx.commit()?;

    let vehicles_written = to_u64(vehicles_written);
    #[allow(clippy::cast_sign_loss)]
    let orphaned = orphaned.max(0) as u64 + staged.defects_unkeyed;

    if orphaned > 0 {
        log::debug!("{orphaned} staged defects did not join to a test");
    }

    Ok(BulkLoadCounts {
        vehicles: WriteCounts {
            succeeded: vehicles_written,
            failed: 0,
            // Registrations already stored (initial mode) plus in-file repeats.
            skipped: staged.vehicles.saturating_sub(vehicles_written),
        },
        tests: WriteCounts {
            succeeded: to_u64(tests_written),
            failed: 0,
            skipped: staged.tests_undated,
        },
        defects: WriteCounts {
            succeeded: to_u64(defects_written),
            failed: 0,
            skipped: orphaned,
        },
    })
}

#[cfg(test)]
mod tests {
    use mot_loader_ingest_models::TableCounts;
    use mot_loader_vehicle_models::{DefectRecord, MotTestRecord};

    use super::*;
    use crate::row_batch::tests::{open, vehicle};
    use crate::schema::table_counts;

    fn stage(batch: &[VehicleRecord]) -> BulkArtifacts {
        let mut artifacts = BulkArtifacts::create(None).unwrap();
        for v in batch {
            artifacts.push(v).unwrap();
        }
        artifacts
    }

    fn sample() -> Vec<VehicleRecord> {
        let mut tricky = vehicle("C3", "CITROËN", &[("2022-02-02 02:02:02", 1)]);
        tricky.tests[0].defects[0].text = Some("Wiper \"blade\", worn,\nsplit".to_string());
        tricky.modification = Some("it's, \"modified\"".to_string());

        vec![
            vehicle("A1", "FORD", &[("2024-01-02 03:04:05", 2)]),
            vehicle(
                "B2",
                "VW",
                &[("2023-05-06 07:08:09", 1), ("2024-05-06 07:08:09", 0)],
            ),
            tricky,
        ]
    }

    #[test]
    fn loads_all_three_tables_in_one_pass() {
        let mut conn = open();
        let counts = load(&mut conn, stage(&sample()), VehicleWriteMode::Initial).unwrap();

        assert_eq!(counts.vehicles.succeeded, 3);
        assert_eq!(counts.tests.succeeded, 4);
        assert_eq!(counts.defects.succeeded, 4);
        assert_eq!(counts.defects.skipped, 0);
        assert_eq!(
            table_counts(&conn).unwrap(),
            TableCounts {
                vehicles: 3,
                mot_tests: 4,
                defects: 4,
            }
        );

        let (text, modification): (String, String) = conn
            .query_row(
                "SELECT d.text, v.modification
                 FROM defects d
                 JOIN mot_tests t ON t.id = d.mot_test_id
                 JOIN vehicles v ON v.registration = t.registration
                 WHERE v.registration = 'C3'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(text, "Wiper \"blade\", worn,\nsplit");
        assert_eq!(modification, "it's, \"modified\"");
    }

    #[test]
    fn reloading_is_idempotent() {
        let mut conn = open();
        load(&mut conn, stage(&sample()), VehicleWriteMode::Initial).unwrap();
        let first = table_counts(&conn).unwrap();

        load(&mut conn, stage(&sample()), VehicleWriteMode::Initial).unwrap();
        load(&mut conn, stage(&sample()), VehicleWriteMode::Delta).unwrap();

        assert_eq!(table_counts(&conn).unwrap(), first);
    }

    #[test]
    fn matches_row_batch_results() {
        let batch = sample();

        let row_conn = open();
        let _ = crate::row_batch::upsert_vehicles(&row_conn, &batch, VehicleWriteMode::Initial);
        let _ = crate::row_batch::upsert_tests(&row_conn, &batch);
        let _ = crate::row_batch::upsert_defects(&row_conn, &batch);

        let mut bulk_conn = open();
        load(&mut bulk_conn, stage(&batch), VehicleWriteMode::Initial).unwrap();

        assert_eq!(
            table_counts(&row_conn).unwrap(),
            table_counts(&bulk_conn).unwrap()
        );
    }

    #[test]
    fn repeated_vehicle_in_file_keeps_last_row() {
        let mut conn = open();
        let batch = vec![
            vehicle("A1", "FORD", &[("2024-01-02 03:04:05", 1)]),
            vehicle("A1", "AUDI", &[("2024-01-02 03:04:05", 1)]),
        ];
        let counts = load(&mut conn, stage(&batch), VehicleWriteMode::Delta).unwrap();

        assert_eq!(counts.vehicles.succeeded, 1);
        assert_eq!(counts.defects.succeeded, 1);
        let make: String = conn
            .query_row("SELECT make FROM vehicles", [], |r| r.get(0))
            .unwrap();
        assert_eq!(make, "AUDI");
    }

    #[test]
    fn undated_tests_orphan_their_defects() {
        let mut conn = open();
        let mut v = vehicle("A1", "FORD", &[]);
        v.tests.push(MotTestRecord {
            defects: vec![DefectRecord::default(); 2],
            ..MotTestRecord::default()
        });

        let artifacts = stage(&[v]);
        assert_eq!(artifacts.staged().tests_undated, 1);
        let counts = load(&mut conn, artifacts, VehicleWriteMode::Initial).unwrap();

        assert_eq!(counts.tests.skipped, 1);
        assert_eq!(counts.defects.skipped, 2);
        assert_eq!(table_counts(&conn).unwrap().defects, 0);
    }

    #[test]
    fn empty_artifacts_load_nothing() {
        let mut conn = open();
        let counts = load(&mut conn, stage(&[]), VehicleWriteMode::Initial).unwrap();

        assert_eq!(counts, BulkLoadCounts::default());
        assert_eq!(table_counts(&conn).unwrap(), TableCounts::default());
    }

    #[test]
    fn vehicles_with_only_undated_tests_load_without_tests() {
        let mut conn = open();
        let mut v = vehicle("A1", "FORD", &[]);
        v.tests.push(MotTestRecord::default());

        let counts = load(&mut conn, stage(&[v]), VehicleWriteMode::Initial).unwrap();

        assert_eq!(counts.vehicles.succeeded, 1);
        assert_eq!(counts.tests.skipped, 1);
        assert_eq!(table_counts(&conn).unwrap().mot_tests, 0);
    }

    #[test]
    fn same_dated_tests_of_one_vehicle_keep_the_last() {
        let mut v = vehicle(
            "A1",
            "FORD",
            &[("2024-01-02 03:04:05", 3), ("2024-01-02 03:04:05", 1)],
        );
        v.tests[1].test_result = Some("FAILED".to_string());
        v.tests[1].defects[0].text = Some("last".to_string());
        let batch = vec![v];

        let mut bulk_conn = open();
        let counts = load(&mut bulk_conn, stage(&batch), VehicleWriteMode::Initial).unwrap();
        assert_eq!(counts.tests.succeeded, 1);

        let row_conn = open();
        let _ = crate::row_batch::upsert_vehicles(&row_conn, &batch, VehicleWriteMode::Initial);
        let _ = crate::row_batch::upsert_tests(&row_conn, &batch);
        let _ = crate::row_batch::upsert_defects(&row_conn, &batch);

        for conn in [&bulk_conn, &row_conn] {
            let (result, first_defect): (String, String) = conn
                .query_row(
                    "SELECT t.test_result, d.text
                     FROM mot_tests t JOIN defects d ON d.mot_test_id = t.id
                     WHERE d.ordinal = 0",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .unwrap();
            assert_eq!(result, "FAILED");
            assert_eq!(first_defect, "last");
            assert_eq!(table_counts(conn).unwrap().defects, 3);
        }
    }

    #[test]
    fn failure_rolls_back_the_whole_file() {
        let mut conn = open();
        conn.execute_batch("DROP TABLE defects").unwrap();

        assert!(load(&mut conn, stage(&sample()), VehicleWriteMode::Initial).is_err());

        let vehicles: i64 = conn
            .query_row("SELECT COUNT(*) FROM vehicles", [], |r| r.get(0))
            .unwrap();
        let tests: i64 = conn
            .query_row("SELECT COUNT(*) FROM mot_tests", [], |r| r.get(0))
            .unwrap();
        assert_eq!((vehicles, tests), (0, 0));
    }

    #[test]
    fn artifacts_are_removed_on_every_path() {
        let mut conn = open();
        let artifacts = stage(&sample());
        let dir = artifacts.dir().to_path_buf();
        assert!(dir.join("vehicles.csv").exists());
        load(&mut conn, artifacts, VehicleWriteMode::Initial).unwrap();
        assert!(!dir.exists());

        conn.execute_batch("DROP TABLE defects").unwrap();
        let artifacts = stage(&sample());
        let dir = artifacts.dir().to_path_buf();
        assert!(load(&mut conn, artifacts, VehicleWriteMode::Initial).is_err());
        assert!(!dir.exists());
    }
}
