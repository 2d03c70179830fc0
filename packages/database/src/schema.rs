//! Schema bootstrap and secondary-index suspension.
//!
//! The bootstrap is an idempotent set of `CREATE ... IF NOT EXISTS`
//! statements run every time a pool is opened. There is no migration
//! history; the tables below are the only shape the loader knows.
//!
//! `defects` has no declared foreign key to `mot_tests`: parents are
//! resolved by the row-batch lookup or the bulk-copy join before a defect
//! is ever written.

use duckdb::Connection;
use mot_loader_ingest_models::TableCounts;

use crate::DbError;

/// Secondary indexes dropped for the duration of a load and rebuilt after.
const SECONDARY_INDEXES: &[(&str, &str)] = &[
    (
        "idx_defects_mot_test_id",
        "CREATE INDEX IF NOT EXISTS idx_defects_mot_test_id ON defects (mot_test_id)",
    ),
    (
        "idx_mot_tests_completed_date",
        "CREATE INDEX IF NOT EXISTS idx_mot_tests_completed_date ON mot_tests (completed_date)",
    ),
];

/// Creates all tables, sequences, and indexes that do not exist yet.
///
/// Also rebuilds any secondary index left dropped by an interrupted run.
///
/// # Errors
///
/// Returns [`DbError`] if any statement fails.
pub fn bootstrap(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE SEQUENCE IF NOT EXISTS mot_tests_id_seq;
         CREATE SEQUENCE IF NOT EXISTS defects_id_seq;

         CREATE TABLE IF NOT EXISTS vehicles (
            registration TEXT PRIMARY KEY,
            first_used_date TIMESTAMP,
            registration_date TIMESTAMP,
            manufacture_date TIMESTAMP,
            primary_colour TEXT,
            secondary_colour TEXT,
            engine_size BIGINT,
            model TEXT,
            make TEXT,
            fuel_type TEXT,
            last_mot_test_date TIMESTAMP,
            last_update_timestamp TIMESTAMP,
            data_source TEXT,
            last_update_date TIMESTAMP,
            modification TEXT
         );

         CREATE TABLE IF NOT EXISTS mot_tests (
            id BIGINT PRIMARY KEY DEFAULT nextval('mot_tests_id_seq'),
            registration TEXT NOT NULL,
            completed_date TIMESTAMP,
            expiry_date TIMESTAMP,
            test_result TEXT,
            odometer_value BIGINT,
            odometer_unit TEXT,
            odometer_result_type TEXT,
            UNIQUE (registration, completed_date)
         );

         CREATE TABLE IF NOT EXISTS defects (
            id BIGINT PRIMARY KEY DEFAULT nextval('defects_id_seq'),
            mot_test_id BIGINT NOT NULL,
            ordinal INTEGER NOT NULL,
            dangerous BOOLEAN,
            text TEXT,
            type TEXT,
            UNIQUE (mot_test_id, ordinal)
         );

         CREATE TABLE IF NOT EXISTS import_log (
            filename TEXT PRIMARY KEY,
            import_timestamp TIMESTAMP NOT NULL,
            status TEXT NOT NULL
         );",
    )?;

    restore_indexes(conn)
}

/// Drops the secondary indexes so bulk writes skip their maintenance.
///
/// # Errors
///
/// Returns [`DbError`] if a `DROP INDEX` fails.
pub fn suspend_indexes(conn: &Connection) -> Result<(), DbError> {
    for (name, _) in SECONDARY_INDEXES {
        conn.execute_batch(&format!("DROP INDEX IF EXISTS {name}"))?;
    }
    log::info!("Suspended {} secondary indexes", SECONDARY_INDEXES.len());
    Ok(())
}

/// Recreates any missing secondary index.
///
/// # Errors
///
/// Returns [`DbError`] if a `CREATE INDEX` fails.
pub fn restore_indexes(conn: &Connection) -> Result<(), DbError> {
    for (_, ddl) in SECONDARY_INDEXES {
        conn.execute_batch(ddl)?;
    }
    Ok(())
}

/// Names of the user-created indexes currently present, sorted.
///
/// # Errors
///
/// Returns [`DbError`] if the catalog query fails.
pub fn existing_indexes(conn: &Connection) -> Result<Vec<String>, DbError> {
    let mut stmt = conn.prepare("SELECT index_name FROM duckdb_indexes() ORDER BY index_name")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut names = Vec::new();
    for name in rows {
        names.push(name?);
    }
    Ok(names)
}

/// Row counts of the three entity tables.
///
/// # Errors
///
/// Returns [`DbError`] if a count query fails.
pub fn table_counts(conn: &Connection) -> Result<TableCounts, DbError> {
    Ok(TableCounts {
        vehicles: count_rows(conn, "vehicles")?,
        mot_tests: count_rows(conn, "mot_tests")?,
        defects: count_rows(conn, "defects")?,
    })
}

fn count_rows(conn: &Connection, table: &str) -> Result<u64, DbError> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    #[allow(clippy::cast_sign_loss)]
    Ok(count as u64)
}
