//! The import ledger: one `import_log` row per source file.
//!
//! Every transition is a single autocommitted upsert, so it is durable and
//! visible to every other pooled connection as soon as the call returns.
//! Nothing here caches.

use std::str::FromStr as _;

use duckdb::Connection;
use mot_loader_ingest_models::ImportStatus;

use crate::DbError;

/// Timestamp format written to `import_timestamp`.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// A ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub filename: String,
    pub status: ImportStatus,
    /// Last transition time, as `DuckDB` renders it.
    pub updated_at: String,
}

/// Records `status` for `filename`, overwriting any previous entry.
///
/// # Errors
///
/// Returns [`DbError`] if the upsert fails.
pub fn record_transition(
    conn: &Connection,
    filename: &str,
    status: ImportStatus,
) -> Result<(), DbError> {
    let now = chrono::Utc::now()
        .naive_utc()
        .format(TIMESTAMP_FORMAT)
        .to_string();

    conn.execute(
        "INSERT INTO import_log (filename, import_timestamp, status)
         VALUES (?, CAST(? AS TIMESTAMP), ?)
         ON CONFLICT (filename) DO UPDATE SET
            import_timestamp = EXCLUDED.import_timestamp,
            status = EXCLUDED.status",
        duckdb::params![filename, now, status.as_ref()],
    )?;

    log::debug!("[{filename}] ledger -> {status}");
    Ok(())
}

/// Returns the current entry for `filename`, if any.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails or the stored status is not a
/// known [`ImportStatus`].
pub fn status_of(conn: &Connection, filename: &str) -> Result<Option<LedgerEntry>, DbError> {
    let result = conn.query_row(
        "SELECT status, CAST(import_timestamp AS TEXT) FROM import_log WHERE filename = ?",
        [filename],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
    );

    match result {
        Ok((status, updated_at)) => Ok(Some(LedgerEntry {
            filename: filename.to_string(),
            status: parse_status(&status)?,
            updated_at,
        })),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(DbError::DuckDb(e)),
    }
}

/// Whether `filename` should be processed: true unless its last recorded
/// status is [`ImportStatus::Completed`].
///
/// # Errors
///
/// Returns [`DbError`] if the lookup fails.
pub fn is_eligible(conn: &Connection, filename: &str) -> Result<bool, DbError> {
    Ok(status_of(conn, filename)?.is_none_or(|entry| entry.status.is_eligible()))
}

/// Filenames whose last recorded status is `status`, sorted.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn list_by_status(conn: &Connection, status: ImportStatus) -> Result<Vec<String>, DbError> {
    let mut stmt =
        conn.prepare("SELECT filename FROM import_log WHERE status = ? ORDER BY filename")?;
    let rows = stmt.query_map([status.as_ref()], |row| row.get::<_, String>(0))?;

    let mut names = Vec::new();
    for name in rows {
        names.push(name?);
    }
    Ok(names)
}

/// Number of ledger entries per status, in status order.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails or a stored status is unknown.
pub fn counts_by_status(conn: &Connection) -> Result<Vec<(ImportStatus, u64)>, DbError> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM import_log GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut counts = Vec::new();
    for row in rows {
        let (status, count) = row?;
        #[allow(clippy::cast_sign_loss)]
        counts.push((parse_status(&status)?, count as u64));
    }
    counts.sort_by_key(|(status, _)| *status);
    Ok(counts)
}

fn parse_status(s: &str) -> Result<ImportStatus, DbError> {
    ImportStatus::from_str(s).map_err(|_| DbError::Conversion {
        message: format!("unknown import status {s:?}"),
    })
}
