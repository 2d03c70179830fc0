//! Connection pool setup.

use std::path::Path;

use duckdb::DuckdbConnectionManager;

use crate::DbError;

/// Shared pool of connections to one database file.
pub type DbPool = r2d2::Pool<DuckdbConnectionManager>;

/// A connection checked out of [`DbPool`].
pub type PooledConn = r2d2::PooledConnection<DuckdbConnectionManager>;

/// Opens (or creates) the database at `path`, builds a pool of at most
/// `max_size` connections, and bootstraps the schema.
///
/// # Errors
///
/// Returns [`DbError`] if the file cannot be opened, the pool cannot be
/// built, or the schema bootstrap fails.
pub fn open_pool(path: &Path, max_size: u32) -> Result<DbPool, DbError> {
    crate::paths::ensure_parent(path)?;

    let manager = DuckdbConnectionManager::file(path)?;
    let pool = r2d2::Pool::builder()
        .max_size(max_size.max(1))
        .build(manager)?;

    let conn = pool.get()?;
    crate::schema::bootstrap(&conn)?;

    log::info!(
        "Opened {} with a pool of {} connections",
        path.display(),
        pool.max_size()
    );

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_parent_directories_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mot.duckdb");

        let pool = open_pool(&path, 2).unwrap();
        assert!(path.exists());

        let conn = pool.get().unwrap();
        let counts = crate::schema::table_counts(&conn).unwrap();
        assert_eq!(counts.vehicles, 0);
    }

    #[test]
    fn reopening_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mot.duckdb");

        drop(open_pool(&path, 1).unwrap());
        let pool = open_pool(&path, 1).unwrap();
        let conn = pool.get().unwrap();
        assert_eq!(crate::schema::existing_indexes(&conn).unwrap().len(), 2);
    }
}
