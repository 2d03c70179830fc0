#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `DuckDB` storage for MOT history data.
//!
//! A single embedded database file holds the `vehicles`, `mot_tests`,
//! `defects`, and `import_log` tables. All access goes through an `r2d2`
//! pool ([`db::DbPool`]); each unit of work checks out one connection and
//! returns it when done.
//!
//! Writes come in two flavours:
//! - [`row_batch`]: parameterized multi-row upserts, one statement per
//!   entity per chunk, failures counted rather than raised
//! - [`bulk_copy`]: whole-file CSV artifacts loaded inside one transaction
//!
//! All SQL is written for `DuckDB` directly; there is no dialect adapter
//! layer. Callers must not run two writers at once: concurrent
//! transactions touching the same keys abort at commit.

pub mod bulk_copy;
pub mod db;
pub mod ledger;
pub mod paths;
pub mod row_batch;
pub mod schema;

pub use db::{DbPool, PooledConn, open_pool};

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `DuckDB` query error.
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// Connection pool error.
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error writing a bulk-load artifact.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Data conversion error.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },
}
