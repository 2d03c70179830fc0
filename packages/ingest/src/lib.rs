#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Ingestion pipeline for MOT history files.
//!
//! A [`coordinator`] run takes a set of `.json.gz` source files, drops the
//! ones the import ledger already marks completed, and fans the rest out
//! to [`worker::process_file`] on the blocking thread pool. Each worker
//! streams its file through the decoder into an [`strategy::InsertionStrategy`]
//! and records the file's terminal status.
//!
//! [`retry`] and [`delta`] are alternative front ends that build the input
//! set from the ledger's failed entries or from the remote API listing.

pub mod archive;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod delta;
pub mod retry;
pub mod strategy;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use context::PipelineContext;
pub use coordinator::{discover_local, run_files};

use mot_loader_database::DbError;
use mot_loader_decoder::DecodeError;
use mot_loader_remote::RemoteError;

/// Errors that can occur during ingestion.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Storage error.
    #[error(transparent)]
    Db(#[from] DbError),

    /// Record decode error.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Remote API error.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// I/O error on a source file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking task panicked or was cancelled.
    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Invalid or missing configuration.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of what went wrong.
        message: String,
    },
}

