#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Client for the MOT history bulk-download API.
//!
//! Covers the narrow slice the loader needs: an OAuth2 client-credentials
//! token, the `bulk` / `delta` file listing, streaming downloads, and zip
//! extraction. Every HTTP call goes through [`retry`] so transient failures
//! back off and retry before surfacing.

pub mod archive;
pub mod client;
pub mod credentials;
pub mod download;
pub mod listing;
pub mod retry;

pub use client::RemoteClient;
pub use credentials::Credentials;
pub use listing::{FileListing, RemoteFile};

/// Errors from remote API operations.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status.
    #[error("HTTP {status} for {url}")]
    HttpStatus {
        /// Request URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// Response body was not the expected JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error on a local path.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path that caused the error.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Zip archive could not be read.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// A required setting is absent.
    #[error("Missing required configuration: {name}")]
    MissingConfig {
        /// Environment variable name.
        name: String,
    },
}

impl RemoteError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
