#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Decoder for MOT history NDJSON lines.
//!
//! Each line of a source file is one vehicle object with nested
//! `motTests[]`, each with nested `defects[]`. [`decode_line`] turns one
//! line into a [`VehicleRecord`] tree with normalized timestamps, or a
//! [`DecodeError`] the caller logs and skips.

mod raw;
pub mod stream;
pub mod timestamp;

use mot_loader_vehicle_models::VehicleRecord;

pub use stream::{Line, LineStream, open_lines};
pub use timestamp::normalize_timestamp;

/// Errors that can occur while decoding a single line.
///
/// Both variants are per-line: the stream continues after either.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The line is not a valid JSON object (or not valid UTF-8).
    #[error("Malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The record has no usable registration.
    #[error("Record has no registration")]
    MissingKey,
}

/// Decodes one source line into a normalized vehicle record.
///
/// # Errors
///
/// * [`DecodeError::Malformed`] if the bytes are not a JSON object of the
///   expected shape
/// * [`DecodeError::MissingKey`] if `registration` is absent or blank
pub fn decode_line(line: &[u8]) -> Result<VehicleRecord, DecodeError> {
    let raw: raw::RawVehicle = serde_json::from_slice(line)?;

    let registration = raw
        .registration
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .ok_or(DecodeError::MissingKey)?;

    Ok(raw.into_record(registration))
}
