#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Normalized vehicle, MOT test, and defect records.
//!
//! A decoded source line becomes one [`VehicleRecord`] owning its
//! [`MotTestRecord`]s, each of which owns its [`DefectRecord`]s. All
//! date/time fields are already in canonical `YYYY-MM-DD HH:MM:SS` form
//! (or `None`) by the time a record reaches this type.

use serde::{Deserialize, Serialize};

/// A vehicle keyed by its registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleRecord {
    /// Registration mark; the natural key. Never empty.
    pub registration: String,
    pub first_used_date: Option<String>,
    pub registration_date: Option<String>,
    pub manufacture_date: Option<String>,
    pub primary_colour: Option<String>,
    pub secondary_colour: Option<String>,
    /// Engine size in cc. `None` when absent or unparseable.
    pub engine_size: Option<i64>,
    pub model: Option<String>,
    pub make: Option<String>,
    pub fuel_type: Option<String>,
    pub last_mot_test_date: Option<String>,
    pub last_update_timestamp: Option<String>,
    /// Data-source tag supplied by the publisher.
    pub data_source: Option<String>,
    pub last_update_date: Option<String>,
    /// Free-text modification note.
    pub modification: Option<String>,
    /// Tests in source order.
    pub tests: Vec<MotTestRecord>,
}

impl VehicleRecord {
    /// Creates a record with only the registration populated.
    #[must_use]
    pub fn new(registration: impl Into<String>) -> Self {
        Self {
            registration: registration.into(),
            first_used_date: None,
            registration_date: None,
            manufacture_date: None,
            primary_colour: None,
            secondary_colour: None,
            engine_size: None,
            model: None,
            make: None,
            fuel_type: None,
            last_mot_test_date: None,
            last_update_timestamp: None,
            data_source: None,
            last_update_date: None,
            modification: None,
            tests: Vec::new(),
        }
    }

    /// Total number of defects across all tests of this vehicle.
    #[must_use]
    pub fn defect_count(&self) -> usize {
        self.tests.iter().map(|t| t.defects.len()).sum()
    }
}

/// A single MOT test. Identified by `(registration, completed_date)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotTestRecord {
    pub completed_date: Option<String>,
    pub expiry_date: Option<String>,
    /// `PASSED`, `FAILED`, etc. Stored as published.
    pub test_result: Option<String>,
    pub odometer_value: Option<i64>,
    pub odometer_unit: Option<String>,
    pub odometer_result_type: Option<String>,
    /// Defects in source order. Position in this vector is part of the
    /// defect's identity.
    pub defects: Vec<DefectRecord>,
}

/// A defect recorded against a test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefectRecord {
    pub dangerous: Option<bool>,
    pub text: Option<String>,
    /// Defect type code (`ADVISORY`, `MAJOR`, `PRS`, ...).
    pub defect_type: Option<String>,
}
