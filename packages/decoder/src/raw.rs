//! Wire shapes of one source line, and the coercions from those shapes to
//! [`VehicleRecord`].
//!
//! The publisher is loose about scalar types (engine size and odometer
//! readings arrive as strings, some flags as `"true"`), so every scalar is
//! read through a lenient deserializer and coerced afterwards.

use mot_loader_vehicle_models::{DefectRecord, MotTestRecord, VehicleRecord};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::timestamp::normalize_opt;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawVehicle {
    #[serde(default, deserialize_with = "lenient_string")]
    pub registration: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub first_used_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub registration_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub manufacture_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub primary_colour: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub secondary_colour: Option<String>,
    #[serde(default)]
    pub engine_size: Option<Value>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub make: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub fuel_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub last_mot_test_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub last_update_timestamp: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub data_source: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub last_update_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub modification: Option<String>,
    #[serde(default)]
    pub mot_tests: Option<Vec<RawTest>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTest {
    #[serde(default, deserialize_with = "lenient_string")]
    pub completed_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub expiry_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub test_result: Option<String>,
    #[serde(default)]
    pub odometer_value: Option<Value>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub odometer_unit: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub odometer_result_type: Option<String>,
    #[serde(default)]
    pub defects: Option<Vec<RawDefect>>,
}

#[derive(Debug, Deserialize)]
pub struct RawDefect {
    #[serde(default, deserialize_with = "lenient_bool")]
    pub dangerous: Option<bool>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub text: Option<String>,
    #[serde(default, rename = "type", deserialize_with = "lenient_string")]
    pub defect_type: Option<String>,
}

/// Accepts a string, number, or boolean and renders it as text. Empty
/// strings, `null`, arrays, and objects become `None`.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

/// Accepts a boolean or a `"true"`/`"false"` string (any case).
fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => Some(b),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

/// Coerces a JSON scalar to an integer. Unparseable input yields `None`.
#[must_use]
pub fn coerce_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Whether a scalar is present but failed [`coerce_int`].
fn is_bad_int(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) if s.trim().is_empty() => false,
        v => coerce_int(v).is_none(),
    }
}

impl RawVehicle {
    /// Converts the wire shape into a normalized record. The caller has
    /// already checked that `registration` is present.
    pub(crate) fn into_record(self, registration: String) -> VehicleRecord {
        if is_bad_int(self.engine_size.as_ref()) {
            log::warn!("Invalid engine size for vehicle {registration}; storing NULL");
        }

        let tests = self
            .mot_tests
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.into_record(&registration))
            .collect();

        VehicleRecord {
            first_used_date: normalize_opt(self.first_used_date.as_deref()),
            registration_date: normalize_opt(self.registration_date.as_deref()),
            manufacture_date: normalize_opt(self.manufacture_date.as_deref()),
            primary_colour: self.primary_colour,
            secondary_colour: self.secondary_colour,
            engine_size: coerce_int(self.engine_size.as_ref()),
            model: self.model,
            make: self.make,
            fuel_type: self.fuel_type,
            last_mot_test_date: normalize_opt(self.last_mot_test_date.as_deref()),
            last_update_timestamp: normalize_opt(self.last_update_timestamp.as_deref()),
            data_source: self.data_source,
            last_update_date: normalize_opt(self.last_update_date.as_deref()),
            modification: self.modification,
            tests,
            registration,
        }
    }
}

impl RawTest {
    fn into_record(self, registration: &str) -> MotTestRecord {
        if is_bad_int(self.odometer_value.as_ref()) {
            log::debug!("Invalid odometer value for vehicle {registration}; storing NULL");
        }

        MotTestRecord {
            completed_date: normalize_opt(self.completed_date.as_deref()),
            expiry_date: normalize_opt(self.expiry_date.as_deref()),
            test_result: self.test_result,
            odometer_value: coerce_int(self.odometer_value.as_ref()),
            odometer_unit: self.odometer_unit,
            odometer_result_type: self.odometer_result_type,
            defects: self
                .defects
                .unwrap_or_default()
                .into_iter()
                .map(|d| DefectRecord {
                    dangerous: d.dangerous,
                    text: d.text,
                    defect_type: d.defect_type,
                })
                .collect(),
        }
    }
}
