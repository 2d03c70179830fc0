//! Row-batched upserts.
//!
//! Each public function writes one batch of one entity type and reports
//! `(succeeded, failed, skipped)` counts instead of raising: a chunk whose
//! statement fails is logged and counted as failed, and the caller moves
//! on to the next batch. Callers must write vehicles, then tests, then
//! defects, so that every defect's parent test is committed before the
//! defect looks it up.

use std::collections::{BTreeMap, BTreeSet};

use duckdb::Connection;
use mot_loader_ingest_models::{VehicleWriteMode, WriteCounts};
use mot_loader_vehicle_models::{DefectRecord, MotTestRecord, VehicleRecord};

use crate::DbError;

/// Rows per INSERT statement.
const CHUNK_SIZE: usize = 1_000;

const VEHICLE_ROW: &str = "(?, CAST(? AS TIMESTAMP), CAST(? AS TIMESTAMP), \
    CAST(? AS TIMESTAMP), ?, ?, CAST(? AS BIGINT), ?, ?, ?, CAST(? AS TIMESTAMP), \
    CAST(? AS TIMESTAMP), ?, CAST(? AS TIMESTAMP), ?)";

const TEST_ROW: &str =
    "(?, CAST(? AS TIMESTAMP), CAST(? AS TIMESTAMP), ?, CAST(? AS BIGINT), ?, ?)";

const DEFECT_ROW: &str = "(?, ?, ?, ?, ?)";

/// Keeps only the last occurrence of each key, preserving order.
fn dedup_last<'a, T, K: Ord>(items: &'a [T], key: impl Fn(&'a T) -> K) -> Vec<&'a T> {
    let mut last_seen: BTreeMap<K, usize> = BTreeMap::new();
    for (i, item) in items.iter().enumerate() {
        last_seen.insert(key(item), i);
    }
    let keep: BTreeSet<usize> = last_seen.into_values().collect();
    items
        .iter()
        .enumerate()
        .filter(|(i, _)| keep.contains(i))
        .map(|(_, item)| item)
        .collect()
}

/// Builds `"{prefix} VALUES row, row, ... {suffix}"` for `n` rows.
fn insert_sql(prefix: &str, row: &str, n: usize, suffix: &str) -> String {
    let mut sql = String::with_capacity(prefix.len() + suffix.len() + n * (row.len() + 2) + 8);
    sql.push_str(prefix);
    sql.push_str(" VALUES ");
    for i in 0..n {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(row);
    }
    sql.push(' ');
    sql.push_str(suffix);
    sql
}

fn to_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// Writes the vehicle rows of a batch.
///
/// In [`VehicleWriteMode::Initial`] registrations already stored are probed
/// for and skipped; the insert itself still carries `ON CONFLICT DO
/// NOTHING` for rows a concurrent worker stored in the meantime. In
/// [`VehicleWriteMode::Delta`] every row is upserted.
#[must_use]
pub fn upsert_vehicles(
    conn: &Connection,
    batch: &[VehicleRecord],
    mode: VehicleWriteMode,
) -> WriteCounts {
    let rows = dedup_last(batch, |v| v.registration.as_str());
    let mut counts = WriteCounts::default();

    for chunk in rows.chunks(CHUNK_SIZE) {
        match write_vehicle_chunk(conn, chunk, mode) {
            Ok(c) => counts.merge(c),
            Err(e) => {
                log::error!("Vehicle batch of {} rows failed: {e}", chunk.len());
                counts.merge(WriteCounts::all_failed(to_u64(chunk.len())));
            }
        }
    }

    counts
}

fn existing_registrations(
    conn: &Connection,
    chunk: &[&VehicleRecord],
) -> Result<BTreeSet<String>, DbError> {
    let placeholders = vec!["?"; chunk.len()].join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT registration FROM vehicles WHERE registration IN ({placeholders})"
    ))?;
    for (i, v) in chunk.iter().enumerate() {
        stmt.raw_bind_parameter(i + 1, &v.registration)?;
    }
    stmt.raw_execute()?;

    let mut existing = BTreeSet::new();
    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next()? {
        existing.insert(row.get::<_, String>(0)?);
    }
    Ok(existing)
}

fn write_vehicle_chunk(
    conn: &Connection,
    chunk: &[&VehicleRecord],
    mode: VehicleWriteMode,
) -> Result<WriteCounts, DbError> {
    let mut counts = WriteCounts::default();

    let pending: Vec<&VehicleRecord> = match mode {
        VehicleWriteMode::Initial => {
            let existing = existing_registrations(conn, chunk)?;
            if !existing.is_empty() {
                log::debug!(
                    "Skipping {} vehicles already stored (first: {})",
                    existing.len(),
                    existing.iter().next().map_or("", String::as_str),
                );
            }
            counts.skipped += to_u64(existing.len());
            chunk
                .iter()
                .filter(|v| !existing.contains(&v.registration))
                .copied()
                .collect()
        }
        VehicleWriteMode::Delta => chunk.to_vec(),
    };

    if pending.is_empty() {
        return Ok(counts);
    }

    let conflict = match mode {
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

    let sql = insert_sql(
        "INSERT INTO vehicles (
            registration, first_used_date, registration_date, manufacture_date,
            primary_colour, secondary_colour, engine_size, model, make, fuel_type,
            last_mot_test_date, last_update_timestamp, data_source, last_update_date,
            modification
        )",
        VEHICLE_ROW,
        pending.len(),
        conflict,
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut param_idx = 1usize;

    for v in &pending {
        stmt.raw_bind_parameter(param_idx, &v.registration)?;
        stmt.raw_bind_parameter(param_idx + 1, v.first_used_date.as_deref())?;
        stmt.raw_bind_parameter(param_idx + 2, v.registration_date.as_deref())?;
        stmt.raw_bind_parameter(param_idx + 3, v.manufacture_date.as_deref())?;
        stmt.raw_bind_parameter(param_idx + 4, v.primary_colour.as_deref())?;
        stmt.raw_bind_parameter(param_idx + 5, v.secondary_colour.as_deref())?;
        stmt.raw_bind_parameter(param_idx + 6, v.engine_size)?;
        stmt.raw_bind_parameter(param_idx + 7, v.model.as_deref())?;
        stmt.raw_bind_parameter(param_idx + 8, v.make.as_deref())?;
        stmt.raw_bind_parameter(param_idx + 9, v.fuel_type.as_deref())?;
        stmt.raw_bind_parameter(param_idx + 10, v.last_mot_test_date.as_deref())?;
        stmt.raw_bind_parameter(param_idx + 11, v.last_update_timestamp.as_deref())?;
        stmt.raw_bind_parameter(param_idx + 12, v.data_source.as_deref())?;
        stmt.raw_bind_parameter(param_idx + 13, v.last_update_date.as_deref())?;
        stmt.raw_bind_parameter(param_idx + 14, v.modification.as_deref())?;
        param_idx += 15;
    }

    let affected = to_u64(stmt.raw_execute()?);
    let attempted = to_u64(pending.len());

    match mode {
        VehicleWriteMode::Initial => {
            // Rows another worker inserted between the probe and the insert.
            counts.succeeded += affected.min(attempted);
            counts.skipped += attempted.saturating_sub(affected);
        }
        VehicleWriteMode::Delta => counts.succeeded += attempted,
    }

    Ok(counts)
}

/// Writes the test rows of a batch as upserts on
/// `(registration, completed_date)`.
///
/// Tests without a completed date have no natural key and are skipped.
#[must_use]
pub fn upsert_tests(conn: &Connection, batch: &[VehicleRecord]) -> WriteCounts {
    let mut counts = WriteCounts::default();

    let mut keyed: Vec<(&str, &MotTestRecord)> = Vec::new();
    for vehicle in batch {
        for test in &vehicle.tests {
            if test.completed_date.is_some() {
                keyed.push((vehicle.registration.as_str(), test));
            } else {
                counts.skipped += 1;
            }
        }
    }

    if counts.skipped > 0 {
        log::debug!("Skipping {} tests without a completed date", counts.skipped);
    }

    let rows = dedup_last(&keyed, |(reg, t)| (*reg, t.completed_date.as_deref()));

    for chunk in rows.chunks(CHUNK_SIZE) {
        match write_test_chunk(conn, chunk) {
            Ok(n) => counts.succeeded += n,
            Err(e) => {
                log::error!("Test batch of {} rows failed: {e}", chunk.len());
                counts.failed += to_u64(chunk.len());
            }
        }
    }

    counts
}

fn write_test_chunk(conn: &Connection, chunk: &[&(&str, &MotTestRecord)]) -> Result<u64, DbError> {
    let sql = insert_sql(
        "INSERT INTO mot_tests (
            registration, completed_date, expiry_date, test_result,
            odometer_value, odometer_unit, odometer_result_type
        )",
        TEST_ROW,
        chunk.len(),
        "ON CONFLICT (registration, completed_date) DO UPDATE SET
            expiry_date = EXCLUDED.expiry_date,
            test_result = EXCLUDED.test_result,
            odometer_value = EXCLUDED.odometer_value,
            odometer_unit = EXCLUDED.odometer_unit,
            odometer_result_type = EXCLUDED.odometer_result_type",
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut param_idx = 1usize;

    for (registration, t) in chunk {
        stmt.raw_bind_parameter(param_idx, *registration)?;
        stmt.raw_bind_parameter(param_idx + 1, t.completed_date.as_deref())?;
        stmt.raw_bind_parameter(param_idx + 2, t.expiry_date.as_deref())?;
        stmt.raw_bind_parameter(param_idx + 3, t.test_result.as_deref())?;
        stmt.raw_bind_parameter(param_idx + 4, t.odometer_value)?;
        stmt.raw_bind_parameter(param_idx + 5, t.odometer_unit.as_deref())?;
        stmt.raw_bind_parameter(param_idx + 6, t.odometer_result_type.as_deref())?;
        param_idx += 7;
    }

    stmt.raw_execute()?;
    Ok(to_u64(chunk.len()))
}

/// Looks up the storage id of the test keyed by `(registration,
/// completed_date)`.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails. A miss is `Ok(None)`.
pub fn resolve_test_id(
    conn: &Connection,
    registration: &str,
    completed_date: &str,
) -> Result<Option<i64>, DbError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id FROM mot_tests
         WHERE registration = ? AND completed_date = CAST(? AS TIMESTAMP)",
    )?;
    match stmt.query_row([registration, completed_date], |row| row.get(0)) {
        Ok(id) => Ok(Some(id)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(DbError::DuckDb(e)),
    }
}

/// A defect with its parent test resolved.
struct ResolvedDefect<'a> {
    mot_test_id: i64,
    ordinal: i64,
    defect: &'a DefectRecord,
}

/// Writes the defect rows of a batch.
///
/// Must run after [`upsert_tests`] for the same batch has returned. Each
/// distinct parent test is resolved with one point lookup; defects whose
/// parent is not found are dropped and counted as `skipped` (orphans).
/// Defects are upserted on `(mot_test_id, ordinal)`, where `ordinal` is the
/// defect's position in its test.
#[must_use]
pub fn upsert_defects(conn: &Connection, batch: &[VehicleRecord]) -> WriteCounts {
    let mut counts = WriteCounts::default();
    let mut parents: BTreeMap<(&str, &str), Option<i64>> = BTreeMap::new();
    let mut resolved: Vec<ResolvedDefect<'_>> = Vec::new();

    for vehicle in batch {
        for test in &vehicle.tests {
            if test.defects.is_empty() {
                continue;
            }

            let parent = match test.completed_date.as_deref() {
                None => None,
                Some(completed) => {
                    let key = (vehicle.registration.as_str(), completed);
                    if let Some(id) = parents.get(&key) {
                        *id
                    } else {
                        match resolve_test_id(conn, key.0, key.1) {
                            Ok(id) => {
                                parents.insert(key, id);
                                id
                            }
                            Err(e) => {
                                log::error!(
                                    "Parent lookup for {} @ {completed} failed: {e}",
                                    vehicle.registration
                                );
                                counts.failed += to_u64(test.defects.len());
                                continue;
                            }
                        }
                    }
                }
            };

            let Some(mot_test_id) = parent else {
                log::debug!(
                    "Dropping {} defects of {} @ {}: parent test not found",
                    test.defects.len(),
                    vehicle.registration,
                    test.completed_date.as_deref().unwrap_or("<no date>"),
                );
                counts.skipped += to_u64(test.defects.len());
                continue;
            };

            for (ordinal, defect) in test.defects.iter().enumerate() {
                resolved.push(ResolvedDefect {
                    mot_test_id,
                    ordinal: i64::try_from(ordinal).unwrap_or(i64::MAX),
                    defect,
                });
            }
        }
    }

    let rows = dedup_last(&resolved, |d| (d.mot_test_id, d.ordinal));

    for chunk in rows.chunks(CHUNK_SIZE) {
        match write_defect_chunk(conn, chunk) {
            Ok(n) => counts.succeeded += n,
            Err(e) => {
                log::error!("Defect batch of {} rows failed: {e}", chunk.len());
                counts.failed += to_u64(chunk.len());
            }
        }
    }

    counts
}

fn write_defect_chunk(conn: &Connection, chunk: &[&ResolvedDefect<'_>]) -> Result<u64, DbError> {
    let sql = insert_sql(
        "INSERT INTO defects (mot_test_id, ordinal, dangerous, text, type)",
        DEFECT_ROW,
        chunk.len(),
        "ON CONFLICT (mot_test_id, ordinal) DO UPDATE SET
            dangerous = EXCLUDED.dangerous,
            text = EXCLUDED.text,
            type = EXCLUDED.type",
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut param_idx = 1usize;

    for d in chunk {
        stmt.raw_bind_parameter(param_idx, d.mot_test_id)?;
        stmt.raw_bind_parameter(param_idx + 1, d.ordinal)?;
        stmt.raw_bind_parameter(param_idx + 2, d.defect.dangerous)?;
        stmt.raw_bind_parameter(param_idx + 3, d.defect.text.as_deref())?;
        stmt.raw_bind_parameter(param_idx + 4, d.defect.defect_type.as_deref())?;
        param_idx += 5;
    }

    stmt.raw_execute()?;
    Ok(to_u64(chunk.len()))
}

#[cfg(test)]
pub(crate) mod tests {
    use mot_loader_ingest_models::TableCounts;

    use super::*;
    use crate::schema::table_counts;

    pub(crate) fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::schema::bootstrap(&conn).unwrap();
        conn
    }

    pub(crate) fn vehicle(reg: &str, make: &str, tests: &[(&str, usize)]) -> VehicleRecord {
        let mut v = VehicleRecord::new(reg);
        v.make = Some(make.to_string());
        v.engine_size = Some(1_598);
        for (completed, defects) in tests {
            v.tests.push(MotTestRecord {
                completed_date: Some((*completed).to_string()),
                test_result: Some("PASSED".to_string()),
                odometer_value: Some(50_000),
                defects: (0..*defects)
                    .map(|i| DefectRecord {
                        dangerous: Some(false),
                        text: Some(format!("defect {i}")),
                        defect_type: Some("ADVISORY".to_string()),
                    })
                    .collect(),
                ..MotTestRecord::default()
            });
        }
        v
    }

    fn write_all(conn: &Connection, batch: &[VehicleRecord], mode: VehicleWriteMode) {
        let _ = upsert_vehicles(conn, batch, mode);
        let _ = upsert_tests(conn, batch);
        let _ = upsert_defects(conn, batch);
    }

    fn make_of(conn: &Connection, reg: &str) -> Option<String> {
        conn.query_row(
            "SELECT make FROM vehicles WHERE registration = ?",
            [reg],
            |r| r.get(0),
        )
        .unwrap()
    }

    #[test]
    fn writes_parent_before_child() {
        let conn = open();
        let batch = vec![
            vehicle("A1", "FORD", &[("2024-01-02 03:04:05", 2)]),
            vehicle("B2", "VW", &[("2023-05-06 07:08:09", 1), ("2024-05-06 07:08:09", 0)]),
        ];

        assert_eq!(
            upsert_vehicles(&conn, &batch, VehicleWriteMode::Initial).succeeded,
            2
        );
        assert_eq!(upsert_tests(&conn, &batch).succeeded, 3);
        let defects = upsert_defects(&conn, &batch);
        assert_eq!(defects.succeeded, 3);
        assert_eq!(defects.skipped, 0);

        let dangling: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM defects d
                 WHERE NOT EXISTS (SELECT 1 FROM mot_tests t WHERE t.id = d.mot_test_id)",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(dangling, 0);
    }

    #[test]
    fn rerunning_a_batch_is_idempotent() {
        let conn = open();
        let batch: Vec<VehicleRecord> = (0..10)
            .map(|i| vehicle(&format!("REG{i}"), "FORD", &[("2024-01-02 03:04:05", 2)]))
            .collect();

        write_all(&conn, &batch, VehicleWriteMode::Initial);
        let first = table_counts(&conn).unwrap();
        write_all(&conn, &batch, VehicleWriteMode::Initial);
        write_all(&conn, &batch, VehicleWriteMode::Delta);

        assert_eq!(
            first,
            TableCounts {
                vehicles: 10,
                mot_tests: 10,
                defects: 20,
            }
        );
        assert_eq!(table_counts(&conn).unwrap(), first);
    }

    #[test]
    fn initial_mode_skips_existing_vehicles() {
        let conn = open();
        let _ = upsert_vehicles(&conn, &[vehicle("A1", "FORD", &[])], VehicleWriteMode::Initial);

        let counts = upsert_vehicles(
            &conn,
            &[vehicle("A1", "AUDI", &[]), vehicle("B2", "VW", &[])],
            VehicleWriteMode::Initial,
        );
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.skipped, 1);
        assert_eq!(make_of(&conn, "A1").as_deref(), Some("FORD"));
    }

    #[test]
    fn delta_mode_refreshes_existing_vehicles() {
        let conn = open();
        let _ = upsert_vehicles(&conn, &[vehicle("A1", "FORD", &[])], VehicleWriteMode::Initial);
        let counts = upsert_vehicles(&conn, &[vehicle("A1", "AUDI", &[])], VehicleWriteMode::Delta);

        assert_eq!(counts.succeeded, 1);
        assert_eq!(make_of(&conn, "A1").as_deref(), Some("AUDI"));
    }

    #[test]
    fn duplicate_keys_in_one_batch_keep_the_last() {
        let conn = open();
        let batch = vec![vehicle("A1", "FORD", &[]), vehicle("A1", "AUDI", &[])];
        let counts = upsert_vehicles(&conn, &batch, VehicleWriteMode::Delta);

        assert_eq!(counts.failed, 0);
        assert_eq!(make_of(&conn, "A1").as_deref(), Some("AUDI"));
    }

    #[test]
    fn tests_update_in_place_on_natural_key() {
        let conn = open();
        let mut v = vehicle("A1", "FORD", &[("2024-01-02 03:04:05", 0)]);
        let _ = upsert_tests(&conn, std::slice::from_ref(&v));

        v.tests[0].test_result = Some("FAILED".to_string());
        let _ = upsert_tests(&conn, std::slice::from_ref(&v));

        let (count, result): (i64, String) = conn
            .query_row(
                "SELECT COUNT(*), MAX(test_result) FROM mot_tests",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(result, "FAILED");
    }

    #[test]
    fn undated_tests_are_skipped_and_their_defects_orphaned() {
        let conn = open();
        let mut v = vehicle("A1", "FORD", &[("2024-01-02 03:04:05", 1)]);
        v.tests.push(MotTestRecord {
            defects: vec![DefectRecord::default(); 3],
            ..MotTestRecord::default()
        });
        let batch = vec![v];

        let tests = upsert_tests(&conn, &batch);
        assert_eq!((tests.succeeded, tests.skipped), (1, 1));

        let defects = upsert_defects(&conn, &batch);
        assert_eq!((defects.succeeded, defects.skipped), (1, 3));
    }

    #[test]
    fn defects_without_committed_parent_are_orphaned() {
        let conn = open();
        let batch = vec![vehicle("A1", "FORD", &[("2024-01-02 03:04:05", 2)])];

        let defects = upsert_defects(&conn, &batch);
        assert_eq!(defects.succeeded, 0);
        assert_eq!(defects.skipped, 2);
        assert_eq!(table_counts(&conn).unwrap().defects, 0);
    }

    #[test]
    fn resolves_test_ids_by_natural_key() {
        let conn = open();
        let batch = vec![vehicle("A1", "FORD", &[("2024-01-02 03:04:05", 0)])];
        let _ = upsert_tests(&conn, &batch);

        assert!(resolve_test_id(&conn, "A1", "2024-01-02 03:04:05")
            .unwrap()
            .is_some());
        assert_eq!(
            resolve_test_id(&conn, "A1", "2020-01-01 00:00:00").unwrap(),
            None
        );
    }

    #[test]
    fn failed_statement_is_counted_not_raised() {
        let conn = open();
        conn.execute_batch("DROP TABLE vehicles").unwrap();

        let counts = upsert_vehicles(
            &conn,
            &[vehicle("A1", "FORD", &[]), vehicle("B2", "VW", &[])],
            VehicleWriteMode::Delta,
        );
        assert_eq!(counts, WriteCounts::all_failed(2));
    }
}
