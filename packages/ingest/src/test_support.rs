//! Fixtures shared by the pipeline tests.

use std::io::Write as _;
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;
use mot_loader_database::open_pool;
use mot_loader_ingest_models::{IngestConfig, LoadStrategy};
use mot_loader_vehicle_models::{DefectRecord, MotTestRecord, VehicleRecord};
use tempfile::TempDir;

use crate::PipelineContext;

/// A vehicle with one test per `(completed_date, defect_count)` pair.
pub fn record(reg: &str, tests: &[(&str, usize)]) -> VehicleRecord {
    let mut v = VehicleRecord::new(reg);
    v.make = Some("FORD".to_string());
    for (completed, defects) in tests {
        v.tests.push(MotTestRecord {
            completed_date: Some((*completed).to_string()),
            test_result: Some("PASSED".to_string()),
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

/// One source line in the published JSON shape.
pub fn line(reg: &str, tests: &[(&str, usize)]) -> String {
    let tests: Vec<serde_json::Value> = tests
        .iter()
        .map(|(completed, defects)| {
            let defects: Vec<serde_json::Value> = (0..*defects)
                .map(|i| {
                    serde_json::json!({
                        "dangerous": false,
                        "text": format!("defect {i}"),
                        "type": "ADVISORY",
                    })
                })
                .collect();
            serde_json::json!({
                "completedDate": completed,
                "testResult": "PASSED",
                "odometerValue": "12345",
                "odometerUnit": "MI",
                "defects": defects,
            })
        })
        .collect();

    serde_json::json!({
        "registration": reg,
        "make": "FORD",
        "engineSize": "1598",
        "motTests": tests,
    })
    .to_string()
}

/// `count` lines with registrations `{prefix}0..{prefix}{count-1}`, each
/// with two tests of one defect.
pub fn lines(prefix: &str, count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            line(
                &format!("{prefix}{i}"),
                &[("2023-01-02T10:00:00.000Z", 1), ("2024-01-02T10:00:00.000Z", 1)],
            )
        })
        .collect()
}

fn gzip(lines: &[String]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for l in lines {
        encoder.write_all(l.as_bytes()).unwrap();
        encoder.write_all(b"\n").unwrap();
    }
    encoder.finish().unwrap()
}

pub fn write_gz(path: &Path, lines: &[String]) {
    std::fs::write(path, gzip(lines)).unwrap();
}

/// Writes a gzip file cut off halfway, so reading fails mid-stream.
pub fn write_truncated_gz(path: &Path, lines: &[String]) {
    let bytes = gzip(lines);
    std::fs::write(path, &bytes[..bytes.len() / 2]).unwrap();
}

/// A context over a fresh database file in a temp directory.
pub fn context(strategy: LoadStrategy, batch_size: usize) -> (TempDir, PipelineContext) {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_pool(&dir.path().join("mot.duckdb"), 4).unwrap();
    let config = IngestConfig {
        batch_size,
        max_workers: 3,
        strategy,
        ..IngestConfig::default()
    };
    let ctx = PipelineContext::new(pool, config).with_work_dir(dir.path());
    (dir, ctx)
}
