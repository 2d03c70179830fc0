//! File listing returned by the bulk-download endpoint.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Path prefix the API uses for full-dataset archives.
pub const BULK_PREFIX: &str = "v1/public/bulk/";

/// One downloadable file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    /// API path of the file, e.g. `v1/public/delta/2024-03-01.zip`.
    pub filename: String,
    /// Pre-signed download URL.
    pub download_url: String,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub file_created_on: Option<String>,
}

impl RemoteFile {
    /// Ledger key: the last path segment of [`RemoteFile::filename`].
    #[must_use]
    pub fn ledger_key(&self) -> &str {
        ledger_key(&self.filename)
    }

    /// Whether this is a full-dataset archive.
    #[must_use]
    pub fn is_bulk(&self) -> bool {
        self.filename.starts_with(BULK_PREFIX)
    }
}

/// Last segment of an API path (`a/b/c.zip` -> `c.zip`).
#[must_use]
pub fn ledger_key(api_path: &str) -> &str {
    Path::new(api_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(api_path)
}

/// The two groups of files the endpoint returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListing {
    #[serde(default)]
    pub bulk: Vec<RemoteFile>,
    #[serde(default)]
    pub delta: Vec<RemoteFile>,
}

impl FileListing {
    /// Files to consider for download, bulk files first when included.
    #[must_use]
    pub fn candidates(&self, include_bulk: bool) -> Vec<&RemoteFile> {
        let bulk = self.bulk.iter().filter(|_| include_bulk);
        bulk.chain(self.delta.iter().filter(|f| include_bulk || !f.is_bulk()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"{
        "bulk": [
            {"filename": "v1/public/bulk/bulk-light-vehicle_01-03-2024.zip",
             "downloadUrl": "https://example.invalid/bulk", "fileSize": 123456789,
             "fileCreatedOn": "2024-03-01"}
        ],
        "delta": [
            {"filename": "v1/public/delta/delta-light-vehicle_02-03-2024.zip",
             "downloadUrl": "https://example.invalid/d1"},
            {"filename": "v1/public/delta/delta-light-vehicle_03-03-2024.json.gz",
             "downloadUrl": "https://example.invalid/d2"}
        ]
    }"#;

    #[test]
    fn deserializes_both_groups() {
        let listing: FileListing = serde_json::from_str(LISTING).unwrap();
        assert_eq!(listing.bulk.len(), 1);
        assert_eq!(listing.delta.len(), 2);
        assert_eq!(listing.bulk[0].file_size, Some(123_456_789));
        assert_eq!(listing.delta[0].download_url, "https://example.invalid/d1");
    }

    #[test]
    fn missing_groups_default_to_empty() {
        let listing: FileListing = serde_json::from_str(r#"{"delta": []}"#).unwrap();
        assert!(listing.bulk.is_empty());
    }

    #[test]
    fn ledger_key_is_last_path_segment() {
        assert_eq!(ledger_key("v1/public/delta/a.zip"), "a.zip");
        assert_eq!(ledger_key("a.json.gz"), "a.json.gz");
    }

    #[test]
    fn bulk_is_skipped_unless_requested() {
        let listing: FileListing = serde_json::from_str(LISTING).unwrap();
        assert!(listing.bulk[0].is_bulk());

        let names: Vec<&str> = listing
            .candidates(false)
            .into_iter()
            .map(RemoteFile::ledger_key)
            .collect();
        assert_eq!(
            names,
            vec![
                "delta-light-vehicle_02-03-2024.zip",
                "delta-light-vehicle_03-03-2024.json.gz"
            ]
        );
        assert_eq!(listing.candidates(true).len(), 3);
    }
}
