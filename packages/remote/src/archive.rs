//! Zip archive handling for downloaded files.
//!
//! The API ships most files as `.zip` archives wrapping one or more
//! `.json.gz` files. [`extract_zip`] unpacks them into a directory and
//! [`find_json_gz`] collects the inputs for the coordinator.

use std::fs::File;
use std::io::Read as _;
use std::path::{Path, PathBuf};

use crate::RemoteError;

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

/// Source file suffix the loader ingests.
pub const JSON_GZ_SUFFIX: &str = ".json.gz";

/// Returns `true` if the file starts with the zip local-file-header magic.
///
/// # Errors
///
/// Returns [`RemoteError::Io`] if the file cannot be opened.
pub fn is_zip(path: &Path) -> Result<bool, RemoteError> {
    let mut file = File::open(path).map_err(|e| RemoteError::io(path, e))?;
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == ZIP_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(RemoteError::io(path, e)),
    }
}

/// Extracts every file entry of `zip_path` under `dest`.
///
/// Entries whose names would escape `dest` are skipped with a warning.
/// Returns the extracted file paths.
///
/// # Errors
///
/// Returns [`RemoteError`] if the archive is unreadable or a file cannot
/// be written.
pub fn extract_zip(zip_path: &Path, dest: &Path) -> Result<Vec<PathBuf>, RemoteError> {
    log::info!("Extracting {}", zip_path.display());

    let file = File::open(zip_path).map_err(|e| RemoteError::io(zip_path, e))?;
    let mut archive = zip::ZipArchive::new(file)?;
    std::fs::create_dir_all(dest).map_err(|e| RemoteError::io(dest, e))?;

    let mut extracted = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }

        let Some(relative) = entry.enclosed_name() else {
            log::warn!("  skipping unsafe zip entry: {}", entry.name());
            continue;
        };

        let out_path = dest.join(relative);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RemoteError::io(parent, e))?;
        }

        let mut out = File::create(&out_path).map_err(|e| RemoteError::io(&out_path, e))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| RemoteError::io(&out_path, e))?;
        extracted.push(out_path);
    }

    log::info!("  extracted {} file(s)", extracted.len());
    Ok(extracted)
}

/// Recursively collects `*.json.gz` files under `dir`, sorted by path.
///
/// # Errors
///
/// Returns [`RemoteError::Io`] if a directory cannot be read.
pub fn find_json_gz(dir: &Path) -> Result<Vec<PathBuf>, RemoteError> {
    let mut found = Vec::new();
    collect(dir, &mut |p| has_suffix(p, JSON_GZ_SUFFIX), &mut found)?;
    found.sort();
    Ok(found)
}

/// Recursively searches `roots` for a file whose name is `filename`.
/// Returns the first hit in root order.
///
/// Missing roots are ignored.
///
/// # Errors
///
/// Returns [`RemoteError::Io`] if an existing directory cannot be read.
pub fn find_by_name(roots: &[&Path], filename: &str) -> Result<Option<PathBuf>, RemoteError> {
    for root in roots {
        if !root.is_dir() {
            continue;
        }
        let mut found = Vec::new();
        collect(
            root,
            &mut |p| p.file_name().is_some_and(|n| n == filename),
            &mut found,
        )?;
        found.sort();
        if let Some(hit) = found.into_iter().next() {
            return Ok(Some(hit));
        }
    }
    Ok(None)
}

fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(suffix))
}

fn collect(
    dir: &Path,
    matches: &mut dyn FnMut(&Path) -> bool,
    out: &mut Vec<PathBuf>,
) -> Result<(), RemoteError> {
    let entries = std::fs::read_dir(dir).map_err(|e| RemoteError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| RemoteError::io(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| RemoteError::io(&path, e))?;
        if file_type.is_dir() {
            collect(&path, matches, out)?;
        } else if matches(&path) {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip_writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, data) in entries {
            zip_writer.start_file(*name, options).unwrap();
            zip_writer.write_all(data).unwrap();
        }
        zip_writer.finish().unwrap();
    }

    #[test]
    fn detects_zip_by_magic_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("delta.zip");
        write_zip(&zip_path, &[("a.json.gz", b"x")]);
        let gz_path = tmp.path().join("plain.json.gz");
        std::fs::write(&gz_path, [0x1f, 0x8b, 0x08, 0x00]).unwrap();
        let tiny = tmp.path().join("tiny");
        std::fs::write(&tiny, b"PK").unwrap();

        assert!(is_zip(&zip_path).unwrap());
        assert!(!is_zip(&gz_path).unwrap());
        assert!(!is_zip(&tiny).unwrap());
    }

    #[test]
    fn extracts_nested_entries_and_finds_inputs() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("delta.zip");
        write_zip(
            &zip_path,
            &[
                ("part-2.json.gz", b"two"),
                ("nested/part-1.json.gz", b"one"),
                ("README.txt", b"readme"),
            ],
        );

        let out = tmp.path().join("out");
        let extracted = extract_zip(&zip_path, &out).unwrap();
        assert_eq!(extracted.len(), 3);
        assert_eq!(std::fs::read(out.join("nested/part-1.json.gz")).unwrap(), b"one");

        let inputs = find_json_gz(&out).unwrap();
        assert_eq!(
            inputs,
            vec![out.join("nested/part-1.json.gz"), out.join("part-2.json.gz")]
        );
    }

    #[test]
    fn skips_entries_escaping_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("evil.zip");
        write_zip(&zip_path, &[("../escape.json.gz", b"x"), ("ok.json.gz", b"y")]);

        let out = tmp.path().join("out");
        let extracted = extract_zip(&zip_path, &out).unwrap();
        assert_eq!(extracted, vec![out.join("ok.json.gz")]);
        assert!(!tmp.path().join("escape.json.gz").exists());
    }

    #[test]
    fn finds_file_by_name_across_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        let downloads = tmp.path().join("downloads/2024");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::create_dir_all(&downloads).unwrap();
        std::fs::write(downloads.join("target.json.gz"), b"x").unwrap();

        let missing = tmp.path().join("nope");
        let hit = find_by_name(
            &[&missing, &data, &tmp.path().join("downloads")],
            "target.json.gz",
        )
        .unwrap();
        assert_eq!(hit, Some(downloads.join("target.json.gz")));
        assert_eq!(find_by_name(&[&data], "other.json.gz").unwrap(), None);
    }
}
