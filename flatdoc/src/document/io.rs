use super::Record;
use crate::error::Result;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Create the parent directory and an empty `[]` collection file if missing.
/// Returns true when the file was created.
pub fn ensure_collection_file(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    write_records(path, &[])?;
    log::info!("Created collection file {}", path.display());
    Ok(true)
}

/// Read a collection file: a JSON array of objects.
pub fn read_records(path: &Path) -> Result<Vec<Record>> {
    let content = std::fs::read_to_string(path)?;
    let records: Vec<Record> = serde_json::from_str(&content)?;
    Ok(records)
}

/// Rewrite a collection file in full.
///
/// The array is written to a temporary file in the same directory, flushed
/// to disk and renamed over `path`, so readers see either the old or the new
/// contents and never a truncated file.
pub fn write_records(path: &Path, records: &[Record]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let json = serde_json::to_string_pretty(records)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(json.as_bytes())?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    log::debug!("Wrote {} records to {}", records.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_ensure_creates_empty_array() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/dir/users.json");

        assert!(ensure_collection_file(&path).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "[]");
        assert!(!ensure_collection_file(&path).unwrap());
    }

    #[test]
    fn test_pretty_printed_with_two_spaces() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("users.json");
        write_records(&path, &[record(json!({ "name": "Alice", "age": 30 }))]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("[\n  {\n    \"name\": \"Alice\",\n    \"age\": 30\n  }\n]"));
    }

    #[test]
    fn test_read_back_preserves_field_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("users.json");
        let original = vec![
            record(json!({ "zeta": 1, "alpha": 2, "_id": "x" })),
            record(json!({ "b": true, "a": [1, 2] })),
        ];
        write_records(&path, &original).unwrap();

        let loaded = read_records(&path).unwrap();
        assert_eq!(loaded, original);
        let keys: Vec<&String> = loaded[0].keys().collect();
        assert_eq!(keys, vec!["zeta", "alpha", "_id"]);
    }

    #[test]
    fn test_read_rejects_non_array() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.json");
        std::fs::write(&path, "{ \"not\": \"an array\" }").unwrap();

        let err = read_records(&path).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IoFailure);
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("users.json");
        write_records(&path, &[]).unwrap();
        write_records(&path, &[record(json!({ "a": 1 }))]).unwrap();

        let entries: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
