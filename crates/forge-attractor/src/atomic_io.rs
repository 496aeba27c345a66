//! Crash-safe file writes for the logs-root state files (checkpoint, final,
//! status, manifest, live). Every write goes through a temp file in the same
//! directory, fsynced, then renamed over the target so a reader never
//! observes a partially-written file.

use crate::AttractorError;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// `mkdir -p dir; write tmp; fsync; rename tmp -> target`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AttractorError> {
    let parent = path.parent().ok_or_else(|| {
        AttractorError::Runtime(format!("path '{}' has no parent directory", path.display()))
    })?;
    fs::create_dir_all(parent).map_err(|error| {
        AttractorError::Runtime(format!(
            "failed to create directory '{}': {}",
            parent.display(),
            error
        ))
    })?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            AttractorError::Runtime(format!("path '{}' has no file name", path.display()))
        })?;
    let tmp_path = parent.join(format!(".{file_name}.tmp-{}", std::process::id()));

    {
        let mut file = File::create(&tmp_path).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed to create temp file '{}': {}",
                tmp_path.display(),
                error
            ))
        })?;
        file.write_all(bytes).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed writing temp file '{}': {}",
                tmp_path.display(),
                error
            ))
        })?;
        file.sync_all().map_err(|error| {
            AttractorError::Runtime(format!(
                "failed to fsync temp file '{}': {}",
                tmp_path.display(),
                error
            ))
        })?;
    }

    fs::rename(&tmp_path, path).map_err(|error| {
        let _ = fs::remove_file(&tmp_path);
        AttractorError::Runtime(format!(
            "failed to rename '{}' -> '{}': {}",
            tmp_path.display(),
            path.display(),
            error
        ))
    })
}

/// Appends a single line to an NDJSON ledger under an advisory file lock,
/// creating the file and its parent directory if necessary. Safe to call
/// concurrently from multiple parallel branches.
pub fn append_ndjson_line(path: &Path, line: &str) -> Result<(), AttractorError> {
    use fs2::FileExt;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed to create directory '{}': {}",
                parent.display(),
                error
            ))
        })?;
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|error| {
            AttractorError::Runtime(format!(
                "failed to open ledger '{}': {}",
                path.display(),
                error
            ))
        })?;

    file.lock_exclusive().map_err(|error| {
        AttractorError::Runtime(format!(
            "failed to lock ledger '{}': {}",
            path.display(),
            error
        ))
    })?;

    let result = (|| {
        file.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.sync_data()
    })();

    let _ = FileExt::unlock(&file);

    result.map_err(|error| {
        AttractorError::Runtime(format!(
            "failed appending to ledger '{}': {}",
            path.display(),
            error
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_atomic_replaces_existing_file_content() {
        let dir = TempDir::new().expect("temp dir should be created");
        let path = dir.path().join("checkpoint.json");
        write_atomic(&path, b"{\"a\":1}").expect("first write should succeed");
        write_atomic(&path, b"{\"a\":2}").expect("second write should succeed");
        let content = fs::read_to_string(&path).expect("file should be readable");
        assert_eq!(content, "{\"a\":2}");
    }

    #[test]
    fn write_atomic_leaves_no_temp_file_behind() {
        let dir = TempDir::new().expect("temp dir should be created");
        let path = dir.path().join("nested").join("final.json");
        write_atomic(&path, b"{}").expect("write should succeed");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .expect("dir should be readable")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn append_ndjson_line_appends_multiple_lines_in_order() {
        let dir = TempDir::new().expect("temp dir should be created");
        let path = dir.path().join("progress.ndjson");
        append_ndjson_line(&path, "{\"seq\":1}").expect("first append should succeed");
        append_ndjson_line(&path, "{\"seq\":2}").expect("second append should succeed");
        let content = fs::read_to_string(&path).expect("file should be readable");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec!["{\"seq\":1}", "{\"seq\":2}"]);
    }
}
