//! Atomic JSON snapshot files for the local backend.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::Path;

/// Serialize `value` and write it atomically:
/// - ensure parent directory exists
/// - write to a temp file in the same directory
/// - fsync file + rename into place
pub(crate) fn atomic_write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to encode snapshot for {}", path.display()))?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory for policy snapshot {}",
            path.display()
        )
    })?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or("policy.json");
    let temp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let mut temp_file = std::fs::File::create(&temp_path)
        .with_context(|| format!("failed to create temporary file {}", temp_path.display()))?;
    temp_file
        .write_all(&content)
        .with_context(|| format!("failed to write temporary file {}", temp_path.display()))?;
    temp_file
        .sync_all()
        .with_context(|| format!("failed to fsync temporary file {}", temp_path.display()))?;

    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to rename temporary file {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

/// Read a JSON snapshot, `None` when the file does not exist yet.
pub(crate) fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no existing policy snapshot");
        return Ok(None);
    }
    let raw = std::fs::read(path)
        .with_context(|| format!("failed to read policy snapshot {}", path.display()))?;
    let value = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to decode policy snapshot {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_creates_parents_and_reads_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("values.json");
        atomic_write_json(&path, &vec![1_u32, 2, 3]).expect("write");
        let back: Option<Vec<u32>> = read_json_if_exists(&path).expect("read");
        assert_eq!(back, Some(vec![1, 2, 3]));
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let back: Option<Vec<u32>> =
            read_json_if_exists(&dir.path().join("absent.json")).expect("read");
        assert!(back.is_none());
    }
}
