//! Filesystem helpers shared across modules.
//!
//! These helpers provide consistent error context (operation + path) and the
//! write-then-rename primitive every persisted record goes through.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    ensure_dir_all_with_op("creating directory", path).await
}

/// Ensure the parent directory of a file path exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    ensure_dir_all(parent).await
}

/// Ensure a directory exists (synchronous variant) with a custom operation label.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error(op, path, e))
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

/// Atomically replace `path` with `bytes`.
///
/// Readers observe either the previous content or the new content, never a
/// truncated file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent_dir(path).await?;
    let tmp = temp_sibling(path);

    let write = async {
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| io_error("creating temp file", &tmp, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| io_error("writing temp file", &tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| io_error("syncing temp file", &tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| io_error("renaming temp file onto", path, e))
    };

    let result = write.await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

/// Serialize `value` as pretty JSON and atomically write it to `path`.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

/// Read and decode a JSON file. Returns `Ok(None)` when the file does not exist.
pub async fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error("reading", path, e)),
    }
}

/// Remove a file, treating "already gone" as success.
///
/// Returns whether a file was actually removed.
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error("removing", path, e)),
    }
}

/// List the `*.json` files directly inside `dir`, sorted by path.
///
/// A missing directory yields an empty list.
pub async fn list_json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error("listing", dir, e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("listing", dir, e))?
    {
        let path = entry.path();
        let is_json = path.extension().is_some_and(|ext| ext == "json");
        let is_temp = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        if is_json && !is_temp {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Encode an arbitrary identifier (email, group id) into a file-name-safe key.
///
/// Alphanumerics, `-`, `_`, `.` and `@` are kept; everything else becomes
/// `%XX`. The encoding is injective, so distinct ids never share a file.
pub fn file_key(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'@' => out.push(byte as char),
            b'.' if !out.is_empty() => out.push('.'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_atomic_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("record.json");

        write_json_atomic(&path, &serde_json::json!({"a": 1})).await.unwrap();
        write_json_atomic(&path, &serde_json::json!({"a": 2})).await.unwrap();

        let value: serde_json::Value = read_json_opt(&path).await.unwrap().unwrap();
        assert_eq!(value["a"], 2);

        // No temp files left behind.
        let listed = list_json_files(path.parent().unwrap()).await.unwrap();
        assert_eq!(listed, vec![path.clone()]);
        let mut entries = std::fs::read_dir(path.parent().unwrap()).unwrap();
        assert!(entries.next().is_some());
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn test_read_json_opt_missing_file() {
        let dir = TempDir::new().unwrap();
        let value: Option<serde_json::Value> =
            read_json_opt(&dir.path().join("missing.json")).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_remove_file_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.json");
        assert!(!remove_file_if_exists(&path).await.unwrap());
        tokio::fs::write(&path, b"{}").await.unwrap();
        assert!(remove_file_if_exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_json_files_missing_dir() {
        let dir = TempDir::new().unwrap();
        assert!(list_json_files(&dir.path().join("nope")).await.unwrap().is_empty());
    }

    #[test]
    fn test_file_key() {
        assert_eq!(file_key("jane@example.com"), "jane@example.com");
        assert_eq!(file_key("acme/west"), "acme%2Fwest");
        assert_eq!(file_key("../etc"), "%2E.%2Fetc");
        assert_ne!(file_key("a/b"), file_key("a%2Fb"));
    }
}
