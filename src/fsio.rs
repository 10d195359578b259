//! Atomic filesystem write helpers for plan state and metadata artifacts
//!
//! Everything persisted as JSON or CSV goes through a tmp + rename cycle:
//! the artifact either exists complete under its final name or not at all.
//! A crash between artifact-write and marker-write therefore leaves the
//! work item detectably unfinished rather than corrupt.

use crate::error::{MarginError, MarginResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tokio::fs;

/// Write a string to `path` atomically
pub async fn write_string_atomic(path: &Path, contents: &str) -> MarginResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| MarginError::io(parent, "create", e))?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)
        .await
        .map_err(|e| MarginError::io(&tmp_path, "write", e))?;
    fs::rename(&tmp_path, path)
        .await
        .map_err(|e| MarginError::io(path, "rename", e))?;
    Ok(())
}

/// Serialize a value as pretty JSON and write it atomically
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> MarginResult<()> {
    let json = serde_json::to_string_pretty(value).map_err(|source| MarginError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write_string_atomic(path, &json).await
}

/// Read and deserialize a JSON file
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> MarginResult<T> {
    let contents = fs::read_to_string(path)
        .await
        .map_err(|e| MarginError::io(path, "read", e))?;
    serde_json::from_str(&contents).map_err(|source| MarginError::Json {
        path: path.to_path_buf(),
        source,
    })
}
