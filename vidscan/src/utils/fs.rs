//! Filesystem helpers shared across modules.
//!
//! Every helper attaches the operation and path to IO failures so log lines
//! and job error details say what was being touched.

use std::path::Path;

use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::{Error, Result};

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::io_path(op, path, e))
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    ensure_dir_all_with_op("creating directory", path).await
}

/// Ensure a directory exists (synchronous variant).
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| Error::io_path(op, path, e))
}

/// Remove a directory tree. A missing directory is not an error.
///
/// Returns whether anything was removed.
pub async fn remove_dir_all_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io_path("removing directory", path, e)),
    }
}

/// Remove a file. A missing file is not an error.
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io_path("removing file", path, e)),
    }
}

/// Recreate `path` as an empty directory.
pub async fn recreate_dir(path: &Path) -> Result<()> {
    remove_dir_all_if_exists(path).await?;
    ensure_dir_all(path).await
}

/// Serialize `value` as pretty JSON and replace `path` atomically.
///
/// The document is written to a sibling temp file and flushed to disk before
/// it is renamed over the target, so readers only ever see a complete file,
/// even after a crash.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;

    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        ensure_dir_all(parent).await?;
    }

    let temp_path = path.with_extension("tmp");
    {
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::io_path("creating", &temp_path, e))?;
        file.write_all(&json)
            .await
            .map_err(|e| Error::io_path("writing", &temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| Error::io_path("syncing", &temp_path, e))?;
    }
    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| Error::io_path("renaming", &temp_path, e))?;

    if let Some(parent) = parent {
        sync_dir(parent).await?;
    }
    Ok(())
}

/// Flush a directory entry so a completed rename survives power loss.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<()> {
    let handle = tokio::fs::File::open(dir)
        .await
        .map_err(|e| Error::io_path("opening directory", dir, e))?;
    handle
        .sync_all()
        .await
        .map_err(|e| Error::io_path("syncing directory", dir, e))
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Copy `from` to `to` if the source exists. Returns whether a copy happened.
pub async fn copy_if_exists(from: &Path, to: &Path) -> Result<bool> {
    match tokio::fs::copy(from, to).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !from.exists() => Ok(false),
        Err(e) => Err(Error::io_path("copying", from, e)),
    }
}
