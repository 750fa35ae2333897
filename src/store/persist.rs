//! On-disk representation of the store: one JSON document plus a `.backup`
//! sibling holding the last good snapshot before the most recent save.
//!
//! Writes go to a `.tmp` sibling and are renamed over the primary, so a reader
//! never observes a half-written file.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::model::Snapshot;
use crate::error::{CoreError, CoreResult};

/// Where a loaded graph came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadSource {
    Primary,
    Backup,
    /// Neither file was usable; started from an empty graph.
    Default,
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

pub fn backup_path(path: &Path) -> PathBuf {
    sibling(path, ".backup")
}

pub fn temp_path(path: &Path) -> PathBuf {
    sibling(path, ".tmp")
}

async fn read_snapshot(path: &Path) -> Result<Snapshot, String> {
    let bytes = fs::read(path).await.map_err(|e| e.to_string())?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err("file is empty".into());
    }
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

/// Loads the graph, degrading primary → backup → empty. Never fails.
pub async fn load(path: &Path) -> (Snapshot, LoadSource) {
    match read_snapshot(path).await {
        Ok(snapshot) => return (snapshot, LoadSource::Primary),
        Err(reason) => {
            if fs::try_exists(path).await.unwrap_or(false) {
                tracing::error!(path = %path.display(), %reason, "Data file unreadable, trying backup");
            } else {
                tracing::info!(path = %path.display(), "No data file yet, trying backup");
            }
        }
    }

    let backup = backup_path(path);
    match read_snapshot(&backup).await {
        Ok(snapshot) => {
            tracing::warn!(path = %backup.display(), "Recovered state from backup");
            (snapshot, LoadSource::Backup)
        }
        Err(reason) => {
            tracing::warn!(path = %backup.display(), %reason, "Backup unusable, starting empty");
            (Snapshot::default(), LoadSource::Default)
        }
    }
}

async fn write_temp(temp: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(temp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

/// Atomically replaces the primary with `bytes`. When `refresh_backup` is set
/// the current primary is copied to `.backup` first; callers pass it only for
/// a primary known to hold a good snapshot.
///
/// On failure the temp file is removed and the primary is left untouched.
pub async fn write_atomic(path: &Path, bytes: &[u8], refresh_backup: bool) -> CoreResult<()> {
    if refresh_backup && fs::try_exists(path).await.unwrap_or(false) {
        if let Err(e) = fs::copy(path, backup_path(path)).await {
            tracing::warn!(path = %path.display(), error = %e, "Could not refresh backup");
        }
    }

    let temp = temp_path(path);
    let result = match write_temp(&temp, bytes).await {
        Ok(()) => fs::rename(&temp, path).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        if let Err(unlink) = fs::remove_file(&temp).await {
            if unlink.kind() != io::ErrorKind::NotFound {
                tracing::error!(path = %temp.display(), error = %unlink, "Could not remove temp file");
            }
        }
        return Err(CoreError::Persistence(format!(
            "writing {}: {e}",
            path.display()
        )));
    }

    Ok(())
}
