//! Temp-file naming, atomic finalize and stale temp sweeping.
//!
//! An in-flight transfer writes to `<dir>/<file_name>.part`; its resume
//! checkpoint lives at `<dir>/<file_name>.part.json`. On success the temp file
//! is renamed onto the destination in one step.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, instrument, warn};

use super::constants::{CHECKPOINT_SUFFIX, TEMP_SUFFIX};
use super::error::DownloadError;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Temp file path for `file_name` inside `dir`.
#[must_use]
pub fn temp_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(format!("{file_name}.{TEMP_SUFFIX}"))
}

/// Resume checkpoint path for `file_name` inside `dir`.
#[must_use]
pub fn checkpoint_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(format!("{file_name}.{CHECKPOINT_SUFFIX}"))
}

/// Creates `dir` (and parents) if missing.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] if the directory cannot be created.
pub async fn ensure_dir(dir: &Path) -> Result<(), DownloadError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| DownloadError::io(dir, e))
}

/// Moves the completed temp file onto its destination.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] if the rename fails.
#[instrument(level = "debug", skip_all, fields(temp = %temp.display(), destination = %destination.display()))]
pub async fn finalize(temp: &Path, destination: &Path) -> Result<(), DownloadError> {
    if cfg!(windows) {
        match tokio::fs::remove_file(destination).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(DownloadError::io(destination, e)),
        }
    }
    tokio::fs::rename(temp, destination)
        .await
        .map_err(|e| DownloadError::io(destination, e))
}

/// Deletes a file, treating "already gone" as success.
pub async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}

/// Length of a file, or 0 when it does not exist.
pub async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0)
}

fn is_temp_artifact(name: &str) -> bool {
    name.ends_with(&format!(".{TEMP_SUFFIX}")) || name.ends_with(&format!(".{CHECKPOINT_SUFFIX}"))
}

/// Deletes temp files and checkpoints in `dir` last modified more than `days` ago.
///
/// Invoked by callers; the engine never sweeps on its own. Returns the number
/// of files removed.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] if `dir` cannot be listed.
#[instrument(skip_all, fields(dir = %dir.display(), days))]
pub async fn cleanup_stale_temp_files(dir: &Path, days: u32) -> Result<usize, DownloadError> {
    let max_age = Duration::from_secs(u64::from(days) * SECS_PER_DAY);
    let now = SystemTime::now();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| DownloadError::io(dir, e))?;
    let mut removed = 0usize;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| DownloadError::io(dir, e))?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !is_temp_artifact(name) {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age >= max_age {
            let path = entry.path();
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), age_secs = age.as_secs(), "removed stale temp file");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale temp file"),
            }
        }
    }

    info!(removed, days, "temp cleanup complete");
    Ok(removed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_temp_and_checkpoint_paths() {
        let dir = Path::new("/downloads");
        assert_eq!(
            temp_path(dir, "movie.mkv"),
            PathBuf::from("/downloads/movie.mkv.part")
        );
        assert_eq!(
            checkpoint_path(dir, "movie.mkv"),
            PathBuf::from("/downloads/movie.mkv.part.json")
        );
    }

    #[tokio::test]
    async fn test_finalize_moves_temp_onto_destination() {
        let dir = TempDir::new().unwrap();
        let temp = temp_path(dir.path(), "a.bin");
        let destination = dir.path().join("a.bin");
        std::fs::write(&temp, b"payload").unwrap();

        finalize(&temp, &destination).await.unwrap();

        assert!(!temp.exists());
        assert_eq!(std::fs::read(&destination).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_finalize_replaces_existing_destination() {
        let dir = TempDir::new().unwrap();
        let temp = temp_path(dir.path(), "a.bin");
        let destination = dir.path().join("a.bin");
        std::fs::write(&destination, b"old").unwrap();
        std::fs::write(&temp, b"new").unwrap();

        finalize(&temp, &destination).await.unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_remove_if_exists_ignores_missing() {
        let dir = TempDir::new().unwrap();
        remove_if_exists(&dir.path().join("missing.part")).await;
    }

    #[tokio::test]
    async fn test_cleanup_zero_days_removes_only_temp_artifacts() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.bin.part"), b"x").unwrap();
        std::fs::write(dir.path().join("a.bin.part.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("done.bin"), b"keep").unwrap();

        let removed = cleanup_stale_temp_files(dir.path(), 0).await.unwrap();

        assert_eq!(removed, 2);
        assert!(dir.path().join("done.bin").exists());
        assert!(!dir.path().join("a.bin.part").exists());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_temp_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("fresh.bin.part"), b"x").unwrap();

        let removed = cleanup_stale_temp_files(dir.path(), 7).await.unwrap();

        assert_eq!(removed, 0);
        assert!(dir.path().join("fresh.bin.part").exists());
    }

    #[tokio::test]
    async fn test_cleanup_missing_dir_is_error() {
        let dir = TempDir::new().unwrap();
        let result = cleanup_stale_temp_files(&dir.path().join("nope"), 1).await;
        assert!(matches!(result, Err(DownloadError::Io { .. })));
    }
}
