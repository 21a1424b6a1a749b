//! Resume checkpoints persisted next to the temp file.
//!
//! A checkpoint records how many bytes of the temp file are confirmed and the
//! validators the server sent, so a transfer registered again after a process
//! restart can continue from the same offset.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::DownloadError;
use super::record::{TransferRecord, Validator};
use super::storage;

/// On-disk resume state for one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// URL the partial bytes came from.
    pub url: String,
    /// Bytes confirmed in the temp file.
    pub bytes_downloaded: u64,
    /// Total size when known.
    pub total_bytes: Option<u64>,
    /// Validators from the response that produced the partial bytes.
    #[serde(default)]
    pub validator: Validator,
}

impl Checkpoint {
    /// Captures the current state of a record.
    #[must_use]
    pub fn from_record(record: &TransferRecord) -> Self {
        let snapshot = record.snapshot();
        Self {
            url: snapshot.url,
            bytes_downloaded: snapshot.bytes_downloaded,
            total_bytes: snapshot.total_bytes,
            validator: record.validator(),
        }
    }
}

/// Writes a checkpoint, replacing any previous one.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] if the file cannot be written.
pub async fn save(path: &Path, checkpoint: &Checkpoint) -> Result<(), DownloadError> {
    let json = serde_json::to_vec_pretty(checkpoint)
        .map_err(|e| DownloadError::io(path, std::io::Error::other(e)))?;
    tokio::fs::write(path, json)
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    debug!(
        path = %path.display(),
        bytes = checkpoint.bytes_downloaded,
        "checkpoint saved"
    );
    Ok(())
}

/// Reads a checkpoint. Missing or unreadable files yield `None`.
pub async fn load(path: &Path) -> Option<Checkpoint> {
    let raw = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(checkpoint) => Some(checkpoint),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring corrupt checkpoint");
            None
        }
    }
}

/// Deletes a checkpoint if present.
pub async fn remove(path: &Path) {
    storage::remove_if_exists(path).await;
}
