//! Transfer record: identity, configuration and mutable state of one download.
//!
//! Identity fields are immutable after registration. Status, progress counters,
//! the recorded failure cause and the resume validator live together behind a
//! single mutex so that status queries always observe a consistent snapshot.
//! Pause and cancel requests are cancellation tokens observed by the runner.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::TransferError;
use super::request::DownloadRequest;
use super::storage;

/// Process-unique transfer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(u64);

impl TransferId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling priority. Higher variants are dispatched first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default band.
    #[default]
    Medium,
    /// Ahead of ordinary transfers.
    High,
    /// Ahead of everything else.
    Immediate,
}

impl Priority {
    /// Returns the stable string label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Immediate => "immediate",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "immediate" => Ok(Self::Immediate),
            _ => Err(format!("invalid priority: {s}")),
        }
    }
}

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Returned for ids that were never registered.
    #[default]
    Unknown,
    /// Registered, waiting for a worker.
    Pending,
    /// Worker acquired, about to connect.
    Started,
    /// Request issued, waiting for response headers.
    Connecting,
    /// Streaming bytes to the temp file.
    Downloading,
    /// Stopped by request; partial file retained.
    Paused,
    /// Stopped permanently by request; partial file removed.
    Cancelled,
    /// All bytes written and moved to the destination.
    Successful,
    /// Ended with an error.
    Failed,
}

impl Status {
    /// Returns the stable string label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Connecting => "connecting",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Successful => "successful",
            Self::Failed => "failed",
        }
    }

    /// SUCCESSFUL, FAILED and CANCELLED.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Successful | Self::Failed)
    }

    /// States in which no worker holds the transfer and none will pick it up.
    #[must_use]
    pub fn is_settled(self) -> bool {
        self.is_terminal() || self == Self::Paused
    }

    /// Whether a worker is (or is about to be) streaming this transfer.
    #[must_use]
    pub fn is_running(self) -> bool {
        matches!(self, Self::Started | Self::Connecting | Self::Downloading)
    }

    /// Edges of the transfer state machine.
    ///
    /// `Failed -> Pending` exists only for `resume` of a resumable failure; the
    /// caller checks resumability before taking it.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use Status::{
            Cancelled, Connecting, Downloading, Failed, Paused, Pending, Started, Successful,
        };
        matches!(
            (self, next),
            (Pending, Started | Paused | Cancelled)
                | (Started, Connecting | Paused | Cancelled | Failed)
                | (Connecting, Downloading | Paused | Cancelled | Failed)
                | (Downloading, Paused | Cancelled | Failed | Successful)
                | (Paused | Failed, Pending)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server validators captured from the first response, replayed as `If-Range`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// `ETag` response header.
    pub etag: Option<String>,
    /// `Last-Modified` response header.
    pub last_modified: Option<String>,
}

impl Validator {
    /// Value for an `If-Range` header; strong `ETag`s are preferred.
    #[must_use]
    pub fn if_range(&self) -> Option<&str> {
        match &self.etag {
            Some(etag) if !etag.starts_with("W/") => Some(etag.as_str()),
            _ => self.last_modified.as_deref(),
        }
    }
}

/// Point-in-time copy of a record's observable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferSnapshot {
    /// Transfer id.
    pub id: TransferId,
    /// Source URL.
    pub url: String,
    /// Final destination path.
    pub destination: PathBuf,
    /// Grouping tag.
    pub tag: Option<String>,
    /// Scheduling priority.
    pub priority: Priority,
    /// Sequence number of the latest submission.
    pub sequence: u64,
    /// Current status.
    pub status: Status,
    /// Bytes confirmed on disk.
    pub bytes_downloaded: u64,
    /// Total size when known.
    pub total_bytes: Option<u64>,
    /// Failure cause when `status == Failed`.
    pub error: Option<TransferError>,
}

impl TransferSnapshot {
    /// Completed fraction in `0.0..=1.0` when the total is known.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some(self.bytes_downloaded as f64 / total as f64),
            None => None,
        }
    }
}

#[derive(Debug)]
struct TransferState {
    status: Status,
    bytes_downloaded: u64,
    total_bytes: Option<u64>,
    sequence: u64,
    error: Option<TransferError>,
    validator: Validator,
}

/// One registered download.
#[derive(Debug)]
pub struct TransferRecord {
    id: TransferId,
    url: String,
    dir: PathBuf,
    file_name: String,
    tag: Option<String>,
    priority: Priority,
    headers: Vec<(String, String)>,
    user_agent: Option<String>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    state: Mutex<TransferState>,
    status_tx: watch::Sender<Status>,
    active: AtomicBool,
    cancel: CancellationToken,
    pause: Mutex<CancellationToken>,
}

impl TransferRecord {
    /// Creates a PENDING record from a request.
    #[must_use]
    pub fn new(id: TransferId, request: DownloadRequest) -> Self {
        let (status_tx, _) = watch::channel(Status::Pending);
        Self {
            id,
            url: request.url,
            dir: request.dir,
            file_name: request.file_name,
            tag: request.tag,
            priority: request.priority,
            headers: request.headers,
            user_agent: request.user_agent,
            connect_timeout: request.connect_timeout,
            read_timeout: request.read_timeout,
            state: Mutex::new(TransferState {
                status: Status::Pending,
                bytes_downloaded: 0,
                total_bytes: None,
                sequence: 0,
                error: None,
                validator: Validator::default(),
            }),
            status_tx,
            active: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            pause: Mutex::new(CancellationToken::new()),
        }
    }

    /// Transfer id.
    #[must_use]
    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Source URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Grouping tag.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Scheduling priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Extra request headers.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Per-transfer User-Agent override.
    #[must_use]
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// Per-transfer bound on connecting and receiving response headers.
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Per-transfer read timeout override.
    #[must_use]
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Directory the file is written to.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final destination path.
    #[must_use]
    pub fn destination(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// Temp file holding bytes `[0, bytes_downloaded)`.
    #[must_use]
    pub fn temp_path(&self) -> PathBuf {
        storage::temp_path(&self.dir, &self.file_name)
    }

    /// Resume checkpoint written next to the temp file.
    #[must_use]
    pub fn checkpoint_path(&self) -> PathBuf {
        storage::checkpoint_path(&self.dir, &self.file_name)
    }

    fn lock_state(&self) -> MutexGuard<'_, TransferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> Status {
        self.lock_state().status
    }

    /// Consistent copy of the observable state.
    #[must_use]
    pub fn snapshot(&self) -> TransferSnapshot {
        let state = self.lock_state();
        TransferSnapshot {
            id: self.id,
            url: self.url.clone(),
            destination: self.destination(),
            tag: self.tag.clone(),
            priority: self.priority,
            sequence: state.sequence,
            status: state.status,
            bytes_downloaded: state.bytes_downloaded,
            total_bytes: state.total_bytes,
            error: state.error.clone(),
        }
    }

    /// Moves to `next` if the state machine allows it. Returns whether it did.
    pub fn transition(&self, next: Status) -> bool {
        let mut state = self.lock_state();
        self.transition_locked(&mut state, next)
    }

    fn transition_locked(&self, state: &mut TransferState, next: Status) -> bool {
        let current = state.status;
        if !current.can_transition_to(next) {
            debug!(transfer_id = %self.id, from = %current, to = %next, "transition rejected");
            return false;
        }
        state.status = next;
        if next == Status::Pending {
            state.error = None;
        }
        self.status_tx.send_replace(next);
        debug!(transfer_id = %self.id, from = %current, to = %next, "transition");
        true
    }

    /// Moves to FAILED and records the cause.
    pub fn fail(&self, error: TransferError) -> bool {
        let mut state = self.lock_state();
        if !state.status.can_transition_to(Status::Failed) {
            return false;
        }
        state.error = Some(error);
        self.transition_locked(&mut state, Status::Failed)
    }

    /// Moves a FAILED record back to PENDING when its failure is resumable.
    pub fn requeue_failed(&self) -> bool {
        let mut state = self.lock_state();
        let resumable = state.error.as_ref().is_some_and(|error| error.resumable);
        if state.status != Status::Failed || !resumable {
            return false;
        }
        self.transition_locked(&mut state, Status::Pending)
    }

    /// Undoes a requeue that the scheduler refused, putting back the PAUSED or
    /// FAILED status (and failure cause) the record held before it.
    pub fn undo_requeue(&self, previous: Status, error: Option<TransferError>) -> bool {
        let mut state = self.lock_state();
        if state.status != Status::Pending || !matches!(previous, Status::Paused | Status::Failed) {
            return false;
        }
        state.status = previous;
        state.error = error;
        self.status_tx.send_replace(previous);
        debug!(transfer_id = %self.id, to = %previous, "requeue undone");
        true
    }

    /// Bytes confirmed on disk.
    #[must_use]
    pub fn bytes_downloaded(&self) -> u64 {
        self.lock_state().bytes_downloaded
    }

    /// Total size when known.
    #[must_use]
    pub fn total_bytes(&self) -> Option<u64> {
        self.lock_state().total_bytes
    }

    /// Publishes progress. Callers keep `bytes <= total`.
    pub fn set_progress(&self, bytes_downloaded: u64) {
        self.lock_state().bytes_downloaded = bytes_downloaded;
    }

    /// Sets offset and total together (restart, resume from checkpoint, headers).
    pub fn set_extent(&self, bytes_downloaded: u64, total_bytes: Option<u64>) {
        let mut state = self.lock_state();
        state.bytes_downloaded = bytes_downloaded;
        state.total_bytes = total_bytes;
    }

    /// Resume validator.
    #[must_use]
    pub fn validator(&self) -> Validator {
        self.lock_state().validator.clone()
    }

    /// Replaces the resume validator.
    pub fn set_validator(&self, validator: Validator) {
        self.lock_state().validator = validator;
    }

    /// Records the sequence number of a new submission.
    pub fn set_sequence(&self, sequence: u64) {
        self.lock_state().sequence = sequence;
    }

    /// Watches status changes.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.status_tx.subscribe()
    }

    /// Claims the single worker slot for this record.
    #[must_use]
    pub fn try_activate(self: &Arc<Self>) -> Option<ActiveGuard> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ActiveGuard {
                record: Arc::clone(self),
            })
    }

    /// Whether a worker currently holds this record.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Permanent cancel token for this record.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signals cancellation.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    /// Pause token for the current run.
    #[must_use]
    pub fn pause_token(&self) -> CancellationToken {
        self.pause
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Signals pause to the current run.
    pub fn request_pause(&self) {
        self.pause
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    /// Installs a fresh pause token before a re-submission.
    pub fn reset_pause(&self) {
        *self.pause.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
    }
}

/// Holds a record's worker slot; released on drop.
#[derive(Debug)]
pub struct ActiveGuard {
    record: Arc<TransferRecord>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.record.active.store(false, Ordering::Release);
    }
}
