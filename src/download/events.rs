//! Lifecycle events broadcast to subscribers.
//!
//! Events are advisory: a lagging subscriber loses the oldest ones and should
//! fall back to [`crate::download::DownloadEngine::snapshot`] for exact state.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use super::error::TransferError;
use super::record::TransferId;

/// A change in some transfer's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    /// A worker picked the transfer up.
    Started {
        /// Transfer id.
        id: TransferId,
        /// Offset the run continues from.
        offset: u64,
    },
    /// A progress batch was published.
    Progress {
        /// Transfer id.
        id: TransferId,
        /// Bytes confirmed so far.
        bytes: u64,
        /// Total size when known.
        total: Option<u64>,
    },
    /// The transfer stopped at a pause request.
    Paused {
        /// Transfer id.
        id: TransferId,
        /// Bytes retained in the temp file.
        bytes: u64,
    },
    /// The transfer was cancelled.
    Cancelled {
        /// Transfer id.
        id: TransferId,
    },
    /// The file is complete at `path`.
    Completed {
        /// Transfer id.
        id: TransferId,
        /// Final destination.
        path: PathBuf,
        /// Final size.
        bytes: u64,
    },
    /// The transfer failed.
    Failed {
        /// Transfer id.
        id: TransferId,
        /// Recorded cause.
        error: TransferError,
    },
}

impl TransferEvent {
    /// Id of the transfer the event is about.
    #[must_use]
    pub fn id(&self) -> TransferId {
        match self {
            Self::Started { id, .. }
            | Self::Progress { id, .. }
            | Self::Paused { id, .. }
            | Self::Cancelled { id }
            | Self::Completed { id, .. }
            | Self::Failed { id, .. } => *id,
        }
    }

    /// Whether no further events follow for this run.
    #[must_use]
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Started { .. } | Self::Progress { .. })
    }
}

/// Sending half shared by the engine and its runners.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: broadcast::Sender<TransferEvent>,
}

impl EventSender {
    /// Creates a channel holding up to `capacity` undelivered events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn emit(&self, event: TransferEvent) {
        trace!(?event, "transfer event");
        let _ = self.tx.send(event);
    }

    /// New receiver seeing events sent from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }
}
