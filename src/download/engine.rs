//! Download engine: registration, scheduling and control of transfers.
//!
//! [`DownloadEngine`] ties the pieces together. A submitted request becomes a
//! PENDING [`TransferRecord`] in the registry and a job in the priority
//! scheduler; a worker then hands it to the runner. Pause, resume and cancel
//! act on the record directly (tokens and state) and only touch the scheduler
//! to withdraw a job that has not started.
//!
//! # Example
//!
//! ```no_run
//! use file_downloader::download::{DownloadEngine, DownloadRequest, EngineConfig, Priority};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = DownloadEngine::new(EngineConfig::default())?;
//! let id = engine.download(
//!     DownloadRequest::new("https://example.com/big.iso", "./downloads", "big.iso")
//!         .priority(Priority::High),
//! )?;
//! engine.pause(id);
//! engine.resume(id);
//! let snapshot = engine.wait(id).await;
//! println!("{snapshot:?}");
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use super::checkpoint;
use super::client::{ClientBuildError, ClientSettings, HttpClient};
use super::constants::{
    CONNECT_TIMEOUT_SECS, EVENT_CHANNEL_CAPACITY, MAX_WORKERS, READ_TIMEOUT_SECS, SHUTDOWN_GRACE,
};
use super::error::{ErrorKind, TransferError};
use super::events::{EventSender, TransferEvent};
use super::record::{Priority, Status, TransferId, TransferRecord, TransferSnapshot};
use super::registry::TransferRegistry;
use super::request::DownloadRequest;
use super::runner::Runner;
use super::scheduler::{Job, ScheduleError, Scheduler, Slot};
use super::storage;
use crate::user_agent;

/// Minimum allowed worker count.
const MIN_WORKERS: usize = 1;

/// Worker count used when none is configured: available parallelism clamped
/// to `1..=MAX_WORKERS`.
#[must_use]
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map_or(4, NonZeroUsize::get)
        .clamp(MIN_WORKERS, MAX_WORKERS)
}

/// Error type for download engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid worker count provided.
    #[error("invalid worker count {value}: must be between {MIN_WORKERS} and {MAX_WORKERS}")]
    InvalidWorkers {
        /// The invalid value that was provided.
        value: usize,
    },

    /// Some other configuration value is out of range.
    #[error("invalid engine configuration: {reason}")]
    InvalidConfig {
        /// What is wrong.
        reason: String,
    },

    /// The HTTP client could not be built.
    #[error(transparent)]
    Client(#[from] ClientBuildError),

    /// `new` was called outside a tokio runtime.
    #[error("no tokio runtime available; use DownloadEngine::with_handle")]
    NoRuntime,

    /// `execute_blocking` was called from inside the async runtime.
    #[error("execute_blocking must not be called from within an async runtime")]
    InsideRuntime,

    /// The scheduler rejected the job.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// The engine has been shut down.
    #[error("download engine has shut down")]
    ShutDown,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Maximum idle time while waiting for response data.
    pub read_timeout: Duration,
    /// User-Agent for requests that do not set their own.
    pub user_agent: Option<String>,
    /// Headers sent with every request.
    pub default_headers: Vec<(String, String)>,
    /// How long `shutdown` waits for running workers.
    pub shutdown_grace: Duration,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            user_agent: None,
            default_headers: Vec::new(),
            shutdown_grace: SHUTDOWN_GRACE,
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Checks ranges.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidWorkers`] or [`EngineError::InvalidConfig`].
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.workers) {
            return Err(EngineError::InvalidWorkers {
                value: self.workers,
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(EngineError::InvalidConfig {
                reason: "connect_timeout must be greater than zero".to_string(),
            });
        }
        if self.read_timeout.is_zero() {
            return Err(EngineError::InvalidConfig {
                reason: "read_timeout must be greater than zero".to_string(),
            });
        }
        if self.event_capacity == 0 {
            return Err(EngineError::InvalidConfig {
                reason: "event_capacity must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            user_agent: self
                .user_agent
                .clone()
                .unwrap_or_else(user_agent::default_user_agent),
            default_headers: self.default_headers.clone(),
        }
    }
}

/// Count of registered transfers per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Waiting for a worker.
    pub pending: usize,
    /// STARTED, CONNECTING or DOWNLOADING.
    pub running: usize,
    /// Paused.
    pub paused: usize,
    /// Completed.
    pub successful: usize,
    /// Failed.
    pub failed: usize,
    /// Cancelled.
    pub cancelled: usize,
}

impl EngineStats {
    /// Transfers that will not change again without a control call.
    #[must_use]
    pub fn settled(&self) -> usize {
        self.paused + self.successful + self.failed + self.cancelled
    }

    /// All counted transfers.
    #[must_use]
    pub fn total(&self) -> usize {
        self.pending + self.running + self.settled()
    }
}

/// Scheduler job wrapping one record.
struct TransferJob {
    record: Arc<TransferRecord>,
    runner: Arc<Runner>,
}

impl Job for TransferJob {
    fn id(&self) -> TransferId {
        self.record.id()
    }

    fn priority(&self) -> Priority {
        self.record.priority()
    }

    fn run(self, slot: Slot) -> impl Future<Output = ()> + Send {
        async move {
            let run = self.runner.run(&self.record, Some(slot));
            if AssertUnwindSafe(run).catch_unwind().await.is_err() {
                error!(transfer_id = %self.record.id(), "transfer runner panicked");
                self.record.fail(TransferError {
                    kind: ErrorKind::Internal,
                    message: "transfer runner panicked".to_string(),
                    http_status: None,
                    resumable: true,
                });
            }
        }
    }
}

#[derive(Debug)]
struct EngineInner {
    config: EngineConfig,
    registry: TransferRegistry,
    scheduler: Scheduler<TransferJob>,
    runner: Arc<Runner>,
    events: EventSender,
    handle: Handle,
    shut_down: AtomicBool,
}

/// Download engine with a bounded priority worker pool.
///
/// Cheap to clone; clones share the same registry and workers. There is no
/// global instance: construct one and call [`shutdown`](Self::shutdown) when
/// done.
///
/// # Control calls
///
/// `pause`, `resume` and `cancel*` never fail. They return whether anything
/// changed, and unknown ids or transfers in an unsuitable state are no-ops.
#[derive(Debug, Clone)]
pub struct DownloadEngine {
    inner: Arc<EngineInner>,
}

impl DownloadEngine {
    /// Creates an engine on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoRuntime`] outside a runtime, or any error from
    /// [`with_handle`](Self::with_handle).
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let handle = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        Self::with_handle(config, handle)
    }

    /// Creates an engine whose workers run on `handle`.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid configuration or when the HTTP client
    /// cannot be built.
    #[instrument(level = "debug", skip_all, fields(workers = config.workers))]
    pub fn with_handle(config: EngineConfig, handle: Handle) -> Result<Self, EngineError> {
        config.validate()?;
        let client = HttpClient::new(&config.client_settings())?;
        let events = EventSender::new(config.event_capacity);
        let runner = Arc::new(Runner::new(client, events.clone(), config.read_timeout));
        let scheduler = Scheduler::start(config.workers, &handle);

        debug!(
            workers = config.workers,
            connect_timeout_ms = config.connect_timeout.as_millis(),
            read_timeout_ms = config.read_timeout.as_millis(),
            "creating download engine"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                registry: TransferRegistry::new(),
                scheduler,
                runner,
                events,
                handle,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Registers `request` and queues it. Returns as soon as it is queued.
    ///
    /// # Errors
    ///
    /// [`EngineError::ShutDown`] after [`shutdown`](Self::shutdown).
    #[instrument(skip_all, fields(url = %request.url, priority = %request.priority))]
    pub fn download(&self, request: DownloadRequest) -> Result<TransferId, EngineError> {
        if self.is_shut_down() {
            return Err(EngineError::ShutDown);
        }
        let record = self.inner.registry.register(request);
        if let Err(error) = self.enqueue(&record) {
            record.request_cancel();
            record.transition(Status::Cancelled);
            return Err(error);
        }
        info!(transfer_id = %record.id(), destination = %record.destination().display(), "transfer queued");
        Ok(record.id())
    }

    /// Registers `request` and runs it on the calling task, bypassing the
    /// worker pool. Returns once the transfer settles (terminal or paused).
    ///
    /// The transfer is registered like any other, so other tasks can pause or
    /// cancel it by id while it runs.
    ///
    /// # Errors
    ///
    /// [`EngineError::ShutDown`] after [`shutdown`](Self::shutdown).
    #[instrument(skip_all, fields(url = %request.url))]
    pub async fn execute(&self, request: DownloadRequest) -> Result<TransferSnapshot, EngineError> {
        if self.is_shut_down() {
            return Err(EngineError::ShutDown);
        }
        let record = self.inner.registry.register(request);
        self.inner.runner.run(&record, None).await;
        Ok(record.snapshot())
    }

    /// Blocking variant of [`execute`](Self::execute) for synchronous callers.
    ///
    /// The engine's handle must belong to a multi-thread runtime: blocking on a
    /// current-thread handle cannot drive its IO or timers.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InsideRuntime`] when called from inside a tokio runtime
    /// - [`EngineError::InvalidConfig`] when the engine runs on a current-thread
    ///   runtime
    /// - otherwise as [`execute`](Self::execute)
    pub fn execute_blocking(
        &self,
        request: DownloadRequest,
    ) -> Result<TransferSnapshot, EngineError> {
        if Handle::try_current().is_ok() {
            return Err(EngineError::InsideRuntime);
        }
        if self.inner.handle.runtime_flavor() == RuntimeFlavor::CurrentThread {
            return Err(EngineError::InvalidConfig {
                reason: "execute_blocking requires a multi-thread runtime handle".to_string(),
            });
        }
        self.inner.handle.block_on(self.execute(request))
    }

    /// Requests a pause.
    ///
    /// A queued transfer is withdrawn and becomes PAUSED immediately; a running
    /// one stops at its next chunk boundary.
    pub fn pause(&self, id: TransferId) -> bool {
        let Some(record) = self.inner.registry.lookup(id) else {
            return false;
        };
        match record.status() {
            Status::Pending => {
                if self.inner.scheduler.remove(id).is_some() {
                    if record.transition(Status::Paused) {
                        debug!(transfer_id = %id, "paused while queued");
                        self.inner.events.emit(TransferEvent::Paused {
                            id,
                            bytes: record.bytes_downloaded(),
                        });
                    }
                } else {
                    record.request_pause();
                }
                true
            }
            status if status.is_running() => {
                debug!(transfer_id = %id, %status, "pause requested");
                record.request_pause();
                true
            }
            _ => false,
        }
    }

    /// Re-queues a PAUSED transfer, or a FAILED one whose error is resumable.
    ///
    /// The transfer keeps its id, priority and downloaded bytes and gets a new
    /// sequence number.
    pub fn resume(&self, id: TransferId) -> bool {
        let Some(record) = self.inner.registry.lookup(id) else {
            return false;
        };
        if self.is_shut_down() {
            return false;
        }
        let previous = record.snapshot();
        let requeued = match previous.status {
            Status::Paused => record.transition(Status::Pending),
            Status::Failed => record.requeue_failed(),
            _ => false,
        };
        if !requeued {
            return false;
        }
        record.reset_pause();
        match self.enqueue(&record) {
            Ok(()) => {
                info!(transfer_id = %id, offset = record.bytes_downloaded(), "transfer resumed");
                true
            }
            Err(error) => {
                warn!(transfer_id = %id, error = %error, "could not re-queue transfer");
                record.undo_requeue(previous.status, previous.error);
                false
            }
        }
    }

    /// Cancels a transfer and deletes its partial file.
    ///
    /// Cancelling a terminal transfer is a no-op.
    pub async fn cancel(&self, id: TransferId) -> bool {
        let Some(record) = self.inner.registry.lookup(id) else {
            return false;
        };
        self.cancel_record(&record).await
    }

    /// Cancels every transfer carrying `tag`. Returns how many were affected.
    pub async fn cancel_tag(&self, tag: &str) -> usize {
        let mut cancelled = 0;
        for record in self.inner.registry.lookup_by_tag(tag) {
            if self.cancel_record(&record).await {
                cancelled += 1;
            }
        }
        debug!(tag, cancelled, "cancelled tagged transfers");
        cancelled
    }

    /// Cancels every non-terminal transfer. Returns how many were affected.
    pub async fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for record in self.inner.registry.all() {
            if self.cancel_record(&record).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    async fn cancel_record(&self, record: &Arc<TransferRecord>) -> bool {
        let status = record.status();
        if status.is_terminal() {
            return false;
        }
        record.request_cancel();

        let withdrawn = self.inner.scheduler.remove(record.id()).is_some();
        let idle = matches!(status, Status::Pending | Status::Paused) && !record.is_active();
        if (withdrawn || idle) && record.transition(Status::Cancelled) {
            storage::remove_if_exists(&record.temp_path()).await;
            checkpoint::remove(&record.checkpoint_path()).await;
            record.set_progress(0);
            self.inner
                .events
                .emit(TransferEvent::Cancelled { id: record.id() });
        }
        debug!(transfer_id = %record.id(), %status, "cancel requested");
        true
    }

    /// Current status; [`Status::Unknown`] for ids never registered.
    #[must_use]
    pub fn status(&self, id: TransferId) -> Status {
        self.inner
            .registry
            .lookup(id)
            .map_or(Status::Unknown, |record| record.status())
    }

    /// Consistent view of one transfer.
    #[must_use]
    pub fn snapshot(&self, id: TransferId) -> Option<TransferSnapshot> {
        self.inner
            .registry
            .lookup(id)
            .map(|record| record.snapshot())
    }

    /// Snapshots of every registered transfer, ordered by id.
    #[must_use]
    pub fn snapshots(&self) -> Vec<TransferSnapshot> {
        self.inner
            .registry
            .all()
            .iter()
            .map(|record| record.snapshot())
            .collect()
    }

    /// Waits until the transfer is terminal or paused.
    pub async fn wait(&self, id: TransferId) -> Option<TransferSnapshot> {
        let record = self.inner.registry.lookup(id)?;
        let mut status = record.subscribe_status();
        while !status.borrow_and_update().is_settled() {
            if status.changed().await.is_err() {
                break;
            }
        }
        Some(record.snapshot())
    }

    /// Receives lifecycle events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    /// Forgets a terminal transfer. Returns whether it was removed.
    pub fn remove(&self, id: TransferId) -> bool {
        self.inner.registry.remove(id).is_some()
    }

    /// Count of transfers per status.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let mut stats = EngineStats::default();
        for record in self.inner.registry.all() {
            match record.status() {
                Status::Pending => stats.pending += 1,
                Status::Started | Status::Connecting | Status::Downloading => stats.running += 1,
                Status::Paused => stats.paused += 1,
                Status::Successful => stats.successful += 1,
                Status::Failed => stats.failed += 1,
                Status::Cancelled => stats.cancelled += 1,
                Status::Unknown => {}
            }
        }
        stats
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Stops the engine.
    ///
    /// New submissions are rejected, queued transfers are cancelled, running
    /// ones are signalled to cancel, and workers get `shutdown_grace` to exit.
    /// Paused transfers keep their partial files. Returns whether every worker
    /// exited in time. Safe to call more than once.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> bool {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return true;
        }
        info!("shutting down download engine");

        for job in self.inner.scheduler.close() {
            let record = job.record;
            record.request_cancel();
            if record.transition(Status::Cancelled) {
                storage::remove_if_exists(&record.temp_path()).await;
                checkpoint::remove(&record.checkpoint_path()).await;
                record.set_progress(0);
                self.inner
                    .events
                    .emit(TransferEvent::Cancelled { id: record.id() });
            }
        }
        for record in self.inner.registry.all() {
            let status = record.status();
            if status.is_running() || (status == Status::Pending && record.is_active()) {
                record.request_cancel();
            }
        }

        let clean = self.inner.scheduler.join(self.inner.config.shutdown_grace).await;
        info!(clean, "download engine stopped");
        clean
    }

    fn enqueue(&self, record: &Arc<TransferRecord>) -> Result<(), EngineError> {
        let job = TransferJob {
            record: Arc::clone(record),
            runner: Arc::clone(&self.inner.runner),
        };
        let sequence = self.inner.scheduler.submit(job).map_err(|error| match error {
            ScheduleError::ShutDown => EngineError::ShutDown,
            other => EngineError::Schedule(other),
        })?;
        record.set_sequence(sequence);
        Ok(())
    }
}
