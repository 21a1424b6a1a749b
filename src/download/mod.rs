//! Resumable, prioritized HTTP downloads.
//!
//! This module provides a download engine that streams HTTP(S) resources to
//! disk with a bounded pool of workers, pause/resume via byte ranges and
//! cooperative cancellation.
//!
//! # Features
//!
//! - Priority dispatch (`Immediate > High > Medium > Low`, FIFO within a band)
//! - Pause and resume using `Range` / `If-Range`, with on-disk checkpoints
//! - Cancellation of single transfers, tagged groups or everything
//! - Atomic finalize: bytes land in `<file>.part` and are renamed on success
//! - Lifecycle events over a broadcast channel
//!
//! # Example
//!
//! ```no_run
//! use file_downloader::download::{DownloadEngine, DownloadRequest, EngineConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = DownloadEngine::new(EngineConfig::default())?;
//! let id = engine.download(DownloadRequest::new(
//!     "https://example.com/paper.pdf",
//!     "./downloads",
//!     "paper.pdf",
//! ))?;
//! if let Some(snapshot) = engine.wait(id).await {
//!     println!("{}: {}", snapshot.id, snapshot.status);
//! }
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
mod client;
pub mod constants;
mod engine;
mod error;
mod events;
mod record;
mod registry;
mod request;
mod runner;
mod scheduler;
pub mod storage;

pub use client::{
    ClientBuildError, ClientSettings, ContentRange, HttpClient, OpenRequest, content_length,
    parse_content_range, validator,
};
pub use engine::{DownloadEngine, EngineConfig, EngineError, EngineStats, default_workers};
pub use error::{DownloadError, ErrorKind, TransferError};
pub use events::{EventSender, TransferEvent};
pub use record::{
    ActiveGuard, Priority, Status, TransferId, TransferRecord, TransferSnapshot, Validator,
};
pub use registry::TransferRegistry;
pub use request::DownloadRequest;
pub use runner::Runner;
pub use scheduler::{Job, ScheduleError, Scheduler, Slot};
pub use storage::cleanup_stale_temp_files;

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
