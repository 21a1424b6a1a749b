//! File Downloader Library
//!
//! This library provides a concurrent, resumable HTTP download engine:
//! transfers are registered, dispatched by priority onto a bounded worker
//! pool, streamed to a temp file and atomically moved into place. Transfers
//! can be paused, resumed from the bytes already on disk, and cancelled.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`download`] - Transfer records, registry, scheduler, runner and engine

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod download;
#[cfg(test)]
pub mod test_support;
pub(crate) mod user_agent;

// Re-export commonly used types
pub use download::{
    DownloadEngine, DownloadError, DownloadRequest, EngineConfig, EngineError, Priority, Status,
    TransferEvent, TransferId, TransferSnapshot, cleanup_stale_temp_files,
};
