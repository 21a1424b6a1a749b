//! Constants for the download module (timeouts, streaming, progress batching).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Capacity of the buffered writer used when streaming to the temp file.
pub const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Progress is published to the record after at least this many new bytes...
pub const PROGRESS_BATCH_BYTES: u64 = 256 * 1024;

/// ...or after this much time, whichever comes first.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Suffix appended to the destination file name while a transfer is in flight.
pub const TEMP_SUFFIX: &str = "part";

/// Suffix of the JSON resume checkpoint written next to the temp file.
pub const CHECKPOINT_SUFFIX: &str = "part.json";

/// How long `shutdown()` waits for in-flight workers before giving up.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Capacity of the transfer event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Upper bound on the worker pool size.
pub const MAX_WORKERS: usize = 64;
