//! Download request description accepted by the engine.

use std::path::PathBuf;
use std::time::Duration;

use super::record::Priority;

/// Everything needed to register a transfer.
///
/// ```
/// use file_downloader::download::{DownloadRequest, Priority};
///
/// let request = DownloadRequest::new("https://example.com/a.iso", "/tmp/isos", "a.iso")
///     .priority(Priority::High)
///     .tag("nightly")
///     .header("Authorization", "Bearer token");
/// assert_eq!(request.priority, Priority::High);
/// ```
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Source URL.
    pub url: String,
    /// Directory the file is written to.
    pub dir: PathBuf,
    /// Final file name inside `dir`.
    pub file_name: String,
    /// Scheduling priority.
    pub priority: Priority,
    /// Optional grouping key for bulk cancellation.
    pub tag: Option<String>,
    /// Extra request headers sent on every attempt.
    pub headers: Vec<(String, String)>,
    /// Overrides the engine's default User-Agent.
    pub user_agent: Option<String>,
    /// Bounds connecting and waiting for response headers on each attempt.
    pub connect_timeout: Option<Duration>,
    /// Overrides the engine's read timeout for this transfer.
    pub read_timeout: Option<Duration>,
}

impl DownloadRequest {
    /// Creates a request with default priority and no tag.
    #[must_use]
    pub fn new(url: impl Into<String>, dir: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            dir: dir.into(),
            file_name: file_name.into(),
            priority: Priority::default(),
            tag: None,
            headers: Vec::new(),
            user_agent: None,
            connect_timeout: None,
            read_timeout: None,
        }
    }

    /// Sets the scheduling priority.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the grouping tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets a per-transfer User-Agent.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Sets a per-transfer connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets a per-transfer read timeout.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}
