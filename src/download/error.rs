//! Error types for the download module.
//!
//! [`DownloadError`] is what the transport and the runner produce while a
//! transfer is in flight. Because it wraps non-cloneable sources it is reduced
//! to a [`TransferError`] before being stored on the transfer record, where
//! callers can query the cause of a FAILED outcome.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while running a single transfer.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, reset, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Connect or read timed out.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// File system error during download (create file, write, rename, etc.)
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// A request header name or value is not valid HTTP.
    #[error("invalid request header: {name}")]
    InvalidHeader {
        /// The offending header name.
        name: String,
    },

    /// Written byte count does not match the expected total.
    #[error(
        "integrity check failed for {path}: expected {expected_bytes} bytes, got {actual_bytes}"
    )]
    Integrity {
        /// Temp file that failed verification.
        path: PathBuf,
        /// Expected size in bytes.
        expected_bytes: u64,
        /// Actual size in bytes.
        actual_bytes: u64,
    },

    /// The server answered a range request with a range we did not ask for.
    #[error("unexpected Content-Range from {url}: requested offset {requested}, got {received}")]
    UnexpectedRange {
        /// The URL being downloaded.
        url: String,
        /// Offset we asked the server to resume from.
        requested: u64,
        /// Raw Content-Range value (or "missing").
        received: String,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error, promoting timeouts.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::Timeout { url: url.into() };
        }
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an invalid header error.
    pub fn invalid_header(name: impl Into<String>) -> Self {
        Self::InvalidHeader { name: name.into() }
    }

    /// Creates an integrity mismatch error.
    pub fn integrity(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates an unexpected Content-Range error.
    pub fn unexpected_range(
        url: impl Into<String>,
        requested: u64,
        received: impl Into<String>,
    ) -> Self {
        Self::UnexpectedRange {
            url: url.into(),
            requested,
            received: received.into(),
        }
    }

    /// Returns the error category.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Network,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::HttpStatus { .. } => ErrorKind::HttpStatus,
            Self::Io { .. } => ErrorKind::Io,
            Self::InvalidUrl { .. } => ErrorKind::InvalidUrl,
            Self::InvalidHeader { .. } => ErrorKind::InvalidHeader,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::UnexpectedRange { .. } => ErrorKind::Protocol,
        }
    }

    /// Whether a later `resume` can continue from the bytes already written.
    ///
    /// Transient I/O (resets, timeouts, 5xx, short bodies) keeps the partial
    /// file; client errors and malformed responses do not.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::Io { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500 || matches!(status, 408 | 429),
            Self::Integrity {
                expected_bytes,
                actual_bytes,
                ..
            } => actual_bytes < expected_bytes,
            Self::InvalidUrl { .. }
            | Self::InvalidHeader { .. }
            | Self::UnexpectedRange { .. } => false,
        }
    }

    /// HTTP status code carried by this error, if any.
    #[must_use]
    pub fn http_status_code(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Broad category of a transfer failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection-level failure.
    Network,
    /// Connect or read timeout.
    Timeout,
    /// Server answered with an error status.
    HttpStatus,
    /// Local disk failure.
    Io,
    /// URL could not be parsed.
    InvalidUrl,
    /// A request header was rejected before sending.
    InvalidHeader,
    /// Byte count did not match the announced length.
    Integrity,
    /// Malformed response (e.g. a wrong Content-Range).
    Protocol,
    /// The runner itself crashed.
    Internal,
}

impl ErrorKind {
    /// Returns the stable string label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::HttpStatus => "http_status",
            Self::Io => "io",
            Self::InvalidUrl => "invalid_url",
            Self::InvalidHeader => "invalid_header",
            Self::Integrity => "integrity",
            Self::Protocol => "protocol",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure cause recorded on a transfer record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferError {
    /// Error category.
    pub kind: ErrorKind,
    /// Human-readable message (the `Display` of the original error).
    pub message: String,
    /// HTTP status code when the server rejected the request.
    pub http_status: Option<u16>,
    /// Whether `resume` can continue from the preserved partial file.
    pub resumable: bool,
}

impl From<&DownloadError> for TransferError {
    fn from(error: &DownloadError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            http_status: error.http_status_code(),
            resumable: error.is_resumable(),
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

// No From<reqwest::Error> or From<std::io::Error>: every variant needs the url
// or path that the source error does not carry.
