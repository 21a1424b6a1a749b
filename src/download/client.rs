//! HTTP transport for transfers.
//!
//! [`HttpClient`] wraps a pooled reqwest client configured with connect and
//! read timeouts. It only issues (optionally ranged) GET requests and hands the
//! response back untouched: classifying the status code is the runner's job,
//! because a 200, 206 or 416 means different things depending on whether the
//! request asked for a range.

use std::time::Duration;

use reqwest::Client;
use reqwest::header::{
    CONTENT_LENGTH, ETAG, HeaderMap, HeaderName, HeaderValue, IF_RANGE, LAST_MODIFIED, RANGE,
    USER_AGENT,
};
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use super::record::Validator;
use crate::user_agent;

/// Failure to construct the underlying HTTP client.
#[derive(Debug, Error)]
pub enum ClientBuildError {
    /// A default header name or value is not valid HTTP.
    #[error("invalid default header: {name}")]
    InvalidHeader {
        /// The offending header name.
        name: String,
    },

    /// reqwest rejected the builder configuration (TLS backend, etc.)
    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Settings applied to every request made by one client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Maximum idle time between reads of the response.
    pub read_timeout: Duration,
    /// Default User-Agent.
    pub user_agent: String,
    /// Headers sent with every request.
    pub default_headers: Vec<(String, String)>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            user_agent: user_agent::default_user_agent(),
            default_headers: Vec::new(),
        }
    }
}

/// One GET request, possibly resuming at `range_start`.
#[derive(Debug, Clone, Copy)]
pub struct OpenRequest<'a> {
    /// Source URL.
    pub url: &'a str,
    /// First byte wanted. `0` sends no `Range` header.
    pub range_start: u64,
    /// Validator replayed as `If-Range` (ignored when `range_start == 0`).
    pub if_range: Option<&'a str>,
    /// Extra headers for this request only.
    pub headers: &'a [(String, String)],
    /// Overrides the client's User-Agent.
    pub user_agent: Option<&'a str>,
    /// Bounds connecting and waiting for response headers. The client-wide
    /// connect timeout still applies underneath.
    pub connect_timeout: Option<Duration>,
}

impl<'a> OpenRequest<'a> {
    /// A plain full-entity request for `url`.
    #[must_use]
    pub fn new(url: &'a str) -> Self {
        Self {
            url,
            range_start: 0,
            if_range: None,
            headers: &[],
            user_agent: None,
            connect_timeout: None,
        }
    }
}

/// HTTP client for streaming downloads.
///
/// Created once per engine and shared by every worker so connections are
/// pooled.
///
/// # Example
///
/// ```no_run
/// use file_downloader::download::{ClientSettings, HttpClient, OpenRequest};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new(&ClientSettings::default())?;
/// let mut request = OpenRequest::new("https://example.com/file.iso");
/// request.range_start = 1024;
/// let response = client.open(&request).await?;
/// println!("status: {}", response.status());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Builds a client from `settings`.
    ///
    /// Response decompression stays off: a compressed body would make
    /// `Content-Length` and byte ranges refer to different representations.
    ///
    /// # Errors
    ///
    /// Returns [`ClientBuildError`] for malformed default headers or when the
    /// reqwest builder fails.
    pub fn new(settings: &ClientSettings) -> Result<Self, ClientBuildError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &settings.default_headers {
            let (name, value) = parse_header(name, value).ok_or_else(|| {
                ClientBuildError::InvalidHeader { name: name.clone() }
            })?;
            headers.append(name, value);
        }

        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .read_timeout(settings.read_timeout)
            .user_agent(settings.user_agent.as_str())
            .default_headers(headers)
            .build()?;
        debug!(
            connect_timeout_ms = settings.connect_timeout.as_millis(),
            read_timeout_ms = settings.read_timeout.as_millis(),
            "HTTP client built"
        );
        Ok(Self { client })
    }

    /// Sends a GET and returns the response once headers arrive.
    ///
    /// Any status code is returned as `Ok`; only transport failures are errors.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::InvalidUrl`] for unparseable or non-HTTP(S) URLs
    /// - [`DownloadError::InvalidHeader`] for malformed per-request headers
    /// - [`DownloadError::Timeout`] / [`DownloadError::Network`] from the transport
    #[instrument(level = "debug", skip_all, fields(url = %request.url, range_start = request.range_start))]
    pub async fn open(&self, request: &OpenRequest<'_>) -> Result<reqwest::Response, DownloadError> {
        let url = Url::parse(request.url).map_err(|_| DownloadError::invalid_url(request.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DownloadError::invalid_url(request.url));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in request.headers {
            let (name, value) =
                parse_header(name, value).ok_or_else(|| DownloadError::invalid_header(name))?;
            headers.append(name, value);
        }
        if let Some(agent) = request.user_agent {
            let value = HeaderValue::from_str(agent)
                .map_err(|_| DownloadError::invalid_header(USER_AGENT.as_str()))?;
            headers.insert(USER_AGENT, value);
        }
        if request.range_start > 0 {
            let range = format!("bytes={}-", request.range_start);
            let value = HeaderValue::from_str(&range)
                .map_err(|_| DownloadError::invalid_header(RANGE.as_str()))?;
            headers.insert(RANGE, value);
            if let Some(validator) = request.if_range {
                let value = HeaderValue::from_str(validator)
                    .map_err(|_| DownloadError::invalid_header(IF_RANGE.as_str()))?;
                headers.insert(IF_RANGE, value);
            }
        }

        let send = self.client.get(url).headers(headers).send();
        let result = match request.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, send)
                .await
                .map_err(|_| DownloadError::timeout(request.url))?,
            None => send.await,
        };
        let response = result.map_err(|e| DownloadError::network(request.url, e))?;

        debug!(status = response.status().as_u16(), "response headers received");
        Ok(response)
    }
}

fn parse_header(name: &str, value: &str) -> Option<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_bytes(name.as_bytes()).ok()?;
    let value = HeaderValue::from_str(value).ok()?;
    Some((name, value))
}

/// Parsed `Content-Range` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentRange {
    /// `bytes start-end/total` (total may be `*`).
    Bytes {
        /// First byte in the body.
        start: u64,
        /// Last byte in the body, inclusive.
        end: u64,
        /// Complete length when the server knows it.
        total: Option<u64>,
    },
    /// `bytes */total`, sent with 416.
    Unsatisfied {
        /// Complete length of the resource.
        total: u64,
    },
}

/// Parses a `Content-Range` value. Malformed values yield `None`.
#[must_use]
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (range, total) = (range.trim(), total.trim());

    if range == "*" {
        return Some(ContentRange::Unsatisfied {
            total: total.parse().ok()?,
        });
    }

    let (start, end) = range.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total {
        "*" => None,
        digits => {
            let total: u64 = digits.parse().ok()?;
            if end >= total {
                return None;
            }
            Some(total)
        }
    };
    Some(ContentRange::Bytes { start, end, total })
}

/// `Content-Length` as a number.
#[must_use]
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// `ETag` and `Last-Modified` from a response.
#[must_use]
pub fn validator(headers: &HeaderMap) -> Validator {
    let text = |name| {
        headers
            .get(name)
            .and_then(|v: &HeaderValue| v.to_str().ok())
            .map(str::to_string)
    };
    Validator {
        etag: text(ETAG),
        last_modified: text(LAST_MODIFIED),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Match, Mock, Request, ResponseTemplate};

    fn client() -> HttpClient {
        HttpClient::new(&ClientSettings::default()).unwrap()
    }

    #[test]
    fn test_parse_content_range_bytes() {
        assert_eq!(
            parse_content_range("bytes 500-999/1000"),
            Some(ContentRange::Bytes {
                start: 500,
                end: 999,
                total: Some(1000)
            })
        );
        assert_eq!(
            parse_content_range("bytes 0-9/*"),
            Some(ContentRange::Bytes {
                start: 0,
                end: 9,
                total: None
            })
        );
    }

    #[test]
    fn test_parse_content_range_unsatisfied() {
        assert_eq!(
            parse_content_range("bytes */1000"),
            Some(ContentRange::Unsatisfied { total: 1000 })
        );
    }

    #[test]
    fn test_parse_content_range_rejects_garbage() {
        assert_eq!(parse_content_range("items 0-9/10"), None);
        assert_eq!(parse_content_range("bytes 9-0/10"), None);
        assert_eq!(parse_content_range("bytes 0-10/10"), None);
        assert_eq!(parse_content_range("bytes */*"), None);
        assert_eq!(parse_content_range(""), None);
    }

    #[test]
    fn test_new_rejects_bad_default_header() {
        let settings = ClientSettings {
            default_headers: vec![("bad name".to_string(), "x".to_string())],
            ..ClientSettings::default()
        };
        assert!(matches!(
            HttpClient::new(&settings),
            Err(ClientBuildError::InvalidHeader { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_rejects_non_http_url() {
        let result = client().open(&OpenRequest::new("ftp://example.com/a")).await;
        assert!(matches!(result, Err(DownloadError::InvalidUrl { .. })));

        let result = client().open(&OpenRequest::new("not a url")).await;
        assert!(matches!(result, Err(DownloadError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_open_rejects_bad_request_header() {
        let headers = vec![("X-Ok".to_string(), "line\nbreak".to_string())];
        let mut request = OpenRequest::new("http://127.0.0.1:9/a");
        request.headers = &headers;
        let result = client().open(&request).await;
        assert!(matches!(result, Err(DownloadError::InvalidHeader { .. })));
    }

    #[tokio::test]
    async fn test_open_sends_range_and_if_range() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .and(header("Range", "bytes=500-"))
            .and(header("If-Range", "\"v1\""))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 500-999/1000")
                    .set_body_bytes(vec![0u8; 500]),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let url = format!("{}/file.bin", mock_server.uri());
        let mut request = OpenRequest::new(&url);
        request.range_start = 500;
        request.if_range = Some("\"v1\"");

        let response = client().open(&request).await.unwrap();
        assert_eq!(response.status().as_u16(), 206);
    }

    #[tokio::test]
    async fn test_open_connect_timeout_bounds_header_wait() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&mock_server)
            .await;

        let url = format!("{}/slow", mock_server.uri());
        let mut request = OpenRequest::new(&url);
        request.connect_timeout = Some(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let result = client().open(&request).await;
        assert!(matches!(result, Err(DownloadError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_open_without_offset_sends_no_range() {
        struct NoRange;

        impl Match for NoRange {
            fn matches(&self, request: &Request) -> bool {
                !request.headers.contains_key("Range") && !request.headers.contains_key("If-Range")
            }
        }

        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/full"))
            .and(NoRange)
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"all"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let url = format!("{}/full", mock_server.uri());
        let mut request = OpenRequest::new(&url);
        request.if_range = Some("\"ignored\"");
        let response = client().open(&request).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(content_length(response.headers()), Some(3));
    }

    #[tokio::test]
    async fn test_open_sends_default_and_custom_user_agent() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/custom"))
            .and(header("User-Agent", "probe/1.0"))
            .and(header("X-Token", "abc"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/default"))
            .and(header("User-Agent", user_agent::default_user_agent().as_str()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let custom_url = format!("{}/custom", mock_server.uri());
        let headers = vec![("X-Token".to_string(), "abc".to_string())];
        let mut request = OpenRequest::new(&custom_url);
        request.headers = &headers;
        request.user_agent = Some("probe/1.0");
        assert_eq!(client().open(&request).await.unwrap().status().as_u16(), 200);

        let default_url = format!("{}/default", mock_server.uri());
        let response = client().open(&OpenRequest::new(&default_url)).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }

    #[tokio::test]
    async fn test_open_returns_error_statuses_as_responses() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let url = format!("{}/missing", mock_server.uri());
        let response = client().open(&OpenRequest::new(&url)).await.unwrap();
        assert_eq!(response.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn test_validator_reads_etag_and_last_modified() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/v"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"abc\"")
                    .insert_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT"),
            )
            .mount(&mock_server)
            .await;

        let url = format!("{}/v", mock_server.uri());
        let response = client().open(&OpenRequest::new(&url)).await.unwrap();
        let validator = validator(response.headers());
        assert_eq!(validator.etag.as_deref(), Some("\"abc\""));
        assert_eq!(
            validator.last_modified.as_deref(),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );
    }
}
