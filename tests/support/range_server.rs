//! A wiremock responder that honours `Range: bytes=N-` like a static file server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wiremock::{Respond, ResponseTemplate};

pub const ETAG: &str = "\"v1\"";

/// Deterministic, non-repeating-looking payload of `len` bytes.
#[must_use]
pub fn payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| u8::try_from((i * 31 + i / 251) % 251).unwrap_or(0))
        .collect()
}

/// Serves `body`, answering range requests with 206 and out-of-range
/// requests with 416. Every request's `Range` header is recorded.
#[derive(Clone)]
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    requests: Arc<AtomicUsize>,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
    delay: Option<Duration>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            requests: Arc::new(AtomicUsize::new(0)),
            ranges: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }

    /// Delays every response by `delay` before headers are sent.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// `Range` header of each request, in arrival order.
    pub fn ranges(&self) -> Vec<Option<String>> {
        self.ranges.lock().unwrap().clone()
    }
}

fn requested_start(header: &str) -> Option<usize> {
    header
        .strip_prefix("bytes=")?
        .strip_suffix('-')?
        .parse()
        .ok()
}

impl Respond for RangeResponder {
    fn respond(&self, request: &wiremock::Request) -> ResponseTemplate {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let range = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        self.ranges.lock().unwrap().push(range.clone());

        let len = self.body.len();
        let template = match range.as_deref().and_then(requested_start) {
            Some(start) if start >= len => ResponseTemplate::new(416)
                .insert_header("Content-Range", format!("bytes */{len}").as_str()),
            Some(start) => ResponseTemplate::new(206)
                .insert_header(
                    "Content-Range",
                    format!("bytes {start}-{}/{len}", len - 1).as_str(),
                )
                .set_body_bytes(self.body[start..].to_vec()),
            None => ResponseTemplate::new(200).set_body_bytes(self.body.as_slice().to_vec()),
        };
        let template = template
            .insert_header("Accept-Ranges", "bytes")
            .insert_header("ETag", ETAG);
        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}
