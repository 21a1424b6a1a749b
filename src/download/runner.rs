//! Executes one transfer from its current offset to a settled state.
//!
//! The runner owns the record's progress while it holds the record's active
//! flag. It connects (ranged when resuming), streams the body to the temp file
//! through a buffered writer and checks the pause and cancel tokens between
//! chunks. Every exit path ends in exactly one settled status:
//!
//! | exit                         | status     | temp file / checkpoint |
//! |------------------------------|------------|------------------------|
//! | all bytes written            | SUCCESSFUL | renamed / removed      |
//! | pause observed               | PAUSED     | kept / written         |
//! | cancel observed              | CANCELLED  | removed / removed      |
//! | resumable error              | FAILED     | kept / written         |
//! | non-resumable error          | FAILED     | removed / removed      |

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::checkpoint::{self, Checkpoint};
use super::client::{self, ContentRange, HttpClient, OpenRequest};
use super::constants::{PROGRESS_BATCH_BYTES, PROGRESS_INTERVAL, WRITE_BUFFER_SIZE};
use super::error::{DownloadError, TransferError};
use super::events::{EventSender, TransferEvent};
use super::record::{ActiveGuard, Status, TransferRecord, Validator};
use super::scheduler::Slot;
use super::storage;

/// How a run stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Completed { bytes: u64 },
    Paused,
    Cancelled,
}

/// Worker-side claims on a record; released before the settled status is
/// published.
struct Lease {
    _guard: ActiveGuard,
    _slot: Option<Slot>,
}

/// Response accepted for streaming, with the offset it continues from.
struct Accepted {
    response: reqwest::Response,
    offset: u64,
    total: Option<u64>,
}

enum Answer {
    Stream(Accepted),
    AlreadyComplete { total: u64 },
    Restart,
}

/// Runs transfers against one shared HTTP client.
#[derive(Debug, Clone)]
pub struct Runner {
    client: HttpClient,
    events: EventSender,
    read_timeout: Duration,
}

impl Runner {
    /// `read_timeout` bounds the wait for each body chunk unless a request
    /// overrides it.
    #[must_use]
    pub fn new(client: HttpClient, events: EventSender, read_timeout: Duration) -> Self {
        Self {
            client,
            events,
            read_timeout,
        }
    }

    /// Runs `record` until it settles and returns the settled status.
    ///
    /// If another worker already holds the record this returns its current
    /// status without touching it.
    #[instrument(skip_all, fields(transfer_id = %record.id(), url = %record.url()))]
    pub async fn run(&self, record: &Arc<TransferRecord>, slot: Option<Slot>) -> Status {
        let Some(guard) = record.try_activate() else {
            warn!("transfer already has a worker; skipping");
            return record.status();
        };
        let lease = Lease {
            _guard: guard,
            _slot: slot,
        };
        let cancel = record.cancel_token();
        let pause = record.pause_token();

        if cancel.is_cancelled() {
            return self.settle_cancelled(record, lease).await;
        }
        if pause.is_cancelled() {
            return self.settle_paused(record, lease).await;
        }
        if !record.transition(Status::Started) {
            debug!(status = %record.status(), "transfer no longer pending");
            return record.status();
        }

        match self.transfer(record, &cancel, &pause).await {
            Ok(Stop::Completed { bytes }) => self.settle_successful(record, lease, bytes),
            Ok(Stop::Paused) => self.settle_paused(record, lease).await,
            Ok(Stop::Cancelled) => self.settle_cancelled(record, lease).await,
            Err(error) => self.settle_failed(record, lease, &error).await,
        }
    }

    async fn transfer(
        &self,
        record: &TransferRecord,
        cancel: &CancellationToken,
        pause: &CancellationToken,
    ) -> Result<Stop, DownloadError> {
        let temp = record.temp_path();
        storage::ensure_dir(record.dir()).await?;

        let offset = resume_offset(record, &temp).await;
        self.events.emit(TransferEvent::Started {
            id: record.id(),
            offset,
        });
        if let Some(stop) = interrupted(cancel, pause) {
            return Ok(stop);
        }
        record.transition(Status::Connecting);

        let accepted = {
            let mut offset = offset;
            let mut restarted = false;
            loop {
                let validator = record.validator();
                let request = OpenRequest {
                    url: record.url(),
                    range_start: offset,
                    if_range: validator.if_range(),
                    headers: record.headers(),
                    user_agent: record.user_agent(),
                    connect_timeout: record.connect_timeout(),
                };
                let response = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Ok(Stop::Cancelled),
                    () = pause.cancelled() => return Ok(Stop::Paused),
                    response = self.client.open(&request) => response?,
                };

                match classify(record.url(), response, offset)? {
                    Answer::Stream(accepted) => break accepted,
                    Answer::AlreadyComplete { total } => {
                        info!(bytes = total, "server reports the file is already complete");
                        record.set_extent(total, Some(total));
                        record.transition(Status::Downloading);
                        return self.complete(record, &temp, total).await;
                    }
                    Answer::Restart if !restarted => {
                        info!(offset, "range not satisfiable; restarting from zero");
                        restarted = true;
                        offset = 0;
                        record.set_extent(0, None);
                        record.set_validator(Validator::default());
                    }
                    Answer::Restart => {
                        return Err(DownloadError::http_status(
                            record.url(),
                            StatusCode::RANGE_NOT_SATISFIABLE.as_u16(),
                        ));
                    }
                }
            }
        };

        if accepted.offset < offset {
            info!(offset, "server sent the full entity; restarting from zero");
        }
        let validator = client::validator(accepted.response.headers());
        if validator != Validator::default() {
            record.set_validator(validator);
        }
        record.set_extent(accepted.offset, accepted.total);

        if let Some(stop) = interrupted(cancel, pause) {
            return Ok(stop);
        }
        record.transition(Status::Downloading);

        let file = open_temp(&temp, accepted.offset).await?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        let read_timeout = record.read_timeout().unwrap_or(self.read_timeout);
        let streamed = self
            .stream_body(record, accepted, &mut writer, read_timeout, cancel, pause)
            .await;

        let flushed = flush_and_sync(&mut writer, &temp).await;
        let (written, end) = match streamed {
            Ok(end) => end,
            Err((written, error)) => {
                record.set_progress(confirmed_bytes(&temp, written, flushed.is_ok()).await);
                return Err(error);
            }
        };
        if let Err(error) = flushed {
            record.set_progress(confirmed_bytes(&temp, written, false).await);
            return Err(error);
        }
        record.set_progress(written);

        match end {
            StreamEnd::Finished => {
                if let Some(total) = record.total_bytes()
                    && total != written
                {
                    return Err(DownloadError::integrity(&temp, total, written));
                }
                self.complete(record, &temp, written).await
            }
            StreamEnd::Interrupted(stop) => Ok(stop),
        }
    }

    /// Copies the body into `writer`. Returns the byte count reached and how
    /// the stream ended, or the byte count reached alongside the error.
    async fn stream_body(
        &self,
        record: &TransferRecord,
        accepted: Accepted,
        writer: &mut BufWriter<File>,
        read_timeout: Duration,
        cancel: &CancellationToken,
        pause: &CancellationToken,
    ) -> Result<(u64, StreamEnd), (u64, DownloadError)> {
        let url = record.url();
        let temp = record.temp_path();
        let total = accepted.total;
        let mut written = accepted.offset;
        let mut unpublished = 0u64;
        let mut last_publish = Instant::now();
        let mut stream = accepted.response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok((written, StreamEnd::Interrupted(Stop::Cancelled))),
                () = pause.cancelled() => return Ok((written, StreamEnd::Interrupted(Stop::Paused))),
                next = tokio::time::timeout(read_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => return Err((written, DownloadError::timeout(url))),
                Ok(None) => return Ok((written, StreamEnd::Finished)),
                Ok(Some(Err(e))) => return Err((written, DownloadError::network(url, e))),
                Ok(Some(Ok(chunk))) => chunk,
            };

            let len = chunk.len() as u64;
            if let Some(total) = total
                && written + len > total
            {
                return Err((written, DownloadError::integrity(&temp, total, written + len)));
            }
            if let Err(e) = writer.write_all(&chunk).await {
                return Err((written, DownloadError::io(&temp, e)));
            }
            written += len;
            unpublished += len;

            if unpublished >= PROGRESS_BATCH_BYTES || last_publish.elapsed() >= PROGRESS_INTERVAL {
                record.set_progress(written);
                self.events.emit(TransferEvent::Progress {
                    id: record.id(),
                    bytes: written,
                    total,
                });
                unpublished = 0;
                last_publish = Instant::now();
            }
        }
    }

    async fn complete(
        &self,
        record: &TransferRecord,
        temp: &Path,
        bytes: u64,
    ) -> Result<Stop, DownloadError> {
        storage::finalize(temp, &record.destination()).await?;
        checkpoint::remove(&record.checkpoint_path()).await;
        record.set_extent(bytes, Some(bytes));
        Ok(Stop::Completed { bytes })
    }

    fn settle_successful(&self, record: &TransferRecord, lease: Lease, bytes: u64) -> Status {
        drop(lease);
        if record.transition(Status::Successful) {
            info!(bytes, destination = %record.destination().display(), "download complete");
            self.events.emit(TransferEvent::Completed {
                id: record.id(),
                path: record.destination(),
                bytes,
            });
        }
        record.status()
    }

    async fn settle_paused(&self, record: &Arc<TransferRecord>, lease: Lease) -> Status {
        let bytes = record.bytes_downloaded();
        if bytes > 0
            && let Err(error) =
                checkpoint::save(&record.checkpoint_path(), &Checkpoint::from_record(record)).await
        {
            warn!(error = %error, "failed to write checkpoint on pause");
        }
        drop(lease);
        if record.transition(Status::Paused) {
            info!(bytes, "download paused");
            self.events.emit(TransferEvent::Paused {
                id: record.id(),
                bytes,
            });
            // A cancel that raced the release above has no worker left to observe it.
            if record.cancel_token().is_cancelled() {
                return self.finish_cancel(record).await;
            }
        }
        record.status()
    }

    async fn settle_cancelled(&self, record: &Arc<TransferRecord>, lease: Lease) -> Status {
        remove_partials(record).await;
        drop(lease);
        self.finish_cancel(record).await
    }

    async fn finish_cancel(&self, record: &TransferRecord) -> Status {
        if record.transition(Status::Cancelled) {
            remove_partials(record).await;
            record.set_progress(0);
            info!("download cancelled");
            self.events.emit(TransferEvent::Cancelled { id: record.id() });
        }
        record.status()
    }

    async fn settle_failed(
        &self,
        record: &Arc<TransferRecord>,
        lease: Lease,
        error: &DownloadError,
    ) -> Status {
        let recorded = TransferError::from(error);
        if recorded.resumable {
            if record.bytes_downloaded() > 0
                && let Err(e) =
                    checkpoint::save(&record.checkpoint_path(), &Checkpoint::from_record(record))
                        .await
            {
                warn!(error = %e, "failed to write checkpoint after error");
            }
        } else {
            remove_partials(record).await;
            record.set_progress(0);
        }
        drop(lease);
        warn!(
            error = %error,
            resumable = recorded.resumable,
            bytes = record.bytes_downloaded(),
            "download failed"
        );
        if record.fail(recorded.clone()) {
            self.events.emit(TransferEvent::Failed {
                id: record.id(),
                error: recorded,
            });
        }
        record.status()
    }
}

enum StreamEnd {
    Finished,
    Interrupted(Stop),
}

fn interrupted(cancel: &CancellationToken, pause: &CancellationToken) -> Option<Stop> {
    if cancel.is_cancelled() {
        Some(Stop::Cancelled)
    } else if pause.is_cancelled() {
        Some(Stop::Paused)
    } else {
        None
    }
}

/// Picks the offset this run continues from, adopting an on-disk checkpoint
/// when the record itself has no progress yet.
async fn resume_offset(record: &TransferRecord, temp: &Path) -> u64 {
    let on_disk = storage::file_len(temp).await;
    let mut offset = record.bytes_downloaded();

    if offset == 0
        && on_disk > 0
        && let Some(saved) = checkpoint::load(&record.checkpoint_path()).await
    {
        if saved.url == record.url() {
            debug!(bytes = saved.bytes_downloaded, "adopting checkpoint");
            record.set_extent(saved.bytes_downloaded, saved.total_bytes);
            record.set_validator(saved.validator);
            offset = saved.bytes_downloaded;
        } else {
            debug!(checkpoint_url = %saved.url, "ignoring checkpoint for another URL");
        }
    }

    if offset > on_disk {
        warn!(offset, on_disk, "temp file shorter than recorded progress; restarting");
        record.set_extent(0, None);
        record.set_validator(Validator::default());
        return 0;
    }
    offset
}

/// Interprets the response to a request that started at `offset`.
fn classify(url: &str, response: reqwest::Response, offset: u64) -> Result<Answer, DownloadError> {
    let status = response.status();
    let headers = response.headers();
    let content_range = headers
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match status {
        StatusCode::PARTIAL_CONTENT => {
            let received = content_range.clone().unwrap_or_else(|| "missing".to_string());
            match content_range.as_deref().and_then(client::parse_content_range) {
                Some(ContentRange::Bytes { start, total, .. }) if start == offset => {
                    let total =
                        total.or_else(|| client::content_length(headers).map(|len| offset + len));
                    Ok(Answer::Stream(Accepted {
                        response,
                        offset,
                        total,
                    }))
                }
                _ => Err(DownloadError::unexpected_range(url, offset, received)),
            }
        }
        status if status.is_success() => {
            let total = client::content_length(headers);
            Ok(Answer::Stream(Accepted {
                response,
                offset: 0,
                total,
            }))
        }
        StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
            match content_range.as_deref().and_then(client::parse_content_range) {
                Some(ContentRange::Unsatisfied { total }) if total == offset => {
                    Ok(Answer::AlreadyComplete { total })
                }
                _ => Ok(Answer::Restart),
            }
        }
        status => Err(DownloadError::http_status(url, status.as_u16())),
    }
}

/// Opens the temp file positioned at `offset`, dropping anything past it.
async fn open_temp(temp: &Path, offset: u64) -> Result<File, DownloadError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(temp)
        .await
        .map_err(|e| DownloadError::io(temp, e))?;
    file.set_len(offset)
        .await
        .map_err(|e| DownloadError::io(temp, e))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| DownloadError::io(temp, e))?;
    Ok(file)
}

async fn flush_and_sync(writer: &mut BufWriter<File>, temp: &Path) -> Result<(), DownloadError> {
    writer.flush().await.map_err(|e| DownloadError::io(temp, e))?;
    writer
        .get_ref()
        .sync_all()
        .await
        .map_err(|e| DownloadError::io(temp, e))
}

/// Bytes known to be on disk after a run stops.
async fn confirmed_bytes(temp: &Path, written: u64, flushed: bool) -> u64 {
    if flushed {
        written
    } else {
        storage::file_len(temp).await.min(written)
    }
}

async fn remove_partials(record: &TransferRecord) {
    storage::remove_if_exists(&record.temp_path()).await;
    checkpoint::remove(&record.checkpoint_path()).await;
}
