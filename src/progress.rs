//! Progress bars for download runs, driven by engine events.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use file_downloader::{TransferEvent, TransferId};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::broadcast::{self, error::RecvError};

const BAR_TEMPLATE: &str =
    "{spinner} {prefix:30!} [{bar:30}] {bytes}/{total_bytes} {bytes_per_sec} {msg}";
const SPINNER_TEMPLATE: &str = "{spinner} {prefix:30!} {bytes} {bytes_per_sec} {msg}";
const POLL_INTERVAL: Duration = Duration::from_millis(120);

/// One bar per transfer, keyed by id.
pub(crate) struct ProgressBoard {
    multi: MultiProgress,
    labels: HashMap<TransferId, String>,
    bars: HashMap<TransferId, ProgressBar>,
}

impl ProgressBoard {
    pub(crate) fn new(multi: MultiProgress, labels: HashMap<TransferId, String>) -> Self {
        Self {
            multi,
            labels,
            bars: HashMap::new(),
        }
    }

    fn bar(&mut self, id: TransferId) -> &ProgressBar {
        self.bars.entry(id).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new_spinner());
            bar.set_style(spinner_style());
            let label = self
                .labels
                .get(&id)
                .cloned()
                .unwrap_or_else(|| format!("#{id}"));
            bar.set_prefix(label);
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        })
    }

    /// Applies one event to its bar. Events for ids outside this run are ignored.
    pub(crate) fn apply(&mut self, event: &TransferEvent) {
        let id = event.id();
        if !self.labels.contains_key(&id) {
            return;
        }
        match event {
            TransferEvent::Started { offset, .. } => {
                let bar = self.bar(id);
                bar.reset();
                bar.set_position(*offset);
                bar.set_message(if *offset > 0 { "resuming" } else { "" });
            }
            TransferEvent::Progress { bytes, total, .. } => {
                let bar = self.bar(id);
                if let Some(total) = total
                    && bar.length() != Some(*total)
                {
                    bar.set_length(*total);
                    bar.set_style(bar_style());
                }
                bar.set_position(*bytes);
                bar.set_message("");
            }
            TransferEvent::Paused { bytes, .. } => {
                let bar = self.bar(id);
                bar.set_position(*bytes);
                bar.abandon_with_message("paused");
            }
            TransferEvent::Cancelled { .. } => {
                self.bar(id).abandon_with_message("cancelled");
            }
            TransferEvent::Completed { bytes, .. } => {
                let bar = self.bar(id);
                bar.set_length(*bytes);
                bar.set_position(*bytes);
                bar.finish_with_message("done");
            }
            TransferEvent::Failed { error, .. } => {
                self.bar(id)
                    .abandon_with_message(format!("failed: {}", error.kind));
            }
        }
    }

    #[cfg(test)]
    fn get(&self, id: TransferId) -> Option<&ProgressBar> {
        self.bars.get(&id)
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .map(|style| style.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template(SPINNER_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Spawns the progress UI when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `enabled` is false, returns (None, stop) with stop already true.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    events: broadcast::Receiver<TransferEvent>,
    labels: HashMap<TransferId, String>,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !enabled {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let board = ProgressBoard::new(
        MultiProgress::with_draw_target(ProgressDrawTarget::stderr()),
        labels,
    );
    let handle = tokio::spawn(drive(board, events, Arc::clone(&stop)));
    (Some(handle), stop)
}

async fn drive(
    mut board: ProgressBoard,
    mut events: broadcast::Receiver<TransferEvent>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::SeqCst) {
        match tokio::time::timeout(POLL_INTERVAL, events.recv()).await {
            Ok(Ok(event)) => board.apply(&event),
            Ok(Err(RecvError::Lagged(skipped))) => {
                tracing::debug!(skipped, "progress UI lagged behind engine events");
            }
            Ok(Err(RecvError::Closed)) => break,
            Err(_) => {}
        }
    }
    // Drain what is already buffered so final states render.
    while let Ok(event) = events.try_recv() {
        board.apply(&event);
    }
    for bar in board.bars.values() {
        if !bar.is_finished() {
            bar.abandon();
        }
    }
}
