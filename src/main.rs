//! CLI entry point for the file-downloader tool.

use std::collections::HashMap;
use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use file_downloader::{
    DownloadEngine, DownloadRequest, EngineConfig, Status, TransferId, TransferSnapshot,
    cleanup_stale_temp_files, download::default_workers,
};
use tracing::{debug, info, warn};

mod app_config;
mod cli;
mod file_name;
mod progress;

use app_config::FileConfig;
use cli::Args;
use file_name::NameAllocator;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let loaded = app_config::load_default_file_config()?;
    if let Some(path) = loaded.path.as_deref() {
        debug!(path = %path.display(), found = loaded.config.is_some(), "config file");
    }
    let file_config = loaded.into_config();

    // Read input: from positional args or stdin
    let input_text = if !args.urls.is_empty() {
        args.urls.join("\n")
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        info!("No input provided. Pass URLs as arguments or pipe them via stdin.");
        info!("Example: file-downloader https://example.com/file.iso");
        return Ok(());
    };

    let urls = collect_urls(&input_text);
    if urls.is_empty() {
        info!("No URLs found in input");
        return Ok(());
    }

    let output_dir = args
        .output_dir
        .clone()
        .or_else(|| file_config.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."));

    if let Some(days) = args.cleanup_days.or(file_config.cleanup_days) {
        if output_dir.is_dir() {
            match cleanup_stale_temp_files(&output_dir, days).await {
                Ok(removed) => info!(removed, days, "Removed stale partial downloads"),
                Err(error) => warn!(%error, "Stale partial cleanup failed"),
            }
        } else {
            debug!(dir = %output_dir.display(), "output directory missing; nothing to clean");
        }
    }

    let config = engine_config(&args, &file_config);
    debug!(workers = config.workers, "starting download engine");
    let engine = DownloadEngine::new(config).context("Failed to start download engine")?;
    let events = engine.subscribe();

    let priority = args.priority.or(file_config.priority).unwrap_or_default();
    let mut names = NameAllocator::default();
    let mut ids: Vec<TransferId> = Vec::with_capacity(urls.len());
    let mut labels = HashMap::with_capacity(urls.len());
    for url in &urls {
        let file_name = names.allocate(url);
        let mut request =
            DownloadRequest::new(url.as_str(), &output_dir, &file_name).priority(priority);
        if let Some(tag) = &args.tag {
            request = request.tag(tag.as_str());
        }
        let id = engine
            .download(request)
            .with_context(|| format!("Failed to submit {url}"))?;
        debug!(id = %id, url = %url, file = %file_name, "submitted download");
        labels.insert(id, file_name);
        ids.push(id);
    }

    info!(
        downloads = ids.len(),
        dir = %output_dir.display(),
        "Downloading"
    );

    let show_progress = !args.quiet && io::stderr().is_terminal();
    let (progress_handle, progress_stop) =
        progress::spawn_progress_ui(show_progress, events, labels);

    let snapshots = tokio::select! {
        snapshots = wait_all(&engine, &ids) => snapshots,
        Ok(()) = tokio::signal::ctrl_c() => {
            warn!("Interrupted; pausing downloads so the next run can resume them");
            for id in &ids {
                engine.pause(*id);
            }
            wait_all(&engine, &ids).await
        }
    };

    progress_stop.store(true, Ordering::SeqCst);
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }

    if !engine.shutdown().await {
        warn!("Some downloads did not stop within the shutdown grace period");
    }

    for snapshot in &snapshots {
        report(snapshot);
    }

    let stats = engine.stats();
    info!(
        completed = stats.successful,
        failed = stats.failed,
        paused = stats.paused,
        cancelled = stats.cancelled,
        total = stats.total(),
        "Download complete"
    );

    if stats.failed > 0 {
        bail!("{} of {} downloads failed", stats.failed, stats.total());
    }
    Ok(())
}

/// CLI flags over file config over library defaults.
fn engine_config(args: &Args, file_config: &FileConfig) -> EngineConfig {
    let defaults = EngineConfig::default();
    let workers = args
        .workers
        .or(file_config.workers)
        .map_or_else(default_workers, usize::from);
    let connect_timeout = args
        .connect_timeout
        .or(file_config.connect_timeout_secs)
        .map_or(defaults.connect_timeout, Duration::from_secs);
    let read_timeout = args
        .read_timeout
        .or(file_config.read_timeout_secs)
        .map_or(defaults.read_timeout, Duration::from_secs);
    let user_agent = args
        .user_agent
        .clone()
        .or_else(|| file_config.user_agent.clone());

    EngineConfig {
        workers,
        connect_timeout,
        read_timeout,
        user_agent,
        default_headers: args.headers.clone(),
        ..defaults
    }
}

/// One URL per whitespace-separated token; `#` starts a comment line.
fn collect_urls(input: &str) -> Vec<String> {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .flat_map(str::split_whitespace)
        .map(str::to_string)
        .collect()
}

async fn wait_all(engine: &DownloadEngine, ids: &[TransferId]) -> Vec<TransferSnapshot> {
    let mut snapshots = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(snapshot) = engine.wait(*id).await {
            snapshots.push(snapshot);
        }
    }
    snapshots
}

fn report(snapshot: &TransferSnapshot) {
    match snapshot.status {
        Status::Successful => {
            info!(
                path = %snapshot.destination.display(),
                bytes = snapshot.bytes_downloaded,
                "Saved"
            );
        }
        Status::Paused => {
            info!(
                url = %snapshot.url,
                bytes = snapshot.bytes_downloaded,
                "Paused; rerun to resume"
            );
        }
        Status::Failed => {
            let error = snapshot
                .error
                .as_ref()
                .map_or_else(|| "unknown error".to_string(), ToString::to_string);
            warn!(url = %snapshot.url, %error, "Download failed");
        }
        other => {
            debug!(url = %snapshot.url, status = %other, "Download ended");
        }
    }
}
