//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use file_downloader::Priority;

/// Resumable, prioritized HTTP downloads.
///
/// Each URL is fetched into the output directory through a bounded worker
/// pool. Interrupted downloads leave a `.part` file and a checkpoint that the
/// next run picks up.
#[derive(Parser, Debug)]
#[command(name = "file-downloader")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to download (reads stdin when omitted and stdin is piped)
    pub urls: Vec<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Concurrent downloads (1-64, default: available parallelism)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub workers: Option<u8>,

    /// Directory downloads are written to (default: current directory)
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Scheduling priority: low, medium, high or immediate
    #[arg(short = 'p', long)]
    pub priority: Option<Priority>,

    /// Tag attached to every download of this run
    #[arg(short = 't', long)]
    pub tag: Option<String>,

    /// Connect timeout in seconds (1-3600)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub connect_timeout: Option<u64>,

    /// Read timeout in seconds (1-3600)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub read_timeout: Option<u64>,

    /// User-Agent header sent with every request
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Extra request header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Delete stale .part files older than this many days before downloading
    #[arg(long)]
    pub cleanup_days: Option<u32>,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let Some((name, value)) = raw.split_once(':') else {
        return Err(format!("expected \"Name: value\", got {raw:?}"));
    };
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(format!("invalid header name in {raw:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}
