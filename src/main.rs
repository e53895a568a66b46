//! nzbdl — headless Usenet downloader
//!
//! `nzbdl --file foo.nzb` enqueues one NZB and blocks until it reaches
//! a terminal state; `nzbdl serve` runs the persistent queue until a
//! termination signal arrives.

use clap::{Parser, Subcommand};
use nzb_dl::config::Config;
use nzb_dl::engine::{Downloader, FileWriter};
use nzb_dl::error::{Error, Result};
use nzb_dl::nntp::ProviderManager;
use nzb_dl::processor::Processor;
use nzb_dl::queue::QueueManager;
use nzb_dl::store::{BlobStore, Store};
use nzb_dl::types::{JobStatus, QueueItem, Release};
use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "nzbdl", about = "A lightweight, concurrent NNTP downloader")]
struct Cli {
    /// Path to the configuration file (default ./config.yaml, container
    /// fallback /config/config.yaml)
    #[arg(long, global = true, default_value = "")]
    config: String,

    /// Path to an NZB file: enqueue it and block until done
    #[arg(short, long)]
    file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the persistent queue service
    Serve,
    /// Print version and build information
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    if matches!(cli.command, Some(Command::Version)) {
        println!(
            "nzbdl {} (built {})",
            env!("CARGO_PKG_VERSION"),
            env!("BUILD_TIMESTAMP")
        );
        return Ok(());
    }

    let config = Config::load(&cli.config)?;
    let _log_guard = nzb_dl::logging::init(&config.log)?;

    let store = Arc::new(Store::new(&config.store).await?);
    let blobs = Arc::new(BlobStore::new(&config.store.blob_dir).await?);
    let providers = Arc::new(ProviderManager::new(&config.servers).await?);
    let writer = Arc::new(FileWriter::new());
    let downloader = Arc::new(Downloader::new(providers.clone(), writer.clone()));
    let processor = Arc::new(Processor::new(writer, &config.download));
    let queue = Arc::new(QueueManager::new(
        store.clone(),
        blobs.clone(),
        downloader,
        processor,
    ));

    let result = match cli.command {
        Some(Command::Serve) => serve(queue).await,
        None => match cli.file {
            Some(path) => download_one(queue, store.clone(), blobs, &path).await,
            None => Err(Error::config(
                "--file <path> is required (or use the `serve` subcommand)",
            )),
        },
        Some(Command::Version) => unreachable!("handled above"),
    };

    providers.close().await;
    store.close().await;
    result
}

/// Persistent-queue mode: recover, then run until a signal arrives
async fn serve(queue: Arc<QueueManager>) -> Result<()> {
    queue.recover_on_startup().await?;

    let shutdown = CancellationToken::new();
    let runner = {
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { queue.run(shutdown).await })
    };

    nzb_dl::wait_for_shutdown_signal().await;
    tracing::info!("shutting down");
    shutdown.cancel();
    runner.await.map_err(|e| Error::config(format!("scheduler panicked: {e}")))?;
    Ok(())
}

/// One-shot mode: ingest the NZB, enqueue, render progress, block until
/// the job is terminal
async fn download_one(
    queue: Arc<QueueManager>,
    store: Arc<Store>,
    blobs: Arc<BlobStore>,
    path: &std::path::Path,
) -> Result<()> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read NZB file '{}': {e}", path.display()),
        ))
    })?;
    let title = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());

    let release = Release::from_upload(&bytes, title);
    blobs.put(&release.id, &bytes).await?;
    store.upsert_releases(&[&release]).await?;

    let item = queue.enqueue(&release.id).await?;

    let shutdown = CancellationToken::new();
    let runner = {
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { queue.run(shutdown).await })
    };

    // Ctrl+C cancels the job; the scheduler then records it Failed
    {
        let item = item.clone();
        tokio::spawn(async move {
            nzb_dl::wait_for_shutdown_signal().await;
            eprintln!("\n[!] interrupt received, cancelling");
            item.cancel();
        });
    }

    let started = Instant::now();
    let mut last_bytes = 0u64;
    while !item.status().is_terminal() {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let current = item.bytes_written.load(Ordering::Relaxed);
        let delta = current.saturating_sub(last_bytes);
        last_bytes = current;
        let speed_mbps = delta as f64 * 8.0 / (1024.0 * 1024.0);
        render_progress(&item, speed_mbps, started, false);
    }
    render_progress(&item, 0.0, started, true);
    println!();

    shutdown.cancel();
    runner
        .await
        .map_err(|e| Error::config(format!("scheduler panicked: {e}")))?;

    match item.status() {
        JobStatus::Completed => Ok(()),
        _ => Err(Error::JobFailed(
            item.error().unwrap_or_else(|| "unknown error".to_string()),
        )),
    }
}

/// Single-line progress bar: `[====>   ] 50.0% | Speed: ... | ETA: ...`
fn render_progress(item: &QueueItem, speed_mbps: f64, started: Instant, done: bool) {
    let current = item.bytes_written.load(Ordering::Relaxed);
    let total = item.total_bytes.load(Ordering::Relaxed);
    if total == 0 {
        return;
    }

    let elapsed = started.elapsed();
    let mut percent = current as f64 / total as f64 * 100.0;
    let mut display_speed = speed_mbps;
    let mut eta = "calc...".to_string();

    if done {
        percent = 100.0;
        let seconds = elapsed.as_secs_f64().max(0.1);
        display_speed = if current == 0 {
            0.0
        } else {
            (current as f64 / seconds) * 8.0 / (1024.0 * 1024.0)
        };
        eta = format!("{}s", elapsed.as_secs());
    } else {
        let avg = current as f64 / elapsed.as_secs_f64().max(0.1);
        if avg > 0.0 {
            let remaining = (total.saturating_sub(current)) as f64 / avg;
            eta = format!("{}s", remaining as u64);
        }
    }

    const BAR_WIDTH: usize = 20;
    let filled = ((percent / 100.0 * BAR_WIDTH as f64) as usize).min(BAR_WIDTH);
    let mut bar = "=".repeat(filled);
    if filled < BAR_WIDTH {
        bar.push('>');
        bar.push_str(&" ".repeat(BAR_WIDTH - filled - 1));
    }

    let (speed_label, time_label) = if done { ("Avg", "Time") } else { ("Speed", "ETA") };
    print!(
        "\r[{bar}] {percent:5.1}% | {speed_label}: {display_speed:6.2} Mbps | {time_label}: {eta:<8} | {}/{} MB   ",
        current / 1024 / 1024,
        total / 1024 / 1024
    );
    let _ = std::io::stdout().flush();
}
