//! Command-line front end for the tomecut engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use humantime::format_duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use tomecut_core::audio::{record_until_silence, CaptureConfig};
use tomecut_core::{ChapterSplitter, ScriptedRecognizer, SplitConfig, SplitEvent};

#[derive(Parser)]
#[command(name = "tomecut", version, about = "Split audiobooks into chapter files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Split one file, or every file directly inside a directory
    Split {
        path: PathBuf,
        /// Directory receiving per-book output folders; defaults to
        /// next to each input file
        #[arg(long)]
        output: Option<PathBuf>,
        /// Keep WAV segments instead of encoding to Opus
        #[arg(long)]
        no_opus: bool,
        /// Opus bitrate in kbit/s
        #[arg(long, default_value_t = 16)]
        bitrate: u32,
        #[arg(long, default_value = "ffmpeg")]
        ffmpeg: PathBuf,
        #[arg(long, default_value = "ffprobe")]
        ffprobe: PathBuf,
        /// Scripted transcripts handed to the scanner in order, for
        /// dry runs without a speech backend
        #[arg(long = "transcript", value_name = "TEXT")]
        transcripts: Vec<String>,
        /// Print the final reports as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Record from a microphone until trailing silence
    Capture {
        #[arg(long, default_value = ".")]
        output: PathBuf,
        /// Input device name; system default when omitted
        #[arg(long)]
        device: Option<String>,
        /// Quiet span that stops the recording, e.g. "10s" or "1m"
        #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
        silence: Duration,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tomecut=info".parse().unwrap()),
        )
        .init();

    match Cli::parse().command {
        Command::Split {
            path,
            output,
            no_opus,
            bitrate,
            ffmpeg,
            ffprobe,
            transcripts,
            json,
        } => {
            let config = SplitConfig {
                encode_opus: !no_opus,
                opus_bitrate_kbps: bitrate,
                output_root: output,
                ffmpeg_binary: ffmpeg,
                ffprobe_binary: ffprobe,
                ..SplitConfig::default()
            };
            run_split(path, config, transcripts, json).await
        }
        Command::Capture {
            output,
            device,
            silence,
        } => {
            let config = CaptureConfig {
                trailing_silence: silence,
                out_dir: output,
                device,
                ..CaptureConfig::default()
            };
            run_capture(config).await
        }
    }
}

async fn run_split(
    path: PathBuf,
    config: SplitConfig,
    transcripts: Vec<String>,
    json: bool,
) -> Result<()> {
    let mut splitter = ChapterSplitter::new(config);
    if !transcripts.is_empty() {
        splitter = splitter.with_recognizer(Box::new(ScriptedRecognizer::new(transcripts)));
    }
    let splitter = Arc::new(splitter);

    let cancel = splitter.cancel_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current window");
            cancel.cancel();
        }
    });

    let mut events = splitter.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => report_progress(&event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    // The engine is blocking by design; the splitter moves into the
    // worker so the event channel closes when it finishes.
    let reports = tokio::task::spawn_blocking(move || splitter.split_path(&path)).await??;
    printer.await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!(
                "{}: {} segments via {:?}",
                report.input.display(),
                report.outputs.len(),
                report.strategy
            );
        }
    }
    Ok(())
}

async fn run_capture(config: CaptureConfig) -> Result<()> {
    let cancel = tomecut_core::CancelSignal::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing recording");
            interrupt.cancel();
        }
    });

    let path =
        tokio::task::spawn_blocking(move || record_until_silence(&config, &cancel)).await??;
    println!("{}", path.display());
    Ok(())
}

fn report_progress(event: &SplitEvent) {
    match event {
        SplitEvent::ScanProgress {
            elapsed_secs,
            intervals,
        } => info!(
            "scanned {} ({intervals} silences)",
            format_duration(Duration::from_secs(*elapsed_secs as u64))
        ),
        SplitEvent::ScanComplete {
            total_secs,
            intervals,
        } => info!(
            "scan complete: {} of audio, {intervals} silences",
            format_duration(Duration::from_secs(*total_secs as u64))
        ),
        SplitEvent::ChaptersResolved { strategy, count } => {
            info!("{count} chapter breaks resolved via {strategy:?}")
        }
        SplitEvent::SegmentStarted { index, name } => info!("segment {index}: {name}"),
        SplitEvent::SegmentWritten { index, path } => {
            info!("segment {index} written to {}", path.display())
        }
        SplitEvent::FileComplete { path, segments } => {
            info!("{} split into {segments} segments", path.display())
        }
    }
}
