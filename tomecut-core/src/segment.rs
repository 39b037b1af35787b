//! Streaming segment writer: one pass over the book, rotating output
//! files at each chapter break.

use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::chapters::ChapterBreak;
use crate::error::{Result, TomecutError};
use crate::events::SplitEvent;
use crate::graph::node::{weak_target, NodeCore};
use crate::graph::{
    connect, AudioFormat, AudioGraph, NodeId, NodeRegistration, NodeRole, Pacing,
    PassthroughDriver, SampleSource, SampleTarget, Topology,
};

/// Replace characters no filesystem or player handles well.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if (c as u32) < 0x20 => '_',
            c => c,
        })
        .collect()
}

/// Terminal node writing 16-bit PCM WAV.
pub struct WavSink {
    core: NodeCore,
    format: AudioFormat,
    writer: Mutex<Option<hound::WavWriter<BufWriter<fs::File>>>>,
}

impl WavSink {
    pub fn create(
        graph: &Arc<AudioGraph>,
        format: AudioFormat,
        name: &str,
        path: &Path,
    ) -> Result<Arc<Self>> {
        let spec = hound::WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, spec)?;
        let sink = Arc::new(Self {
            core: NodeCore::new(graph, name),
            format,
            writer: Mutex::new(Some(writer)),
        });
        let target = weak_target(&sink);
        graph.register(
            sink.core.id(),
            NodeRegistration {
                name: name.to_owned(),
                role: NodeRole::PureFilter,
                input_format: Some(format),
                output_format: None,
                source: None,
                target: Some(target),
                finished: Arc::clone(sink.core.finished_flag()),
                fan_out: false,
            },
        );
        Ok(sink)
    }

    /// Flush and close the file. Writes after this are rejected.
    pub fn finalize(&self) -> Result<()> {
        let writer = self
            .writer
            .lock()
            .take()
            .ok_or_else(|| TomecutError::Wav("sink already finalized".into()))?;
        self.core.mark_finished();
        writer.finalize()?;
        Ok(())
    }
}

impl SampleTarget for WavSink {
    fn node_id(&self) -> NodeId {
        self.core.id()
    }

    fn graph(&self) -> &Arc<AudioGraph> {
        self.core.graph()
    }

    fn input_format(&self) -> AudioFormat {
        self.format
    }

    fn write(&self, _topology: &Topology, buf: &[f32], cancel: &CancelSignal) -> Result<()> {
        cancel.checkpoint()?;
        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| TomecutError::Wav("write after finalize".into()))?;
        for &s in buf {
            let q = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer.write_sample(q)?;
        }
        Ok(())
    }

    fn flush(&self, _topology: &Topology, _cancel: &CancelSignal) -> Result<()> {
        Ok(())
    }
}

/// Where and how segments land on disk.
#[derive(Debug, Clone)]
pub struct SegmentWriterConfig {
    pub out_dir: PathBuf,
    /// Post-encode each finished WAV to Ogg Opus through ffmpeg.
    pub encode_opus: bool,
    pub opus_bitrate_kbps: u32,
    pub ffmpeg_binary: PathBuf,
}

impl SegmentWriterConfig {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            encode_opus: false,
            opus_bitrate_kbps: 16,
            ffmpeg_binary: PathBuf::from("ffmpeg"),
        }
    }
}

/// Granularity of the write loop; rotation lands within one window of
/// the requested break.
const WRITE_WINDOW: Duration = Duration::from_millis(10);

/// Any break starting inside the first second renames the first segment
/// instead of producing a sliver file.
const FIRST_BREAK_GRACE: Duration = Duration::from_secs(1);

/// Stream `source` to disk, starting a new file at each break. Returns
/// the finished paths in order.
pub fn write_segments(
    graph: &Arc<AudioGraph>,
    source: &Arc<dyn SampleSource>,
    breaks: &[ChapterBreak],
    config: &SegmentWriterConfig,
    cancel: &CancelSignal,
    progress: Option<&broadcast::Sender<SplitEvent>>,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(&config.out_dir)?;
    let format = source.output_format();
    let driver = PassthroughDriver::new(graph, format, "segment-driver");
    connect(source.as_ref(), driver.as_ref())?;

    let mut queue = breaks.iter();
    let mut next_break = queue.next();

    let mut part_idx = 1usize;
    let mut first_name = "01 - Introduction".to_owned();
    if let Some(b) = next_break {
        if b.start < FIRST_BREAK_GRACE {
            if !b.name.trim().is_empty() {
                first_name = format!("01 - {}", b.name);
            }
            next_break = queue.next();
        }
    }

    let mut outputs = Vec::new();
    let mut sink = open_sink(graph, format, &config.out_dir, &first_name)?;
    connect(driver.as_ref(), sink.0.as_ref())?;
    send(progress, SplitEvent::SegmentStarted {
        index: part_idx,
        name: first_name,
    });

    let mut position: u64 = 0;
    while !driver.playback_finished() {
        cancel.checkpoint()?;
        position += driver.drive(WRITE_WINDOW, Pacing::Unthrottled, cancel)?;
        let current = format.samples_to_duration(position);

        if let Some(b) = next_break {
            if current >= b.start {
                let path = finish_sink(sink, config, part_idx, progress)?;
                outputs.push(path);

                part_idx += 1;
                let name = if b.name.trim().is_empty() {
                    format!("{part_idx:02} - Part {part_idx}")
                } else {
                    format!("{part_idx:02} - {}", b.name)
                };
                sink = open_sink(graph, format, &config.out_dir, &name)?;
                connect(driver.as_ref(), sink.0.as_ref())?;
                send(progress, SplitEvent::SegmentStarted {
                    index: part_idx,
                    name,
                });
                next_break = queue.next();
            }
        }
    }

    outputs.push(finish_sink(sink, config, part_idx, progress)?);
    info!(
        segments = outputs.len(),
        out_dir = %config.out_dir.display(),
        "segment writing complete"
    );
    Ok(outputs)
}

fn send(progress: Option<&broadcast::Sender<SplitEvent>>, event: SplitEvent) {
    if let Some(tx) = progress {
        let _ = tx.send(event);
    }
}

fn open_sink(
    graph: &Arc<AudioGraph>,
    format: AudioFormat,
    out_dir: &Path,
    name: &str,
) -> Result<(Arc<WavSink>, PathBuf)> {
    let path = out_dir.join(format!("{}.wav", sanitize_file_name(name)));
    debug!(path = %path.display(), "opening segment");
    let sink = WavSink::create(graph, format, name, &path)?;
    Ok((sink, path))
}

fn finish_sink(
    sink: (Arc<WavSink>, PathBuf),
    config: &SegmentWriterConfig,
    index: usize,
    progress: Option<&broadcast::Sender<SplitEvent>>,
) -> Result<PathBuf> {
    let (sink, wav_path) = sink;
    sink.finalize()?;
    drop(sink);
    let path = if config.encode_opus {
        encode_opus(&wav_path, config)
    } else {
        wav_path
    };
    send(progress, SplitEvent::SegmentWritten {
        index,
        path: path.clone(),
    });
    Ok(path)
}

/// Re-encode a finished WAV to Opus. Failure keeps the WAV and moves on.
fn encode_opus(wav_path: &Path, config: &SegmentWriterConfig) -> PathBuf {
    let opus_path = wav_path.with_extension("opus");
    let result = Command::new(&config.ffmpeg_binary)
        .arg("-v")
        .arg("error")
        .arg("-y")
        .arg("-i")
        .arg(wav_path)
        .arg("-c:a")
        .arg("libopus")
        .arg("-b:a")
        .arg(format!("{}k", config.opus_bitrate_kbps))
        .arg(&opus_path)
        .status();
    match result {
        Ok(status) if status.success() => {
            if let Err(e) = fs::remove_file(wav_path) {
                warn!(error = %e, "could not remove intermediate wav");
            }
            opus_path
        }
        Ok(status) => {
            warn!(%status, "opus encode failed, keeping wav");
            wav_path.to_path_buf()
        }
        Err(e) => {
            warn!(error = %e, "ffmpeg unavailable, keeping wav");
            wav_path.to_path_buf()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BufferSource;

    const FMT: AudioFormat = AudioFormat {
        channels: 1,
        sample_rate: 16_000,
    };

    fn read_wav_len(path: &Path) -> u32 {
        hound::WavReader::open(path).unwrap().len()
    }

    #[test]
    fn sanitizer_replaces_reserved_characters() {
        assert_eq!(
            sanitize_file_name("07 - What? A \"Quote\"/Slash"),
            "07 - What_ A _Quote__Slash"
        );
        assert_eq!(sanitize_file_name("plain name"), "plain name");
    }

    #[test]
    fn segments_rotate_at_breaks() {
        let dir = tempfile::tempdir().unwrap();
        let graph = AudioGraph::new();
        // 3 seconds of audio with breaks at 1s and 2s.
        let source: Arc<dyn SampleSource> =
            BufferSource::new(&graph, FMT, "book", vec![0.3; 48_000]);
        let breaks = vec![
            ChapterBreak {
                start: Duration::from_secs(1),
                name: "Chapter 1".into(),
                ordinal: Some(1),
            },
            ChapterBreak {
                start: Duration::from_secs(2),
                name: String::new(),
                ordinal: None,
            },
        ];
        let config = SegmentWriterConfig::new(dir.path());
        let outputs = write_segments(
            &graph,
            &source,
            &breaks,
            &config,
            &CancelSignal::new(),
            None,
        )
        .unwrap();

        assert_eq!(outputs.len(), 3);
        assert!(outputs[0].ends_with("01 - Introduction.wav"));
        assert!(outputs[1].ends_with("02 - Chapter 1.wav"));
        assert!(outputs[2].ends_with("03 - Part 3.wav"));
        for path in &outputs {
            assert_eq!(read_wav_len(path), 16_000);
        }
    }

    #[test]
    fn early_first_break_renames_the_introduction() {
        let dir = tempfile::tempdir().unwrap();
        let graph = AudioGraph::new();
        let source: Arc<dyn SampleSource> =
            BufferSource::new(&graph, FMT, "book", vec![0.3; 16_000]);
        let breaks = vec![ChapterBreak {
            start: Duration::ZERO,
            name: "Opening Credits".into(),
            ordinal: Some(1),
        }];
        let config = SegmentWriterConfig::new(dir.path());
        let outputs = write_segments(
            &graph,
            &source,
            &breaks,
            &config,
            &CancelSignal::new(),
            None,
        )
        .unwrap();

        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].ends_with("01 - Opening Credits.wav"));
    }
}
