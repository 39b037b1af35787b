//! The splitter engine: everything between "here is an audiobook file"
//! and "here is a directory of chapter files".
//!
//! Per input file the engine runs up to three phases:
//!
//!   1. metadata probe  - if the container already carries chapter
//!      marks, those win and no audio analysis happens at all
//!   2. silence scan    - one streaming pass recording silence
//!      intervals and transcribing the speech after the long ones
//!   3. segment write   - a second streaming pass cutting the audio at
//!      the inferred breaks
//!
//! Each phase gets a fresh [`AudioGraph`]; graphs are cheap and a
//! single-use graph cannot leak wiring between phases.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cancel::CancelSignal;
use crate::chapters::{infer_chapter_breaks, ChapterBreak, InferenceConfig, Strategy};
use crate::error::{Result, TomecutError};
use crate::events::SplitEvent;
use crate::graph::{
    connect, AudioFormat, AudioGraph, Conformer, FfmpegSource, SampleSource, WavSource,
};
use crate::probe::{ChapterMetadataProbe, FfprobeProbe};
use crate::recognize::Recognizer;
use crate::scan::{find_silence_intervals, ScanConfig};
use crate::segment::{sanitize_file_name, write_segments, SegmentWriterConfig};

/// Capacity of the progress broadcast channel. Slow subscribers lose
/// old events instead of stalling the split.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything tunable about a split run.
#[derive(Debug, Clone)]
pub struct SplitConfig {
    /// Format every input is decoded or conformed to before analysis.
    pub processing_format: AudioFormat,
    pub scan: ScanConfig,
    pub inference: InferenceConfig,
    /// Re-encode finished segments to Ogg Opus.
    pub encode_opus: bool,
    pub opus_bitrate_kbps: u32,
    /// Where per-book output directories are created. `None` puts them
    /// next to the input file.
    pub output_root: Option<PathBuf>,
    pub ffmpeg_binary: PathBuf,
    pub ffprobe_binary: PathBuf,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            processing_format: AudioFormat::mono(48_000),
            scan: ScanConfig::default(),
            inference: InferenceConfig::default(),
            encode_opus: true,
            opus_bitrate_kbps: 16,
            output_root: None,
            ffmpeg_binary: PathBuf::from("ffmpeg"),
            ffprobe_binary: PathBuf::from("ffprobe"),
        }
    }
}

/// What one input file produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitReport {
    pub input: PathBuf,
    pub strategy: Strategy,
    pub breaks: Vec<ChapterBreak>,
    pub outputs: Vec<PathBuf>,
}

/// Splits audiobook files into chapter segments.
pub struct ChapterSplitter {
    config: SplitConfig,
    probe: Box<dyn ChapterMetadataProbe>,
    recognizer: Option<Box<dyn Recognizer>>,
    events: broadcast::Sender<SplitEvent>,
    cancel: CancelSignal,
}

impl ChapterSplitter {
    pub fn new(config: SplitConfig) -> Self {
        let probe = Box::new(FfprobeProbe::new(config.ffprobe_binary.clone()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            probe,
            recognizer: None,
            events,
            cancel: CancelSignal::new(),
        }
    }

    /// Replace the metadata probe, mainly for embedding and tests.
    pub fn with_probe(mut self, probe: Box<dyn ChapterMetadataProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Attach a speech recognizer; without one, chapter inference falls
    /// straight through to the silence heuristics.
    pub fn with_recognizer(mut self, recognizer: Box<dyn Recognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SplitEvent> {
        self.events.subscribe()
    }

    /// Clone of the signal that aborts a running split.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Split one file, or every regular file directly inside a
    /// directory. A failing file is logged and skipped; cancellation
    /// stops the whole run.
    pub fn split_path(&self, path: &Path) -> Result<Vec<SplitReport>> {
        if !path.is_dir() {
            return Ok(vec![self.split_file(path)?]);
        }
        let mut inputs: Vec<PathBuf> = fs::read_dir(path)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.is_file())
            .collect();
        inputs.sort();

        let mut reports = Vec::new();
        for input in inputs {
            match self.split_file(&input) {
                Ok(report) => reports.push(report),
                Err(TomecutError::Cancelled) => return Err(TomecutError::Cancelled),
                Err(e) => {
                    warn!(input = %input.display(), error = %e, "skipping file");
                }
            }
        }
        Ok(reports)
    }

    pub fn split_file(&self, path: &Path) -> Result<SplitReport> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("audiobook");
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let out_dir = self
            .config
            .output_root
            .clone()
            .unwrap_or_else(|| parent.to_path_buf())
            .join(sanitize_file_name(stem));
        info!(input = %path.display(), out_dir = %out_dir.display(), "splitting");

        let (breaks, strategy) = self.resolve_breaks(path)?;
        let _ = self.events.send(SplitEvent::ChaptersResolved {
            strategy,
            count: breaks.len(),
        });

        let graph = AudioGraph::new();
        let opened = self.open_source(&graph, path)?;
        let writer_config = SegmentWriterConfig {
            out_dir,
            encode_opus: self.config.encode_opus,
            opus_bitrate_kbps: self.config.opus_bitrate_kbps,
            ffmpeg_binary: self.config.ffmpeg_binary.clone(),
        };
        let outputs = write_segments(
            &graph,
            &opened.source,
            &breaks,
            &writer_config,
            &self.cancel,
            Some(&self.events),
        )?;

        let _ = self.events.send(SplitEvent::FileComplete {
            path: path.to_path_buf(),
            segments: outputs.len(),
        });
        Ok(SplitReport {
            input: path.to_path_buf(),
            strategy,
            breaks,
            outputs,
        })
    }

    fn resolve_breaks(&self, path: &Path) -> Result<(Vec<ChapterBreak>, Strategy)> {
        let probed = self.probe.probe_chapters(path);
        if !probed.is_empty() {
            info!(count = probed.len(), "using container chapter metadata");
            return Ok((probed, Strategy::Metadata));
        }

        let graph = AudioGraph::new();
        let opened = self.open_source(&graph, path)?;
        let outcome = find_silence_intervals(
            &graph,
            &opened.source,
            self.recognizer.as_deref(),
            &self.config.scan,
            &self.cancel,
            Some(&self.events),
        )?;
        let _ = self.events.send(SplitEvent::ScanComplete {
            total_secs: outcome.total_duration.as_secs_f64(),
            intervals: outcome.intervals.len(),
        });

        Ok(infer_chapter_breaks(
            &outcome.intervals,
            outcome.total_duration,
            &self.config.inference,
        ))
    }

    /// Build a source producing the processing format. WAV is read
    /// natively and conformed when needed; everything else is decoded
    /// through ffmpeg, which resamples for us.
    fn open_source(&self, graph: &Arc<AudioGraph>, path: &Path) -> Result<OpenedSource> {
        let is_wav = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("wav"))
            .unwrap_or(false);
        if !is_wav {
            let source = FfmpegSource::spawn(
                graph,
                &self.config.ffmpeg_binary,
                path,
                self.config.processing_format,
                "input-decode",
            )?;
            return Ok(OpenedSource {
                source,
                _decoder: None,
            });
        }

        let wav: Arc<dyn SampleSource> = WavSource::open(graph, path, "input-wav")?;
        if wav.output_format() == self.config.processing_format {
            return Ok(OpenedSource {
                source: wav,
                _decoder: None,
            });
        }
        let conformer = Conformer::new(
            graph,
            wav.output_format(),
            self.config.processing_format,
            "input-conform",
        )?;
        connect(wav.as_ref(), conformer.as_ref())?;
        Ok(OpenedSource {
            source: conformer,
            _decoder: Some(wav),
        })
    }
}

/// The pullable head of an input chain, plus whatever upstream node has
/// to stay registered for it to produce anything.
struct OpenedSource {
    source: Arc<dyn SampleSource>,
    _decoder: Option<Arc<dyn SampleSource>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct StaticProbe(Vec<ChapterBreak>);

    impl ChapterMetadataProbe for StaticProbe {
        fn probe_chapters(&self, _path: &Path) -> Vec<ChapterBreak> {
            self.0.clone()
        }
    }

    struct EmptyProbe;

    impl ChapterMetadataProbe for EmptyProbe {
        fn probe_chapters(&self, _path: &Path) -> Vec<ChapterBreak> {
            Vec::new()
        }
    }

    fn write_test_wav(path: &Path, seconds: u32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..seconds * 16_000 {
            writer.write_sample(8_000i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn test_config(out_root: &Path) -> SplitConfig {
        SplitConfig {
            processing_format: AudioFormat::mono(16_000),
            encode_opus: false,
            output_root: Some(out_root.to_path_buf()),
            ..SplitConfig::default()
        }
    }

    #[test]
    fn metadata_chapters_bypass_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("My Book.wav");
        write_test_wav(&input, 2);

        let splitter = ChapterSplitter::new(test_config(dir.path())).with_probe(Box::new(
            StaticProbe(vec![ChapterBreak {
                start: Duration::from_secs(1),
                name: "Chapter 1".into(),
                ordinal: Some(1),
            }]),
        ));
        let report = splitter.split_file(&input).unwrap();

        assert_eq!(report.strategy, Strategy::Metadata);
        assert_eq!(report.outputs.len(), 2);
        assert!(report.outputs[0].ends_with("My Book/01 - Introduction.wav"));
        assert!(report.outputs[1].ends_with("My Book/02 - Chapter 1.wav"));
    }

    #[test]
    fn unbroken_audio_yields_a_single_segment() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("short.wav");
        write_test_wav(&input, 1);

        let splitter =
            ChapterSplitter::new(test_config(dir.path())).with_probe(Box::new(EmptyProbe));
        let report = splitter.split_file(&input).unwrap();

        assert!(report.breaks.is_empty());
        assert_eq!(report.outputs.len(), 1);
        assert!(report.outputs[0].ends_with("short/01 - Introduction.wav"));
    }

    #[test]
    fn reports_serialize_for_machine_consumers() {
        let report = SplitReport {
            input: PathBuf::from("book.m4b"),
            strategy: Strategy::LongSilence,
            breaks: Vec::new(),
            outputs: vec![PathBuf::from("book/01 - Introduction.opus")],
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains(r#""strategy":"longSilence""#));
    }
}
