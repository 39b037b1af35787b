//! Pull sources: in-memory buffers, endless silence, WAV files, and
//! arbitrary container formats decoded through ffmpeg.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::cancel::CancelSignal;
use crate::error::{Result, TomecutError};
use crate::graph::node::{weak_source, NodeCore};
use crate::graph::{
    AudioFormat, AudioGraph, NodeId, NodeRegistration, NodeRole, ReadResult, SampleSource,
    Topology,
};

fn register_source<S: SampleSource + 'static>(
    graph: &Arc<AudioGraph>,
    node: &Arc<S>,
    core: &NodeCore,
    format: AudioFormat,
) {
    let source = weak_source(node);
    graph.register(
        core.id(),
        NodeRegistration {
            name: core.name().to_owned(),
            role: NodeRole::PureFilter,
            input_format: None,
            output_format: Some(format),
            source: Some(source),
            target: None,
            finished: Arc::clone(core.finished_flag()),
            fan_out: false,
        },
    );
}

/// Finite source backed by an in-memory interleaved sample buffer.
pub struct BufferSource {
    core: NodeCore,
    format: AudioFormat,
    state: Mutex<BufferState>,
}

struct BufferState {
    data: Vec<f32>,
    pos: usize,
}

impl BufferSource {
    pub fn new(
        graph: &Arc<AudioGraph>,
        format: AudioFormat,
        name: &str,
        data: Vec<f32>,
    ) -> Arc<Self> {
        let node = Arc::new(Self {
            core: NodeCore::new(graph, name),
            format,
            state: Mutex::new(BufferState { data, pos: 0 }),
        });
        register_source(graph, &node, &node.core, format);
        node
    }
}

impl SampleSource for BufferSource {
    fn node_id(&self) -> NodeId {
        self.core.id()
    }

    fn graph(&self) -> &Arc<AudioGraph> {
        self.core.graph()
    }

    fn output_format(&self) -> AudioFormat {
        self.format
    }

    fn playback_finished(&self) -> bool {
        self.core.is_finished()
    }

    fn read(
        &self,
        _topology: &Topology,
        buf: &mut [f32],
        cancel: &CancelSignal,
    ) -> Result<ReadResult> {
        cancel.checkpoint()?;
        let channels = self.format.channels as usize;
        let mut state = self.state.lock();
        let remaining = state.data.len() - state.pos;
        let take = (buf.len() / channels * channels).min(remaining);
        if take == 0 {
            self.core.mark_finished();
            return Ok(ReadResult::EndOfStream);
        }
        let pos = state.pos;
        buf[..take].copy_from_slice(&state.data[pos..pos + take]);
        state.pos += take;
        Ok(ReadResult::Samples(take / channels))
    }
}

/// Endless source of zero samples.
pub struct SilenceSource {
    core: NodeCore,
    format: AudioFormat,
}

impl SilenceSource {
    pub fn new(graph: &Arc<AudioGraph>, format: AudioFormat, name: &str) -> Arc<Self> {
        let node = Arc::new(Self {
            core: NodeCore::new(graph, name),
            format,
        });
        register_source(graph, &node, &node.core, format);
        node
    }
}

impl SampleSource for SilenceSource {
    fn node_id(&self) -> NodeId {
        self.core.id()
    }

    fn graph(&self) -> &Arc<AudioGraph> {
        self.core.graph()
    }

    fn output_format(&self) -> AudioFormat {
        self.format
    }

    fn playback_finished(&self) -> bool {
        false
    }

    fn read(
        &self,
        _topology: &Topology,
        buf: &mut [f32],
        cancel: &CancelSignal,
    ) -> Result<ReadResult> {
        cancel.checkpoint()?;
        let channels = self.format.channels as usize;
        let samples = buf.len() / channels;
        buf[..samples * channels].fill(0.0);
        Ok(ReadResult::Samples(samples))
    }
}

enum WavSamples {
    Float(hound::WavIntoSamples<BufReader<File>, f32>),
    Int {
        iter: hound::WavIntoSamples<BufReader<File>, i32>,
        scale: f32,
    },
}

impl WavSamples {
    fn next(&mut self) -> Option<std::result::Result<f32, hound::Error>> {
        match self {
            WavSamples::Float(iter) => iter.next(),
            WavSamples::Int { iter, scale } => iter
                .next()
                .map(|r| r.map(|s| (s as f32 * *scale).clamp(-1.0, 1.0))),
        }
    }
}

/// Streaming WAV decoder. Emits the file's native format; put a
/// [`Conformer`](crate::graph::Conformer) downstream to reach the
/// graph's processing format.
pub struct WavSource {
    core: NodeCore,
    format: AudioFormat,
    samples: Mutex<WavSamples>,
}

impl WavSource {
    pub fn open(graph: &Arc<AudioGraph>, path: &Path, name: &str) -> Result<Arc<Self>> {
        let reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let format = AudioFormat::new(spec.channels, spec.sample_rate);
        let samples = match spec.sample_format {
            hound::SampleFormat::Float => WavSamples::Float(reader.into_samples()),
            hound::SampleFormat::Int => WavSamples::Int {
                iter: reader.into_samples(),
                scale: 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32,
            },
        };
        let node = Arc::new(Self {
            core: NodeCore::new(graph, name),
            format,
            samples: Mutex::new(samples),
        });
        register_source(graph, &node, &node.core, format);
        Ok(node)
    }
}

impl SampleSource for WavSource {
    fn node_id(&self) -> NodeId {
        self.core.id()
    }

    fn graph(&self) -> &Arc<AudioGraph> {
        self.core.graph()
    }

    fn output_format(&self) -> AudioFormat {
        self.format
    }

    fn playback_finished(&self) -> bool {
        self.core.is_finished()
    }

    fn read(
        &self,
        _topology: &Topology,
        buf: &mut [f32],
        cancel: &CancelSignal,
    ) -> Result<ReadResult> {
        cancel.checkpoint()?;
        let channels = self.format.channels as usize;
        let want = buf.len() / channels * channels;
        let mut samples = self.samples.lock();
        let mut filled = 0usize;
        while filled < want {
            match samples.next() {
                Some(sample) => {
                    buf[filled] = sample.map_err(TomecutError::from)?;
                    filled += 1;
                }
                None => break,
            }
        }
        if filled == 0 {
            self.core.mark_finished();
            return Ok(ReadResult::EndOfStream);
        }
        Ok(ReadResult::Samples(filled / channels))
    }
}

/// Decodes any container ffmpeg understands by streaming raw f32le PCM
/// from a child process. The child is asked for the requested format
/// directly, so no downstream conformance is needed.
pub struct FfmpegSource {
    core: NodeCore,
    format: AudioFormat,
    state: Mutex<FfmpegState>,
}

struct FfmpegState {
    child: Child,
    stdout: ChildStdout,
    /// Trailing bytes of a partially-read f32 frame.
    carry: Vec<u8>,
    eof: bool,
}

impl FfmpegSource {
    pub fn spawn(
        graph: &Arc<AudioGraph>,
        binary: &Path,
        input: &Path,
        format: AudioFormat,
        name: &str,
    ) -> Result<Arc<Self>> {
        let mut child = Command::new(binary)
            .arg("-v")
            .arg("error")
            .arg("-nostdin")
            .arg("-i")
            .arg(input)
            .arg("-f")
            .arg("f32le")
            .arg("-ac")
            .arg(format.channels.to_string())
            .arg("-ar")
            .arg(format.sample_rate.to_string())
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                TomecutError::ExternalTool(format!("failed to launch {}: {e}", binary.display()))
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TomecutError::ExternalTool("ffmpeg stdout not captured".into()))?;
        let node = Arc::new(Self {
            core: NodeCore::new(graph, name),
            format,
            state: Mutex::new(FfmpegState {
                child,
                stdout,
                carry: Vec::new(),
                eof: false,
            }),
        });
        register_source(graph, &node, &node.core, format);
        Ok(node)
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        // Reaped already once stdout hit end-of-file; an abandoned
        // decode still has a child writing into a dead pipe.
        if !state.eof {
            if let Err(e) = state.child.kill() {
                warn!(node = self.core.name(), error = %e, "failed to kill ffmpeg");
            }
            let _ = state.child.wait();
        }
    }
}

impl SampleSource for FfmpegSource {
    fn node_id(&self) -> NodeId {
        self.core.id()
    }

    fn graph(&self) -> &Arc<AudioGraph> {
        self.core.graph()
    }

    fn output_format(&self) -> AudioFormat {
        self.format
    }

    fn playback_finished(&self) -> bool {
        self.core.is_finished()
    }

    fn read(
        &self,
        _topology: &Topology,
        buf: &mut [f32],
        cancel: &CancelSignal,
    ) -> Result<ReadResult> {
        cancel.checkpoint()?;
        let channels = self.format.channels as usize;
        let want_bytes = buf.len() / channels * channels * 4;
        let mut state = self.state.lock();
        if state.eof && state.carry.len() < 4 {
            self.core.mark_finished();
            return Ok(ReadResult::EndOfStream);
        }

        let mut bytes = std::mem::take(&mut state.carry);
        let mut chunk = [0u8; 8192];
        while bytes.len() < want_bytes && !state.eof {
            cancel.checkpoint()?;
            let cap = chunk.len().min(want_bytes - bytes.len());
            match state.stdout.read(&mut chunk[..cap]) {
                Ok(0) => {
                    state.eof = true;
                    match state.child.wait() {
                        Ok(status) if !status.success() => {
                            warn!(node = self.core.name(), %status, "ffmpeg exited abnormally");
                        }
                        Err(e) => warn!(node = self.core.name(), error = %e, "ffmpeg wait failed"),
                        _ => {}
                    }
                }
                Ok(n) => bytes.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(TomecutError::Io(e)),
            }
        }

        let whole = bytes.len() / 4 * 4;
        state.carry = bytes.split_off(whole);
        for (i, frame) in bytes.chunks_exact(4).enumerate() {
            buf[i] = f32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        }
        let filled = whole / 4;
        if filled == 0 {
            self.core.mark_finished();
            return Ok(ReadResult::EndOfStream);
        }
        Ok(ReadResult::Samples(filled / channels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FMT: AudioFormat = AudioFormat {
        channels: 1,
        sample_rate: 48_000,
    };

    #[test]
    fn buffer_source_yields_data_then_end_of_stream() {
        let graph = AudioGraph::new();
        let source = BufferSource::new(&graph, FMT, "buf", vec![0.1, 0.2, 0.3]);
        let cancel = CancelSignal::new();
        let topo = graph.lock();
        let mut buf = [0.0f32; 2];

        assert_eq!(
            source.read(&topo, &mut buf, &cancel).unwrap(),
            ReadResult::Samples(2)
        );
        assert_eq!(buf, [0.1, 0.2]);
        assert_eq!(
            source.read(&topo, &mut buf, &cancel).unwrap(),
            ReadResult::Samples(1)
        );
        assert_eq!(buf[0], 0.3);
        assert!(source.read(&topo, &mut buf, &cancel).unwrap().is_end());
        assert!(source.playback_finished());
    }

    #[test]
    fn wav_source_reads_i16_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..400 {
            writer.write_sample(i16::MAX / 2).unwrap();
        }
        writer.finalize().unwrap();

        let graph = AudioGraph::new();
        let source = WavSource::open(&graph, &path, "wav").unwrap();
        assert_eq!(source.output_format(), AudioFormat::mono(16_000));

        let cancel = CancelSignal::new();
        let topo = graph.lock();
        let mut buf = [0.0f32; 512];
        let ReadResult::Samples(n) = source.read(&topo, &mut buf, &cancel).unwrap() else {
            panic!("expected samples");
        };
        assert_eq!(n, 400);
        assert!((buf[0] - 0.5).abs() < 1e-3);
        assert!(source.read(&topo, &mut buf, &cancel).unwrap().is_end());
    }

    #[test]
    fn dropping_an_unfinished_decode_kills_the_child() {
        let graph = AudioGraph::new();
        // `yes` stands in for a decoder that never stops producing.
        let Ok(source) =
            FfmpegSource::spawn(&graph, Path::new("yes"), Path::new("unused"), FMT, "decode")
        else {
            return; // host without a `yes` binary
        };
        let pid = source.state.lock().child.id();
        drop(source);

        // Signal 0 checks for existence without delivering anything.
        let alive = Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        assert!(!alive, "decoder child outlived its node");
    }
}
