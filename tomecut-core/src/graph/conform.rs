//! Format conformance filter: channel mix plus rubato rate conversion.
//!
//! Audiobook files arrive stereo at 44.1 kHz, mono at 22.05 kHz, and
//! everything in between; the scan graph runs at one processing format.
//! The conformer bridges the two on both the push and the pull path.
//!
//! Channel handling goes through a mono intermediate: inputs are
//! averaged down, outputs duplicated up. Rate conversion uses a rubato
//! `FastFixedIn` session fed in fixed chunks, with partial input held
//! between calls. When the rates already match no session is created.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::cancel::CancelSignal;
use crate::error::{Result, TomecutError};
use crate::graph::node::{weak_source, weak_target, NodeCore};
use crate::graph::{
    AudioFormat, AudioGraph, NodeId, NodeRegistration, NodeRole, ReadResult, SampleSource,
    SampleTarget, Topology,
};

/// Input frames per rubato call.
const CONFORM_CHUNK: usize = 1024;

struct ConformState {
    resampler: Option<FastFixedIn<f32>>,
    /// Mono input-rate samples awaiting a full chunk.
    input_buf: Vec<f32>,
    /// Pre-allocated rubato output: `[1][output_frames_max]`.
    rubato_out: Vec<Vec<f32>>,
    /// Converted mono output-rate samples awaiting a puller.
    out_queue: VecDeque<f32>,
    /// Scratch for pulling interleaved upstream audio.
    scratch: Vec<f32>,
    upstream_ended: bool,
}

/// Converts between two [`AudioFormat`]s.
pub struct Conformer {
    core: NodeCore,
    input_format: AudioFormat,
    output_format: AudioFormat,
    state: Mutex<ConformState>,
}

impl Conformer {
    pub fn new(
        graph: &Arc<AudioGraph>,
        input_format: AudioFormat,
        output_format: AudioFormat,
        name: &str,
    ) -> Result<Arc<Self>> {
        let resampler = if input_format.sample_rate == output_format.sample_rate {
            None
        } else {
            let ratio = output_format.sample_rate as f64 / input_format.sample_rate as f64;
            let resampler = FastFixedIn::<f32>::new(
                ratio,
                1.0, // fixed ratio
                PolynomialDegree::Cubic,
                CONFORM_CHUNK,
                1, // mono intermediate
            )
            .map_err(|e| TomecutError::Conform(format!("resampler init: {e}")))?;
            Some(resampler)
        };
        let max_out = resampler
            .as_ref()
            .map(|r| r.output_frames_max())
            .unwrap_or(0);

        let node = Arc::new(Self {
            core: NodeCore::new(graph, name),
            input_format,
            output_format,
            state: Mutex::new(ConformState {
                resampler,
                input_buf: Vec::new(),
                rubato_out: vec![vec![0f32; max_out]; 1],
                out_queue: VecDeque::new(),
                scratch: vec![0f32; input_format.interleaved_len(CONFORM_CHUNK)],
                upstream_ended: false,
            }),
        });
        let source = weak_source(&node);
        let target = weak_target(&node);
        graph.register(
            node.core.id(),
            NodeRegistration {
                name: name.to_owned(),
                role: NodeRole::PureFilter,
                input_format: Some(input_format),
                output_format: Some(output_format),
                source: Some(source),
                target: Some(target),
                finished: Arc::clone(node.core.finished_flag()),
                fan_out: false,
            },
        );
        Ok(node)
    }

    /// Inherent copy so callers of this dual-trait node need not pick a
    /// trait to name the node.
    pub fn node_id(&self) -> NodeId {
        self.core.id()
    }

    /// Average interleaved input frames down to mono.
    fn mix_to_mono(&self, buf: &[f32], out: &mut Vec<f32>) {
        let channels = self.input_format.channels as usize;
        if channels == 1 {
            out.extend_from_slice(buf);
            return;
        }
        for frame in buf.chunks_exact(channels) {
            out.push(frame.iter().sum::<f32>() / channels as f32);
        }
    }
}

/// Run full chunks through rubato, appending mono output to `sink`.
fn convert_ready(state: &mut ConformState, sink: &mut impl Extend<f32>) {
    let Some(resampler) = state.resampler.as_mut() else {
        sink.extend(state.input_buf.drain(..));
        return;
    };
    while state.input_buf.len() >= CONFORM_CHUNK {
        let input = &state.input_buf[..CONFORM_CHUNK];
        match resampler.process_into_buffer(&[input], &mut state.rubato_out, None) {
            Ok((_consumed, produced)) => {
                sink.extend(state.rubato_out[0][..produced].iter().copied());
            }
            Err(e) => error!("conformer process error: {e}"),
        }
        state.input_buf.drain(..CONFORM_CHUNK);
    }
}

/// Pad the held remainder with silence to a full chunk and convert it.
fn convert_tail(state: &mut ConformState, sink: &mut impl Extend<f32>) {
    if !state.input_buf.is_empty() {
        state.input_buf.resize(CONFORM_CHUNK, 0.0);
    }
    convert_ready(state, sink);
}

impl SampleSource for Conformer {
    fn node_id(&self) -> NodeId {
        self.core.id()
    }

    fn graph(&self) -> &Arc<AudioGraph> {
        self.core.graph()
    }

    fn output_format(&self) -> AudioFormat {
        self.output_format
    }

    fn playback_finished(&self) -> bool {
        self.core.is_finished()
    }

    fn read(
        &self,
        topology: &Topology,
        buf: &mut [f32],
        cancel: &CancelSignal,
    ) -> Result<ReadResult> {
        cancel.checkpoint()?;
        let out_channels = self.output_format.channels as usize;
        let want = buf.len() / out_channels;
        let mut state = self.state.lock();

        // Pull and convert until we can satisfy the request or the
        // upstream runs out.
        while state.out_queue.len() < want && !state.upstream_ended {
            let Some(upstream) = topology.upstream_source(self.node_id())? else {
                break;
            };
            let mut scratch = std::mem::take(&mut state.scratch);
            let outcome = upstream.read(topology, &mut scratch, cancel);
            let result = match &outcome {
                Ok(ReadResult::Samples(n)) => {
                    let filled = self.input_format.interleaved_len(*n);
                    let mut mono = Vec::with_capacity(*n);
                    self.mix_to_mono(&scratch[..filled], &mut mono);
                    state.input_buf.extend_from_slice(&mono);
                    let mut queue = std::mem::take(&mut state.out_queue);
                    convert_ready(&mut state, &mut queue);
                    state.out_queue = queue;
                    if *n == 0 {
                        // Nothing buffered upstream right now.
                        Some(ReadResult::Samples(0))
                    } else {
                        None
                    }
                }
                Ok(ReadResult::EndOfStream) => {
                    state.upstream_ended = true;
                    let mut queue = std::mem::take(&mut state.out_queue);
                    convert_tail(&mut state, &mut queue);
                    state.out_queue = queue;
                    None
                }
                Err(_) => None,
            };
            state.scratch = scratch;
            outcome?;
            if let Some(early) = result {
                if state.out_queue.is_empty() {
                    return Ok(early);
                }
                break;
            }
        }

        let take = want.min(state.out_queue.len());
        if take == 0 {
            if state.upstream_ended {
                self.core.mark_finished();
                return Ok(ReadResult::EndOfStream);
            }
            return Ok(ReadResult::Samples(0));
        }
        for i in 0..take {
            let s = state.out_queue.pop_front().unwrap_or(0.0);
            for c in 0..out_channels {
                buf[i * out_channels + c] = s;
            }
        }
        Ok(ReadResult::Samples(take))
    }
}

impl SampleTarget for Conformer {
    fn node_id(&self) -> NodeId {
        self.core.id()
    }

    fn graph(&self) -> &Arc<AudioGraph> {
        self.core.graph()
    }

    fn input_format(&self) -> AudioFormat {
        self.input_format
    }

    fn write(&self, topology: &Topology, buf: &[f32], cancel: &CancelSignal) -> Result<()> {
        cancel.checkpoint()?;
        let mut state = self.state.lock();
        let mut mono = Vec::with_capacity(buf.len() / self.input_format.channels as usize);
        self.mix_to_mono(buf, &mut mono);
        state.input_buf.extend_from_slice(&mono);
        let mut converted = Vec::new();
        convert_ready(&mut state, &mut converted);
        drop(state);
        self.forward(topology, &converted, cancel)
    }

    fn flush(&self, topology: &Topology, cancel: &CancelSignal) -> Result<()> {
        cancel.checkpoint()?;
        let mut state = self.state.lock();
        let mut converted = Vec::new();
        convert_tail(&mut state, &mut converted);
        drop(state);
        self.forward(topology, &converted, cancel)?;
        for target in topology.output_targets(self.node_id())? {
            target.flush(topology, cancel)?;
        }
        Ok(())
    }
}

impl Conformer {
    fn forward(&self, topology: &Topology, mono: &[f32], cancel: &CancelSignal) -> Result<()> {
        if mono.is_empty() {
            return Ok(());
        }
        let out_channels = self.output_format.channels as usize;
        let interleaved: Vec<f32> = if out_channels == 1 {
            mono.to_vec()
        } else {
            let mut v = Vec::with_capacity(mono.len() * out_channels);
            for &s in mono {
                for _ in 0..out_channels {
                    v.push(s);
                }
            }
            v
        };
        for target in topology.output_targets(self.node_id())? {
            target.write(topology, &interleaved, cancel)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{connect, BufferSource, NullSink};

    #[test]
    fn same_rate_stereo_to_mono_passthrough() {
        let graph = AudioGraph::new();
        let conf = Conformer::new(
            &graph,
            AudioFormat::stereo(48_000),
            AudioFormat::mono(48_000),
            "conform",
        )
        .unwrap();
        let sink = NullSink::new(&graph, AudioFormat::mono(48_000), "sink");
        connect(conf.as_ref(), sink.as_ref()).unwrap();

        let cancel = CancelSignal::new();
        let topo = graph.lock();
        // 4 stereo frames.
        conf.write(&topo, &[0.2, 0.4, 0.0, 0.0, 1.0, -1.0, 0.5, 0.5], &cancel)
            .unwrap();
        assert_eq!(sink.samples_consumed(), 4);
    }

    #[test]
    fn downsampling_produces_roughly_ratio_output() {
        let graph = AudioGraph::new();
        let input_fmt = AudioFormat::mono(48_000);
        let output_fmt = AudioFormat::mono(16_000);
        let source = BufferSource::new(&graph, input_fmt, "buf", vec![0.1; 48_000]);
        let conf = Conformer::new(&graph, input_fmt, output_fmt, "conform").unwrap();
        connect(source.as_ref(), conf.as_ref()).unwrap();

        let cancel = CancelSignal::new();
        let topo = graph.lock();
        let mut buf = [0.0f32; 4096];
        let mut total = 0usize;
        loop {
            match conf.read(&topo, &mut buf, &cancel).unwrap() {
                ReadResult::Samples(n) => total += n,
                ReadResult::EndOfStream => break,
            }
        }
        // One second of input → about one second at the output rate.
        let expected = 16_000isize;
        assert!(
            (total as isize - expected).unsigned_abs() < 1_200,
            "total={total} expected≈{expected}"
        );
    }
}
