//! Rate-limited relay that passes a fixed allowance of audio and then stops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelSignal;
use crate::error::Result;
use crate::graph::node::{weak_source, weak_target, NodeCore};
use crate::graph::{
    AudioFormat, AudioGraph, NodeId, NodeRegistration, NodeRole, ReadResult, SampleSource,
    SampleTarget, Topology,
};

/// Relay filter with a hard cap on throughput.
///
/// Reads clamp to the remaining allowance; writes past the cap are
/// silently dropped after the in-allowance prefix is forwarded. Once
/// `passed == allowed` the pipe reports end-of-stream to pullers, which
/// is how recognition closures learn their capture window is full.
pub struct MeasuredPipe {
    core: NodeCore,
    format: AudioFormat,
    allowed: u64,
    passed: AtomicU64,
}

impl MeasuredPipe {
    pub fn new(
        graph: &Arc<AudioGraph>,
        format: AudioFormat,
        name: &str,
        allowance: Duration,
    ) -> Arc<Self> {
        let pipe = Arc::new(Self {
            core: NodeCore::new(graph, name),
            format,
            allowed: format.duration_to_samples(allowance),
            passed: AtomicU64::new(0),
        });
        let source = weak_source(&pipe);
        let target = weak_target(&pipe);
        graph.register(
            pipe.core.id(),
            NodeRegistration {
                name: name.to_owned(),
                role: NodeRole::PureFilter,
                input_format: Some(format),
                output_format: Some(format),
                source: Some(source),
                target: Some(target),
                finished: Arc::clone(pipe.core.finished_flag()),
                fan_out: false,
            },
        );
        pipe
    }

    /// Inherent copy so callers of this dual-trait node need not pick a
    /// trait to name the node.
    pub fn node_id(&self) -> NodeId {
        self.core.id()
    }

    /// Per-channel samples moved so far.
    pub fn samples_passed(&self) -> u64 {
        self.passed.load(Ordering::SeqCst)
    }

    /// True once the full allowance has moved through.
    pub fn reached_end(&self) -> bool {
        self.samples_passed() >= self.allowed
    }

    fn remaining(&self) -> u64 {
        self.allowed.saturating_sub(self.samples_passed())
    }
}

impl SampleSource for MeasuredPipe {
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
        self.core.is_finished() || self.reached_end()
    }

    fn read(
        &self,
        topology: &Topology,
        buf: &mut [f32],
        cancel: &CancelSignal,
    ) -> Result<ReadResult> {
        cancel.checkpoint()?;
        if self.reached_end() {
            self.core.mark_finished();
            return Ok(ReadResult::EndOfStream);
        }
        let Some(upstream) = topology.upstream_source(self.node_id())? else {
            return Ok(ReadResult::Samples(0));
        };
        let channels = self.format.channels as usize;
        let want = (buf.len() / channels).min(self.remaining() as usize);
        match upstream.read(topology, &mut buf[..want * channels], cancel)? {
            ReadResult::Samples(n) => {
                self.passed.fetch_add(n as u64, Ordering::SeqCst);
                Ok(ReadResult::Samples(n))
            }
            ReadResult::EndOfStream => {
                self.core.mark_finished();
                Ok(ReadResult::EndOfStream)
            }
        }
    }
}

impl SampleTarget for MeasuredPipe {
    fn node_id(&self) -> NodeId {
        self.core.id()
    }

    fn graph(&self) -> &Arc<AudioGraph> {
        self.core.graph()
    }

    fn input_format(&self) -> AudioFormat {
        self.format
    }

    fn write(&self, topology: &Topology, buf: &[f32], cancel: &CancelSignal) -> Result<()> {
        cancel.checkpoint()?;
        let channels = self.format.channels as usize;
        let allow = (buf.len() / channels).min(self.remaining() as usize);
        if allow == 0 {
            // Past the cap: samples are dropped without error.
            return Ok(());
        }
        self.passed.fetch_add(allow as u64, Ordering::SeqCst);
        for target in topology.output_targets(self.node_id())? {
            target.write(topology, &buf[..allow * channels], cancel)?;
        }
        Ok(())
    }

    fn flush(&self, topology: &Topology, cancel: &CancelSignal) -> Result<()> {
        cancel.checkpoint()?;
        for target in topology.output_targets(self.node_id())? {
            target.flush(topology, cancel)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{connect, NullSink, SilenceSource};

    const FMT: AudioFormat = AudioFormat {
        channels: 1,
        sample_rate: 48_000,
    };

    #[test]
    fn writes_clamp_to_the_allowance() {
        let graph = AudioGraph::new();
        let pipe = MeasuredPipe::new(&graph, FMT, "pipe", Duration::from_millis(10));
        let sink = NullSink::new(&graph, FMT, "sink");
        connect(pipe.as_ref(), sink.as_ref()).unwrap();

        let cancel = CancelSignal::new();
        let topo = graph.lock();
        let chunk = vec![0.5f32; 480];
        // 480-sample allowance: two writes of 300 pass 300 + 180.
        pipe.write(&topo, &chunk[..300], &cancel).unwrap();
        pipe.write(&topo, &chunk[..300], &cancel).unwrap();
        assert_eq!(pipe.samples_passed(), 480);
        assert!(pipe.reached_end());
        assert_eq!(sink.samples_consumed(), 480);

        // Past the cap writes disappear without error.
        pipe.write(&topo, &chunk, &cancel).unwrap();
        assert_eq!(pipe.samples_passed(), 480);
        assert_eq!(sink.samples_consumed(), 480);
    }

    #[test]
    fn reads_report_end_of_stream_at_the_cap() {
        let graph = AudioGraph::new();
        let source = SilenceSource::new(&graph, FMT, "silence");
        let pipe = MeasuredPipe::new(&graph, FMT, "pipe", Duration::from_millis(10));
        connect(source.as_ref(), pipe.as_ref()).unwrap();

        let cancel = CancelSignal::new();
        let topo = graph.lock();
        let mut buf = [0.0f32; 1024];
        let mut moved = 0u64;
        loop {
            match pipe.read(&topo, &mut buf, &cancel).unwrap() {
                ReadResult::Samples(n) => moved += n as u64,
                ReadResult::EndOfStream => break,
            }
        }
        assert_eq!(moved, 480);
        assert!(pipe.playback_finished());
    }
}
