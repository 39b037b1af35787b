//! Transparent filter that tracks the peak amplitude of passing audio.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::cancel::CancelSignal;
use crate::error::Result;
use crate::graph::node::{weak_source, weak_target, NodeCore};
use crate::graph::{
    AudioFormat, AudioGraph, NodeId, NodeRegistration, NodeRole, ReadResult, SampleSource,
    SampleTarget, Topology,
};

/// Passes samples through unchanged and remembers the peak absolute
/// amplitude seen since the last [`reset`](VolumeMeter::reset). The
/// silence scanner resets it per window and reads it back as that
/// window's loudness.
pub struct VolumeMeter {
    core: NodeCore,
    format: AudioFormat,
    peak_bits: AtomicU32,
}

impl VolumeMeter {
    pub fn new(graph: &Arc<AudioGraph>, format: AudioFormat, name: &str) -> Arc<Self> {
        let meter = Arc::new(Self {
            core: NodeCore::new(graph, name),
            format,
            peak_bits: AtomicU32::new(0f32.to_bits()),
        });
        let source = weak_source(&meter);
        let target = weak_target(&meter);
        graph.register(
            meter.core.id(),
            NodeRegistration {
                name: name.to_owned(),
                role: NodeRole::PureFilter,
                input_format: Some(format),
                output_format: Some(format),
                source: Some(source),
                target: Some(target),
                finished: Arc::clone(meter.core.finished_flag()),
                fan_out: false,
            },
        );
        meter
    }

    /// Inherent copy so callers of this dual-trait node need not pick a
    /// trait to name the node.
    pub fn node_id(&self) -> NodeId {
        self.core.id()
    }

    /// Peak absolute amplitude observed since the last reset.
    pub fn peak(&self) -> f32 {
        f32::from_bits(self.peak_bits.load(Ordering::SeqCst))
    }

    pub fn reset(&self) {
        self.peak_bits.store(0f32.to_bits(), Ordering::SeqCst);
    }

    fn observe(&self, buf: &[f32]) {
        let mut peak = self.peak();
        for &s in buf {
            let a = s.abs();
            if a > peak {
                peak = a;
            }
        }
        self.peak_bits.store(peak.to_bits(), Ordering::SeqCst);
    }
}

impl SampleSource for VolumeMeter {
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
        topology: &Topology,
        buf: &mut [f32],
        cancel: &CancelSignal,
    ) -> Result<ReadResult> {
        cancel.checkpoint()?;
        let Some(upstream) = topology.upstream_source(self.node_id())? else {
            return Ok(ReadResult::Samples(0));
        };
        match upstream.read(topology, buf, cancel)? {
            ReadResult::Samples(n) => {
                self.observe(&buf[..self.format.interleaved_len(n)]);
                Ok(ReadResult::Samples(n))
            }
            ReadResult::EndOfStream => {
                self.core.mark_finished();
                Ok(ReadResult::EndOfStream)
            }
        }
    }
}

impl SampleTarget for VolumeMeter {
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
        self.observe(buf);
        for target in topology.output_targets(self.node_id())? {
            target.write(topology, buf, cancel)?;
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
    use approx::assert_relative_eq;

    const FMT: AudioFormat = AudioFormat {
        channels: 1,
        sample_rate: 48_000,
    };

    #[test]
    fn peak_tracks_across_writes_until_reset() {
        let graph = AudioGraph::new();
        let meter = VolumeMeter::new(&graph, FMT, "meter");
        let cancel = CancelSignal::new();
        let topo = graph.lock();

        meter.write(&topo, &[0.1, -0.4, 0.2], &cancel).unwrap();
        meter.write(&topo, &[0.05, -0.05], &cancel).unwrap();
        assert_relative_eq!(meter.peak(), 0.4);

        meter.reset();
        assert_eq!(meter.peak(), 0.0);
        meter.write(&topo, &[-0.9], &cancel).unwrap();
        assert_relative_eq!(meter.peak(), 0.9);
    }
}
