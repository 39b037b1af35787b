//! Push fan-out: one input mirrored to every attached branch.

use std::sync::Arc;

use crate::cancel::CancelSignal;
use crate::error::{Result, TomecutError};
use crate::graph::node::{weak_target, NodeCore};
use crate::graph::{
    AudioFormat, AudioGraph, NodeId, NodeRegistration, NodeRole, SampleTarget, Topology,
};

/// Mirrors written samples to every attached branch.
///
/// Branches are attached with [`attach`](Splitter::attach), which is
/// additive — unlike [`connect`](crate::graph::connect), it never
/// displaces existing edges. A branch detaches when its downstream node
/// is dropped or its input edge is severed.
pub struct Splitter {
    core: NodeCore,
    format: AudioFormat,
}

impl Splitter {
    pub fn new(graph: &Arc<AudioGraph>, format: AudioFormat, name: &str) -> Arc<Self> {
        let splitter = Arc::new(Self {
            core: NodeCore::new(graph, name),
            format,
        });
        let target = weak_target(&splitter);
        graph.register(
            splitter.core.id(),
            NodeRegistration {
                name: name.to_owned(),
                role: NodeRole::PureFilter,
                input_format: Some(format),
                output_format: Some(format),
                source: None,
                target: Some(target),
                finished: Arc::clone(splitter.core.finished_flag()),
                fan_out: true,
            },
        );
        splitter
    }

    /// Add `target` as a branch receiving a copy of everything written.
    pub fn attach(&self, target: &dyn SampleTarget) -> Result<()> {
        if !Arc::ptr_eq(self.core.graph(), target.graph()) {
            return Err(TomecutError::CrossGraph);
        }
        if self.format != target.input_format() {
            return Err(TomecutError::FormatMismatch {
                output: self.format,
                input: target.input_format(),
            });
        }
        self.core
            .graph()
            .link(self.core.id(), target.node_id(), true)
    }
}

impl SampleTarget for Splitter {
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
    use crate::graph::NullSink;

    const FMT: AudioFormat = AudioFormat {
        channels: 1,
        sample_rate: 48_000,
    };

    #[test]
    fn every_branch_receives_a_copy() {
        let graph = AudioGraph::new();
        let splitter = Splitter::new(&graph, FMT, "split");
        let a = NullSink::new(&graph, FMT, "a");
        let b = NullSink::new(&graph, FMT, "b");
        splitter.attach(a.as_ref()).unwrap();
        splitter.attach(b.as_ref()).unwrap();

        let cancel = CancelSignal::new();
        let topo = graph.lock();
        splitter.write(&topo, &[0.5; 100], &cancel).unwrap();

        assert_eq!(a.samples_consumed(), 100);
        assert_eq!(b.samples_consumed(), 100);
    }

    #[test]
    fn dropped_branches_stop_receiving() {
        let graph = AudioGraph::new();
        let splitter = Splitter::new(&graph, FMT, "split");
        let a = NullSink::new(&graph, FMT, "a");
        let b = NullSink::new(&graph, FMT, "b");
        splitter.attach(a.as_ref()).unwrap();
        splitter.attach(b.as_ref()).unwrap();
        drop(b);

        let cancel = CancelSignal::new();
        let topo = graph.lock();
        splitter.write(&topo, &[0.5; 10], &cancel).unwrap();
        assert_eq!(a.samples_consumed(), 10);
    }

    #[test]
    fn attach_rejects_format_mismatch() {
        let graph = AudioGraph::new();
        let splitter = Splitter::new(&graph, FMT, "split");
        let stereo = NullSink::new(&graph, AudioFormat::stereo(48_000), "stereo");
        assert!(matches!(
            splitter.attach(stereo.as_ref()),
            Err(TomecutError::FormatMismatch { .. })
        ));
    }
}
