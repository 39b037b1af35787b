//! Terminal node that discards everything pushed into it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cancel::CancelSignal;
use crate::error::Result;
use crate::graph::node::{weak_target, NodeCore};
use crate::graph::{
    AudioFormat, AudioGraph, NodeId, NodeRegistration, NodeRole, SampleTarget, Topology,
};

/// Discards samples. Keeps a running count so drives can be verified.
pub struct NullSink {
    core: NodeCore,
    format: AudioFormat,
    consumed: AtomicU64,
}

impl NullSink {
    pub fn new(graph: &Arc<AudioGraph>, format: AudioFormat, name: &str) -> Arc<Self> {
        let sink = Arc::new(Self {
            core: NodeCore::new(graph, name),
            format,
            consumed: AtomicU64::new(0),
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
        sink
    }

    /// Per-channel samples discarded so far.
    pub fn samples_consumed(&self) -> u64 {
        self.consumed.load(Ordering::SeqCst)
    }
}

impl SampleTarget for NullSink {
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
        let samples = buf.len() / self.format.channels as usize;
        self.consumed.fetch_add(samples as u64, Ordering::SeqCst);
        Ok(())
    }

    fn flush(&self, _topology: &Topology, _cancel: &CancelSignal) -> Result<()> {
        Ok(())
    }
}
