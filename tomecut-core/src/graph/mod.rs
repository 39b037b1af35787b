//! Streaming audio graph.
//!
//! Filter nodes form chains that a driver walks in small windows:
//!
//! ```text
//! WavSource ─► Conformer ─► PassthroughDriver ─► VolumeMeter ─► Splitter ─► NullSink
//!                                                                   │
//!                                                                   └─► MeasuredPipe ─► RecognizerSink
//! ```
//!
//! Nodes never own their neighbors. The graph keeps a relational index
//! (`NodeId` → entry with `Weak` trait handles plus upstream/output
//! links) behind one `parking_lot::Mutex`. A driver locks it once per
//! pumped window and hands the locked [`Topology`] view down through
//! `read`/`write`, so reconnecting concurrently with a drive is safe and
//! nodes never re-enter the lock.
//!
//! Connections are exclusive: connecting a source that already feeds
//! another node silently unlinks the old edge first. The one exception
//! is [`Splitter::attach`], which appends a fan-out branch.

pub mod format;
pub mod node;

mod conform;
mod measured;
mod meter;
mod passthrough;
mod sink;
mod source;
mod splitter;

pub use conform::Conformer;
pub use format::AudioFormat;
pub use measured::MeasuredPipe;
pub use meter::VolumeMeter;
pub use node::{NodeId, NodeRole, ReadResult, SampleSource, SampleTarget};
pub use passthrough::{Pacing, PassthroughDriver};
pub use sink::NullSink;
pub use source::{BufferSource, FfmpegSource, SilenceSource, WavSource};
pub use splitter::Splitter;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::error::{Result, TomecutError};

/// Everything the graph records about one registered node.
pub(crate) struct NodeEntry {
    name: String,
    role: NodeRole,
    input_format: Option<AudioFormat>,
    output_format: Option<AudioFormat>,
    source: Option<Weak<dyn SampleSource>>,
    target: Option<Weak<dyn SampleTarget>>,
    finished: Arc<AtomicBool>,
    fan_out: bool,
    upstream: Option<NodeId>,
    outputs: Vec<NodeId>,
}

/// Registration payload handed to [`AudioGraph::register`] by node
/// constructors once their `Arc` exists.
pub(crate) struct NodeRegistration {
    pub name: String,
    pub role: NodeRole,
    pub input_format: Option<AudioFormat>,
    pub output_format: Option<AudioFormat>,
    pub source: Option<Weak<dyn SampleSource>>,
    pub target: Option<Weak<dyn SampleTarget>>,
    pub finished: Arc<AtomicBool>,
    pub fan_out: bool,
}

/// The locked view of the graph's edges. Drivers hold this for the
/// duration of one pumped window and pass it down the chain.
pub struct Topology {
    nodes: HashMap<NodeId, NodeEntry>,
    scope_depth: AtomicU32,
}

/// Marker for a nested traversal of the locked topology. Depth shows up
/// in trace output when chains recurse through fan-out branches; the
/// guard unwinds it on drop.
pub struct InstrumentedScope<'a> {
    topology: &'a Topology,
}

impl Drop for InstrumentedScope<'_> {
    fn drop(&mut self) {
        self.topology.scope_depth.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Topology {
    fn entry(&self, id: NodeId) -> Result<&NodeEntry> {
        self.nodes
            .get(&id)
            .ok_or_else(|| TomecutError::NodeDisposed(id.to_string()))
    }

    fn entry_mut(&mut self, id: NodeId) -> Result<&mut NodeEntry> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| TomecutError::NodeDisposed(id.to_string()))
    }

    /// Resolve the node feeding `of`, if any. Pulling from an active
    /// source is rejected here: those produce on their own schedule.
    pub fn upstream_source(&self, of: NodeId) -> Result<Option<Arc<dyn SampleSource>>> {
        let entry = self.entry(of)?;
        let Some(up_id) = entry.upstream else {
            return Ok(None);
        };
        let up = self.entry(up_id)?;
        if up.role == NodeRole::ActiveSource {
            return Err(TomecutError::ActiveNodeUsage(up.name.clone()));
        }
        let weak = up
            .source
            .as_ref()
            .ok_or_else(|| TomecutError::ActiveNodeUsage(up.name.clone()))?;
        weak.upgrade()
            .map(Some)
            .ok_or_else(|| TomecutError::NodeDisposed(up.name.clone()))
    }

    /// Resolve every node `of` currently feeds. At most one entry unless
    /// `of` is a fan-out node. Pushing into an active sink is rejected.
    pub fn output_targets(&self, of: NodeId) -> Result<Vec<Arc<dyn SampleTarget>>> {
        let entry = self.entry(of)?;
        let mut targets = Vec::with_capacity(entry.outputs.len());
        for &out_id in &entry.outputs {
            let out = self.entry(out_id)?;
            if out.role == NodeRole::ActiveSink {
                return Err(TomecutError::ActiveNodeUsage(out.name.clone()));
            }
            let weak = out
                .target
                .as_ref()
                .ok_or_else(|| TomecutError::ActiveNodeUsage(out.name.clone()))?;
            let target = weak
                .upgrade()
                .ok_or_else(|| TomecutError::NodeDisposed(out.name.clone()))?;
            targets.push(target);
        }
        Ok(targets)
    }

    /// Enter an instrumented traversal scope. Drivers open one per
    /// pumped window.
    pub fn instrumented_scope(&self) -> InstrumentedScope<'_> {
        let depth = self.scope_depth.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(depth, "topology traversal scope entered");
        InstrumentedScope { topology: self }
    }

    pub fn scope_depth(&self) -> u32 {
        self.scope_depth.load(Ordering::Relaxed)
    }

    pub fn has_upstream(&self, of: NodeId) -> bool {
        self.nodes
            .get(&of)
            .map(|e| e.upstream.is_some())
            .unwrap_or(false)
    }

    fn unlink_output_edges(&mut self, of: NodeId) {
        let outputs = match self.nodes.get_mut(&of) {
            Some(entry) => std::mem::take(&mut entry.outputs),
            None => return,
        };
        for out_id in outputs {
            if let Some(out) = self.nodes.get_mut(&out_id) {
                if out.upstream == Some(of) {
                    out.upstream = None;
                }
            }
        }
    }

    fn unlink_input_edge(&mut self, of: NodeId) {
        let upstream = match self.nodes.get_mut(&of) {
            Some(entry) => entry.upstream.take(),
            None => return,
        };
        if let Some(up_id) = upstream {
            if let Some(up) = self.nodes.get_mut(&up_id) {
                up.outputs.retain(|&o| o != of);
            }
        }
    }
}

/// Owner of the topology. Nodes keep an `Arc<AudioGraph>`; the graph
/// only holds `Weak` handles back, so dropping a node's last `Arc`
/// unregisters it and severs its edges.
pub struct AudioGraph {
    topology: Mutex<Topology>,
    next_id: AtomicU64,
}

impl AudioGraph {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topology: Mutex::new(Topology {
                nodes: HashMap::new(),
                scope_depth: AtomicU32::new(0),
            }),
            next_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn allocate_id(&self) -> NodeId {
        NodeId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register(&self, id: NodeId, reg: NodeRegistration) {
        let mut topo = self.topology.lock();
        topo.nodes.insert(
            id,
            NodeEntry {
                name: reg.name,
                role: reg.role,
                input_format: reg.input_format,
                output_format: reg.output_format,
                source: reg.source,
                target: reg.target,
                finished: reg.finished,
                fan_out: reg.fan_out,
                upstream: None,
                outputs: Vec::new(),
            },
        );
    }

    pub(crate) fn unregister(&self, id: NodeId) {
        let mut topo = self.topology.lock();
        topo.unlink_output_edges(id);
        topo.unlink_input_edge(id);
        topo.nodes.remove(&id);
    }

    /// Lock the topology for the duration of one pumped window.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Topology> {
        self.topology.lock()
    }

    pub(crate) fn link(&self, source_id: NodeId, target_id: NodeId, append: bool) -> Result<()> {
        let mut topo = self.topology.lock();

        {
            let src = topo.entry(source_id)?;
            let dst = topo.entry(target_id)?;
            // A node that has run dry never takes fresh input again; a
            // finished upstream is fine, it just reports end-of-stream.
            if dst.finished.load(Ordering::SeqCst) {
                return Err(TomecutError::PlaybackFinished(dst.name.clone()));
            }
            match (src.output_format, dst.input_format) {
                (Some(out), Some(inp)) if out != inp => {
                    return Err(TomecutError::FormatMismatch { output: out, input: inp });
                }
                _ => {}
            }
            // Already wired exactly like this: nothing to do.
            if dst.upstream == Some(source_id) && src.outputs.contains(&target_id) {
                return Ok(());
            }
            debug!(source = %src.name, target = %dst.name, append, "linking nodes");
        }

        // Exclusive connect displaces whatever either side was wired to.
        if !append && !topo.entry(source_id)?.fan_out {
            topo.unlink_output_edges(source_id);
        }
        topo.unlink_input_edge(target_id);

        topo.entry_mut(source_id)?.outputs.push(target_id);
        topo.entry_mut(target_id)?.upstream = Some(source_id);
        Ok(())
    }

    pub(crate) fn unlink_output(&self, id: NodeId) {
        self.topology.lock().unlink_output_edges(id);
    }

    pub(crate) fn unlink_input(&self, id: NodeId) {
        self.topology.lock().unlink_input_edge(id);
    }
}

/// Wire `source → target`, displacing any existing edge on either side.
///
/// Both nodes must live in the same graph and agree on format. Idempotent
/// when the edge already exists.
pub fn connect(source: &dyn SampleSource, target: &dyn SampleTarget) -> Result<()> {
    let graph = source.graph();
    if !Arc::ptr_eq(graph, target.graph()) {
        return Err(TomecutError::CrossGraph);
    }
    graph.link(source.node_id(), target.node_id(), false)
}

/// Sever the edge leaving `node`, if any.
pub fn disconnect_output(node: &dyn SampleSource) {
    node.graph().unlink_output(node.node_id());
}

/// Sever the edge entering `node`, if any.
pub fn disconnect_input(node: &dyn SampleTarget) {
    node.graph().unlink_input(node.node_id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSignal;
    use std::time::Duration;

    const FMT: AudioFormat = AudioFormat {
        channels: 1,
        sample_rate: 48_000,
    };

    #[test]
    fn connect_is_exclusive_on_the_source_side() {
        let graph = AudioGraph::new();
        let source = SilenceSource::new(&graph, FMT, "silence");
        let a = NullSink::new(&graph, FMT, "a");
        let b = NullSink::new(&graph, FMT, "b");

        connect(source.as_ref(), a.as_ref()).unwrap();
        connect(source.as_ref(), b.as_ref()).unwrap();

        let topo = graph.lock();
        let targets = topo.output_targets(source.node_id()).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].node_id(), b.node_id());
        assert!(!topo.has_upstream(a.node_id()));
    }

    #[test]
    fn connect_is_exclusive_on_the_target_side() {
        let graph = AudioGraph::new();
        let s1 = SilenceSource::new(&graph, FMT, "s1");
        let s2 = SilenceSource::new(&graph, FMT, "s2");
        let sink = NullSink::new(&graph, FMT, "sink");

        connect(s1.as_ref(), sink.as_ref()).unwrap();
        connect(s2.as_ref(), sink.as_ref()).unwrap();

        let topo = graph.lock();
        assert!(topo.output_targets(s1.node_id()).unwrap().is_empty());
        assert_eq!(topo.output_targets(s2.node_id()).unwrap().len(), 1);
    }

    #[test]
    fn reconnecting_the_same_edge_is_a_no_op() {
        let graph = AudioGraph::new();
        let source = SilenceSource::new(&graph, FMT, "silence");
        let sink = NullSink::new(&graph, FMT, "sink");

        connect(source.as_ref(), sink.as_ref()).unwrap();
        connect(source.as_ref(), sink.as_ref()).unwrap();
        assert_eq!(
            graph.lock().output_targets(source.node_id()).unwrap().len(),
            1
        );
    }

    #[test]
    fn cross_graph_connect_is_rejected() {
        let g1 = AudioGraph::new();
        let g2 = AudioGraph::new();
        let source = SilenceSource::new(&g1, FMT, "silence");
        let sink = NullSink::new(&g2, FMT, "sink");

        assert!(matches!(
            connect(source.as_ref(), sink.as_ref()),
            Err(TomecutError::CrossGraph)
        ));
    }

    #[test]
    fn format_mismatch_is_rejected() {
        let graph = AudioGraph::new();
        let source = SilenceSource::new(&graph, AudioFormat::mono(44_100), "silence");
        let sink = NullSink::new(&graph, FMT, "sink");

        assert!(matches!(
            connect(source.as_ref(), sink.as_ref()),
            Err(TomecutError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn a_finished_node_refuses_fresh_input() {
        let graph = AudioGraph::new();
        let source = BufferSource::new(&graph, FMT, "buf", vec![0.0; 8]);
        let driver = PassthroughDriver::new(&graph, FMT, "driver");
        let sink = NullSink::new(&graph, FMT, "sink");
        connect(source.as_ref(), driver.as_ref()).unwrap();
        connect(driver.as_ref(), sink.as_ref()).unwrap();

        let cancel = CancelSignal::new();
        driver.drive_to_end(Pacing::Unthrottled, &cancel).unwrap();
        assert!(driver.playback_finished());

        let more = SilenceSource::new(&graph, FMT, "more");
        assert!(matches!(
            connect(more.as_ref(), driver.as_ref()),
            Err(TomecutError::PlaybackFinished(_))
        ));
        // The drained upstream may still be linked elsewhere; it just
        // reports end-of-stream.
        let spare = NullSink::new(&graph, FMT, "spare");
        connect(source.as_ref(), spare.as_ref()).unwrap();
    }

    #[test]
    fn instrumented_scopes_nest_and_unwind() {
        let graph = AudioGraph::new();
        let topo = graph.lock();
        assert_eq!(topo.scope_depth(), 0);
        {
            let _outer = topo.instrumented_scope();
            let _inner = topo.instrumented_scope();
            assert_eq!(topo.scope_depth(), 2);
        }
        assert_eq!(topo.scope_depth(), 0);
    }

    #[test]
    fn dropping_a_node_severs_its_edges() {
        let graph = AudioGraph::new();
        let source = SilenceSource::new(&graph, FMT, "silence");
        let sink = NullSink::new(&graph, FMT, "sink");
        connect(source.as_ref(), sink.as_ref()).unwrap();

        drop(sink);
        let topo = graph.lock();
        assert!(topo.output_targets(source.node_id()).unwrap().is_empty());
    }

    #[test]
    fn disconnect_output_severs_both_sides() {
        let graph = AudioGraph::new();
        let source = SilenceSource::new(&graph, FMT, "silence");
        let sink = NullSink::new(&graph, FMT, "sink");
        connect(source.as_ref(), sink.as_ref()).unwrap();

        disconnect_output(source.as_ref());
        let topo = graph.lock();
        assert!(topo.output_targets(source.node_id()).unwrap().is_empty());
        assert!(!topo.has_upstream(sink.node_id()));
    }

    #[test]
    fn pulling_through_an_active_source_is_rejected() {
        struct FakeMic {
            core: crate::graph::node::NodeCore,
        }
        impl SampleSource for FakeMic {
            fn node_id(&self) -> NodeId {
                self.core.id()
            }
            fn graph(&self) -> &Arc<AudioGraph> {
                self.core.graph()
            }
            fn output_format(&self) -> AudioFormat {
                FMT
            }
            fn playback_finished(&self) -> bool {
                self.core.is_finished()
            }
            fn read(&self, _: &Topology, _: &mut [f32], _: &CancelSignal) -> Result<ReadResult> {
                Ok(ReadResult::Samples(0))
            }
        }

        let graph = AudioGraph::new();
        let mic = Arc::new(FakeMic {
            core: crate::graph::node::NodeCore::new(&graph, "mic"),
        });
        let weak_source = node::weak_source(&mic);
        graph.register(
            mic.core.id(),
            NodeRegistration {
                name: "mic".into(),
                role: NodeRole::ActiveSource,
                input_format: None,
                output_format: Some(FMT),
                source: Some(weak_source),
                target: None,
                finished: Arc::clone(mic.core.finished_flag()),
                fan_out: false,
            },
        );

        let driver = PassthroughDriver::new(&graph, FMT, "driver");
        connect(mic.as_ref(), driver.as_ref()).unwrap();

        let cancel = CancelSignal::new();
        let err = driver
            .drive(Duration::from_millis(10), Pacing::Unthrottled, &cancel)
            .unwrap_err();
        assert!(matches!(err, TomecutError::ActiveNodeUsage(_)));
    }
}
