//! Node identity and the pull/push traits every graph member implements.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::cancel::CancelSignal;
use crate::error::Result;
use crate::graph::{AudioFormat, AudioGraph, Topology};

/// Opaque handle identifying a node within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a node participates in moving samples. Fixed at construction.
///
/// - `PureFilter` nodes move samples only when a driver pulls through or
///   pushes into them.
/// - `ActiveSource` nodes produce on their own thread (e.g. a capture
///   device); pulling through one is rejected when the edge is resolved.
/// - `ActiveSink` nodes consume on their own thread; pushing into one is
///   rejected the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    PureFilter,
    ActiveSource,
    ActiveSink,
}

/// Outcome of a pull. End-of-stream is distinct from "no samples right
/// now": an upstream with nothing buffered returns `Samples(0)` and may
/// produce more later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    /// Per-channel samples written into the caller's buffer.
    Samples(usize),
    /// The stream is exhausted and will never produce again.
    EndOfStream,
}

impl ReadResult {
    pub fn is_end(&self) -> bool {
        matches!(self, ReadResult::EndOfStream)
    }
}

/// A node output that can be pulled from.
///
/// `topology` is the graph's locked view, held by whichever driver
/// started the drive; implementations resolve their upstream through it
/// rather than re-locking the graph.
pub trait SampleSource: Send + Sync {
    fn node_id(&self) -> NodeId;

    fn graph(&self) -> &Arc<AudioGraph>;

    fn output_format(&self) -> AudioFormat;

    /// True once this node (or its upstream) has permanently run dry.
    /// Monotonic: never flips back to false.
    fn playback_finished(&self) -> bool;

    /// Pull up to `buf.len() / channels` per-channel samples into `buf`
    /// (interleaved). Returns how many were produced, or end-of-stream.
    fn read(
        &self,
        topology: &Topology,
        buf: &mut [f32],
        cancel: &CancelSignal,
    ) -> Result<ReadResult>;
}

/// A node input that can be pushed into.
pub trait SampleTarget: Send + Sync {
    fn node_id(&self) -> NodeId;

    fn graph(&self) -> &Arc<AudioGraph>;

    fn input_format(&self) -> AudioFormat;

    /// Push interleaved samples. Nodes forward downstream before returning,
    /// so a write completes only once the whole chain accepted it.
    fn write(&self, topology: &Topology, buf: &[f32], cancel: &CancelSignal) -> Result<()>;

    /// Push any buffered remainder downstream.
    fn flush(&self, topology: &Topology, cancel: &CancelSignal) -> Result<()>;
}

/// Trait-object `Weak` for registration. `Arc::downgrade` pins its type
/// parameter against an annotated dyn binding before the unsizing
/// coercion can apply, so the `Arc` is coerced first and the resulting
/// handle downgraded.
pub(crate) fn weak_source<S: SampleSource + 'static>(node: &Arc<S>) -> Weak<dyn SampleSource> {
    let node: Arc<dyn SampleSource> = node.clone();
    Arc::downgrade(&node)
}

pub(crate) fn weak_target<T: SampleTarget + 'static>(node: &Arc<T>) -> Weak<dyn SampleTarget> {
    let node: Arc<dyn SampleTarget> = node.clone();
    Arc::downgrade(&node)
}

/// Shared plumbing embedded by every concrete node: graph handle, id,
/// display name, and the monotonic finished flag. Unregisters the node
/// on drop, which also severs its topology edges.
pub(crate) struct NodeCore {
    graph: Arc<AudioGraph>,
    id: NodeId,
    name: String,
    finished: Arc<AtomicBool>,
}

impl NodeCore {
    pub(crate) fn new(graph: &Arc<AudioGraph>, name: &str) -> Self {
        Self {
            graph: Arc::clone(graph),
            id: graph.allocate_id(),
            name: name.to_owned(),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn graph(&self) -> &Arc<AudioGraph> {
        &self.graph
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn finished_flag(&self) -> &Arc<AtomicBool> {
        &self.finished
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

impl Drop for NodeCore {
    fn drop(&mut self) {
        self.graph.unregister(self.id);
    }
}
