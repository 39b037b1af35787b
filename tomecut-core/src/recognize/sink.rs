//! Graph sink that feeds a recognition stream.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::cancel::CancelSignal;
use crate::error::{Result, TomecutError};
use crate::graph::node::{weak_target, NodeCore};
use crate::graph::{
    AudioFormat, AudioGraph, NodeId, NodeRegistration, NodeRole, SampleTarget, Topology,
};
use crate::recognize::RecognizerStream;

/// Terminal node that forwards everything written into an open
/// [`RecognizerStream`], then yields the transcript on
/// [`finish`](RecognizerSink::finish).
///
/// Expects mono input: recognition backends work on single-channel
/// utterances, so callers conform upstream.
pub struct RecognizerSink {
    core: NodeCore,
    format: AudioFormat,
    stream: Mutex<Option<Box<dyn RecognizerStream>>>,
}

impl RecognizerSink {
    pub fn new(
        graph: &Arc<AudioGraph>,
        format: AudioFormat,
        name: &str,
        stream: Box<dyn RecognizerStream>,
    ) -> Arc<Self> {
        let sink = Arc::new(Self {
            core: NodeCore::new(graph, name),
            format,
            stream: Mutex::new(Some(stream)),
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

    /// Finalize the stream and return the best transcript, or an empty
    /// string when nothing was recognized. Callable once.
    pub fn finish(&self, cancel: &CancelSignal) -> Result<String> {
        let mut stream = self
            .stream
            .lock()
            .take()
            .ok_or_else(|| TomecutError::Recognition("stream already finalized".into()))?;
        self.core.mark_finished();
        let result = stream.finish(cancel)?;
        if !result.success {
            warn!(node = self.core.name(), "recognition reported failure");
        }
        Ok(result.best_text().unwrap_or_default().to_owned())
    }
}

impl SampleTarget for RecognizerSink {
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
        if let Some(stream) = self.stream.lock().as_mut() {
            stream.write(buf)?;
        }
        // Writes after finalization vanish; the closure is already done.
        Ok(())
    }

    fn flush(&self, _topology: &Topology, _cancel: &CancelSignal) -> Result<()> {
        Ok(())
    }
}
