//! In-flight recognition closures spawned during long silences.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::error::Result;
use crate::graph::{AudioGraph, Conformer, MeasuredPipe};
use crate::recognize::RecognizerSink;

/// One branch of the scan graph feeding a recognition stream.
///
/// Holds the branch nodes alive until finalized; dropping the closure
/// after [`finalize`](RecognitionClosure::finalize) unregisters them and
/// severs the splitter edge.
pub(crate) struct RecognitionClosure {
    /// Per-channel sample position where the triggering silence began.
    pub start_samples: u64,
    pub pipe: Arc<MeasuredPipe>,
    sink: Arc<RecognizerSink>,
    // Kept alive for the branch; never addressed directly again.
    _conformer: Option<Arc<Conformer>>,
}

impl RecognitionClosure {
    pub fn new(
        start_samples: u64,
        pipe: Arc<MeasuredPipe>,
        sink: Arc<RecognizerSink>,
        conformer: Option<Arc<Conformer>>,
    ) -> Self {
        Self {
            start_samples,
            pipe,
            sink,
            _conformer: conformer,
        }
    }

    /// Detach the branch and collect the transcript. Recognition
    /// failures degrade to an empty transcript; the scan keeps going.
    fn finalize(self, graph: &AudioGraph, cancel: &CancelSignal) -> Result<String> {
        graph.unlink_input(self.pipe.node_id());
        match self.sink.finish(cancel) {
            Ok(text) => Ok(text),
            Err(crate::error::TomecutError::Cancelled) => Err(crate::error::TomecutError::Cancelled),
            Err(e) => {
                warn!(error = %e, "recognition closure failed; treating as untranscribed");
                Ok(String::new())
            }
        }
    }
}

/// FIFO of closures awaiting finalization. Strict ordering keeps
/// recognition results aligned with their silences even when a later
/// window fills before an earlier one.
#[derive(Default)]
pub(crate) struct ClosureQueue {
    pending: VecDeque<RecognitionClosure>,
}

impl ClosureQueue {
    pub fn push(&mut self, closure: RecognitionClosure) {
        self.pending.push_back(closure);
    }

    /// Finalize closures from the head while their capture windows are
    /// full (or unconditionally once the source has ended). Yields
    /// `(start_samples, transcript)` pairs in spawn order.
    pub fn drain_ready(
        &mut self,
        graph: &AudioGraph,
        source_ended: bool,
        cancel: &CancelSignal,
        out: &mut Vec<(u64, String)>,
    ) -> Result<()> {
        loop {
            let ready = self
                .pending
                .front()
                .map(|head| source_ended || head.pipe.reached_end())
                .unwrap_or(false);
            if !ready {
                break;
            }
            let Some(closure) = self.pending.pop_front() else {
                break;
            };
            let start = closure.start_samples;
            let transcript = closure.finalize(graph, cancel)?;
            debug!(start, transcript, "recognition closure finalized");
            out.push((start, transcript));
        }
        Ok(())
    }
}
