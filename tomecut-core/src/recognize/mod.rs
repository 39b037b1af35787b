//! Speech recognition abstraction.
//!
//! The `Recognizer` trait decouples chapter-heading transcription from
//! any specific backend. The scanner opens one short-lived stream per
//! candidate silence boundary, feeds it a few seconds of audio, and
//! finalizes it later, so backends must tolerate many small utterances.

pub mod sink;
pub mod stub;

pub use sink::RecognizerSink;
pub use stub::ScriptedRecognizer;

use crate::cancel::CancelSignal;
use crate::error::Result;
use crate::graph::AudioFormat;

/// One recognition hypothesis.
#[derive(Debug, Clone)]
pub struct TranscriptPhrase {
    pub display_text: String,
    pub confidence: f32,
}

/// Outcome of finalizing a recognition stream.
#[derive(Debug, Clone, Default)]
pub struct TranscriptResult {
    pub success: bool,
    /// Hypotheses ordered best-first. May be empty even on success.
    pub phrases: Vec<TranscriptPhrase>,
}

impl TranscriptResult {
    /// Display text of the best hypothesis, if any.
    pub fn best_text(&self) -> Option<&str> {
        if !self.success {
            return None;
        }
        self.phrases.first().map(|p| p.display_text.as_str())
    }
}

/// An in-flight utterance. Accepts mono samples until finalized.
pub trait RecognizerStream: Send {
    fn write(&mut self, samples: &[f32]) -> Result<()>;

    /// Finalize and return the recognition result. Consumes the
    /// utterance; the stream accepts no further samples.
    fn finish(&mut self, cancel: &CancelSignal) -> Result<TranscriptResult>;
}

/// Contract for speech recognition backends.
pub trait Recognizer: Send + Sync {
    /// Open a stream for one utterance in `language` (BCP 47 tag).
    fn open_stream(
        &self,
        format: AudioFormat,
        language: &str,
    ) -> Result<Box<dyn RecognizerStream>>;
}
