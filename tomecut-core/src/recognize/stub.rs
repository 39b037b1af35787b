//! Scripted recognizer used by tests and dry runs.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::debug;

use crate::cancel::CancelSignal;
use crate::error::Result;
use crate::graph::AudioFormat;
use crate::recognize::{Recognizer, RecognizerStream, TranscriptPhrase, TranscriptResult};

/// Returns pre-scripted transcripts in order, one per opened stream.
/// Streams opened after the script runs out recognize nothing.
pub struct ScriptedRecognizer {
    script: Mutex<VecDeque<String>>,
}

impl ScriptedRecognizer {
    pub fn new<I, S>(script: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(script.into_iter().map(Into::into).collect()),
        }
    }
}

impl Recognizer for ScriptedRecognizer {
    fn open_stream(
        &self,
        _format: AudioFormat,
        language: &str,
    ) -> Result<Box<dyn RecognizerStream>> {
        let text = self.script.lock().pop_front();
        debug!(?text, language, "scripted recognizer stream opened");
        Ok(Box::new(ScriptedStream {
            text,
            samples_seen: 0,
        }))
    }
}

struct ScriptedStream {
    text: Option<String>,
    samples_seen: u64,
}

impl RecognizerStream for ScriptedStream {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        self.samples_seen += samples.len() as u64;
        Ok(())
    }

    fn finish(&mut self, _cancel: &CancelSignal) -> Result<TranscriptResult> {
        debug!(samples = self.samples_seen, "scripted stream finalized");
        let phrases = match self.text.take() {
            Some(text) if !text.is_empty() => vec![TranscriptPhrase {
                display_text: text,
                confidence: 1.0,
            }],
            _ => Vec::new(),
        };
        Ok(TranscriptResult {
            success: true,
            phrases,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streams_consume_the_script_in_order() {
        let recognizer = ScriptedRecognizer::new(["chapter one", "chapter two"]);
        let cancel = CancelSignal::new();
        let fmt = AudioFormat::mono(16_000);

        let mut s1 = recognizer.open_stream(fmt, "en-US").unwrap();
        let mut s2 = recognizer.open_stream(fmt, "en-US").unwrap();
        let mut s3 = recognizer.open_stream(fmt, "en-US").unwrap();

        assert_eq!(
            s1.finish(&cancel).unwrap().best_text(),
            Some("chapter one")
        );
        assert_eq!(
            s2.finish(&cancel).unwrap().best_text(),
            Some("chapter two")
        );
        assert_eq!(s3.finish(&cancel).unwrap().best_text(), None);
    }
}
