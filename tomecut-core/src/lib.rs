//! # tomecut-core
//!
//! Audiobook chapter-splitting engine.
//!
//! ## Architecture
//!
//! ```text
//! Input file → WavSource / FfmpegSource → [Conformer]
//!                                             │
//!                            PassthroughDriver (pull → push pump)
//!                                             │
//!                          VolumeMeter → Splitter ─┬→ NullSink
//!                                                  └→ MeasuredPipe → RecognizerSink
//!                                             │
//!                       silence intervals + transcripts → infer_chapter_breaks
//!                                             │
//!                          second pass → WavSink per chapter → [opus]
//! ```
//!
//! Nodes live in one [`graph::AudioGraph`] per streaming pass. Drivers
//! take the graph lock once per pumped window and hand the locked
//! topology down the chain, so a whole window moves under one lock.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

#[cfg(feature = "audio-cpal")]
pub mod audio;
pub mod buffering;
pub mod cancel;
pub mod chapters;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod probe;
pub mod recognize;
pub mod scan;
pub mod segment;

// Convenience re-exports for downstream crates
pub use cancel::CancelSignal;
pub use chapters::{ChapterBreak, InferenceConfig, Strategy};
pub use engine::{ChapterSplitter, SplitConfig, SplitReport};
pub use error::TomecutError;
pub use events::SplitEvent;
pub use graph::{AudioFormat, AudioGraph, SampleSource, SampleTarget};
pub use probe::{ChapterMetadataProbe, FfprobeProbe};
pub use recognize::{Recognizer, ScriptedRecognizer};
pub use scan::{ScanConfig, SilenceInterval};

#[cfg(feature = "audio-cpal")]
pub use audio::{record_until_silence, CaptureConfig};
