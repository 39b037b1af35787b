//! Chapter-boundary inference.
//!
//! Strategies escalate from most to least informed:
//!
//! 1. Container metadata (handled upstream by the probe; this module
//!    never sees files).
//! 2. Transcripts: silences followed by "Chapter N" announcements.
//! 3. Long-silence partitioning when too few chapters were announced.
//! 4. Periodic breaks when even the silences look wrong.
//!
//! The whole module is pure: silences plus a total duration in, breaks
//! out. Same inputs, same breaks.

mod heuristics;
mod numbers;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::scan::SilenceInterval;

/// A resolved chapter boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterBreak {
    /// Where the new chapter starts, from the beginning of the file.
    pub start: Duration,
    /// Display name; empty when nothing announced the chapter.
    pub name: String,
    /// Chapter number when the strategy could assign one.
    pub ordinal: Option<u32>,
}

/// Which strategy produced the final set of breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    Metadata,
    Transcript,
    LongSilence,
    Periodic,
}

/// Tunables for inference. The defaults encode what holds for typical
/// commercial audiobooks.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Expect at least one chapter per this much audio; fewer means the
    /// transcript strategy missed too much.
    pub min_chapter_spacing: Duration,
    /// Average chapter length past which the result is rejected outright.
    pub absurd_average: Duration,
    /// Spacing of last-resort periodic breaks.
    pub periodic_interval: Duration,
    /// Long-silence partitioning never cuts chapters shorter than this.
    pub min_chapter_length: Duration,
    /// Or longer than this.
    pub max_chapter_length: Duration,
    /// Shave applied to the silence-length bar so near-ties still qualify.
    pub length_shave_factor: f64,
    /// Character budget for titles lifted from transcripts.
    pub max_title_len: usize,
    /// Transcript search stops after this many consecutive unfound chapters.
    pub max_sequential_misses: u32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            min_chapter_spacing: Duration::from_secs(40 * 60),
            absurd_average: Duration::from_secs(50 * 60),
            periodic_interval: Duration::from_secs(30 * 60),
            min_chapter_length: Duration::from_secs(2 * 60),
            max_chapter_length: Duration::from_secs(20 * 60),
            length_shave_factor: 0.95,
            max_title_len: 30,
            max_sequential_misses: 3,
        }
    }
}

/// Turn a silence scan into chapter breaks, escalating strategies until
/// the result looks plausible. Always returns breaks sorted by start;
/// possibly empty only when the file itself is empty.
pub fn infer_chapter_breaks(
    silences: &[SilenceInterval],
    total_duration: Duration,
    config: &InferenceConfig,
) -> (Vec<ChapterBreak>, Strategy) {
    let mut breaks = heuristics::breaks_from_transcripts(silences, config);
    let mut strategy = Strategy::Transcript;

    let min_expected =
        ((total_duration.as_secs_f64() / config.min_chapter_spacing.as_secs_f64()) as usize).max(1);
    if !silences.is_empty() && breaks.len() + 1 < min_expected {
        info!(
            found = breaks.len(),
            min_expected, "too few announced chapters, partitioning on long silences"
        );
        breaks = heuristics::breaks_from_long_silences(silences, total_duration, config);
        strategy = Strategy::LongSilence;
    }

    let average = total_duration / breaks.len().max(1) as u32;
    if average > config.absurd_average {
        info!(
            average_secs = average.as_secs(),
            "chapters still implausibly long, inserting periodic breaks"
        );
        breaks = heuristics::periodic_breaks(total_duration, config);
        strategy = Strategy::Periodic;
    }

    breaks.sort_by_key(|b| b.start);
    (breaks, strategy)
}
