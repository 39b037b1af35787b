//! The individual break-finding strategies behind
//! [`infer_chapter_breaks`](crate::chapters::infer_chapter_breaks).

use std::time::Duration;

use tracing::warn;

use crate::chapters::numbers::{loose_heading, strict_heading};
use crate::chapters::{ChapterBreak, InferenceConfig};
use crate::scan::SilenceInterval;

fn midpoint(s: &SilenceInterval) -> Duration {
    s.start + s.length() / 2
}

/// Walk the transcripts looking for "Chapter 1", "Chapter 2", … in
/// ascending order, falling back to the bare number when the keyword is
/// missing, and giving up after enough consecutive misses.
pub(crate) fn breaks_from_transcripts(
    silences: &[SilenceInterval],
    config: &InferenceConfig,
) -> Vec<ChapterBreak> {
    let mut breaks = Vec::new();
    let mut expected: usize = 1;
    let mut next_start = 0usize;
    let mut misses = 0u32;

    while next_start < silences.len() && misses < config.max_sequential_misses {
        // Past the matcher table the numbering is beyond anything a
        // single audiobook file holds.
        let Some(strict) = strict_heading(expected) else {
            break;
        };
        let in_order = |re: &regex_lite::Regex| {
            silences[next_start..]
                .iter()
                .position(|s| re.is_match(&s.transcript))
                .map(|i| i + next_start)
        };
        let found = in_order(&strict)
            .or_else(|| loose_heading(expected).as_ref().and_then(in_order));

        match found {
            None => {
                warn!(expected, "no transcript announced this chapter, skipping");
                misses += 1;
            }
            Some(i) => {
                misses = 0;
                next_start = i + 1;
                breaks.push(ChapterBreak {
                    start: midpoint(&silences[i]),
                    name: format!("Chapter {expected}"),
                    ordinal: Some(expected as u32),
                });
            }
        }
        expected += 1;
    }

    attach_bookends(&mut breaks, silences);
    breaks.sort_by_key(|b| b.start);
    breaks
}

/// Look for a prologue or author's note ahead of chapter one, and an
/// epilogue or author's note after the last chapter.
fn attach_bookends(breaks: &mut Vec<ChapterBreak>, silences: &[SilenceInterval]) {
    if breaks.is_empty() {
        return;
    }

    let announces = |s: &&SilenceInterval, phrase: &str| s.transcript.to_lowercase().contains(phrase);

    let first_chapter_start = breaks[0]
        .start
        .saturating_sub(Duration::from_secs(10))
        .max(Duration::from_secs(5));
    let before: Vec<&SilenceInterval> = silences
        .iter()
        .filter(|s| s.start < first_chapter_start && !s.transcript.is_empty())
        .collect();
    let front = before
        .iter()
        .find(|s| announces(s, "prologue"))
        .map(|s| (*s, "Prologue"))
        .or_else(|| {
            before
                .iter()
                .find(|s| announces(s, "author's note"))
                .map(|s| (*s, "Author's Note"))
        });
    if let Some((s, name)) = front {
        breaks.insert(
            0,
            ChapterBreak {
                start: midpoint(s),
                name: name.to_owned(),
                ordinal: None,
            },
        );
    }

    let last_chapter_end = breaks
        .last()
        .map(|b| b.start + Duration::from_secs(10))
        .unwrap_or_default();
    let after: Vec<&SilenceInterval> = silences
        .iter()
        .filter(|s| s.end > last_chapter_end && !s.transcript.is_empty())
        .collect();
    let back = after
        .iter()
        .find(|s| announces(s, "epilogue"))
        .map(|s| (*s, "Epilogue"))
        .or_else(|| {
            after
                .iter()
                .find(|s| announces(s, "author's note"))
                .map(|s| (*s, "Author's Note"))
        });
    if let Some((s, name)) = back {
        breaks.push(ChapterBreak {
            start: midpoint(s),
            name: name.to_owned(),
            ordinal: None,
        });
    }
}

/// Partition the book at its longest silences, aiming for chapters of
/// roughly half the maximum length.
pub(crate) fn breaks_from_long_silences(
    silences: &[SilenceInterval],
    total: Duration,
    config: &InferenceConfig,
) -> Vec<ChapterBreak> {
    let mut breaks = Vec::new();
    if silences.is_empty() {
        warn!("no silences to partition on");
        return breaks;
    }

    let target_chapter = config.max_chapter_length.as_secs_f64() / 2.0;
    let approx_chapters =
        ((total.as_secs_f64() / target_chapter) as usize).min(silences.len() - 1);
    if approx_chapters == 0 {
        warn!("file too short for silence partitioning");
        return breaks;
    }

    // The N+1'th longest silence, shaved a little, becomes the bar a
    // candidate must clear.
    let mut by_length: Vec<Duration> = silences.iter().map(|s| s.length()).collect();
    by_length.sort_unstable_by(|a, b| b.cmp(a));
    let approx_break = by_length[approx_chapters].mul_f64(config.length_shave_factor);

    let mut current_start = Duration::ZERO;
    loop {
        let candidates: Vec<&SilenceInterval> = silences
            .iter()
            .filter(|s| {
                s.start >= current_start + config.min_chapter_length
                    && s.end <= current_start + config.max_chapter_length
            })
            .collect();
        let Some(longest) = candidates.iter().map(|s| s.length()).max() else {
            return breaks;
        };
        let bar = approx_break.min(longest);
        let Some(chosen) = candidates.iter().find(|s| s.length() >= bar) else {
            return breaks;
        };
        let mid = midpoint(chosen);
        breaks.push(ChapterBreak {
            start: mid,
            name: whole_word_prefix(&chosen.transcript, config.max_title_len).to_owned(),
            ordinal: None,
        });
        current_start = mid;
    }
}

/// Last resort: evenly spaced breaks with generic names.
pub(crate) fn periodic_breaks(total: Duration, config: &InferenceConfig) -> Vec<ChapterBreak> {
    let mut breaks = Vec::new();
    let mut current = Duration::ZERO;
    let mut index = 1u32;
    while current < total {
        breaks.push(ChapterBreak {
            start: current,
            name: format!("Part {index}"),
            ordinal: Some(index),
        });
        current += config.periodic_interval;
        index += 1;
    }
    breaks
}

/// Longest prefix of `input` within `max_chars` that does not split a
/// word. Falls back to a hard character cut when there is no space to
/// break at.
pub(crate) fn whole_word_prefix(input: &str, max_chars: usize) -> &str {
    let input = input.trim();
    if input.chars().count() <= max_chars {
        return input;
    }
    let mut cut = 0usize;
    let mut hard_cut = input.len();
    for (count, (idx, ch)) in input.char_indices().enumerate() {
        if count >= max_chars {
            hard_cut = idx;
            break;
        }
        if ch == ' ' {
            cut = idx;
        }
    }
    if cut == 0 {
        &input[..hard_cut]
    } else {
        input[..cut].trim_end()
    }
}
