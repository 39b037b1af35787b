//! Container chapter metadata, read through ffprobe.
//!
//! M4B and some MP3 audiobooks carry real chapter tables; when present
//! they beat every inference strategy, so the engine asks here first.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::chapters::ChapterBreak;

/// Source of authoritative chapter breaks for a file, if it has any.
/// Failures are soft: a probe that cannot run reports no chapters and
/// the engine falls through to inference.
pub trait ChapterMetadataProbe: Send + Sync {
    fn probe_chapters(&self, path: &Path) -> Vec<ChapterBreak>;
}

/// Reads chapter tables with `ffprobe -print_format json -show_chapters`.
pub struct FfprobeProbe {
    binary: PathBuf,
}

impl FfprobeProbe {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

#[derive(Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    chapters: Vec<FfprobeChapter>,
}

#[derive(Deserialize)]
struct FfprobeChapter {
    start_time: Option<String>,
    #[serde(default)]
    tags: FfprobeChapterTags,
}

#[derive(Deserialize, Default)]
struct FfprobeChapterTags {
    title: Option<String>,
}

impl ChapterMetadataProbe for FfprobeProbe {
    fn probe_chapters(&self, path: &Path) -> Vec<ChapterBreak> {
        let output = match Command::new(&self.binary)
            .arg("-v")
            .arg("quiet")
            .arg("-print_format")
            .arg("json")
            .arg("-show_chapters")
            .arg(path)
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "ffprobe unavailable, skipping metadata probe");
                return Vec::new();
            }
        };
        if !output.status.success() {
            warn!(status = %output.status, "ffprobe failed, skipping metadata probe");
            return Vec::new();
        }

        let parsed: FfprobeOutput = match serde_json::from_slice(&output.stdout) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "unparseable ffprobe output");
                return Vec::new();
            }
        };

        let breaks: Vec<ChapterBreak> = parsed
            .chapters
            .iter()
            .enumerate()
            .filter_map(|(i, ch)| {
                let secs: f64 = ch.start_time.as_deref()?.parse().ok()?;
                Some(ChapterBreak {
                    start: Duration::from_secs_f64(secs.max(0.0)),
                    name: ch
                        .tags
                        .title
                        .clone()
                        .unwrap_or_else(|| format!("Chapter {}", i + 1)),
                    ordinal: Some(i as u32 + 1),
                })
            })
            .collect();
        debug!(path = %path.display(), chapters = breaks.len(), "metadata probe complete");
        breaks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_json_parses_into_breaks() {
        let json = r#"{
            "chapters": [
                {"id": 0, "start_time": "0.000000", "end_time": "1800.0",
                 "tags": {"title": "Opening Credits"}},
                {"id": 1, "start_time": "1800.500000", "end_time": "3600.0"}
            ]
        }"#;
        let parsed: FfprobeOutput = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.chapters.len(), 2);
        assert_eq!(parsed.chapters[0].tags.title.as_deref(), Some("Opening Credits"));
        assert_eq!(parsed.chapters[1].start_time.as_deref(), Some("1800.500000"));
    }

    #[test]
    fn chapterless_json_yields_nothing() {
        let parsed: FfprobeOutput = serde_json::from_str("{}").unwrap();
        assert!(parsed.chapters.is_empty());
    }
}
