//! Progress events broadcast by the splitter engine.
//!
//! Subscribers (the CLI progress display, or any embedding application)
//! receive these on a `tokio::sync::broadcast` channel. Lagging
//! subscribers lose old events rather than stalling the engine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::chapters::Strategy;

/// Everything the engine reports while splitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "type")]
pub enum SplitEvent {
    /// Periodic heartbeat during the silence scan.
    ScanProgress {
        /// Audio time scanned so far, in seconds.
        elapsed_secs: f64,
        /// Silence intervals found so far.
        intervals: usize,
    },
    ScanComplete {
        total_secs: f64,
        intervals: usize,
    },
    /// Chapter boundaries settled, before any output is written.
    ChaptersResolved {
        strategy: Strategy,
        count: usize,
    },
    SegmentStarted {
        index: usize,
        name: String,
    },
    SegmentWritten {
        index: usize,
        path: PathBuf,
    },
    FileComplete {
        path: PathBuf,
        segments: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_camel_case_tags() {
        let json = serde_json::to_string(&SplitEvent::ScanProgress {
            elapsed_secs: 12.5,
            intervals: 3,
        })
        .unwrap();
        assert!(json.contains(r#""type":"scanProgress""#));
        assert!(json.contains(r#""elapsedSecs":12.5"#));
    }
}
