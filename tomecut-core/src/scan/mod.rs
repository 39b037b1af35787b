//! Silence scan: one fast pass over the whole book.
//!
//! ```text
//! source ─► PassthroughDriver ─► VolumeMeter ─► Splitter ─► NullSink
//!                                                  │
//!                              (during long silences, per closure)
//!                                                  └─► MeasuredPipe(7s) ─► [Conformer] ─► RecognizerSink
//! ```
//!
//! The driver pumps unthrottled in 10 ms windows. Each window's peak
//! amplitude feeds a silence state machine; when narration resumes
//! after a silence past the transcription trigger, a recognition
//! closure captures the next few seconds through a rate-limited
//! branch. Closures
//! finalize in FIFO order so transcripts stay aligned with their
//! silences.

mod closure;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cancel::CancelSignal;
use crate::error::Result;
use crate::events::SplitEvent;
use crate::graph::{
    connect, AudioFormat, AudioGraph, Conformer, MeasuredPipe, NullSink, Pacing,
    PassthroughDriver, SampleSource, SampleTarget, Splitter, VolumeMeter,
};
use crate::recognize::{Recognizer, RecognizerSink};
use crate::scan::closure::{ClosureQueue, RecognitionClosure};

/// Tunables for the silence scan. Defaults hold for typical audiobook
/// masters; the threshold in particular assumes normalized narration
/// with a digital-silence noise floor.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Peak amplitude below which a window counts as silent.
    pub silence_threshold: f32,
    /// Shortest silence worth recording as an interval.
    pub min_silence: Duration,
    /// Silence length that triggers a recognition closure.
    pub transcription_trigger: Duration,
    /// Audio captured per recognition closure, priming included.
    pub transcription_window: Duration,
    /// Scan granularity; also the silence-boundary resolution.
    pub scan_window: Duration,
    /// Silence written into a fresh recognition stream so the backend's
    /// own endpointing does not clip the first word.
    pub priming_silence: Duration,
    /// Format handed to the recognition backend.
    pub recognizer_format: AudioFormat,
    /// BCP 47 language tag for recognition streams.
    pub language: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            silence_threshold: 0.001,
            min_silence: Duration::from_millis(700),
            transcription_trigger: Duration::from_millis(1200),
            transcription_window: Duration::from_secs(7),
            scan_window: Duration::from_millis(10),
            priming_silence: Duration::from_millis(500),
            recognizer_format: AudioFormat::mono(16_000),
            language: "en-US".to_owned(),
        }
    }
}

/// A recorded stretch of silence, with the transcript of what follows
/// it when a recognition closure covered that spot.
#[derive(Debug, Clone)]
pub struct SilenceInterval {
    pub start: Duration,
    pub end: Duration,
    pub transcript: String,
}

impl SilenceInterval {
    pub fn length(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

/// What the scan learned about the whole file.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// Intervals ordered by start time.
    pub intervals: Vec<SilenceInterval>,
    pub total_duration: Duration,
}

/// Send a progress heartbeat roughly every 30 s of scanned audio.
const PROGRESS_EVERY: Duration = Duration::from_secs(30);

/// Run the silence scan over `source`, which must already produce the
/// processing format. With `recognizer` set, long silences also get the
/// following audio transcribed.
pub fn find_silence_intervals(
    graph: &Arc<AudioGraph>,
    source: &Arc<dyn SampleSource>,
    recognizer: Option<&dyn Recognizer>,
    config: &ScanConfig,
    cancel: &CancelSignal,
    progress: Option<&broadcast::Sender<SplitEvent>>,
) -> Result<ScanOutcome> {
    let format = source.output_format();
    let driver = PassthroughDriver::new(graph, format, "scan-driver");
    let meter = VolumeMeter::new(graph, format, "scan-meter");
    let splitter = Splitter::new(graph, format, "scan-splitter");
    let null = NullSink::new(graph, format, "scan-null");
    connect(source.as_ref(), driver.as_ref())?;
    connect(driver.as_ref(), meter.as_ref())?;
    connect(meter.as_ref(), splitter.as_ref())?;
    splitter.attach(null.as_ref())?;

    // Intervals keyed by their sample-exact start so closure transcripts
    // match without a float round trip.
    let mut intervals: Vec<(u64, SilenceInterval)> = Vec::new();
    let mut transcripts: HashMap<u64, String> = HashMap::new();
    let mut closures = ClosureQueue::default();
    let mut finalized: Vec<(u64, String)> = Vec::new();

    let mut position: u64 = 0;
    let mut silence_start: Option<u64> = None;
    let mut closure_seq = 0usize;
    let mut next_progress = PROGRESS_EVERY;

    loop {
        cancel.checkpoint()?;
        meter.reset();
        let moved = driver.drive(config.scan_window, Pacing::Unthrottled, cancel)?;
        position += moved;
        let now = format.samples_to_duration(position);
        let ended = driver.playback_finished();

        let silent = meter.peak() < config.silence_threshold && moved > 0;
        match (silent, silence_start) {
            (true, None) => {
                silence_start = Some(position.saturating_sub(moved));
            }
            (true, Some(_)) => {}
            (false, Some(start)) => {
                let silence_len = format.samples_to_duration(position - moved - start);
                if silence_len >= config.min_silence {
                    intervals.push((
                        start,
                        SilenceInterval {
                            start: format.samples_to_duration(start),
                            end: format.samples_to_duration(position - moved),
                            transcript: String::new(),
                        },
                    ));
                }
                // Sound resumed after a qualifying silence: transcribe
                // what follows. The branch captures from the next
                // window on; priming covers the backend's endpointing.
                if silence_len >= config.transcription_trigger {
                    if let Some(recognizer) = recognizer {
                        closure_seq += 1;
                        let closure = spawn_closure(
                            graph, &splitter, recognizer, config, format, start, closure_seq,
                            cancel,
                        )?;
                        closures.push(closure);
                    }
                }
                silence_start = None;
            }
            (false, None) => {}
        }

        closures.drain_ready(graph, ended, cancel, &mut finalized)?;

        if let (Some(tx), true) = (progress, now >= next_progress) {
            next_progress = now + PROGRESS_EVERY;
            let _ = tx.send(SplitEvent::ScanProgress {
                elapsed_secs: now.as_secs_f64(),
                intervals: intervals.len(),
            });
        }

        if ended {
            // A silence still open at end-of-stream is recorded too.
            if let Some(start) = silence_start {
                if format.samples_to_duration(position - start) >= config.min_silence {
                    intervals.push((
                        start,
                        SilenceInterval {
                            start: format.samples_to_duration(start),
                            end: now,
                            transcript: String::new(),
                        },
                    ));
                }
            }
            closures.drain_ready(graph, true, cancel, &mut finalized)?;
            break;
        }
    }

    for (start, transcript) in finalized {
        transcripts.insert(start, transcript);
    }
    let intervals: Vec<SilenceInterval> = intervals
        .into_iter()
        .map(|(start, mut interval)| {
            if let Some(text) = transcripts.remove(&start) {
                interval.transcript = text;
            }
            interval
        })
        .collect();

    let total = format.samples_to_duration(position);
    info!(
        total_secs = total.as_secs_f64(),
        intervals = intervals.len(),
        "silence scan complete"
    );
    Ok(ScanOutcome {
        intervals,
        total_duration: total,
    })
}

/// Attach a rate-limited recognition branch to the splitter and prime
/// it with silence.
#[allow(clippy::too_many_arguments)]
fn spawn_closure(
    graph: &Arc<AudioGraph>,
    splitter: &Splitter,
    recognizer: &dyn Recognizer,
    config: &ScanConfig,
    format: AudioFormat,
    start_samples: u64,
    seq: usize,
    cancel: &CancelSignal,
) -> Result<RecognitionClosure> {
    let stream = recognizer.open_stream(config.recognizer_format, &config.language)?;
    let pipe = MeasuredPipe::new(
        graph,
        format,
        &format!("sr-pipe-{seq}"),
        config.transcription_window,
    );
    let sink = RecognizerSink::new(
        graph,
        config.recognizer_format,
        &format!("sr-sink-{seq}"),
        stream,
    );
    let conformer = if format == config.recognizer_format {
        connect(pipe.as_ref(), sink.as_ref())?;
        None
    } else {
        let conformer = Conformer::new(
            graph,
            format,
            config.recognizer_format,
            &format!("sr-conform-{seq}"),
        )?;
        connect(pipe.as_ref(), conformer.as_ref())?;
        connect(conformer.as_ref(), sink.as_ref())?;
        Some(conformer)
    };

    // Priming counts against the pipe's allowance, exactly like audio.
    let priming = format.duration_to_samples(config.priming_silence) as usize;
    let zeros = vec![0f32; format.interleaved_len(format.duration_to_samples(config.scan_window) as usize).max(1)];
    let mut remaining = priming;
    while remaining > 0 {
        cancel.checkpoint()?;
        let n = remaining.min(zeros.len() / format.channels as usize);
        let topo = graph.lock();
        pipe.write(&topo, &zeros[..format.interleaved_len(n)], cancel)?;
        remaining -= n;
    }

    splitter.attach(pipe.as_ref())?;
    debug!(seq, start_samples, "recognition closure spawned");
    Ok(RecognitionClosure::new(start_samples, pipe, sink, conformer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BufferSource;
    use crate::recognize::{RecognizerStream, ScriptedRecognizer, TranscriptResult};
    use approx::assert_abs_diff_eq;
    use parking_lot::Mutex;

    const RATE: u32 = 16_000;

    fn fmt() -> AudioFormat {
        AudioFormat::mono(RATE)
    }

    /// Loud / silent pattern builder, durations in milliseconds.
    fn signal(pattern: &[(bool, u64)]) -> Vec<f32> {
        let mut out = Vec::new();
        for &(loud, ms) in pattern {
            let n = (RATE as u64 * ms / 1000) as usize;
            out.extend(std::iter::repeat(if loud { 0.5 } else { 0.0 }).take(n));
        }
        out
    }

    fn scan(data: Vec<f32>, recognizer: Option<&dyn Recognizer>) -> ScanOutcome {
        let graph = AudioGraph::new();
        let source: Arc<dyn SampleSource> = BufferSource::new(&graph, fmt(), "book", data);
        let config = ScanConfig {
            recognizer_format: fmt(),
            ..ScanConfig::default()
        };
        find_silence_intervals(
            &graph,
            &source,
            recognizer,
            &config,
            &CancelSignal::new(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn detects_silences_past_the_minimum() {
        let outcome = scan(
            signal(&[
                (true, 2_000),
                (false, 900), // recorded
                (true, 1_000),
                (false, 300), // too short
                (true, 1_000),
            ]),
            None,
        );
        assert_eq!(outcome.intervals.len(), 1);
        let interval = &outcome.intervals[0];
        assert_abs_diff_eq!(interval.start.as_secs_f64(), 2.0, epsilon = 0.05);
        assert_abs_diff_eq!(interval.length().as_secs_f64(), 0.9, epsilon = 0.05);
    }

    #[test]
    fn trailing_silence_is_recorded() {
        let outcome = scan(signal(&[(true, 1_000), (false, 800)]), None);
        assert_eq!(outcome.intervals.len(), 1);
        assert_abs_diff_eq!(outcome.total_duration.as_secs_f64(), 1.8, epsilon = 0.05);
    }

    #[test]
    fn amplitude_at_the_threshold_is_not_silence() {
        // A noise floor sitting exactly on the threshold still counts
        // as sound; only dropping below it does.
        let outcome = scan(vec![0.001; 2 * RATE as usize], None);
        assert!(outcome.intervals.is_empty());
    }

    #[test]
    fn long_silences_carry_transcripts() {
        let recognizer = ScriptedRecognizer::new(["Chapter two the storm"]);
        let outcome = scan(
            signal(&[
                (true, 3_000),
                (false, 1_500), // past the trigger
                (true, 9_000),  // transcribed; fills the 7s window
                (false, 2_000),
            ]),
            Some(&recognizer),
        );
        assert_eq!(outcome.intervals.len(), 2);
        assert_eq!(outcome.intervals[0].transcript, "Chapter two the storm");
        // Second closure never got a script entry.
        assert_eq!(outcome.intervals[1].transcript, "");
    }

    /// Records the loudest sample any of its streams ever received.
    struct PeakRecognizer(Arc<Mutex<f32>>);

    struct PeakStream(Arc<Mutex<f32>>);

    impl Recognizer for PeakRecognizer {
        fn open_stream(
            &self,
            _format: AudioFormat,
            _language: &str,
        ) -> Result<Box<dyn RecognizerStream>> {
            Ok(Box::new(PeakStream(Arc::clone(&self.0))))
        }
    }

    impl RecognizerStream for PeakStream {
        fn write(&mut self, samples: &[f32]) -> Result<()> {
            let mut peak = self.0.lock();
            for &s in samples {
                *peak = (*peak).max(s.abs());
            }
            Ok(())
        }

        fn finish(&mut self, _cancel: &CancelSignal) -> Result<TranscriptResult> {
            Ok(TranscriptResult {
                success: true,
                phrases: Vec::new(),
            })
        }
    }

    #[test]
    fn closures_hear_narration_resuming_after_very_long_silences() {
        // A silence far longer than the capture window must not eat the
        // window: the stream has to receive the narration that follows.
        let peak = Arc::new(Mutex::new(0f32));
        let recognizer = PeakRecognizer(Arc::clone(&peak));
        let outcome = scan(
            signal(&[(true, 3_000), (false, 8_500), (true, 9_000)]),
            Some(&recognizer),
        );
        assert_eq!(outcome.intervals.len(), 1);
        assert!(
            *peak.lock() > 0.4,
            "recognition stream heard no narration after the silence"
        );
    }

    #[test]
    fn short_silences_spawn_no_closures() {
        let recognizer = ScriptedRecognizer::new(["should never appear"]);
        let outcome = scan(
            signal(&[(true, 1_000), (false, 800), (true, 1_000)]),
            Some(&recognizer),
        );
        assert_eq!(outcome.intervals.len(), 1);
        assert_eq!(outcome.intervals[0].transcript, "");
    }
}
