//! Record narration from a microphone into a WAV master, stopping once
//! the narrator has been quiet for long enough.

use std::fs;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ringbuf::traits::Consumer;
use tracing::info;

use crate::audio::{create_capture_ring, AudioCapture};
use crate::cancel::CancelSignal;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Quiet stretch that ends the recording.
    pub trailing_silence: Duration,
    /// Peak amplitude at or below which a sample counts as quiet.
    pub silence_threshold: f32,
    pub out_dir: PathBuf,
    /// Input device name; `None` takes the system default.
    pub device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            trailing_silence: Duration::from_secs(10),
            silence_threshold: 0.001,
            out_dir: PathBuf::from("."),
            device: None,
        }
    }
}

/// How often the recording thread drains the capture ring.
const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// Capture mono audio until `trailing_silence` of quiet follows speech,
/// or until cancelled. Returns the path of the finished WAV.
///
/// Blocking; the capture stream is created and dropped on the calling
/// thread, which cpal requires on Windows and macOS.
pub fn record_until_silence(config: &CaptureConfig, cancel: &CancelSignal) -> Result<PathBuf> {
    fs::create_dir_all(&config.out_dir)?;
    let stamp = humantime::format_rfc3339_seconds(SystemTime::now())
        .to_string()
        .replace(':', "_");
    let path = config.out_dir.join(format!("recording {stamp}.wav"));

    let (producer, mut consumer) = create_capture_ring();
    let running = Arc::new(AtomicBool::new(true));
    let capture = AudioCapture::open(producer, Arc::clone(&running), config.device.as_deref())?;

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: capture.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer: hound::WavWriter<BufWriter<fs::File>> =
        hound::WavWriter::create(&path, spec)?;
    info!(path = %path.display(), rate = capture.sample_rate, "recording");

    let quiet_limit = (config.trailing_silence.as_secs_f64() * capture.sample_rate as f64) as u64;
    let mut quiet_run: u64 = 0;
    let mut heard_speech = false;
    let mut chunk = vec![0f32; 8192];

    let outcome = loop {
        if cancel.is_cancelled() {
            break "cancelled";
        }
        let drained = consumer.pop_slice(&mut chunk);
        if drained == 0 {
            std::thread::sleep(DRAIN_INTERVAL);
            continue;
        }
        for &s in &chunk[..drained] {
            if s.abs() > config.silence_threshold {
                heard_speech = true;
                quiet_run = 0;
            } else {
                quiet_run += 1;
            }
            let q = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer.write_sample(q)?;
        }
        if heard_speech && quiet_run >= quiet_limit {
            break "trailing silence";
        }
    };

    capture.stop();
    drop(capture);
    writer.finalize()?;
    info!(path = %path.display(), reason = outcome, "recording stopped");
    Ok(path)
}
