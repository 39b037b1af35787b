//! Microphone capture via cpal.
//!
//! The cpal input callback runs on an OS audio thread at elevated
//! priority, so it must not allocate, block on a lock, or do I/O. The
//! callback therefore downmixes into a pre-grown scratch buffer and
//! pushes into an SPSC ring whose `push_slice` is wait-free; everything
//! else happens on the recording thread.
//!
//! `cpal::Stream` is bound to its creation thread on Windows and macOS,
//! so [`AudioCapture`] must be created and dropped on the same thread.
//! [`recorder::record_until_silence`] is a blocking function for
//! exactly that reason.

pub mod recorder;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig};
use ringbuf::traits::{Producer, Split};
use ringbuf::HeapRb;
use tracing::{error, info, warn};

use crate::error::{Result, TomecutError};

pub use recorder::{record_until_silence, CaptureConfig};

/// Producer half, owned by the audio callback.
pub type CaptureProducer = ringbuf::HeapProd<f32>;
/// Consumer half, drained by the recording thread.
pub type CaptureConsumer = ringbuf::HeapCons<f32>;

/// 2^22 mono samples, about 87 s at 48 kHz. Narration survives long
/// stalls on the consumer side without callback drops.
pub const RING_CAPACITY: usize = 1 << 22;

pub fn create_capture_ring() -> (CaptureProducer, CaptureConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}

/// Handle to a live input stream pushing mono f32 into a ring.
///
/// Not `Send`; create and drop on one thread.
pub struct AudioCapture {
    /// Dropping the stream stops capture, so it is kept here.
    _stream: Stream,
    running: Arc<AtomicBool>,
    /// Rate the device actually opened at.
    pub sample_rate: u32,
}

/// Downmix an interleaved callback buffer to mono and push it into the
/// ring. Runs on the audio thread; `scratch` is reused across calls.
fn push_mono<T: Copy>(
    data: &[T],
    channels: usize,
    to_f32: impl Fn(T) -> f32,
    scratch: &mut Vec<f32>,
    producer: &mut CaptureProducer,
) {
    let frames = data.len() / channels;
    scratch.resize(frames, 0.0);
    for (frame, slot) in data.chunks_exact(channels).zip(scratch.iter_mut()) {
        let mut sum = 0f32;
        for &s in frame {
            sum += to_f32(s);
        }
        *slot = sum / channels as f32;
    }
    let written = producer.push_slice(&scratch[..frames]);
    if written < frames {
        warn!(dropped = frames - written, "capture ring full");
    }
}

impl AudioCapture {
    /// Open an input device by name when given, otherwise the default
    /// input, otherwise the first device the host lists.
    pub fn open(
        mut producer: CaptureProducer,
        running: Arc<AtomicBool>,
        preferred_device: Option<&str>,
    ) -> Result<Self> {
        let host = cpal::default_host();

        let mut selected = None;
        if let Some(wanted) = preferred_device {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected = devices
                        .find(|d| d.name().map(|name| name == wanted).unwrap_or(false));
                    if selected.is_none() {
                        warn!(wanted, "preferred input device not found, falling back");
                    }
                }
                Err(e) => warn!(error = %e, "could not list input devices"),
            }
        }
        let device = match selected.or_else(|| host.default_input_device()) {
            Some(device) => device,
            None => {
                let mut devices = host
                    .input_devices()
                    .map_err(|e| TomecutError::AudioDevice(e.to_string()))?;
                warn!("no default input device, taking first available");
                devices.next().ok_or(TomecutError::NoDefaultInputDevice)?
            }
        };
        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| TomecutError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;
        info!(sample_rate, channels, "capture config selected");

        let config = StreamConfig {
            channels: channels as u16,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let flag = Arc::clone(&running);
        let mut scratch: Vec<f32> = Vec::new();
        let on_error = |err: cpal::StreamError| error!("input stream error: {err}");

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if flag.load(Ordering::Relaxed) {
                        push_mono(data, channels, |s| s, &mut scratch, &mut producer);
                    }
                },
                on_error,
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    if flag.load(Ordering::Relaxed) {
                        push_mono(
                            data,
                            channels,
                            |s| s as f32 / 32_768.0,
                            &mut scratch,
                            &mut producer,
                        );
                    }
                },
                on_error,
                None,
            ),
            SampleFormat::U16 => device.build_input_stream(
                &config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    if flag.load(Ordering::Relaxed) {
                        push_mono(
                            data,
                            channels,
                            |s| (s as f32 - 32_768.0) / 32_768.0,
                            &mut scratch,
                            &mut producer,
                        );
                    }
                },
                on_error,
                None,
            ),
            fmt => {
                return Err(TomecutError::AudioDevice(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| TomecutError::AudioDevice(e.to_string()))?;

        stream
            .play()
            .map_err(|e| TomecutError::AudioDevice(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
        })
    }

    /// Tell the callback to stop pushing; the stream itself dies with
    /// the handle.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}
