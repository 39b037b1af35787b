use std::time::Duration;

/// Interleaved PCM stream format carried on every graph edge.
///
/// Connections only form between matching formats; conversions happen
/// explicitly through a [`Conformer`](crate::graph::Conformer) node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub channels: u16,
    pub sample_rate: u32,
}

impl AudioFormat {
    pub fn new(channels: u16, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    pub fn mono(sample_rate: u32) -> Self {
        Self::new(1, sample_rate)
    }

    pub fn stereo(sample_rate: u32) -> Self {
        Self::new(2, sample_rate)
    }

    /// Samples per channel covered by `duration`, rounded down.
    pub fn duration_to_samples(&self, duration: Duration) -> u64 {
        (duration.as_secs_f64() * self.sample_rate as f64) as u64
    }

    /// Wall time covered by `samples` per-channel samples.
    pub fn samples_to_duration(&self, samples: u64) -> Duration {
        Duration::from_secs_f64(samples as f64 / self.sample_rate as f64)
    }

    /// Interleaved buffer length for `samples` per-channel samples.
    pub fn interleaved_len(&self, samples: usize) -> usize {
        samples * self.channels as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_round_trip_at_48k() {
        let fmt = AudioFormat::mono(48_000);
        assert_eq!(fmt.duration_to_samples(Duration::from_millis(10)), 480);
        assert_eq!(fmt.samples_to_duration(48_000), Duration::from_secs(1));
    }

    #[test]
    fn interleaved_len_scales_by_channels() {
        assert_eq!(AudioFormat::stereo(44_100).interleaved_len(100), 200);
        assert_eq!(AudioFormat::mono(44_100).interleaved_len(100), 100);
    }
}
