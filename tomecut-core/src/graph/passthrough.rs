//! Pump node that moves samples through an otherwise passive chain.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::buffering::BufferPool;
use crate::cancel::CancelSignal;
use crate::error::{Result, TomecutError};
use crate::graph::node::{weak_source, weak_target, NodeCore};
use crate::graph::{
    AudioFormat, AudioGraph, NodeId, NodeRegistration, NodeRole, ReadResult, SampleSource,
    SampleTarget, Topology,
};

/// Per-channel samples pumped per lock acquisition.
const DRIVE_CHUNK_SAMPLES: usize = 65_536;

/// Real-time pacing only sleeps when it would sleep at least this long,
/// so scheduler jitter does not accumulate into drift.
const PACING_GUARD: Duration = Duration::from_millis(15);

/// Whether a drive runs flat out or is throttled to wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    Unthrottled,
    RealTime,
}

/// Filter that actively pumps its upstream into its downstream.
///
/// Each pumped window takes the graph lock once, pulls up to
/// [`DRIVE_CHUNK_SAMPLES`] from upstream, and pushes the result
/// downstream before releasing the lock. Reconnections therefore land
/// between windows, never inside one.
pub struct PassthroughDriver {
    core: NodeCore,
    format: AudioFormat,
    pool: BufferPool,
}

impl PassthroughDriver {
    pub fn new(graph: &Arc<AudioGraph>, format: AudioFormat, name: &str) -> Arc<Self> {
        let driver = Arc::new(Self {
            core: NodeCore::new(graph, name),
            format,
            pool: BufferPool::new(format.interleaved_len(DRIVE_CHUNK_SAMPLES)),
        });
        let source = weak_source(&driver);
        let target = weak_target(&driver);
        graph.register(
            driver.core.id(),
            NodeRegistration {
                name: name.to_owned(),
                role: NodeRole::PureFilter,
                input_format: Some(format),
                output_format: Some(format),
                source: Some(source),
                target: Some(target),
                finished: Arc::clone(driver.core.finished_flag()),
                fan_out: false,
            },
        );
        driver
    }

    /// Inherent copy so callers of this dual-trait node need not pick a
    /// trait to name the node.
    pub fn node_id(&self) -> NodeId {
        self.core.id()
    }

    /// Pump `amount` of audio through the chain. Returns per-channel
    /// samples actually moved, which is less than requested if the
    /// upstream ends first.
    pub fn drive(&self, amount: Duration, pacing: Pacing, cancel: &CancelSignal) -> Result<u64> {
        self.drive_samples(self.format.duration_to_samples(amount), pacing, cancel)
    }

    /// Pump until the upstream reports end-of-stream, then flush the
    /// downstream chain. Returns total per-channel samples moved.
    pub fn drive_to_end(&self, pacing: Pacing, cancel: &CancelSignal) -> Result<u64> {
        let begun = Instant::now();
        let mut total = 0u64;
        while !self.core.is_finished() {
            total += self.drive_samples(DRIVE_CHUNK_SAMPLES as u64, Pacing::Unthrottled, cancel)?;
            if pacing == Pacing::RealTime {
                self.pace(total, begun, cancel)?;
            }
        }
        Ok(total)
    }

    /// Throttle to wall clock, cumulatively from `begun` so a slow
    /// window's deficit is repaid instead of compounding into drift.
    fn pace(&self, total_moved: u64, begun: Instant, cancel: &CancelSignal) -> Result<()> {
        let audio_time = self.format.samples_to_duration(total_moved);
        let lag = audio_time.saturating_sub(begun.elapsed());
        if lag > PACING_GUARD {
            cancel.sleep(lag)?;
        }
        Ok(())
    }

    fn drive_samples(&self, samples: u64, pacing: Pacing, cancel: &CancelSignal) -> Result<u64> {
        let begun = Instant::now();
        let mut buf = self.pool.rent();
        let channels = self.format.channels as usize;
        let mut remaining = samples;
        let mut moved = 0u64;

        while remaining > 0 && !self.core.is_finished() {
            cancel.checkpoint()?;

            // One lock acquisition per pumped window. Both sides must
            // resolve on every chunk: edges move between windows.
            let produced = {
                let topo = self.core.graph().lock();
                let _scope = topo.instrumented_scope();
                let Some(upstream) = topo.upstream_source(self.node_id())? else {
                    return Err(TomecutError::NotConnected(self.core.name().to_owned()));
                };
                let targets = topo.output_targets(self.node_id())?;
                if targets.is_empty() {
                    return Err(TomecutError::NotConnected(self.core.name().to_owned()));
                }
                let want = (remaining as usize).min(buf.len() / channels);
                match upstream.read(&topo, &mut buf[..want * channels], cancel)? {
                    ReadResult::Samples(n) => {
                        if n > 0 {
                            for target in &targets {
                                target.write(&topo, &buf[..n * channels], cancel)?;
                            }
                        }
                        Some(n)
                    }
                    ReadResult::EndOfStream => {
                        self.core.mark_finished();
                        for target in &targets {
                            target.flush(&topo, cancel)?;
                        }
                        None
                    }
                }
            };

            let Some(n) = produced else { break };
            if n == 0 {
                // Upstream has nothing buffered yet. Yield off the lock.
                cancel.sleep(Duration::from_millis(1))?;
                continue;
            }
            moved += n as u64;
            remaining -= n as u64;

            if pacing == Pacing::RealTime {
                self.pace(moved, begun, cancel)?;
            }
        }

        trace!(node = self.core.name(), moved, "drive window complete");
        Ok(moved)
    }
}

impl SampleSource for PassthroughDriver {
    fn node_id(&self) -> NodeId {
        self.core.id()
    }

    fn graph(&self) -> &Arc<AudioGraph> {
        self.core.graph()
    }

    fn output_format(&self) -> AudioFormat {
        self.format
    }

    fn playback_finished(&self) -> bool {
        self.core.is_finished()
    }

    fn read(
        &self,
        topology: &Topology,
        buf: &mut [f32],
        cancel: &CancelSignal,
    ) -> Result<ReadResult> {
        cancel.checkpoint()?;
        if self.core.is_finished() {
            return Ok(ReadResult::EndOfStream);
        }
        let Some(upstream) = topology.upstream_source(self.node_id())? else {
            return Ok(ReadResult::Samples(0));
        };
        match upstream.read(topology, buf, cancel)? {
            ReadResult::Samples(n) => Ok(ReadResult::Samples(n)),
            ReadResult::EndOfStream => {
                self.core.mark_finished();
                Ok(ReadResult::EndOfStream)
            }
        }
    }
}

impl SampleTarget for PassthroughDriver {
    fn node_id(&self) -> NodeId {
        self.core.id()
    }

    fn graph(&self) -> &Arc<AudioGraph> {
        self.core.graph()
    }

    fn input_format(&self) -> AudioFormat {
        self.format
    }

    fn write(&self, topology: &Topology, buf: &[f32], cancel: &CancelSignal) -> Result<()> {
        cancel.checkpoint()?;
        for target in topology.output_targets(self.node_id())? {
            target.write(topology, buf, cancel)?;
        }
        Ok(())
    }

    fn flush(&self, topology: &Topology, cancel: &CancelSignal) -> Result<()> {
        cancel.checkpoint()?;
        for target in topology.output_targets(self.node_id())? {
            target.flush(topology, cancel)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{connect, BufferSource, NullSink};

    const FMT: AudioFormat = AudioFormat {
        channels: 1,
        sample_rate: 48_000,
    };

    #[test]
    fn drive_moves_the_requested_window() {
        let graph = AudioGraph::new();
        let source = BufferSource::new(&graph, FMT, "buf", vec![0.25; 48_000]);
        let driver = PassthroughDriver::new(&graph, FMT, "driver");
        let sink = NullSink::new(&graph, FMT, "sink");
        connect(source.as_ref(), driver.as_ref()).unwrap();
        connect(driver.as_ref(), sink.as_ref()).unwrap();

        let cancel = CancelSignal::new();
        let moved = driver
            .drive(Duration::from_millis(100), Pacing::Unthrottled, &cancel)
            .unwrap();
        assert_eq!(moved, 4_800);
        assert_eq!(sink.samples_consumed(), 4_800);
        assert!(!driver.playback_finished());
    }

    #[test]
    fn drive_to_end_consumes_the_whole_source() {
        let graph = AudioGraph::new();
        let source = BufferSource::new(&graph, FMT, "buf", vec![0.25; 100_000]);
        let driver = PassthroughDriver::new(&graph, FMT, "driver");
        let sink = NullSink::new(&graph, FMT, "sink");
        connect(source.as_ref(), driver.as_ref()).unwrap();
        connect(driver.as_ref(), sink.as_ref()).unwrap();

        let cancel = CancelSignal::new();
        let moved = driver.drive_to_end(Pacing::Unthrottled, &cancel).unwrap();
        assert_eq!(moved, 100_000);
        assert!(driver.playback_finished());
        assert_eq!(sink.samples_consumed(), 100_000);
    }

    #[test]
    fn unconnected_driver_reports_not_connected() {
        let graph = AudioGraph::new();
        let driver = PassthroughDriver::new(&graph, FMT, "driver");
        let cancel = CancelSignal::new();
        assert!(matches!(
            driver.drive(Duration::from_millis(10), Pacing::Unthrottled, &cancel),
            Err(TomecutError::NotConnected(_))
        ));
    }

    #[test]
    fn driver_without_an_output_refuses_to_pump() {
        let graph = AudioGraph::new();
        let source = BufferSource::new(&graph, FMT, "buf", vec![0.25; 8_000]);
        let driver = PassthroughDriver::new(&graph, FMT, "driver");
        connect(source.as_ref(), driver.as_ref()).unwrap();

        let cancel = CancelSignal::new();
        assert!(matches!(
            driver.drive(Duration::from_millis(100), Pacing::Unthrottled, &cancel),
            Err(TomecutError::NotConnected(_))
        ));
        // Nothing was consumed from the source.
        let topo = graph.lock();
        let mut buf = [0.0f32; 8];
        assert_eq!(
            source.read(&topo, &mut buf, &cancel).unwrap(),
            ReadResult::Samples(8)
        );
    }

    #[test]
    fn real_time_pacing_holds_a_drive_to_wall_clock() {
        let graph = AudioGraph::new();
        let source = BufferSource::new(&graph, FMT, "buf", vec![0.25; 12_000]);
        let driver = PassthroughDriver::new(&graph, FMT, "driver");
        let sink = NullSink::new(&graph, FMT, "sink");
        connect(source.as_ref(), driver.as_ref()).unwrap();
        connect(driver.as_ref(), sink.as_ref()).unwrap();

        let cancel = CancelSignal::new();
        let begun = Instant::now();
        let moved = driver
            .drive(Duration::from_millis(250), Pacing::RealTime, &cancel)
            .unwrap();
        assert_eq!(moved, 12_000);
        // 250 ms of audio must take roughly that long; generous floor
        // to stay scheduler-proof.
        assert!(begun.elapsed() >= Duration::from_millis(180));
    }

    #[test]
    fn cancel_interrupts_a_drive() {
        let graph = AudioGraph::new();
        let source = BufferSource::new(&graph, FMT, "buf", vec![0.0; 48_000]);
        let driver = PassthroughDriver::new(&graph, FMT, "driver");
        let sink = NullSink::new(&graph, FMT, "sink");
        connect(source.as_ref(), driver.as_ref()).unwrap();
        connect(driver.as_ref(), sink.as_ref()).unwrap();

        let cancel = CancelSignal::new();
        cancel.cancel();
        assert!(matches!(
            driver.drive(Duration::from_secs(1), Pacing::Unthrottled, &cancel),
            Err(TomecutError::Cancelled)
        ));
    }
}
