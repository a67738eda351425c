//! Fixed-rate broadcast of the current snapshot.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use super::registry::{BroadcastReport, ConsumerRegistry};
use crate::metrics::{MetricAggregator, Snapshot};
use crate::sensors::types::wall_clock_secs;
use crate::shutdown::Shutdown;

/// Periodically fans the snapshot out to every consumer, independent of sensor rates.
pub struct BroadcastHub {
    aggregator: Arc<MetricAggregator>,
    registry: Arc<ConsumerRegistry>,
    tick: Duration,
    last_timestamp: f64,
}

impl BroadcastHub {
    pub fn new(
        aggregator: Arc<MetricAggregator>,
        registry: Arc<ConsumerRegistry>,
        tick: Duration,
    ) -> Self {
        Self {
            aggregator,
            registry,
            tick,
            last_timestamp: 0.0,
        }
    }

    /// Broadcast every tick until shutdown.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            "Broadcasting at {:.1} Hz",
            1.0 / self.tick.as_secs_f64()
        );

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => {
                    self.tick_once(wall_clock_secs());
                }
            }
        }

        tracing::debug!("Broadcast hub stopped");
    }

    /// One broadcast. `now` is wall-clock seconds, clamped so consumers never see time go
    /// backwards.
    pub fn tick_once(&mut self, now: f64) -> BroadcastReport {
        let snapshot = self.stamp(self.aggregator.snapshot(), now);
        let report = self.registry.broadcast(&snapshot);

        if report.dropped > 0 {
            tracing::debug!("Dropped {} frame(s) for slow consumers", report.dropped);
        }
        report
    }

    fn stamp(&mut self, mut snapshot: Snapshot, now: f64) -> Snapshot {
        self.last_timestamp = self.last_timestamp.max(now);
        snapshot.timestamp = self.last_timestamp;
        snapshot
    }
}
