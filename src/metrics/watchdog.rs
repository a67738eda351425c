//! Stall watchdog.
//!
//! BLE trainers simply stop notifying when the rider stops pedalling, so without intervention
//! the last non-zero power would be broadcast forever. The watchdog periodically asks the
//! aggregator to apply channel timeouts.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use super::aggregator::MetricAggregator;
use crate::shutdown::Shutdown;

/// Watchdog timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Silence after which power, cadence and speed are zeroed
    pub cycling_timeout: Duration,
    /// Silence after which heart rate is reported stale
    pub heart_rate_stale_after: Duration,
    /// How often timeouts are checked
    pub check_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            cycling_timeout: Duration::from_millis(1200),
            heart_rate_stale_after: Duration::from_secs(5),
            check_interval: Duration::from_millis(250),
        }
    }
}

/// Which group of snapshot fields a timer guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogChannel {
    Cycling,
    HeartRate,
}

/// Inactivity timer for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogEntry {
    pub channel: WatchdogChannel,
    pub last_update_at: Option<Instant>,
    pub timeout: Duration,
}

impl WatchdogEntry {
    pub fn new(channel: WatchdogChannel, timeout: Duration) -> Self {
        Self {
            channel,
            last_update_at: None,
            timeout,
        }
    }

    /// Record activity; never moves the timer backwards.
    pub fn touch(&mut self, at: Instant) {
        self.last_update_at = Some(match self.last_update_at {
            Some(previous) if previous > at => previous,
            _ => at,
        });
    }

    /// Whether the channel has been quiet for longer than its timeout.
    ///
    /// A channel that never reported is not expired.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.last_update_at
            .map(|last| now.saturating_duration_since(last) > self.timeout)
            .unwrap_or(false)
    }
}

/// Periodic timeout enforcement task.
pub struct StallWatchdog {
    aggregator: Arc<MetricAggregator>,
    check_interval: Duration,
}

impl StallWatchdog {
    pub fn new(aggregator: Arc<MetricAggregator>, config: &WatchdogConfig) -> Self {
        Self {
            aggregator,
            check_interval: config.check_interval,
        }
    }

    /// Check timeouts until shutdown.
    pub async fn run(self, mut shutdown: Shutdown) {
        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(
            "Stall watchdog started (check every {} ms)",
            self.check_interval.as_millis()
        );

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => self.check(Instant::now()),
            }
        }

        tracing::debug!("Stall watchdog stopped");
    }

    /// One watchdog pass.
    pub fn check(&self, now: Instant) {
        let outcome = self.aggregator.enforce_timeouts(now);

        if outcome.cycling_zeroed {
            tracing::info!("No cycling data received recently, zeroing power/cadence/speed");
        }
        match outcome.heart_rate_stale {
            Some(true) => tracing::warn!("Heart rate data is stale"),
            Some(false) => tracing::info!("Heart rate data resumed"),
            None => {}
        }
    }
}
