//! Metric aggregator: the single owner of the shared [`Snapshot`].
//!
//! Sessions never touch the snapshot directly. Each one receives a [`MetricWriter`] scoped to the
//! field families it owns; the aggregator refuses overlapping claims so every family has exactly
//! one writer. All locking is a short synchronous critical section, never held across `.await`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::watchdog::{WatchdogChannel, WatchdogConfig, WatchdogEntry};
use super::{FieldSet, Snapshot};
use crate::sensors::types::DecodedSample;

/// Aggregator errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregatorError {
    /// Another writer already owns some of the requested fields
    #[error("Fields already owned by another writer: {0}")]
    FieldsAlreadyClaimed(FieldSet),
}

/// What a watchdog pass changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WatchdogOutcome {
    /// Power, cadence and speed were forced to zero
    pub cycling_zeroed: bool,
    /// Heart rate just became stale (`Some(true)`) or fresh again (`Some(false)`)
    pub heart_rate_stale: Option<bool>,
}

struct AggregatorState {
    snapshot: Snapshot,
    claimed: FieldSet,
    cycling: WatchdogEntry,
    heart_rate: WatchdogEntry,
    heart_rate_reported_stale: bool,
}

/// Merges decoded samples from all sessions into one snapshot.
pub struct MetricAggregator {
    state: Mutex<AggregatorState>,
    samples_tx: broadcast::Sender<DecodedSample>,
}

impl MetricAggregator {
    /// Create an aggregator with the given watchdog timeouts.
    pub fn new(config: &WatchdogConfig) -> Arc<Self> {
        let (samples_tx, _) = broadcast::channel(256);

        Arc::new(Self {
            state: Mutex::new(AggregatorState {
                snapshot: Snapshot::default(),
                claimed: FieldSet::NONE,
                cycling: WatchdogEntry::new(WatchdogChannel::Cycling, config.cycling_timeout),
                heart_rate: WatchdogEntry::new(
                    WatchdogChannel::HeartRate,
                    config.heart_rate_stale_after,
                ),
                heart_rate_reported_stale: false,
            }),
            samples_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim exclusive write access to `fields`.
    pub fn writer(self: &Arc<Self>, fields: FieldSet) -> Result<MetricWriter, AggregatorError> {
        let mut state = self.lock();
        if state.claimed.intersects(fields) {
            return Err(AggregatorError::FieldsAlreadyClaimed(
                state.claimed.intersection(fields),
            ));
        }
        state.claimed = state.claimed | fields;

        Ok(MetricWriter {
            aggregator: Arc::clone(self),
            fields,
        })
    }

    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.lock().snapshot
    }

    /// Receive every decoded sample (persistence/observer hook).
    pub fn subscribe_samples(&self) -> broadcast::Receiver<DecodedSample> {
        self.samples_tx.subscribe()
    }

    /// Whether the heart rate channel has gone quiet past its stale timeout.
    pub fn heart_rate_stale(&self, now: Instant) -> bool {
        self.lock().heart_rate.is_expired(now)
    }

    /// Watchdog entries for diagnostics.
    pub fn watchdog_entries(&self) -> [WatchdogEntry; 2] {
        let state = self.lock();
        [state.cycling, state.heart_rate]
    }

    /// Apply watchdog rules at `now`.
    ///
    /// The cycling group is zeroed together when its timer expired and any of its values is
    /// non-zero; the timer is then refreshed so the zero-write is not repeated every pass. Heart
    /// rate is never zeroed, only flagged stale.
    pub fn enforce_timeouts(&self, now: Instant) -> WatchdogOutcome {
        let mut state = self.lock();
        let mut outcome = WatchdogOutcome::default();

        if state.cycling.is_expired(now) && state.snapshot.cycling_active() {
            state.snapshot.power_w = 0;
            state.snapshot.cadence_rpm = 0.0;
            state.snapshot.speed_kmh = 0.0;
            state.cycling.touch(now);
            outcome.cycling_zeroed = true;
        }

        let hr_stale = state.heart_rate.is_expired(now);
        if hr_stale != state.heart_rate_reported_stale {
            state.heart_rate_reported_stale = hr_stale;
            outcome.heart_rate_stale = Some(hr_stale);
        }

        outcome
    }

    /// Apply the fields of `sample` that are in `fields`. Returns whether anything changed.
    fn apply(&self, fields: FieldSet, sample: &DecodedSample) -> bool {
        let mut cycling_touched = false;
        let mut heart_rate_touched = false;

        {
            let mut state = self.lock();
            let snapshot = &mut state.snapshot;

            if fields.contains(FieldSet::POWER) {
                if let Some(power) = sample.power_w {
                    snapshot.power_w = power;
                    cycling_touched = true;
                }
            }

            if fields.contains(FieldSet::CADENCE_SPEED) {
                if let Some(cadence) = sample.cadence_rpm.and_then(sanitize) {
                    snapshot.cadence_rpm = cadence;
                    cycling_touched = true;
                }
                if let Some(speed) = sample.speed_kmh.and_then(sanitize) {
                    snapshot.speed_kmh = speed;
                    cycling_touched = true;
                }
            }

            if fields.contains(FieldSet::HEART_RATE) {
                if let Some(bpm) = sample.heart_rate_bpm {
                    snapshot.heart_rate_bpm = bpm;
                    heart_rate_touched = true;
                }
            }

            if cycling_touched || heart_rate_touched {
                snapshot.timestamp = snapshot.timestamp.max(sample.timestamp);
            }
            if cycling_touched {
                state.cycling.touch(sample.received_at);
            }
            if heart_rate_touched {
                state.heart_rate.touch(sample.received_at);
            }
        }

        let _ = self.samples_tx.send(sample.clone());

        cycling_touched || heart_rate_touched
    }

    fn release(&self, fields: FieldSet) {
        let mut state = self.lock();
        state.claimed = state.claimed.without(fields);
    }
}

/// Metrics must be finite and non-negative to enter the snapshot.
fn sanitize(value: f32) -> Option<f32> {
    if value.is_finite() {
        Some(value.max(0.0))
    } else {
        None
    }
}

/// Write handle owning a set of snapshot fields. Releases its claim on drop.
pub struct MetricWriter {
    aggregator: Arc<MetricAggregator>,
    fields: FieldSet,
}

impl MetricWriter {
    /// Fields this writer owns.
    pub fn fields(&self) -> FieldSet {
        self.fields
    }

    /// Apply a decoded sample; fields outside this writer's set are ignored.
    ///
    /// Returns whether any snapshot field was written (and its watchdog timer reset).
    pub fn apply(&self, sample: &DecodedSample) -> bool {
        self.aggregator.apply(self.fields, sample)
    }
}

impl Drop for MetricWriter {
    fn drop(&mut self) {
        self.aggregator.release(self.fields);
    }
}

impl std::fmt::Debug for MetricWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricWriter")
            .field("fields", &self.fields)
            .finish()
    }
}
