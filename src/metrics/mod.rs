//! Canonical metric snapshot, its aggregator and the stall watchdog.

pub mod aggregator;
pub mod watchdog;

use serde::{Deserialize, Serialize};

pub use aggregator::{AggregatorError, MetricAggregator, MetricWriter, WatchdogOutcome};
pub use watchdog::{StallWatchdog, WatchdogChannel, WatchdogConfig, WatchdogEntry};

/// Latest known metrics, as broadcast to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    /// Power in watts
    pub power_w: u16,
    /// Cadence in RPM
    pub cadence_rpm: f32,
    /// Speed in km/h
    pub speed_kmh: f32,
    /// Heart rate in BPM
    pub heart_rate_bpm: u16,
}

impl Snapshot {
    /// Whether any of the stall-coupled cycling metrics is non-zero.
    pub fn cycling_active(&self) -> bool {
        self.power_w != 0 || self.cadence_rpm != 0.0 || self.speed_kmh != 0.0
    }
}

/// Snapshot field families a writer may update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FieldSet(u8);

impl FieldSet {
    pub const NONE: FieldSet = FieldSet(0);
    pub const POWER: FieldSet = FieldSet(0b001);
    pub const CADENCE_SPEED: FieldSet = FieldSet(0b010);
    pub const HEART_RATE: FieldSet = FieldSet(0b100);

    pub const fn union(self, other: FieldSet) -> FieldSet {
        FieldSet(self.0 | other.0)
    }

    pub const fn contains(self, other: FieldSet) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn intersects(self, other: FieldSet) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn intersection(self, other: FieldSet) -> FieldSet {
        FieldSet(self.0 & other.0)
    }

    pub const fn without(self, other: FieldSet) -> FieldSet {
        FieldSet(self.0 & !other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for FieldSet {
    type Output = FieldSet;

    fn bitor(self, rhs: FieldSet) -> FieldSet {
        self.union(rhs)
    }
}

impl std::fmt::Display for FieldSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.contains(FieldSet::POWER) {
            names.push("power");
        }
        if self.contains(FieldSet::CADENCE_SPEED) {
            names.push("cadence/speed");
        }
        if self.contains(FieldSet::HEART_RATE) {
            names.push("heart rate");
        }
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join(", "))
        }
    }
}
