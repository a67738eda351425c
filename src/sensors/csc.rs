//! Speed and cadence derivation from cumulative revolution counters.
//!
//! CSC and Cycling Power sensors never transmit speed or cadence directly. They report running
//! revolution counts stamped with a 16-bit event clock, so every value is a delta against the
//! previous notification from the same connection.

use serde::{Deserialize, Serialize};

use super::gatt::{CrankRevolutions, WheelRevolutions};

/// CSC event clock resolution (1/1024 s).
pub const CSC_TICKS_PER_SEC: f64 = 1024.0;

/// Cycling Power wheel event clock resolution (1/2048 s).
pub const POWER_WHEEL_TICKS_PER_SEC: f64 = 2048.0;

/// Deltas implying more than this are counter resets, not riding.
const MAX_PLAUSIBLE_SPEED_KMH: f64 = 150.0;
const MAX_PLAUSIBLE_CADENCE_RPM: f64 = 250.0;

/// Wheel size used to turn revolutions into distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WheelCalibration {
    /// Rolling circumference in meters
    pub circumference_m: f64,
}

impl Default for WheelCalibration {
    fn default() -> Self {
        // 700x25c
        Self {
            circumference_m: 2.105,
        }
    }
}

/// Previous counter readings for one sensor connection.
#[derive(Debug, Clone, Default)]
pub struct RevolutionTracker {
    last_wheel: Option<WheelRevolutions>,
    last_crank: Option<CrankRevolutions>,
}

impl RevolutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget previous readings; the next reading of each kind yields nothing.
    pub fn reset(&mut self) {
        self.last_wheel = None;
        self.last_crank = None;
    }

    /// Speed in km/h since the previous wheel reading.
    pub fn wheel_speed_kmh(
        &mut self,
        current: WheelRevolutions,
        ticks_per_sec: f64,
        calibration: &WheelCalibration,
    ) -> Option<f32> {
        let previous = self.last_wheel.replace(current)?;

        let dt_ticks = current.event_time.wrapping_sub(previous.event_time);
        if dt_ticks == 0 {
            return None;
        }

        let revs = current.revolutions.wrapping_sub(previous.revolutions) as f64;
        let dt_s = dt_ticks as f64 / ticks_per_sec;
        let speed = revs * calibration.circumference_m / dt_s * 3.6;

        if speed > MAX_PLAUSIBLE_SPEED_KMH {
            tracing::debug!("Discarding implausible wheel delta ({:.1} km/h)", speed);
            return None;
        }

        Some(speed as f32)
    }

    /// Cadence in RPM since the previous crank reading.
    pub fn crank_cadence_rpm(&mut self, current: CrankRevolutions) -> Option<f32> {
        let previous = self.last_crank.replace(current)?;

        let dt_ticks = current.event_time.wrapping_sub(previous.event_time);
        if dt_ticks == 0 {
            return None;
        }

        let revs = current.revolutions.wrapping_sub(previous.revolutions) as f64;
        let dt_s = dt_ticks as f64 / CSC_TICKS_PER_SEC;
        let cadence = revs / dt_s * 60.0;

        if cadence > MAX_PLAUSIBLE_CADENCE_RPM {
            tracing::debug!("Discarding implausible crank delta ({:.1} rpm)", cadence);
            return None;
        }

        Some(cadence as f32)
    }
}
