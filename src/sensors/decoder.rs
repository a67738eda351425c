//! Notification decoding: raw GATT bytes to partial metric samples.
//!
//! One [`SampleDecoder`] lives inside each device session. It is stateless for every profile
//! except the revolution-counter ones (CSC, and crank data carried in Cycling Power), where the
//! previous reading is needed to produce a delta.

use super::csc::{RevolutionTracker, WheelCalibration, CSC_TICKS_PER_SEC, POWER_WHEEL_TICKS_PER_SEC};
use super::gatt::{
    parse_csc_measurement, parse_cycling_power_measurement, parse_heart_rate_measurement,
    parse_indoor_bike_data, DecodeError,
};
use super::types::{Capability, DecodedSample, GattProfile, RawNotification};

/// Per-session decoder.
#[derive(Debug, Clone)]
pub struct SampleDecoder {
    capability: Capability,
    calibration: WheelCalibration,
    tracker: RevolutionTracker,
}

impl SampleDecoder {
    /// Create a decoder for a session of the given capability.
    pub fn new(capability: Capability, calibration: WheelCalibration) -> Self {
        Self {
            capability,
            calibration,
            tracker: RevolutionTracker::new(),
        }
    }

    /// Drop revolution history. Call on every (re)connection.
    pub fn reset(&mut self) {
        self.tracker.reset();
    }

    /// Decode one notification.
    ///
    /// Returns `Ok(None)` when the payload was well formed but carried no metric update, such as
    /// the first CSC reading after a connection.
    pub fn decode(
        &mut self,
        notification: &RawNotification,
    ) -> Result<Option<DecodedSample>, DecodeError> {
        let mut sample = DecodedSample::empty(self.capability, notification.received_at);
        let data = notification.payload.as_slice();

        match notification.profile {
            GattProfile::HeartRate => {
                let parsed = parse_heart_rate_measurement(data)?;
                sample.heart_rate_bpm = Some(parsed.heart_rate_bpm);
                sample.rr_intervals_ms = parsed.rr_intervals_ms();
            }
            GattProfile::CyclingPower => {
                let parsed = parse_cycling_power_measurement(data)?;
                sample.power_w = Some(clamp_power(parsed.power_watts));
                if let Some(crank) = parsed.crank {
                    sample.cadence_rpm = self.tracker.crank_cadence_rpm(crank);
                }
                if let Some(wheel) = parsed.wheel {
                    sample.speed_kmh = self.tracker.wheel_speed_kmh(
                        wheel,
                        POWER_WHEEL_TICKS_PER_SEC,
                        &self.calibration,
                    );
                }
            }
            GattProfile::CyclingSpeedCadence => {
                let parsed = parse_csc_measurement(data)?;
                if let Some(wheel) = parsed.wheel {
                    sample.speed_kmh =
                        self.tracker
                            .wheel_speed_kmh(wheel, CSC_TICKS_PER_SEC, &self.calibration);
                }
                if let Some(crank) = parsed.crank {
                    sample.cadence_rpm = self.tracker.crank_cadence_rpm(crank);
                }
            }
            GattProfile::IndoorBike => {
                let parsed = parse_indoor_bike_data(data)?;
                sample.power_w = parsed.power_watts.map(clamp_power);
                sample.cadence_rpm = parsed.cadence_rpm;
                sample.speed_kmh = parsed.speed_kmh;
                sample.heart_rate_bpm = parsed.heart_rate_bpm.map(u16::from);
            }
        }

        if sample.is_empty() {
            return Ok(None);
        }

        Ok(Some(sample))
    }
}

/// Negative instantaneous power (back-pedalling on some meters) is reported as zero.
fn clamp_power(watts: i16) -> u16 {
    watts.max(0) as u16
}
