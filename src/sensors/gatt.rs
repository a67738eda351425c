//! GATT characteristic layouts for the cycling and heart rate profiles.
//!
//! Every parser here is a pure function of the notification bytes. Fields that the flags mark as
//! absent come back as `None`; a flagged field that does not fit in the buffer is a
//! [`DecodeError::MalformedPayload`], never a partial record.

use thiserror::Error;
use uuid::Uuid;

use super::types::GattProfile;

/// FTMS Service UUID (0x1826)
pub const FTMS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Indoor Bike Data Characteristic UUID (0x2AD2)
pub const INDOOR_BIKE_DATA_UUID: Uuid = Uuid::from_u128(0x0000_2ad2_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Power Service UUID (0x1818)
pub const CYCLING_POWER_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1818_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Power Measurement UUID (0x2A63)
pub const CYCLING_POWER_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a63_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Service UUID (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Measurement UUID (0x2A37)
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Speed and Cadence Service UUID (0x1816)
pub const CSC_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1816_0000_1000_8000_0080_5f9b_34fb);

/// CSC Measurement UUID (0x2A5B)
pub const CSC_MEASUREMENT_UUID: Uuid = Uuid::from_u128(0x0000_2a5b_0000_1000_8000_0080_5f9b_34fb);

/// Errors raised while decoding a notification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Buffer too short for its flags, or flags that describe no data
    #[error("Malformed {profile} payload ({len} bytes): {reason}")]
    MalformedPayload {
        profile: GattProfile,
        len: usize,
        reason: &'static str,
    },
}

/// Little-endian cursor over a notification buffer.
struct FieldReader<'a> {
    data: &'a [u8],
    offset: usize,
    profile: GattProfile,
}

impl<'a> FieldReader<'a> {
    fn new(data: &'a [u8], profile: GattProfile) -> Self {
        Self {
            data,
            offset: 0,
            profile,
        }
    }

    fn malformed(&self, reason: &'static str) -> DecodeError {
        DecodeError::MalformedPayload {
            profile: self.profile,
            len: self.data.len(),
            reason,
        }
    }

    fn take<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], DecodeError> {
        let end = self.offset + N;
        let bytes = self
            .data
            .get(self.offset..end)
            .ok_or_else(|| self.malformed(field))?;
        self.offset = end;

        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn skip(&mut self, width: usize, field: &'static str) -> Result<(), DecodeError> {
        if self.offset + width > self.data.len() {
            return Err(self.malformed(field));
        }
        self.offset += width;
        Ok(())
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take::<1>(field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take(field)?))
    }

    fn i16(&mut self, field: &'static str) -> Result<i16, DecodeError> {
        Ok(i16::from_le_bytes(self.take(field)?))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take(field)?))
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }
}

/// Parsed Heart Rate Measurement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartRateData {
    /// Heart rate in BPM
    pub heart_rate_bpm: u16,
    /// RR intervals in 1/1024 s units
    pub rr_intervals: Vec<u16>,
    /// Energy expended in kJ (if present)
    pub energy_expended: Option<u16>,
    /// Sensor contact detected
    pub sensor_contact: bool,
}

impl HeartRateData {
    /// RR intervals converted to milliseconds.
    pub fn rr_intervals_ms(&self) -> Vec<u16> {
        self.rr_intervals
            .iter()
            .map(|&rr| ((rr as u32 * 1000) / 1024) as u16)
            .collect()
    }
}

/// Parse a Heart Rate Measurement notification.
pub fn parse_heart_rate_measurement(data: &[u8]) -> Result<HeartRateData, DecodeError> {
    let mut reader = FieldReader::new(data, GattProfile::HeartRate);
    let flags = reader.u8("flags")?;

    let hr_format_u16 = (flags & 0x01) != 0;
    let sensor_contact_supported = (flags & 0x04) != 0;
    let energy_expended_present = (flags & 0x08) != 0;
    let rr_interval_present = (flags & 0x10) != 0;

    let heart_rate_bpm = if hr_format_u16 {
        reader.u16("16-bit heart rate")?
    } else {
        reader.u8("8-bit heart rate")? as u16
    };

    let mut result = HeartRateData {
        heart_rate_bpm,
        sensor_contact: sensor_contact_supported && (flags & 0x02) != 0,
        ..Default::default()
    };

    if energy_expended_present {
        result.energy_expended = Some(reader.u16("energy expended")?);
    }

    if rr_interval_present {
        while reader.remaining() >= 2 {
            result.rr_intervals.push(reader.u16("rr interval")?);
        }
    }

    Ok(result)
}

/// Cumulative crank revolution counter and its event time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrankRevolutions {
    /// Cumulative crank revolutions
    pub revolutions: u16,
    /// Last crank event time in 1/1024 s
    pub event_time: u16,
}

/// Cumulative wheel revolution counter and its event time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WheelRevolutions {
    /// Cumulative wheel revolutions
    pub revolutions: u32,
    /// Last wheel event time in 1/1024 s (CSC) or 1/2048 s (Cycling Power)
    pub event_time: u16,
}

/// Parsed Cycling Power Measurement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CyclingPowerData {
    /// Instantaneous power in watts
    pub power_watts: i16,
    /// Pedal power balance (if present)
    pub power_balance: Option<u8>,
    /// Accumulated torque (if present)
    pub torque: Option<u16>,
    /// Wheel revolution data (if present)
    pub wheel: Option<WheelRevolutions>,
    /// Crank revolution data (if present)
    pub crank: Option<CrankRevolutions>,
}

/// Parse a Cycling Power Measurement notification (minimum 4 bytes).
pub fn parse_cycling_power_measurement(data: &[u8]) -> Result<CyclingPowerData, DecodeError> {
    let mut reader = FieldReader::new(data, GattProfile::CyclingPower);
    let flags = reader.u16("flags")?;
    let power_watts = reader.i16("instantaneous power")?;

    let mut result = CyclingPowerData {
        power_watts,
        ..Default::default()
    };

    // Pedal Power Balance (bit 0)
    if (flags & 0x0001) != 0 {
        result.power_balance = Some(reader.u8("pedal power balance")?);
    }

    // Accumulated Torque (bit 2)
    if (flags & 0x0004) != 0 {
        result.torque = Some(reader.u16("accumulated torque")?);
    }

    // Wheel Revolution Data (bit 4)
    if (flags & 0x0010) != 0 {
        result.wheel = Some(WheelRevolutions {
            revolutions: reader.u32("wheel revolutions")?,
            event_time: reader.u16("wheel event time")?,
        });
    }

    // Crank Revolution Data (bit 5)
    if (flags & 0x0020) != 0 {
        result.crank = Some(CrankRevolutions {
            revolutions: reader.u16("crank revolutions")?,
            event_time: reader.u16("crank event time")?,
        });
    }

    Ok(result)
}

/// Parsed CSC Measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CscMeasurement {
    /// Wheel revolution data (if present)
    pub wheel: Option<WheelRevolutions>,
    /// Crank revolution data (if present)
    pub crank: Option<CrankRevolutions>,
}

/// Parse a CSC Measurement notification.
pub fn parse_csc_measurement(data: &[u8]) -> Result<CscMeasurement, DecodeError> {
    let mut reader = FieldReader::new(data, GattProfile::CyclingSpeedCadence);
    let flags = reader.u8("flags")?;

    let wheel_present = (flags & 0x01) != 0;
    let crank_present = (flags & 0x02) != 0;

    if !wheel_present && !crank_present {
        return Err(reader.malformed("flags select neither wheel nor crank data"));
    }

    let mut result = CscMeasurement::default();

    if wheel_present {
        result.wheel = Some(WheelRevolutions {
            revolutions: reader.u32("wheel revolutions")?,
            event_time: reader.u16("wheel event time")?,
        });
    }

    if crank_present {
        result.crank = Some(CrankRevolutions {
            revolutions: reader.u16("crank revolutions")?,
            event_time: reader.u16("crank event time")?,
        });
    }

    Ok(result)
}

/// Parsed Indoor Bike Data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndoorBikeData {
    /// Instantaneous speed in km/h (if present)
    pub speed_kmh: Option<f32>,
    /// Instantaneous cadence in RPM (if present)
    pub cadence_rpm: Option<f32>,
    /// Instantaneous power in watts (if present)
    pub power_watts: Option<i16>,
    /// Heart rate in BPM (if present)
    pub heart_rate_bpm: Option<u8>,
}

/// Parse an Indoor Bike Data notification.
///
/// - Bytes 0-1: flags
/// - Remaining bytes: fields in flag order; absent fields take no space
///
/// Instantaneous speed is present when the "More Data" flag (bit 0) is clear.
pub fn parse_indoor_bike_data(data: &[u8]) -> Result<IndoorBikeData, DecodeError> {
    let mut reader = FieldReader::new(data, GattProfile::IndoorBike);
    let flags = reader.u16("flags")?;
    let mut result = IndoorBikeData::default();

    if (flags & 0x0001) == 0 {
        // 0.01 km/h units
        result.speed_kmh = Some(reader.u16("instantaneous speed")? as f32 / 100.0);
    }

    if (flags & 0x0002) != 0 {
        reader.skip(2, "average speed")?;
    }

    if (flags & 0x0004) != 0 {
        // 0.5 RPM units
        result.cadence_rpm = Some(reader.u16("instantaneous cadence")? as f32 * 0.5);
    }

    if (flags & 0x0008) != 0 {
        reader.skip(2, "average cadence")?;
    }

    if (flags & 0x0010) != 0 {
        reader.skip(3, "total distance")?;
    }

    if (flags & 0x0020) != 0 {
        reader.skip(2, "resistance level")?;
    }

    if (flags & 0x0040) != 0 {
        result.power_watts = Some(reader.i16("instantaneous power")?);
    }

    if (flags & 0x0080) != 0 {
        reader.skip(2, "average power")?;
    }

    // Total energy, energy per hour, energy per minute
    if (flags & 0x0100) != 0 {
        reader.skip(5, "expended energy")?;
    }

    if (flags & 0x0200) != 0 {
        result.heart_rate_bpm = Some(reader.u8("heart rate")?);
    }

    Ok(result)
}
