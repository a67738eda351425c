//! Sensor types and enums for BLE fitness sensors.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use super::gatt;

/// Metric family a sensor session is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Power meter or smart trainer
    Power,
    /// Combined (or single) speed/cadence sensor
    CadenceSpeed,
    /// Heart rate monitor
    HeartRate,
}

impl Capability {
    /// All capabilities, in session start order.
    pub const ALL: [Capability; 3] = [
        Capability::Power,
        Capability::CadenceSpeed,
        Capability::HeartRate,
    ];

    /// GATT profiles this capability can stream from, in preference order.
    pub fn profiles(&self) -> &'static [GattProfile] {
        match self {
            Capability::Power => &[GattProfile::CyclingPower, GattProfile::IndoorBike],
            Capability::CadenceSpeed => &[GattProfile::CyclingSpeedCadence],
            Capability::HeartRate => &[GattProfile::HeartRate],
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Power => write!(f, "Power"),
            Capability::CadenceSpeed => write!(f, "Speed/Cadence"),
            Capability::HeartRate => write!(f, "Heart Rate"),
        }
    }
}

/// GATT characteristic formats understood by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GattProfile {
    /// Cycling Power Measurement (0x2A63)
    CyclingPower,
    /// CSC Measurement (0x2A5B)
    CyclingSpeedCadence,
    /// Heart Rate Measurement (0x2A37)
    HeartRate,
    /// FTMS Indoor Bike Data (0x2AD2)
    IndoorBike,
}

impl GattProfile {
    /// Service that hosts this profile's measurement characteristic.
    pub fn service_uuid(&self) -> Uuid {
        match self {
            GattProfile::CyclingPower => gatt::CYCLING_POWER_SERVICE_UUID,
            GattProfile::CyclingSpeedCadence => gatt::CSC_SERVICE_UUID,
            GattProfile::HeartRate => gatt::HEART_RATE_SERVICE_UUID,
            GattProfile::IndoorBike => gatt::FTMS_SERVICE_UUID,
        }
    }

    /// Measurement characteristic that notifies samples.
    pub fn characteristic_uuid(&self) -> Uuid {
        match self {
            GattProfile::CyclingPower => gatt::CYCLING_POWER_MEASUREMENT_UUID,
            GattProfile::CyclingSpeedCadence => gatt::CSC_MEASUREMENT_UUID,
            GattProfile::HeartRate => gatt::HEART_RATE_MEASUREMENT_UUID,
            GattProfile::IndoorBike => gatt::INDOOR_BIKE_DATA_UUID,
        }
    }
}

impl std::fmt::Display for GattProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GattProfile::CyclingPower => write!(f, "Cycling Power"),
            GattProfile::CyclingSpeedCadence => write!(f, "Cycling Speed/Cadence"),
            GattProfile::HeartRate => write!(f, "Heart Rate"),
            GattProfile::IndoorBike => write!(f, "FTMS Indoor Bike"),
        }
    }
}

/// Lifecycle state of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not started yet
    #[default]
    Idle,
    /// Looking for a matching advertisement
    Scanning,
    /// Transport-level connect in progress
    Connecting,
    /// GATT discovery and notify subscription
    Subscribing,
    /// Receiving notifications
    Streaming,
    /// Link lost, waiting for the reconnect timer
    Disconnected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Scanning => write!(f, "Scanning..."),
            SessionState::Connecting => write!(f, "Connecting..."),
            SessionState::Subscribing => write!(f, "Subscribing..."),
            SessionState::Streaming => write!(f, "Streaming"),
            SessionState::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// A sensor found during BLE scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredSensor {
    /// BLE device address/identifier
    pub device_id: String,
    /// Advertised local name
    pub name: String,
    /// Signal strength (RSSI)
    pub signal_strength: Option<i16>,
}

/// How a session picks its device out of the advertisements it sees.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanTarget {
    /// Case-insensitive substring of the advertised name
    pub name_filter: Option<String>,
    /// Known device identity; wins over the name filter
    pub device_id: Option<String>,
}

impl ScanTarget {
    /// Target matching advertised names containing `filter`.
    pub fn by_name(filter: impl Into<String>) -> Self {
        Self {
            name_filter: Some(filter.into()),
            device_id: None,
        }
    }

    /// Whether an advertisement with this identity and name is ours.
    pub fn matches(&self, device_id: &str, name: Option<&str>) -> bool {
        if let Some(id) = &self.device_id {
            return id.eq_ignore_ascii_case(device_id);
        }

        match (&self.name_filter, name) {
            (Some(filter), Some(name)) => name.to_uppercase().contains(&filter.to_uppercase()),
            (None, _) => true,
            (Some(_), None) => false,
        }
    }
}

impl std::fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.device_id, &self.name_filter) {
            (Some(id), _) => write!(f, "device {}", id),
            (None, Some(filter)) => write!(f, "name containing '{}'", filter),
            (None, None) => write!(f, "any device"),
        }
    }
}

/// A characteristic notification as it arrives from the radio.
#[derive(Debug, Clone)]
pub struct RawNotification {
    /// Session capability that received it
    pub capability: Capability,
    /// Format of the payload
    pub profile: GattProfile,
    /// Notification bytes
    pub payload: Vec<u8>,
    /// Arrival time
    pub received_at: Instant,
}

impl RawNotification {
    /// Wrap a payload received now.
    pub fn new(capability: Capability, profile: GattProfile, payload: Vec<u8>) -> Self {
        Self {
            capability,
            profile,
            payload,
            received_at: Instant::now(),
        }
    }
}

/// Partial metric update decoded from one notification.
///
/// `None` means the notification did not carry that metric; it never stands in for zero.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSample {
    /// Session capability that produced the sample
    pub capability: Capability,
    /// Instantaneous power in watts (clamped to >= 0)
    pub power_w: Option<u16>,
    /// Cadence in RPM
    pub cadence_rpm: Option<f32>,
    /// Speed in km/h
    pub speed_kmh: Option<f32>,
    /// Heart rate in BPM
    pub heart_rate_bpm: Option<u16>,
    /// RR intervals in milliseconds, oldest first
    pub rr_intervals_ms: Vec<u16>,
    /// Wall-clock arrival time in seconds since the Unix epoch
    pub timestamp: f64,
    /// Monotonic arrival time
    pub received_at: Instant,
}

impl DecodedSample {
    /// Empty sample for a notification received at `received_at`.
    pub fn empty(capability: Capability, received_at: Instant) -> Self {
        Self {
            capability,
            power_w: None,
            cadence_rpm: None,
            speed_kmh: None,
            heart_rate_bpm: None,
            rr_intervals_ms: Vec::new(),
            timestamp: wall_clock_secs(),
            received_at,
        }
    }

    /// True when no metric field is present.
    pub fn is_empty(&self) -> bool {
        self.power_w.is_none()
            && self.cadence_rpm.is_none()
            && self.speed_kmh.is_none()
            && self.heart_rate_bpm.is_none()
    }
}

/// Seconds since the Unix epoch, with sub-second precision.
pub fn wall_clock_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Events published by device sessions.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Session moved to a new state
    StateChanged {
        capability: Capability,
        state: SessionState,
    },
    /// Scanning matched a device
    Discovered {
        capability: Capability,
        sensor: DiscoveredSensor,
    },
    /// A notification could not be decoded
    SampleRejected {
        capability: Capability,
        error: String,
    },
}

/// Errors that can occur talking to sensors.
#[derive(Debug, Error)]
pub enum SensorError {
    /// BLE adapter not found or unavailable
    #[error("Bluetooth adapter not found")]
    AdapterNotFound,

    /// Failed to start or run BLE scanning
    #[error("Failed to scan: {0}")]
    ScanFailed(String),

    /// Sensor not found with given device ID
    #[error("Sensor not found: {0}")]
    SensorNotFound(String),

    /// Connection to sensor failed
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The connected sensor does not expose the characteristic
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    /// Failed to subscribe to sensor notifications
    #[error("Failed to subscribe to notifications: {0}")]
    SubscribeFailed(String),

    /// Sensor link dropped
    #[error("Sensor disconnected: {0}")]
    TransportDisconnected(String),

    /// Generic BLE error
    #[error("BLE error: {0}")]
    BleError(String),
}
