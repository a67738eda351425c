//! BLE sensor side of the bridge: discovery, GATT decoding and per-device sessions.

pub mod btle;
pub mod csc;
pub mod decoder;
pub mod gatt;
pub mod session;
pub mod simulated;
pub mod transport;
pub mod types;

pub use btle::BtleplugTransport;
pub use csc::WheelCalibration;
pub use decoder::SampleDecoder;
pub use gatt::DecodeError;
pub use session::{DeviceSession, SessionConfig, SessionHandle};
pub use simulated::{SimulatedRide, SimulatedSensor, SimulatedTransport};
pub use transport::{BleTransport, NotificationStream};
pub use types::{
    Capability, DecodedSample, DiscoveredSensor, GattProfile, RawNotification, ScanTarget,
    SensorError, SessionEvent, SessionState,
};
