//! RideBridge - BLE fitness telemetry bridge
//!
//! Connects to a power meter or smart trainer, an optional speed/cadence sensor and a heart rate
//! strap over Bluetooth Low Energy, merges their notifications into one snapshot and streams it
//! to local WebSocket consumers (game engines, overlays, loggers) at a fixed rate.

pub mod bridge;
pub mod config;
pub mod metrics;
pub mod sensors;
pub mod shutdown;
pub mod streaming;

// Re-export commonly used types
pub use bridge::{Bridge, BridgeError};
pub use config::{BridgeConfig, ConfigError};
pub use metrics::{MetricAggregator, Snapshot};
pub use sensors::{BleTransport, BtleplugTransport, SimulatedTransport};
pub use streaming::Encoding;
