//! BLE transport seam.
//!
//! Device sessions talk to the radio only through [`BleTransport`]. The production binding is
//! [`super::btle::BtleplugTransport`]; tests and `--simulate` use
//! [`super::simulated::SimulatedTransport`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use uuid::Uuid;

use super::types::{DiscoveredSensor, ScanTarget, SensorError};

/// Stream of raw notification payloads from one subscribed characteristic.
///
/// The stream ends when the link drops.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Central-role BLE operations needed by a device session.
pub trait BleTransport: Send + Sync + 'static {
    /// Live link to a peripheral
    type Connection: Send + Sync + 'static;

    /// Scan until a device matching `target` is seen or `timeout` elapses.
    fn scan(
        &self,
        target: &ScanTarget,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<DiscoveredSensor>, SensorError>> + Send;

    /// Connect to a discovered device and run GATT discovery.
    fn connect(
        &self,
        sensor: &DiscoveredSensor,
    ) -> impl Future<Output = Result<Self::Connection, SensorError>> + Send;

    /// Enable notifications on a characteristic.
    fn subscribe(
        &self,
        connection: &Self::Connection,
        service: Uuid,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<NotificationStream, SensorError>> + Send;

    /// Whether the link is still up.
    fn is_connected(&self, connection: &Self::Connection) -> impl Future<Output = bool> + Send;

    /// Tear down the link.
    fn disconnect(
        &self,
        connection: &Self::Connection,
    ) -> impl Future<Output = Result<(), SensorError>> + Send;
}
