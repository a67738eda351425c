//! btleplug-backed BLE transport.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::transport::{BleTransport, NotificationStream};
use super::types::{DiscoveredSensor, ScanTarget, SensorError};

/// Number of scans running on a shared adapter.
///
/// The adapter only scans once: the first caller starts it and the last one to
/// finish stops it.
#[derive(Clone, Default)]
struct ScanCount {
    active: Arc<Mutex<usize>>,
}

impl ScanCount {
    async fn acquire<F, Fut, E>(&self, start: F) -> Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let mut active = self.active.lock().await;
        if *active == 0 {
            start().await?;
        }
        *active += 1;
        Ok(())
    }

    async fn release<F, Fut, E>(&self, stop: F) -> Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let mut active = self.active.lock().await;
        if *active == 0 {
            return Ok(());
        }
        *active -= 1;
        if *active == 0 {
            stop().await?;
        }
        Ok(())
    }
}

/// Transport over the first BLE adapter of the host.
#[derive(Clone)]
pub struct BtleplugTransport {
    adapter: Adapter,
    scans: ScanCount,
}

impl BtleplugTransport {
    /// Initialize the BLE adapter.
    pub async fn new() -> Result<Self, SensorError> {
        tracing::info!("Initializing BLE adapter");

        let manager = Manager::new()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?;

        let adapter = manager
            .adapters()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?
            .into_iter()
            .next()
            .ok_or(SensorError::AdapterNotFound)?;

        tracing::info!("BLE adapter initialized");
        Ok(Self {
            adapter,
            scans: ScanCount::default(),
        })
    }

    async fn start_scan(&self) -> Result<(), SensorError> {
        self.scans
            .acquire(|| async {
                tracing::debug!("Starting BLE scan");
                self.adapter
                    .start_scan(ScanFilter::default())
                    .await
                    .map_err(|e| SensorError::ScanFailed(e.to_string()))
            })
            .await
    }

    async fn stop_scan(&self) {
        let stopped = self
            .scans
            .release(|| async {
                tracing::debug!("Stopping BLE scan");
                self.adapter.stop_scan().await
            })
            .await;
        if let Err(e) = stopped {
            tracing::debug!("Failed to stop scan: {}", e);
        }
    }

    /// Scan for `duration` and return every named device seen.
    pub async fn list_nearby(&self, duration: Duration) -> Result<Vec<DiscoveredSensor>, SensorError> {
        self.start_scan().await?;
        tokio::time::sleep(duration).await;

        let peripherals = self.adapter.peripherals().await;
        self.stop_scan().await;
        let peripherals = peripherals.map_err(|e| SensorError::ScanFailed(e.to_string()))?;

        let mut sensors = Vec::new();
        for peripheral in peripherals {
            if let Some(sensor) = describe(&peripheral).await {
                sensors.push(sensor);
            }
        }
        sensors.sort_by(|a, b| b.signal_strength.cmp(&a.signal_strength));
        Ok(sensors)
    }

    async fn find_known(&self, target: &ScanTarget) -> Option<DiscoveredSensor> {
        let peripherals = self.adapter.peripherals().await.ok()?;
        for peripheral in peripherals {
            if let Some(sensor) = describe(&peripheral).await {
                if target.matches(&sensor.device_id, Some(&sensor.name)) {
                    return Some(sensor);
                }
            }
        }
        None
    }

    async fn wait_for_match(&self, target: &ScanTarget) -> Result<DiscoveredSensor, SensorError> {
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| SensorError::ScanFailed(e.to_string()))?;

        while let Some(event) = events.next().await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => continue,
            };

            let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                continue;
            };

            if let Some(sensor) = describe(&peripheral).await {
                if target.matches(&sensor.device_id, Some(&sensor.name)) {
                    return Ok(sensor);
                }
            }
        }

        Err(SensorError::ScanFailed("adapter event stream ended".to_string()))
    }

    async fn find_peripheral(&self, device_id: &str) -> Result<Peripheral, SensorError> {
        self.adapter
            .peripherals()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?
            .into_iter()
            .find(|p| p.id().to_string() == device_id)
            .ok_or_else(|| SensorError::SensorNotFound(device_id.to_string()))
    }
}

/// Identity of a peripheral, if it advertises a name.
async fn describe(peripheral: &Peripheral) -> Option<DiscoveredSensor> {
    let properties = peripheral.properties().await.ok()??;
    let name = properties.local_name?;

    Some(DiscoveredSensor {
        device_id: peripheral.id().to_string(),
        name,
        signal_strength: properties.rssi,
    })
}

impl BleTransport for BtleplugTransport {
    type Connection = Peripheral;

    async fn scan(
        &self,
        target: &ScanTarget,
        timeout: Duration,
    ) -> Result<Option<DiscoveredSensor>, SensorError> {
        self.start_scan().await?;

        let found = match self.find_known(target).await {
            Some(sensor) => Ok(Some(sensor)),
            None => match tokio::time::timeout(timeout, self.wait_for_match(target)).await {
                Ok(result) => result.map(Some),
                Err(_) => Ok(None),
            },
        };

        self.stop_scan().await;
        found
    }

    async fn connect(&self, sensor: &DiscoveredSensor) -> Result<Peripheral, SensorError> {
        let peripheral = self.find_peripheral(&sensor.device_id).await?;

        peripheral
            .connect()
            .await
            .map_err(|e| SensorError::ConnectFailed(e.to_string()))?;

        peripheral
            .discover_services()
            .await
            .map_err(|e| SensorError::ConnectFailed(e.to_string()))?;

        Ok(peripheral)
    }

    async fn subscribe(
        &self,
        connection: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream, SensorError> {
        let target = connection
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or(SensorError::CharacteristicNotFound(characteristic))?;

        connection
            .subscribe(&target)
            .await
            .map_err(|e| SensorError::SubscribeFailed(e.to_string()))?;

        tracing::debug!("Subscribed to characteristic: {}", characteristic);

        let notifications = connection
            .notifications()
            .await
            .map_err(|e| SensorError::SubscribeFailed(e.to_string()))?;

        let stream = notifications
            .filter(move |n| futures::future::ready(n.uuid == characteristic))
            .map(|n| n.value);

        Ok(Box::pin(stream))
    }

    async fn is_connected(&self, connection: &Peripheral) -> bool {
        connection.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self, connection: &Peripheral) -> Result<(), SensorError> {
        connection
            .disconnect()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))
    }
}
