//! In-process BLE stand-in.
//!
//! Simulated sensors advertise a name and a set of GATT characteristics, can refuse connections,
//! drop their link and push notification payloads. Used by the test suite and by the binary's
//! `--simulate` mode to feed consumers without hardware.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use super::transport::{BleTransport, NotificationStream};
use super::types::{DiscoveredSensor, GattProfile, ScanTarget, SensorError};
use crate::shutdown::Shutdown;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct SensorInner {
    device_id: String,
    name: String,
    characteristics: HashSet<(Uuid, Uuid)>,
    advertising: AtomicBool,
    refuse_connects: AtomicU32,
    connects: AtomicU32,
    generation: AtomicU64,
    link: Mutex<Option<broadcast::Sender<(Uuid, Vec<u8>)>>>,
}

/// A fake peripheral.
#[derive(Clone)]
pub struct SimulatedSensor {
    inner: Arc<SensorInner>,
}

impl SimulatedSensor {
    /// A sensor exposing the measurement characteristics of `profiles`.
    pub fn new(name: impl Into<String>, profiles: &[GattProfile]) -> Self {
        let characteristics = profiles
            .iter()
            .map(|p| (p.service_uuid(), p.characteristic_uuid()))
            .collect();

        Self {
            inner: Arc::new(SensorInner {
                device_id: Uuid::new_v4().to_string(),
                name: name.into(),
                characteristics,
                advertising: AtomicBool::new(true),
                refuse_connects: AtomicU32::new(0),
                connects: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                link: Mutex::new(None),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Start or stop advertising (asleep / out of range).
    pub fn set_advertising(&self, advertising: bool) {
        self.inner.advertising.store(advertising, Ordering::SeqCst);
    }

    /// Make the next `count` connection attempts fail.
    pub fn refuse_next_connects(&self, count: u32) {
        self.inner.refuse_connects.store(count, Ordering::SeqCst);
    }

    /// Successful connections so far.
    pub fn connect_count(&self) -> u32 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Whether a central currently holds a link.
    pub fn is_linked(&self) -> bool {
        self.lock_link().is_some()
    }

    /// Push a notification on `profile`'s characteristic. Returns false without a subscriber.
    pub fn notify(&self, profile: GattProfile, payload: Vec<u8>) -> bool {
        match self.lock_link().as_ref() {
            Some(tx) => tx.send((profile.characteristic_uuid(), payload)).is_ok(),
            None => false,
        }
    }

    /// Drop the link as if the sensor went out of range; open streams end.
    pub fn drop_link(&self) {
        self.lock_link().take();
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, Option<broadcast::Sender<(Uuid, Vec<u8>)>>> {
        self.inner.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn discovered(&self) -> DiscoveredSensor {
        DiscoveredSensor {
            device_id: self.inner.device_id.clone(),
            name: self.inner.name.clone(),
            signal_strength: Some(-60),
        }
    }
}

/// Link handle returned by [`SimulatedTransport::connect`].
pub struct SimulatedConnection {
    sensor: SimulatedSensor,
    generation: u64,
}

impl SimulatedConnection {
    fn is_current(&self) -> bool {
        self.sensor.inner.generation.load(Ordering::SeqCst) == self.generation
            && self.sensor.is_linked()
    }
}

/// Transport over a set of simulated sensors.
#[derive(Clone, Default)]
pub struct SimulatedTransport {
    sensors: Arc<Mutex<Vec<SimulatedSensor>>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a sensor visible to scans.
    pub fn add_sensor(&self, sensor: SimulatedSensor) {
        self.sensors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sensor);
    }

    fn find(&self, target: &ScanTarget) -> Option<SimulatedSensor> {
        self.sensors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|s| {
                s.inner.advertising.load(Ordering::SeqCst)
                    && target.matches(s.device_id(), Some(s.name()))
            })
            .cloned()
    }

    fn by_id(&self, device_id: &str) -> Option<SimulatedSensor> {
        self.sensors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|s| s.device_id() == device_id)
            .cloned()
    }
}

impl BleTransport for SimulatedTransport {
    type Connection = SimulatedConnection;

    async fn scan(
        &self,
        target: &ScanTarget,
        timeout: Duration,
    ) -> Result<Option<DiscoveredSensor>, SensorError> {
        let search = async {
            loop {
                if let Some(sensor) = self.find(target) {
                    return sensor.discovered();
                }
                tokio::time::sleep(SCAN_POLL_INTERVAL).await;
            }
        };

        Ok(tokio::time::timeout(timeout, search).await.ok())
    }

    async fn connect(&self, sensor: &DiscoveredSensor) -> Result<SimulatedConnection, SensorError> {
        let sim = self
            .by_id(&sensor.device_id)
            .ok_or_else(|| SensorError::SensorNotFound(sensor.device_id.clone()))?;

        if !sim.inner.advertising.load(Ordering::SeqCst) {
            return Err(SensorError::ConnectFailed("device out of range".to_string()));
        }

        let refused = sim
            .inner
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SensorError::ConnectFailed("connection refused".to_string()));
        }

        let (tx, _) = broadcast::channel(256);
        *sim.lock_link() = Some(tx);
        let generation = sim.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        sim.inner.connects.fetch_add(1, Ordering::SeqCst);

        Ok(SimulatedConnection {
            sensor: sim,
            generation,
        })
    }

    async fn subscribe(
        &self,
        connection: &SimulatedConnection,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream, SensorError> {
        if !connection
            .sensor
            .inner
            .characteristics
            .contains(&(service, characteristic))
        {
            return Err(SensorError::CharacteristicNotFound(characteristic));
        }

        let rx = match connection.sensor.lock_link().as_ref() {
            Some(tx)
                if connection.sensor.inner.generation.load(Ordering::SeqCst)
                    == connection.generation =>
            {
                tx.subscribe()
            }
            _ => return Err(SensorError::SubscribeFailed("link is down".to_string())),
        };

        let stream = futures::stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok((uuid, payload)) if uuid == characteristic => return Some((payload, rx)),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn is_connected(&self, connection: &SimulatedConnection) -> bool {
        connection.is_current()
    }

    async fn disconnect(&self, connection: &SimulatedConnection) -> Result<(), SensorError> {
        if connection.is_current() {
            connection.sensor.drop_link();
        }
        Ok(())
    }
}

/// Builders for real GATT notification payloads.
pub mod payloads {
    /// Heart Rate Measurement, 8-bit format.
    pub fn heart_rate(bpm: u8) -> Vec<u8> {
        vec![0x00, bpm]
    }

    /// Heart Rate Measurement with RR intervals (1/1024 s units).
    pub fn heart_rate_with_rr(bpm: u8, rr_intervals: &[u16]) -> Vec<u8> {
        let mut data = vec![0x10, bpm];
        for rr in rr_intervals {
            data.extend_from_slice(&rr.to_le_bytes());
        }
        data
    }

    /// Cycling Power Measurement with no optional fields.
    pub fn cycling_power(watts: i16) -> Vec<u8> {
        let mut data = vec![0x00, 0x00];
        data.extend_from_slice(&watts.to_le_bytes());
        data
    }

    /// Cycling Power Measurement carrying crank revolution data.
    pub fn cycling_power_with_crank(watts: i16, crank_revs: u16, crank_time: u16) -> Vec<u8> {
        let mut data = vec![0x20, 0x00];
        data.extend_from_slice(&watts.to_le_bytes());
        data.extend_from_slice(&crank_revs.to_le_bytes());
        data.extend_from_slice(&crank_time.to_le_bytes());
        data
    }

    /// CSC Measurement with optional (revolutions, event time) blocks.
    pub fn csc(wheel: Option<(u32, u16)>, crank: Option<(u16, u16)>) -> Vec<u8> {
        let mut flags = 0u8;
        let mut body = Vec::new();

        if let Some((revs, time)) = wheel {
            flags |= 0x01;
            body.extend_from_slice(&revs.to_le_bytes());
            body.extend_from_slice(&time.to_le_bytes());
        }
        if let Some((revs, time)) = crank {
            flags |= 0x02;
            body.extend_from_slice(&revs.to_le_bytes());
            body.extend_from_slice(&time.to_le_bytes());
        }

        let mut data = vec![flags];
        data.extend(body);
        data
    }

    /// Indoor Bike Data with speed, cadence and power.
    pub fn indoor_bike(speed_kmh: f32, cadence_rpm: f32, watts: i16) -> Vec<u8> {
        let mut data = vec![0x44, 0x00];
        data.extend_from_slice(&((speed_kmh * 100.0).round() as u16).to_le_bytes());
        data.extend_from_slice(&((cadence_rpm * 2.0).round() as u16).to_le_bytes());
        data.extend_from_slice(&watts.to_le_bytes());
        data
    }
}

/// Baseline values the simulated rider oscillates around.
#[derive(Debug, Clone, Copy)]
pub struct RideProfile {
    pub power_w: f64,
    pub cadence_rpm: f64,
    pub speed_kmh: f64,
    pub heart_rate_bpm: f64,
    pub wheel_circumference_m: f64,
}

impl Default for RideProfile {
    fn default() -> Self {
        Self {
            power_w: 150.0,
            cadence_rpm: 80.0,
            speed_kmh: 25.0,
            heart_rate_bpm: 140.0,
            wheel_circumference_m: 2.105,
        }
    }
}

/// Simulated power meter, CSC sensor and heart strap driven by a slow sine ride.
pub struct SimulatedRide {
    pub power: SimulatedSensor,
    pub cadence_speed: SimulatedSensor,
    pub heart_rate: SimulatedSensor,
    profile: RideProfile,
}

impl SimulatedRide {
    /// Create the three sensors and register them with `transport`.
    pub fn install(transport: &SimulatedTransport, names: [&str; 3], profile: RideProfile) -> Self {
        let ride = Self {
            power: SimulatedSensor::new(names[0], &[GattProfile::CyclingPower]),
            cadence_speed: SimulatedSensor::new(names[1], &[GattProfile::CyclingSpeedCadence]),
            heart_rate: SimulatedSensor::new(names[2], &[GattProfile::HeartRate]),
            profile,
        };

        transport.add_sensor(ride.power.clone());
        transport.add_sensor(ride.cadence_speed.clone());
        transport.add_sensor(ride.heart_rate.clone());
        ride
    }

    /// Emit notifications (power and CSC at 4 Hz, heart rate at 1 Hz) until shutdown.
    pub async fn run(self, mut shutdown: Shutdown) {
        let period = Duration::from_millis(250);
        let mut ticker = tokio::time::interval(period);
        let mut elapsed = 0.0f64;
        let mut wheel_revs = 0.0f64;
        let mut crank_revs = 0.0f64;
        let mut wheel_event = (0u32, 0u16);
        let mut crank_event = (0u64, 0u16);
        let mut tick: u64 = 0;

        tracing::info!("Simulated ride started");

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }

            let dt = period.as_secs_f64();
            elapsed += dt;
            tick += 1;

            let p = &self.profile;
            let power = p.power_w + (elapsed * 0.3).sin() * 30.0;
            let cadence = p.cadence_rpm + (elapsed * 0.5).sin() * 10.0;
            let speed = p.speed_kmh + (elapsed * 0.3).sin() * 5.0;
            let heart_rate = p.heart_rate_bpm + (elapsed * 0.2).sin() * 10.0;

            let wheel_rate = speed / 3.6 / p.wheel_circumference_m;
            let crank_rate = cadence / 60.0;
            wheel_revs += wheel_rate * dt;
            crank_revs += crank_rate * dt;

            // Event times mark the last whole revolution, as real sensors report them
            if wheel_revs as u32 != wheel_event.0 {
                wheel_event = (
                    wheel_revs as u32,
                    event_time(elapsed - wheel_revs.fract() / wheel_rate),
                );
            }
            if crank_revs as u64 != crank_event.0 {
                crank_event = (
                    crank_revs as u64,
                    event_time(elapsed - crank_revs.fract() / crank_rate),
                );
            }

            self.power.notify(
                GattProfile::CyclingPower,
                payloads::cycling_power(power.max(0.0) as i16),
            );
            self.cadence_speed.notify(
                GattProfile::CyclingSpeedCadence,
                payloads::csc(
                    Some(wheel_event),
                    Some(((crank_event.0 % 65_536) as u16, crank_event.1)),
                ),
            );

            if tick % 4 == 0 {
                self.heart_rate
                    .notify(GattProfile::HeartRate, payloads::heart_rate(heart_rate as u8));
            }

            if tick % 20 == 0 {
                tracing::debug!(
                    "Simulated ride: {:.0} W, {:.0} rpm, {:.1} km/h, {:.0} bpm",
                    power,
                    cadence,
                    speed,
                    heart_rate
                );
            }
        }

        tracing::info!("Simulated ride stopped");
    }
}

/// Seconds to a 1/1024 s rolling event time.
fn event_time(seconds: f64) -> u16 {
    ((seconds.max(0.0) * 1024.0) as u64 % 65_536) as u16
}
