//! Device session: one BLE link per configured capability.
//!
//! A session drives a single device through
//! `Scanning -> Connecting -> Subscribing -> Streaming`, falls back to `Disconnected` when the
//! link drops and starts scanning again after the reconnect delay. It never gives up on its own;
//! only the shutdown signal ends it.
//!
//! Decoded samples go to the aggregator through the session's [`MetricWriter`], so a session can
//! only ever write the snapshot fields it owns.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};

use super::csc::WheelCalibration;
use super::decoder::SampleDecoder;
use super::transport::{BleTransport, NotificationStream};
use super::types::{
    Capability, DiscoveredSensor, GattProfile, RawNotification, ScanTarget, SensorError,
    SessionEvent, SessionState,
};
use crate::metrics::MetricWriter;
use crate::shutdown::Shutdown;

/// Session timing and targeting.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capability this session provides
    pub capability: Capability,
    /// Which device to look for
    pub target: ScanTarget,
    /// How long one scan attempt lasts
    pub scan_timeout: Duration,
    /// Pause between unsuccessful scans
    pub rescan_interval: Duration,
    /// Pause after a failed connect or subscribe
    pub retry_delay: Duration,
    /// Pause after the link drops before scanning again
    pub reconnect_delay: Duration,
    /// How often the link is checked while streaming
    pub liveness_interval: Duration,
    /// Wheel used for speed derivation
    pub calibration: WheelCalibration,
}

impl SessionConfig {
    /// Defaults for a capability and target.
    pub fn new(capability: Capability, target: ScanTarget) -> Self {
        Self {
            capability,
            target,
            scan_timeout: Duration::from_secs(10),
            rescan_interval: Duration::from_secs(5),
            retry_delay: Duration::from_secs(2),
            reconnect_delay: Duration::from_secs(5),
            liveness_interval: Duration::from_secs(1),
            calibration: WheelCalibration::default(),
        }
    }
}

/// Observer side of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    capability: Capability,
    state_rx: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch state transitions.
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Wait until the session reaches `state` or `timeout` elapses.
    pub async fn wait_for(&self, state: SessionState, timeout: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == state))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

/// Why a streaming phase ended.
#[derive(Debug)]
enum StreamEnd {
    Shutdown,
    LinkLost(SensorError),
}

/// State machine for one device.
pub struct DeviceSession<T: BleTransport> {
    config: SessionConfig,
    transport: Arc<T>,
    writer: MetricWriter,
    decoder: SampleDecoder,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl<T: BleTransport> DeviceSession<T> {
    /// Create a session and its observer handle.
    pub fn new(
        config: SessionConfig,
        transport: Arc<T>,
        writer: MetricWriter,
        events: broadcast::Sender<SessionEvent>,
    ) -> (Self, SessionHandle) {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let decoder = SampleDecoder::new(config.capability, config.calibration);
        let handle = SessionHandle {
            capability: config.capability,
            state_rx,
        };

        (
            Self {
                config,
                transport,
                writer,
                decoder,
                state_tx,
                events,
            },
            handle,
        )
    }

    fn capability(&self) -> Capability {
        self.config.capability
    }

    fn set_state(&self, state: SessionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if changed {
            tracing::debug!("{} session: {}", self.capability(), state);
            let _ = self.events.send(SessionEvent::StateChanged {
                capability: self.capability(),
                state,
            });
        }
    }

    /// Run until shutdown. Ends in `Idle` with the link released.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        tracing::info!(
            "{} session started, looking for {}",
            self.capability(),
            self.config.target
        );

        loop {
            if shutdown.is_triggered() {
                break;
            }

            self.set_state(SessionState::Scanning);
            let sensor = match self.scan(&mut shutdown).await {
                Some(Ok(Some(sensor))) => sensor,
                Some(Ok(None)) => {
                    tracing::info!(
                        "{}: no device matching {} found, retrying in {}s",
                        self.capability(),
                        self.config.target,
                        self.config.rescan_interval.as_secs()
                    );
                    if !pause(self.config.rescan_interval, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
                Some(Err(e)) => {
                    tracing::warn!("{}: scan failed: {}", self.capability(), e);
                    if !pause(self.config.rescan_interval, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
                None => break,
            };

            tracing::info!(
                "{}: found {} ({})",
                self.capability(),
                sensor.name,
                sensor.device_id
            );
            let _ = self.events.send(SessionEvent::Discovered {
                capability: self.capability(),
                sensor: sensor.clone(),
            });

            self.set_state(SessionState::Connecting);
            let connection = match self.connect(&sensor, &mut shutdown).await {
                Some(Ok(connection)) => connection,
                Some(Err(e)) => {
                    tracing::warn!(
                        "{}: failed to connect to {}: {}",
                        self.capability(),
                        sensor.name,
                        e
                    );
                    self.set_state(SessionState::Disconnected);
                    if !pause(self.config.retry_delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
                None => break,
            };

            // Reconnect to the same device even if it later advertises under another name
            self.config.target.device_id = Some(sensor.device_id.clone());

            self.set_state(SessionState::Subscribing);
            let (profile, notifications) = match self.subscribe(&connection).await {
                Ok(subscribed) => subscribed,
                Err(e) => {
                    tracing::warn!("{}: failed to subscribe: {}", self.capability(), e);
                    self.release(&connection).await;
                    self.set_state(SessionState::Disconnected);
                    if !pause(self.config.retry_delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            self.decoder.reset();
            tracing::info!(
                "{}: streaming {} from {}",
                self.capability(),
                profile,
                sensor.name
            );
            self.set_state(SessionState::Streaming);

            let end = self
                .stream(&connection, profile, notifications, &mut shutdown)
                .await;
            self.release(&connection).await;

            let lost = match end {
                StreamEnd::Shutdown => break,
                StreamEnd::LinkLost(e) => e,
            };

            tracing::warn!(
                "{}: lost link to {} ({}), reconnecting in {}s",
                self.capability(),
                sensor.name,
                lost,
                self.config.reconnect_delay.as_secs()
            );
            self.set_state(SessionState::Disconnected);
            if !pause(self.config.reconnect_delay, &mut shutdown).await {
                break;
            }
        }

        self.set_state(SessionState::Idle);
        tracing::info!("{} session stopped", self.capability());
    }

    /// `None` means shutdown was requested while scanning.
    async fn scan(
        &self,
        shutdown: &mut Shutdown,
    ) -> Option<Result<Option<DiscoveredSensor>, SensorError>> {
        tokio::select! {
            _ = shutdown.wait() => None,
            result = self.transport.scan(&self.config.target, self.config.scan_timeout) => Some(result),
        }
    }

    async fn connect(
        &self,
        sensor: &DiscoveredSensor,
        shutdown: &mut Shutdown,
    ) -> Option<Result<T::Connection, SensorError>> {
        tokio::select! {
            _ = shutdown.wait() => None,
            result = self.transport.connect(sensor) => Some(result),
        }
    }

    /// Subscribe to the first supported profile the device exposes.
    async fn subscribe(
        &self,
        connection: &T::Connection,
    ) -> Result<(GattProfile, NotificationStream), SensorError> {
        let mut last_error = None;

        for profile in self.capability().profiles() {
            match self
                .transport
                .subscribe(
                    connection,
                    profile.service_uuid(),
                    profile.characteristic_uuid(),
                )
                .await
            {
                Ok(stream) => return Ok((*profile, stream)),
                Err(e) => {
                    tracing::debug!("{}: {} unavailable: {}", self.capability(), profile, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SensorError::SubscribeFailed(format!("no profile for {}", self.capability()))
        }))
    }

    async fn stream(
        &mut self,
        connection: &T::Connection,
        profile: GattProfile,
        mut notifications: NotificationStream,
        shutdown: &mut Shutdown,
    ) -> StreamEnd {
        let mut liveness = tokio::time::interval_at(
            Instant::now() + self.config.liveness_interval,
            self.config.liveness_interval,
        );
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait() => return StreamEnd::Shutdown,
                payload = notifications.next() => match payload {
                    Some(payload) => self.handle_notification(profile, payload),
                    None => {
                        return StreamEnd::LinkLost(SensorError::TransportDisconnected(
                            "notification stream ended".to_string(),
                        ))
                    }
                },
                _ = liveness.tick() => {
                    if !self.transport.is_connected(connection).await {
                        return StreamEnd::LinkLost(SensorError::TransportDisconnected(
                            "liveness check failed".to_string(),
                        ));
                    }
                }
            }
        }
    }

    fn handle_notification(&mut self, profile: GattProfile, payload: Vec<u8>) {
        let notification = RawNotification::new(self.capability(), profile, payload);

        match self.decoder.decode(&notification) {
            Ok(Some(sample)) => {
                self.writer.apply(&sample);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(
                    "{}: dropped notification [{}]: {}",
                    self.capability(),
                    hex(&notification.payload),
                    e
                );
                let _ = self.events.send(SessionEvent::SampleRejected {
                    capability: self.capability(),
                    error: e.to_string(),
                });
            }
        }
    }

    async fn release(&self, connection: &T::Connection) {
        if let Err(e) = self.transport.disconnect(connection).await {
            tracing::debug!("{}: disconnect failed: {}", self.capability(), e);
        }
    }
}

/// Sleep for `duration`; false if shutdown came first.
async fn pause(duration: Duration, shutdown: &mut Shutdown) -> bool {
    tokio::select! {
        _ = shutdown.wait() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
