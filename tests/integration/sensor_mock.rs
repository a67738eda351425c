//! Shared test rig: simulated trainer and heart strap wired through real sessions, aggregator,
//! watchdog and broadcast registry, without any network.

use std::sync::Arc;
use std::time::Duration;

use ridebridge::metrics::{FieldSet, MetricAggregator, StallWatchdog, WatchdogConfig};
use ridebridge::sensors::session::{DeviceSession, SessionConfig, SessionHandle};
use ridebridge::sensors::simulated::payloads;
use ridebridge::sensors::types::{Capability, GattProfile, ScanTarget, SessionState};
use ridebridge::sensors::{SimulatedSensor, SimulatedTransport};
use ridebridge::shutdown::{self, ShutdownTrigger};
use ridebridge::streaming::{BroadcastHub, ConsumerRegistry, RegistryConfig};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const TRAINER_NAME: &str = "Wahoo KICKR 1A2B";
pub const STRAP_NAME: &str = "TICKR 3C4D";

/// Watchdog timing used by most tests.
pub fn watchdog_config() -> WatchdogConfig {
    WatchdogConfig {
        cycling_timeout: Duration::from_millis(1200),
        heart_rate_stale_after: Duration::from_secs(5),
        check_interval: Duration::from_millis(250),
    }
}

fn session_config(capability: Capability, name: &str) -> SessionConfig {
    SessionConfig {
        scan_timeout: Duration::from_millis(500),
        rescan_interval: Duration::from_millis(200),
        retry_delay: Duration::from_millis(200),
        reconnect_delay: Duration::from_millis(500),
        liveness_interval: Duration::from_millis(200),
        ..SessionConfig::new(capability, ScanTarget::by_name(name))
    }
}

/// A running in-process bridge pipeline.
pub struct Rig {
    pub trainer: SimulatedSensor,
    pub strap: SimulatedSensor,
    pub aggregator: Arc<MetricAggregator>,
    pub registry: Arc<ConsumerRegistry>,
    pub sessions: Vec<SessionHandle>,
    trigger: ShutdownTrigger,
    tasks: Vec<JoinHandle<()>>,
}

impl Rig {
    /// Start sessions, watchdog and hub (50 ms tick).
    pub async fn start(watchdog: WatchdogConfig) -> Rig {
        let transport = Arc::new(SimulatedTransport::new());
        let trainer = SimulatedSensor::new(TRAINER_NAME, &[GattProfile::IndoorBike]);
        let strap = SimulatedSensor::new(STRAP_NAME, &[GattProfile::HeartRate]);
        transport.add_sensor(trainer.clone());
        transport.add_sensor(strap.clone());

        let aggregator = MetricAggregator::new(&watchdog);
        let registry = Arc::new(ConsumerRegistry::new(RegistryConfig {
            queue_capacity: 64,
            max_consecutive_drops: 1000,
        }));
        let (trigger, signal) = shutdown::channel();
        let (events, _) = broadcast::channel(64);
        let mut tasks = Vec::new();
        let mut sessions = Vec::new();

        for (capability, name, fields) in [
            (
                Capability::Power,
                "KICKR",
                FieldSet::POWER | FieldSet::CADENCE_SPEED,
            ),
            (Capability::HeartRate, "TICKR", FieldSet::HEART_RATE),
        ] {
            let writer = aggregator.writer(fields).unwrap();
            let (session, handle) = DeviceSession::new(
                session_config(capability, name),
                Arc::clone(&transport),
                writer,
                events.clone(),
            );
            sessions.push(handle);
            tasks.push(tokio::spawn(session.run(signal.clone())));
        }

        tasks.push(tokio::spawn(
            StallWatchdog::new(Arc::clone(&aggregator), &watchdog).run(signal.clone()),
        ));
        tasks.push(tokio::spawn(
            BroadcastHub::new(
                Arc::clone(&aggregator),
                Arc::clone(&registry),
                Duration::from_millis(50),
            )
            .run(signal),
        ));

        let rig = Rig {
            trainer,
            strap,
            aggregator,
            registry,
            sessions,
            trigger,
            tasks,
        };
        rig.wait_streaming().await;
        rig
    }

    /// Wait until every session is streaming.
    pub async fn wait_streaming(&self) {
        for session in &self.sessions {
            assert!(
                session
                    .wait_for(SessionState::Streaming, Duration::from_secs(5))
                    .await,
                "{} session never started streaming",
                session.capability()
            );
        }
    }

    /// One trainer notification.
    pub fn pedal(&self, watts: i16, cadence_rpm: f32, speed_kmh: f32) {
        assert!(self.trainer.notify(
            GattProfile::IndoorBike,
            payloads::indoor_bike(speed_kmh, cadence_rpm, watts),
        ));
    }

    /// One heart rate notification.
    pub fn beat(&self, bpm: u8) {
        assert!(self
            .strap
            .notify(GattProfile::HeartRate, payloads::heart_rate(bpm)));
    }

    pub async fn stop(self) {
        self.trigger.trigger();
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}
