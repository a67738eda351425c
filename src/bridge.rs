//! Bridge assembly: sessions, watchdog, broadcast hub and consumer server under one shutdown
//! signal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{BridgeConfig, ConfigError};
use crate::metrics::{AggregatorError, FieldSet, MetricAggregator, StallWatchdog};
use crate::sensors::session::{DeviceSession, SessionHandle};
use crate::sensors::transport::BleTransport;
use crate::sensors::types::{Capability, DecodedSample, SessionEvent, SessionState};
use crate::shutdown::{self, Shutdown, ShutdownTrigger};
use crate::streaming::{BroadcastHub, ConsumerRegistry, ConsumerServer, StreamingError};

/// Startup errors. Everything after startup is recovered internally.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Streaming(#[from] StreamingError),

    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
}

/// Fields each configured capability writes.
///
/// Trainers report cadence and speed alongside power, so without a dedicated cadence/speed sensor
/// the power session owns those fields too.
pub fn field_ownership(config: &BridgeConfig) -> Vec<(Capability, FieldSet)> {
    let has_cadence_sensor = config.sensors.cadence_speed.is_some();

    Capability::ALL
        .iter()
        .filter(|capability| config.sensors.target(**capability).is_some())
        .map(|capability| {
            let fields = match capability {
                Capability::Power if has_cadence_sensor => FieldSet::POWER,
                Capability::Power => FieldSet::POWER | FieldSet::CADENCE_SPEED,
                Capability::CadenceSpeed => FieldSet::CADENCE_SPEED,
                Capability::HeartRate => FieldSet::HEART_RATE,
            };
            (*capability, fields)
        })
        .collect()
}

/// A running bridge.
pub struct Bridge {
    aggregator: Arc<MetricAggregator>,
    registry: Arc<ConsumerRegistry>,
    local_addr: SocketAddr,
    sessions: Vec<SessionHandle>,
    session_events: broadcast::Sender<SessionEvent>,
    trigger: ShutdownTrigger,
    tasks: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl Bridge {
    /// Validate `config`, bind the listen socket and start every task.
    pub async fn start<T: BleTransport>(config: BridgeConfig, transport: T) -> Result<Self, BridgeError> {
        config.validate()?;

        let aggregator = MetricAggregator::new(&config.watchdog.watchdog_config());
        let registry = Arc::new(ConsumerRegistry::new(config.broadcast.registry_config()));
        let server = ConsumerServer::bind(
            &config.listen.address(),
            Arc::clone(&registry),
            Arc::clone(&aggregator),
            config.broadcast.server_config(),
        )
        .await?;
        let local_addr = server.local_addr()?;

        let (trigger, shutdown) = shutdown::channel();
        let (session_events, _) = broadcast::channel(256);
        let transport = Arc::new(transport);
        let mut tasks = Vec::new();
        let mut sessions = Vec::new();

        for (capability, fields) in field_ownership(&config) {
            let Some(session_config) = config.sensors.session_config(capability) else {
                continue;
            };
            let writer = aggregator.writer(fields)?;
            tracing::debug!("{} session owns {}", capability, fields);

            let (session, handle) = DeviceSession::new(
                session_config,
                Arc::clone(&transport),
                writer,
                session_events.clone(),
            );
            sessions.push(handle);
            tasks.push(tokio::spawn(session.run(shutdown.clone())));
        }

        let watchdog_config = config.watchdog.watchdog_config();
        tasks.push(tokio::spawn(
            StallWatchdog::new(Arc::clone(&aggregator), &watchdog_config).run(shutdown.clone()),
        ));
        tasks.push(tokio::spawn(
            BroadcastHub::new(
                Arc::clone(&aggregator),
                Arc::clone(&registry),
                config.broadcast.tick(),
            )
            .run(shutdown.clone()),
        ));
        tasks.push(tokio::spawn(server.run(shutdown)));

        tracing::info!(
            "Bridge started on ws://{} with {} sensor session(s)",
            local_addr,
            sessions.len()
        );

        Ok(Self {
            aggregator,
            registry,
            local_addr,
            sessions,
            session_events,
            trigger,
            tasks,
            grace: Duration::from_millis(config.broadcast.shutdown_grace_ms),
        })
    }

    /// Address consumers connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn aggregator(&self) -> &Arc<MetricAggregator> {
        &self.aggregator
    }

    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }

    /// Every decoded sample, for persistence or other observers.
    pub fn subscribe_samples(&self) -> broadcast::Receiver<DecodedSample> {
        self.aggregator.subscribe_samples()
    }

    pub fn subscribe_session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_events.subscribe()
    }

    pub fn sessions(&self) -> &[SessionHandle] {
        &self.sessions
    }

    pub fn session_states(&self) -> Vec<(Capability, SessionState)> {
        self.sessions
            .iter()
            .map(|s| (s.capability(), s.state()))
            .collect()
    }

    /// Another shutdown receiver, e.g. for a simulator running alongside the bridge.
    pub fn shutdown_signal(&self) -> Shutdown {
        self.trigger.subscribe()
    }

    /// Stop every task, waiting up to the grace period before aborting stragglers.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down bridge");
        self.trigger.trigger();

        let deadline = tokio::time::Instant::now() + self.grace;
        for mut task in self.tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                tracing::warn!("Task did not stop within grace period, aborting");
                task.abort();
            }
        }

        tracing::info!("Bridge stopped");
    }
}
