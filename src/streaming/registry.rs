//! Consumer registry.
//!
//! Every consumer owns a bounded outbound queue drained by its own writer task. Fan-out only
//! ever uses `try_send`, so one consumer that cannot keep up loses frames (and eventually its
//! registration) without delaying anybody else.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use super::encoder::{self, Encoding, OutboundFrame};
use super::{ConnectionId, StreamingError, StreamingEvent};
use crate::metrics::Snapshot;

/// Queue sizing and eviction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Frames buffered per consumer
    pub queue_capacity: usize,
    /// Consecutive dropped frames before the consumer is removed
    pub max_consecutive_drops: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 8,
            max_consecutive_drops: 40,
        }
    }
}

/// Public view of a registered consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    pub id: ConnectionId,
    pub peer: Option<SocketAddr>,
    pub encoding: Encoding,
    pub connected_at: Instant,
    pub last_sent_at: Option<Instant>,
    pub frames_queued: u64,
    pub frames_dropped: u64,
}

/// Result of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    pub removed: Vec<ConnectionId>,
}

struct Consumer {
    info: ConsumerInfo,
    tx: mpsc::Sender<OutboundFrame>,
    consecutive_drops: u32,
}

/// All currently connected consumers.
pub struct ConsumerRegistry {
    consumers: Mutex<HashMap<ConnectionId, Consumer>>,
    next_id: AtomicU64,
    config: RegistryConfig,
    event_tx: broadcast::Sender<StreamingEvent>,
}

impl ConsumerRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            consumers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
            event_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Consumer>> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a consumer. `handshake` is queued before the consumer becomes visible to
    /// broadcasts, so it is always the first message delivered.
    pub fn register(
        &self,
        peer: Option<SocketAddr>,
        encoding: Encoding,
        handshake: OutboundFrame,
    ) -> (ConnectionId, mpsc::Receiver<OutboundFrame>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));

        // Fresh queue with capacity >= 1
        let _ = tx.try_send(handshake);

        let consumer = Consumer {
            info: ConsumerInfo {
                id,
                peer,
                encoding,
                connected_at: Instant::now(),
                last_sent_at: None,
                frames_queued: 0,
                frames_dropped: 0,
            },
            tx,
            consecutive_drops: 0,
        };
        self.lock().insert(id, consumer);

        tracing::info!(
            "Consumer {} joined from {} ({})",
            id,
            peer.map(|p| p.to_string())
                .unwrap_or_else(|| "local".to_string()),
            encoding
        );
        let _ = self.event_tx.send(StreamingEvent::ConsumerJoined { id, peer, encoding });

        (id, rx)
    }

    /// Remove a consumer. Returns false if it was already gone.
    pub fn remove(&self, id: ConnectionId, reason: &str) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            tracing::info!("Consumer {} left: {}", id, reason);
            let _ = self.event_tx.send(StreamingEvent::ConsumerLeft {
                id,
                reason: reason.to_string(),
            });
        }
        removed
    }

    /// Drop every consumer, closing their queues.
    pub fn clear(&self, reason: &str) {
        let ids: Vec<ConnectionId> = self.lock().keys().copied().collect();
        for id in ids {
            self.remove(id, reason);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn consumers(&self) -> Vec<ConsumerInfo> {
        let mut infos: Vec<ConsumerInfo> = self.lock().values().map(|c| c.info.clone()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StreamingEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn publish(&self, event: StreamingEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Enqueue `snapshot` for every consumer in its own encoding.
    ///
    /// Each encoding is produced at most once per call.
    pub fn broadcast(&self, snapshot: &Snapshot) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut binary: Option<Option<OutboundFrame>> = None;
        let mut text: Option<Option<OutboundFrame>> = None;
        let mut failures = Vec::new();
        let now = Instant::now();

        {
            let mut consumers = self.lock();

            for consumer in consumers.values_mut() {
                let slot = match consumer.info.encoding {
                    Encoding::Binary => &mut binary,
                    Encoding::Text => &mut text,
                };
                let frame = slot.get_or_insert_with(|| {
                    encoder::encode(snapshot, consumer.info.encoding)
                        .map_err(|e| tracing::error!("Failed to encode snapshot: {}", e))
                        .ok()
                });
                let Some(frame) = frame.as_ref() else {
                    continue;
                };

                match consumer.tx.try_send(frame.clone()) {
                    Ok(()) => {
                        consumer.consecutive_drops = 0;
                        consumer.info.last_sent_at = Some(now);
                        consumer.info.frames_queued += 1;
                        report.delivered += 1;
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        consumer.consecutive_drops += 1;
                        consumer.info.frames_dropped += 1;
                        report.dropped += 1;

                        if consumer.consecutive_drops > self.config.max_consecutive_drops {
                            failures.push(StreamingError::ConsumerSendFailure {
                                id: consumer.info.id,
                                reason: format!(
                                    "{} consecutive frames dropped",
                                    consumer.consecutive_drops
                                ),
                            });
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        failures.push(StreamingError::ConsumerSendFailure {
                            id: consumer.info.id,
                            reason: "writer closed".to_string(),
                        });
                    }
                }
            }
        }

        for failure in failures {
            if let StreamingError::ConsumerSendFailure { id, reason } = &failure {
                tracing::warn!("{}", failure);
                if self.remove(*id, reason) {
                    report.removed.push(*id);
                }
            }
        }

        report
    }
}

impl Default for ConsumerRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
