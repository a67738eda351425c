//! WebSocket consumer server.
//!
//! Each accepted connection gets a writer task, which drains the consumer's registry queue onto
//! the socket with a per-send timeout, and a reader task for keep-alive traffic. Either side
//! failing removes only that consumer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::encoder::{self, Encoding, Handshake, OutboundFrame};
use super::registry::ConsumerRegistry;
use super::{ConnectionId, StreamingError, StreamingEvent};
use crate::metrics::MetricAggregator;
use crate::shutdown::Shutdown;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    /// Encoding used when the consumer does not ask for one
    pub default_encoding: Encoding,
    /// Broadcast tick, advertised in the handshake
    pub tick: Duration,
    /// Per-message write timeout
    pub send_timeout: Duration,
    /// Time allowed for the WebSocket upgrade
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            default_encoding: Encoding::Binary,
            tick: Duration::from_millis(50),
            send_timeout: Duration::from_millis(250),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Accepts WebSocket consumers and registers them.
pub struct ConsumerServer {
    listener: TcpListener,
    registry: Arc<ConsumerRegistry>,
    aggregator: Arc<MetricAggregator>,
    config: ServerConfig,
}

impl ConsumerServer {
    /// Bind the listen socket.
    pub async fn bind(
        addr: &str,
        registry: Arc<ConsumerRegistry>,
        aggregator: Arc<MetricAggregator>,
        config: ServerConfig,
    ) -> Result<Self, StreamingError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StreamingError::BindFailed(format!("{}: {}", addr, e)))?;

        Ok(Self {
            listener,
            registry,
            aggregator,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, StreamingError> {
        self.listener
            .local_addr()
            .map_err(|e| StreamingError::BindFailed(e.to_string()))
    }

    /// Accept consumers until shutdown.
    pub async fn run(self, mut shutdown: Shutdown) {
        if let Ok(addr) = self.local_addr() {
            tracing::info!("Consumer server listening on ws://{}", addr);
            self.registry.publish(StreamingEvent::ServerStarted { addr });
        }

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let connection = Connection {
                            registry: Arc::clone(&self.registry),
                            aggregator: Arc::clone(&self.aggregator),
                            config: self.config,
                            shutdown: shutdown.clone(),
                        };
                        tokio::spawn(connection.serve(stream, peer));
                    }
                    Err(e) => tracing::warn!("Failed to accept connection: {}", e),
                },
            }
        }

        self.registry.clear("bridge shutting down");
        self.registry.publish(StreamingEvent::ServerStopped);
        tracing::info!("Consumer server stopped");
    }
}

struct Connection {
    registry: Arc<ConsumerRegistry>,
    aggregator: Arc<MetricAggregator>,
    config: ServerConfig,
    shutdown: Shutdown,
}

impl Connection {
    async fn serve(self, stream: TcpStream, peer: SocketAddr) {
        let mut requested = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            requested = Some(requested_encoding(request.uri().query()));
            Ok(response)
        };

        let upgrade = tokio::time::timeout(
            self.config.handshake_timeout,
            tokio_tungstenite::accept_hdr_async(stream, callback),
        )
        .await;

        let websocket = match upgrade {
            Ok(Ok(websocket)) => websocket,
            Ok(Err(e)) => {
                let error = StreamingError::WebSocket(e.to_string());
                tracing::debug!("Upgrade from {} failed: {}", peer, error);
                return;
            }
            Err(_) => {
                tracing::debug!("WebSocket upgrade from {} timed out", peer);
                return;
            }
        };

        let encoding = match requested.flatten() {
            Some(Ok(encoding)) => encoding,
            Some(Err(e)) => {
                tracing::warn!(
                    "{} from {}, using {}",
                    e,
                    peer,
                    self.config.default_encoding
                );
                self.config.default_encoding
            }
            None => self.config.default_encoding,
        };

        let handshake = Handshake::new(
            encoding,
            self.config.tick.as_millis() as u64,
            &self.aggregator.snapshot(),
        );
        let handshake = match encoder::encode_handshake(&handshake) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("{}", e);
                return;
            }
        };

        let (sink, source) = websocket.split();
        let (id, frames) = self.registry.register(Some(peer), encoding, handshake);
        let (control_tx, control_rx) = mpsc::channel(8);

        let reader = tokio::spawn(read_loop(
            id,
            source,
            control_tx,
            Arc::clone(&self.registry),
        ));
        self.write_loop(id, sink, frames, control_rx).await;

        // The reader holds the other half of the socket; the connection only closes once both
        // halves are dropped.
        reader.abort();
        tracing::debug!("Consumer {} connection closed", id);
    }

    async fn write_loop(
        mut self,
        id: ConnectionId,
        mut sink: WsSink,
        mut frames: mpsc::Receiver<OutboundFrame>,
        mut control: mpsc::Receiver<Message>,
    ) {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.wait() => {
                    let close = Message::Close(Some(CloseFrame {
                        code: CloseCode::Away,
                        reason: "bridge shutting down".into(),
                    }));
                    let _ = tokio::time::timeout(self.config.send_timeout, sink.send(close)).await;
                    self.registry.remove(id, "bridge shutting down");
                    return;
                }
                frame = frames.recv() => match frame {
                    Some(frame) => into_message(frame),
                    None => break,
                },
                Some(reply) = control.recv() => reply,
            };

            match tokio::time::timeout(self.config.send_timeout, sink.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let failure = StreamingError::ConsumerSendFailure {
                        id,
                        reason: e.to_string(),
                    };
                    tracing::warn!("{}", failure);
                    self.registry.remove(id, "send failed");
                    break;
                }
                Err(_) => {
                    let failure = StreamingError::ConsumerSendFailure {
                        id,
                        reason: format!(
                            "send timed out after {} ms",
                            self.config.send_timeout.as_millis()
                        ),
                    };
                    tracing::warn!("{}", failure);
                    self.registry.remove(id, "send timed out");
                    break;
                }
            }
        }

        let _ = tokio::time::timeout(self.config.send_timeout, sink.close()).await;
        tracing::debug!("Consumer {} writer finished", id);
    }
}

/// Handle inbound traffic: answer text with a pong, stop on close or error.
///
/// Protocol-level pings are answered by tungstenite itself on the next write.
async fn read_loop(
    id: ConnectionId,
    mut source: WsSource,
    control: mpsc::Sender<Message>,
    registry: Arc<ConsumerRegistry>,
) {
    let reason = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                let reply = serde_json::json!({ "pong": text }).to_string();
                if control.try_send(Message::Text(reply)).is_err() {
                    tracing::debug!("Consumer {} pong dropped", id);
                }
            }
            Some(Ok(Message::Close(_))) => break "closed by peer",
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                let error = StreamingError::WebSocket(e.to_string());
                tracing::debug!("Consumer {} read failed: {}", id, error);
                break "connection error";
            }
            None => break "connection closed",
        }
    };

    registry.remove(id, reason);
}

fn into_message(frame: OutboundFrame) -> Message {
    match frame {
        OutboundFrame::Text(text) => Message::Text(text),
        OutboundFrame::Binary(bytes) => Message::Binary(bytes),
    }
}

/// Encoding requested via `?encoding=` in the upgrade URI, if any.
fn requested_encoding(query: Option<&str>) -> Option<Result<Encoding, StreamingError>> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "encoding")
        .map(|(_, value)| value.parse())
}
