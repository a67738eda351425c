//! Consumer-facing side of the bridge: encoding, the consumer registry, the fixed-rate
//! broadcast hub and the WebSocket server.

pub mod encoder;
pub mod hub;
pub mod registry;
pub mod server;

use std::net::SocketAddr;

use thiserror::Error;

pub use encoder::{Encoding, Handshake, OutboundFrame, BINARY_FRAME_LEN};
pub use hub::BroadcastHub;
pub use registry::{BroadcastReport, ConsumerInfo, ConsumerRegistry, RegistryConfig};
pub use server::{ConsumerServer, ServerConfig};

/// Streaming-related errors
#[derive(Debug, Error)]
pub enum StreamingError {
    #[error("Server bind failed: {0}")]
    BindFailed(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Failed to encode frame: {0}")]
    Encode(String),

    #[error("Failed to decode frame: {0}")]
    Decode(String),

    #[error("Unknown encoding: {0}")]
    InvalidEncoding(String),

    #[error("Consumer {id} send failure: {reason}")]
    ConsumerSendFailure { id: ConnectionId, reason: String },
}

/// Identifier of one consumer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Streaming server events
#[derive(Debug, Clone)]
pub enum StreamingEvent {
    /// Server is accepting consumers
    ServerStarted { addr: SocketAddr },
    /// Accept loop ended
    ServerStopped,
    /// Consumer completed the handshake
    ConsumerJoined {
        id: ConnectionId,
        peer: Option<SocketAddr>,
        encoding: Encoding,
    },
    /// Consumer removed from the registry
    ConsumerLeft { id: ConnectionId, reason: String },
}
