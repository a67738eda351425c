//! Wire encoding of snapshots.
//!
//! Binary frames are exactly 24 bytes, little-endian, fixed-width:
//!
//! | offset | type | field            |
//! |--------|------|------------------|
//! | 0      | f64  | timestamp (s)    |
//! | 8      | f32  | power (W)        |
//! | 12     | f32  | cadence (RPM)    |
//! | 16     | f32  | speed (km/h)     |
//! | 20     | i32  | heart rate (BPM) |
//!
//! bincode's default configuration is little-endian with fixed-size integers, which is exactly
//! this layout for a struct of these fields in this order.

use serde::{Deserialize, Serialize};

use super::StreamingError;
use crate::metrics::Snapshot;

/// Size of one binary frame.
pub const BINARY_FRAME_LEN: usize = 24;

/// Consumer payload encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Binary,
    Text,
}

impl std::str::FromStr for Encoding {
    type Err = StreamingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binary" => Ok(Encoding::Binary),
            "text" | "json" => Ok(Encoding::Text),
            other => Err(StreamingError::InvalidEncoding(other.to_string())),
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Encoding::Binary => write!(f, "binary"),
            Encoding::Text => write!(f, "text"),
        }
    }
}

/// Field layout of a binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinaryFrame {
    pub timestamp: f64,
    pub power: f32,
    pub cadence: f32,
    pub speed: f32,
    pub heart_rate: i32,
}

impl From<&Snapshot> for BinaryFrame {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            timestamp: snapshot.timestamp,
            power: f32::from(snapshot.power_w),
            cadence: snapshot.cadence_rpm,
            speed: snapshot.speed_kmh,
            heart_rate: i32::from(snapshot.heart_rate_bpm),
        }
    }
}

/// JSON frame with the same five values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TextFrame {
    pub timestamp: f64,
    pub power: u16,
    pub cadence: f32,
    pub speed: f32,
    pub heart_rate: u16,
}

impl From<&Snapshot> for TextFrame {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            timestamp: snapshot.timestamp,
            power: snapshot.power_w,
            cadence: snapshot.cadence_rpm,
            speed: snapshot.speed_kmh,
            heart_rate: snapshot.heart_rate_bpm,
        }
    }
}

/// First message sent to every consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(rename = "type")]
    pub kind: String,
    pub bridge: String,
    pub version: String,
    pub encoding: Encoding,
    pub tick_ms: u64,
    pub frame_bytes: usize,
    pub snapshot: TextFrame,
}

impl Handshake {
    pub fn new(encoding: Encoding, tick_ms: u64, snapshot: &Snapshot) -> Self {
        Self {
            kind: "handshake".to_string(),
            bridge: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            encoding,
            tick_ms,
            frame_bytes: match encoding {
                Encoding::Binary => BINARY_FRAME_LEN,
                Encoding::Text => 0,
            },
            snapshot: TextFrame::from(snapshot),
        }
    }
}

/// An encoded message ready for a consumer's queue.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Encode a snapshot as a 24-byte binary frame.
pub fn encode_binary(snapshot: &Snapshot) -> Result<Vec<u8>, StreamingError> {
    let bytes = bincode::serialize(&BinaryFrame::from(snapshot))
        .map_err(|e| StreamingError::Encode(e.to_string()))?;

    if bytes.len() != BINARY_FRAME_LEN {
        return Err(StreamingError::Encode(format!(
            "binary frame is {} bytes, expected {}",
            bytes.len(),
            BINARY_FRAME_LEN
        )));
    }
    Ok(bytes)
}

/// Decode a binary frame. Used by consumers and tests.
pub fn decode_binary(bytes: &[u8]) -> Result<BinaryFrame, StreamingError> {
    if bytes.len() != BINARY_FRAME_LEN {
        return Err(StreamingError::Decode(format!(
            "binary frame is {} bytes, expected {}",
            bytes.len(),
            BINARY_FRAME_LEN
        )));
    }
    bincode::deserialize(bytes).map_err(|e| StreamingError::Decode(e.to_string()))
}

/// Encode a snapshot as a JSON text frame.
pub fn encode_text(snapshot: &Snapshot) -> Result<String, StreamingError> {
    serde_json::to_string(&TextFrame::from(snapshot))
        .map_err(|e| StreamingError::Encode(e.to_string()))
}

/// Encode a snapshot for the given encoding.
pub fn encode(snapshot: &Snapshot, encoding: Encoding) -> Result<OutboundFrame, StreamingError> {
    match encoding {
        Encoding::Binary => encode_binary(snapshot).map(OutboundFrame::Binary),
        Encoding::Text => encode_text(snapshot).map(OutboundFrame::Text),
    }
}

/// Encode the handshake message.
pub fn encode_handshake(handshake: &Handshake) -> Result<OutboundFrame, StreamingError> {
    serde_json::to_string(handshake)
        .map(OutboundFrame::Text)
        .map_err(|e| StreamingError::Encode(e.to_string()))
}
