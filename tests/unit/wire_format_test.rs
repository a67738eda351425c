//! Unit tests for the consumer wire format.

use ridebridge::metrics::Snapshot;
use ridebridge::streaming::encoder::{encode_binary, encode_text, BINARY_FRAME_LEN};

/// Consumers parse frames by offset; the layout must never drift.
#[test]
fn test_binary_frame_offsets() {
    let snapshot = Snapshot {
        timestamp: 12.5,
        power_w: 65_535,
        cadence_rpm: 0.0,
        speed_kmh: 42.25,
        heart_rate_bpm: 0,
    };
    let bytes = encode_binary(&snapshot).unwrap();

    assert_eq!(bytes.len(), BINARY_FRAME_LEN);
    assert_eq!(f64::from_le_bytes(bytes[0..8].try_into().unwrap()), 12.5);
    assert_eq!(f32::from_le_bytes(bytes[8..12].try_into().unwrap()), 65_535.0);
    assert_eq!(f32::from_le_bytes(bytes[12..16].try_into().unwrap()), 0.0);
    assert_eq!(f32::from_le_bytes(bytes[16..20].try_into().unwrap()), 42.25);
    assert_eq!(i32::from_le_bytes(bytes[20..24].try_into().unwrap()), 0);
}

#[test]
fn test_text_frame_has_exactly_five_fields() {
    let json = encode_text(&Snapshot::default()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    let object = value.as_object().unwrap();

    let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(
        keys,
        vec!["cadence", "heart_rate", "power", "speed", "timestamp"]
    );
}
