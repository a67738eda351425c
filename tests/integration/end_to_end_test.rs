//! A ride from first pedal stroke to stall, observed as a binary consumer would see it.

use std::time::Duration;

use ridebridge::metrics::Snapshot;
use ridebridge::streaming::encoder::{
    decode_binary, encode_handshake, BinaryFrame, Encoding, Handshake, OutboundFrame,
};
use tokio::time::{sleep, Instant};

use crate::sensor_mock::{watchdog_config, Rig};

#[tokio::test(start_paused = true)]
async fn test_ride_then_stall_as_seen_by_consumer() {
    let rig = Rig::start(watchdog_config()).await;

    let handshake = Handshake::new(Encoding::Binary, 50, &rig.aggregator.snapshot());
    let (id, mut rx) = rig.registry.register(
        None,
        Encoding::Binary,
        encode_handshake(&handshake).unwrap(),
    );

    let collector = tokio::spawn(async move {
        let mut handshake = None;
        let mut frames: Vec<(Instant, BinaryFrame)> = Vec::new();
        while let Some(frame) = rx.recv().await {
            match frame {
                OutboundFrame::Text(text) => {
                    assert!(frames.is_empty(), "text message after data frames");
                    handshake = Some(text);
                }
                OutboundFrame::Binary(bytes) => {
                    frames.push((Instant::now(), decode_binary(&bytes).unwrap()));
                }
            }
        }
        (handshake, frames)
    });

    let started = Instant::now();
    rig.beat(140);
    let mut last_pedal = started;
    let mut next_beat = started + Duration::from_secs(1);

    // 5 s of riding at 4 Hz
    while started.elapsed() < Duration::from_secs(5) {
        rig.pedal(150, 80.0, 25.0);
        last_pedal = Instant::now();
        sleep(Duration::from_millis(250)).await;
        if Instant::now() >= next_beat {
            rig.beat(140);
            next_beat += Duration::from_secs(1);
        }
    }

    // 3 s of silence from the trainer, strap keeps going
    let stop_at = Instant::now() + Duration::from_secs(3);
    while Instant::now() < stop_at {
        sleep(Duration::from_millis(250)).await;
        if Instant::now() >= next_beat {
            rig.beat(140);
            next_beat += Duration::from_secs(1);
        }
    }

    assert!(rig.registry.remove(id, "test finished"));
    let (handshake, frames) = collector.await.unwrap();

    let handshake: serde_json::Value = serde_json::from_str(&handshake.unwrap()).unwrap();
    assert_eq!(handshake["type"], "handshake");
    assert_eq!(handshake["encoding"], "binary");
    assert_eq!(handshake["frame_bytes"], 24);

    // Roughly 20 frames per second over 8 s
    assert!(
        (150..=165).contains(&frames.len()),
        "{} frames",
        frames.len()
    );

    let riding_until = last_pedal + Duration::from_millis(1200);
    let stalled_from = last_pedal + Duration::from_millis(1200 + 250);
    let settled = started + Duration::from_millis(20);

    for (at, frame) in &frames {
        if *at < settled {
            continue;
        }
        assert_eq!(frame.heart_rate, 140);

        if *at < riding_until {
            assert_eq!(frame.power, 150.0);
            assert_eq!(frame.cadence, 80.0);
            assert_eq!(frame.speed, 25.0);
        } else if *at > stalled_from {
            assert_eq!(frame.power, 0.0);
            assert_eq!(frame.cadence, 0.0);
            assert_eq!(frame.speed, 0.0);
        }
    }

    let timestamps: Vec<f64> = frames.iter().map(|(_, f)| f.timestamp).collect();
    assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    assert!(frames
        .last()
        .map(|(at, _)| *at > stalled_from)
        .unwrap_or(false));

    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_handshake_carries_current_snapshot() {
    let rig = Rig::start(watchdog_config()).await;

    rig.pedal(210, 90.0, 33.0);
    rig.beat(150);
    sleep(Duration::from_millis(10)).await;

    let snapshot: Snapshot = rig.aggregator.snapshot();
    let handshake = Handshake::new(Encoding::Text, 50, &snapshot);
    assert_eq!(handshake.snapshot.power, 210);
    assert_eq!(handshake.snapshot.heart_rate, 150);
    assert_eq!(handshake.frame_bytes, 0);

    rig.stop().await;
}
