//! Stall watchdog behaviour through the full session pipeline.
//!
//! Runs on tokio's paused clock so timing assertions are exact.

use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::sensor_mock::{watchdog_config, Rig};

const SAMPLE_PERIOD: Duration = Duration::from_millis(250);

/// Let the sessions process what was just notified.
async fn settle() {
    sleep(Duration::from_millis(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_stall_zeroes_cycling_group_within_timeout() {
    let rig = Rig::start(watchdog_config()).await;

    for _ in 0..8 {
        rig.pedal(150, 80.0, 25.0);
        sleep(SAMPLE_PERIOD).await;
    }
    rig.pedal(150, 80.0, 25.0);
    settle().await;
    let last_sample = Instant::now();

    // Still within the timeout: last known values persist
    sleep(Duration::from_millis(1000)).await;
    let snapshot = rig.aggregator.snapshot();
    assert_eq!(snapshot.power_w, 150);
    assert_eq!(snapshot.cadence_rpm, 80.0);

    // Timeout plus one check interval
    tokio::time::sleep_until(last_sample + Duration::from_millis(1200 + 250 + 10)).await;
    let snapshot = rig.aggregator.snapshot();
    assert_eq!(snapshot.power_w, 0);
    assert_eq!(snapshot.cadence_rpm, 0.0);
    assert_eq!(snapshot.speed_kmh, 0.0);

    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_heart_rate_unaffected_by_cycling_stall() {
    let rig = Rig::start(watchdog_config()).await;

    rig.pedal(180, 85.0, 28.0);
    rig.beat(140);
    settle().await;

    // Cycling goes silent, heart rate keeps arriving at 1 Hz
    for bpm in [141, 142, 143, 144] {
        sleep(Duration::from_secs(1)).await;
        rig.beat(bpm);
    }
    settle().await;

    let snapshot = rig.aggregator.snapshot();
    assert_eq!(snapshot.power_w, 0);
    assert_eq!(snapshot.speed_kmh, 0.0);
    assert_eq!(snapshot.heart_rate_bpm, 144);

    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_heart_rate_goes_stale_but_keeps_value() {
    let rig = Rig::start(watchdog_config()).await;

    rig.beat(138);
    settle().await;
    assert!(!rig.aggregator.heart_rate_stale(Instant::now()));

    sleep(Duration::from_secs(6)).await;
    assert!(rig.aggregator.heart_rate_stale(Instant::now()));
    assert_eq!(rig.aggregator.snapshot().heart_rate_bpm, 138);

    rig.beat(139);
    settle().await;
    assert!(!rig.aggregator.heart_rate_stale(Instant::now()));

    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_real_zero_sample_resets_timer() {
    let rig = Rig::start(watchdog_config()).await;

    rig.pedal(200, 90.0, 30.0);
    settle().await;

    // Coasting: trainer reports 0 W while the wheel still spins
    sleep(Duration::from_millis(1000)).await;
    rig.pedal(0, 0.0, 22.0);
    settle().await;

    // 2 s after the first sample, 1 s after the zero-watt one
    sleep(Duration::from_millis(1000)).await;
    let snapshot = rig.aggregator.snapshot();
    assert_eq!(snapshot.power_w, 0);
    assert_eq!(snapshot.speed_kmh, 22.0);

    // Only now does the watchdog step in
    sleep(Duration::from_millis(500)).await;
    assert_eq!(rig.aggregator.snapshot().speed_kmh, 0.0);

    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stall_deadline_holds_for_any_phase() {
    let rig = Rig::start(watchdog_config()).await;

    // Vary where the last sample lands relative to the watchdog's check ticks
    for offset_ms in [0u64, 40, 125, 249] {
        rig.pedal(160, 82.0, 26.0);
        settle().await;
        sleep(Duration::from_millis(offset_ms)).await;
        rig.pedal(165, 82.0, 26.0);
        settle().await;
        let last_sample = Instant::now();

        tokio::time::sleep_until(last_sample + Duration::from_millis(1200 + 250 + 10)).await;
        let snapshot = rig.aggregator.snapshot();
        assert!(
            !snapshot.cycling_active(),
            "not zeroed for offset {} ms",
            offset_ms
        );
    }

    rig.stop().await;
}
