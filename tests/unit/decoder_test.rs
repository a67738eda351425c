//! Unit tests for notification decoding and revolution-delta derivation.

use ridebridge::sensors::simulated::payloads;
use ridebridge::sensors::types::{Capability, GattProfile, RawNotification};
use ridebridge::sensors::{SampleDecoder, WheelCalibration};

fn csc_decoder() -> SampleDecoder {
    SampleDecoder::new(Capability::CadenceSpeed, WheelCalibration::default())
}

fn csc(wheel: Option<(u32, u16)>, crank: Option<(u16, u16)>) -> RawNotification {
    RawNotification::new(
        Capability::CadenceSpeed,
        GattProfile::CyclingSpeedCadence,
        payloads::csc(wheel, crank),
    )
}

/// 5 revolutions of a 2.105 m wheel in one second.
#[test]
fn test_csc_speed_derivation() {
    let mut decoder = csc_decoder();

    assert!(decoder.decode(&csc(Some((100, 0)), None)).unwrap().is_none());

    let sample = decoder
        .decode(&csc(Some((105, 1024)), None))
        .unwrap()
        .unwrap();
    let speed = sample.speed_kmh.unwrap();
    assert!((speed - 37.89).abs() < 0.01, "speed was {}", speed);
    assert!(sample.power_w.is_none());
}

#[test]
fn test_csc_cadence_derivation() {
    let mut decoder = csc_decoder();

    decoder.decode(&csc(None, Some((10, 0)))).unwrap();
    let sample = decoder
        .decode(&csc(None, Some((12, 1536))))
        .unwrap()
        .unwrap();

    // 2 revolutions in 1.5 s
    assert!((sample.cadence_rpm.unwrap() - 80.0).abs() < 0.01);
}

#[test]
fn test_csc_counter_wraparound() {
    let mut decoder = csc_decoder();

    decoder
        .decode(&csc(None, Some((65_535, 65_024))))
        .unwrap();
    let sample = decoder
        .decode(&csc(None, Some((0, 512))))
        .unwrap()
        .unwrap();

    // 1 revolution over 1024 ticks across both rollovers
    assert!((sample.cadence_rpm.unwrap() - 60.0).abs() < 0.01);
}

#[test]
fn test_csc_repeated_event_time_yields_nothing() {
    let mut decoder = csc_decoder();

    decoder.decode(&csc(Some((100, 2048)), None)).unwrap();
    assert!(decoder
        .decode(&csc(Some((100, 2048)), None))
        .unwrap()
        .is_none());
}

#[test]
fn test_reset_forgets_previous_reading() {
    let mut decoder = csc_decoder();

    decoder.decode(&csc(Some((100, 0)), None)).unwrap();
    decoder.reset();
    assert!(decoder
        .decode(&csc(Some((105, 1024)), None))
        .unwrap()
        .is_none());
}

#[test]
fn test_power_crank_cadence() {
    let mut decoder = SampleDecoder::new(Capability::Power, WheelCalibration::default());
    let notify = |revs, time| {
        RawNotification::new(
            Capability::Power,
            GattProfile::CyclingPower,
            payloads::cycling_power_with_crank(200, revs, time),
        )
    };

    let first = decoder.decode(&notify(10, 0)).unwrap().unwrap();
    assert_eq!(first.power_w, Some(200));
    assert!(first.cadence_rpm.is_none());

    let second = decoder.decode(&notify(11, 768)).unwrap().unwrap();
    assert!((second.cadence_rpm.unwrap() - 80.0).abs() < 0.01);
}

#[test]
fn test_heart_rate_rr_intervals() {
    let mut decoder = SampleDecoder::new(Capability::HeartRate, WheelCalibration::default());
    let raw = RawNotification::new(
        Capability::HeartRate,
        GattProfile::HeartRate,
        payloads::heart_rate_with_rr(62, &[1024, 512]),
    );

    let sample = decoder.decode(&raw).unwrap().unwrap();
    assert_eq!(sample.heart_rate_bpm, Some(62));
    assert_eq!(sample.rr_intervals_ms, vec![1000, 500]);
}

#[test]
fn test_short_payload_rejected() {
    let mut decoder = SampleDecoder::new(Capability::Power, WheelCalibration::default());
    let raw = RawNotification::new(Capability::Power, GattProfile::CyclingPower, vec![0x00, 0x00]);

    assert!(decoder.decode(&raw).is_err());
}
