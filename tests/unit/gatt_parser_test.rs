//! Unit tests for GATT characteristic parsing.

use ridebridge::sensors::gatt::{
    parse_csc_measurement, parse_cycling_power_measurement, parse_heart_rate_measurement,
    parse_indoor_bike_data, DecodeError,
};
use ridebridge::sensors::types::GattProfile;

fn is_malformed<T>(result: Result<T, DecodeError>, expected: GattProfile) -> bool {
    matches!(result, Err(DecodeError::MalformedPayload { profile, .. }) if profile == expected)
}

#[test]
fn test_parse_indoor_bike_data_speed_only() {
    // Flags: 0x0000 (only instantaneous speed)
    // Speed: 2500 = 25.00 km/h
    let data = [0x00, 0x00, 0xC4, 0x09];
    let result = parse_indoor_bike_data(&data).unwrap();

    assert!((result.speed_kmh.unwrap() - 25.0).abs() < 0.01);
    assert!(result.power_watts.is_none());
    assert!(result.cadence_rpm.is_none());
}

#[test]
fn test_parse_indoor_bike_data_full() {
    // Flags: 0x0044 (cadence + power)
    // Speed: 3500 = 35.00 km/h
    // Cadence: 190 = 95 RPM
    // Power: 300W
    let data = [0x44, 0x00, 0xAC, 0x0D, 0xBE, 0x00, 0x2C, 0x01];
    let result = parse_indoor_bike_data(&data).unwrap();

    assert!((result.speed_kmh.unwrap() - 35.0).abs() < 0.01);
    assert_eq!(result.cadence_rpm, Some(95.0));
    assert_eq!(result.power_watts, Some(300));
}

#[test]
fn test_parse_indoor_bike_data_skips_unused_fields() {
    // Flags: 0x0256 (avg speed, cadence, distance, power, heart rate)
    let data = [
        0x56, 0x02, // flags
        0xC4, 0x09, // speed 25.00
        0x00, 0x00, // average speed
        0xA0, 0x00, // cadence 80
        0x10, 0x27, 0x00, // total distance
        0x96, 0x00, // power 150
        0x8C, // heart rate 140
    ];
    let result = parse_indoor_bike_data(&data).unwrap();

    assert_eq!(result.cadence_rpm, Some(80.0));
    assert_eq!(result.power_watts, Some(150));
    assert_eq!(result.heart_rate_bpm, Some(140));
}

#[test]
fn test_parse_indoor_bike_data_more_data_flag() {
    // Flags: 0x0001 (more data = no instantaneous speed)
    let data = [0x01, 0x00];
    let result = parse_indoor_bike_data(&data).unwrap();

    assert!(result.speed_kmh.is_none());
}

#[test]
fn test_parse_indoor_bike_data_truncated() {
    assert!(is_malformed(parse_indoor_bike_data(&[0x00]), GattProfile::IndoorBike));
    // Power flagged but missing
    assert!(is_malformed(
        parse_indoor_bike_data(&[0x40, 0x00, 0xC4, 0x09, 0x96]),
        GattProfile::IndoorBike
    ));
}

#[test]
fn test_parse_cycling_power_measurement_basic() {
    // Flags: 0x0000 (no optional fields)
    // Power: 200W
    let data = [0x00, 0x00, 0xC8, 0x00];
    let result = parse_cycling_power_measurement(&data).unwrap();

    assert_eq!(result.power_watts, 200);
    assert!(result.power_balance.is_none());
    assert!(result.crank.is_none());
}

#[test]
fn test_parse_cycling_power_measurement_negative() {
    // Power: -50W (back-pedalling on some meters)
    let data = [0x00, 0x00, 0xCE, 0xFF];
    let result = parse_cycling_power_measurement(&data).unwrap();

    assert_eq!(result.power_watts, -50);
}

#[test]
fn test_parse_cycling_power_measurement_with_crank() {
    // Flags: 0x0021 (balance + crank revolution data)
    let data = [0x21, 0x00, 0xFA, 0x00, 0x64, 0x0A, 0x00, 0x00, 0x04];
    let result = parse_cycling_power_measurement(&data).unwrap();

    assert_eq!(result.power_watts, 250);
    assert_eq!(result.power_balance, Some(100));
    let crank = result.crank.unwrap();
    assert_eq!(crank.revolutions, 10);
    assert_eq!(crank.event_time, 1024);
}

#[test]
fn test_parse_cycling_power_measurement_truncated() {
    assert!(is_malformed(
        parse_cycling_power_measurement(&[0x00, 0x00, 0xC8]),
        GattProfile::CyclingPower
    ));
    // Crank flagged, only two of four bytes present
    assert!(is_malformed(
        parse_cycling_power_measurement(&[0x20, 0x00, 0xC8, 0x00, 0x01, 0x00]),
        GattProfile::CyclingPower
    ));
}

#[test]
fn test_parse_heart_rate_u8() {
    // Flags: 0x00 (8-bit HR)
    let data = [0x00, 0x8C];
    let result = parse_heart_rate_measurement(&data).unwrap();

    assert_eq!(result.heart_rate_bpm, 140);
    assert!(result.rr_intervals.is_empty());
}

#[test]
fn test_parse_heart_rate_u16() {
    // Flags: 0x01 (16-bit HR)
    let data = [0x01, 0x2C, 0x01];
    let result = parse_heart_rate_measurement(&data).unwrap();

    assert_eq!(result.heart_rate_bpm, 300);
}

#[test]
fn test_parse_heart_rate_with_rr_intervals() {
    // Flags: 0x10 (RR intervals), HR 60, RR 1024 (= 1000 ms)
    let data = [0x10, 0x3C, 0x00, 0x04];
    let result = parse_heart_rate_measurement(&data).unwrap();

    assert_eq!(result.rr_intervals, vec![1024]);
    assert_eq!(result.rr_intervals_ms(), vec![1000]);
}

#[test]
fn test_parse_heart_rate_truncated() {
    assert!(is_malformed(parse_heart_rate_measurement(&[]), GattProfile::HeartRate));
    assert!(is_malformed(
        parse_heart_rate_measurement(&[0x01, 0x2C]),
        GattProfile::HeartRate
    ));
}

#[test]
fn test_parse_csc_wheel_and_crank() {
    // Flags: 0x03, wheel 100 revs @ 2048, crank 50 revs @ 1024
    let data = [
        0x03, 0x64, 0x00, 0x00, 0x00, 0x00, 0x08, 0x32, 0x00, 0x00, 0x04,
    ];
    let result = parse_csc_measurement(&data).unwrap();

    let wheel = result.wheel.unwrap();
    assert_eq!(wheel.revolutions, 100);
    assert_eq!(wheel.event_time, 2048);
    let crank = result.crank.unwrap();
    assert_eq!(crank.revolutions, 50);
    assert_eq!(crank.event_time, 1024);
}

#[test]
fn test_parse_csc_truncated_or_empty() {
    assert!(is_malformed(parse_csc_measurement(&[]), GattProfile::CyclingSpeedCadence));
    assert!(is_malformed(
        parse_csc_measurement(&[0x01, 0x64, 0x00]),
        GattProfile::CyclingSpeedCadence
    ));
    // Neither wheel nor crank data
    assert!(is_malformed(
        parse_csc_measurement(&[0x00]),
        GattProfile::CyclingSpeedCadence
    ));
}
