//! Integration tests for configuration persistence and validation.

use ridebridge::config::{load_config, save_config, BridgeConfig, ConfigError, SensorTarget};
use ridebridge::sensors::types::Capability;
use ridebridge::streaming::Encoding;
use tempfile::tempdir;

#[test]
fn test_save_and_reload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut config = BridgeConfig::default();
    config.listen.port = 9100;
    config.sensors.power = Some(SensorTarget {
        name_filter: None,
        device_id: Some("C4:7F:51:00:12:34".to_string()),
    });
    config.sensors.cadence_speed = Some(SensorTarget::by_name("Wahoo SPEED"));
    config.sensors.wheel_circumference_m = 2.096;
    config.watchdog.cycling_timeout_ms = 2000;
    config.broadcast.encoding = Encoding::Text;

    save_config(&config, &path).unwrap();
    let loaded = load_config(&path).unwrap();

    assert_eq!(loaded, config);
}

#[test]
fn test_missing_file_yields_defaults() {
    let dir = tempdir().unwrap();
    let loaded = load_config(&dir.path().join("absent.toml")).unwrap();

    assert_eq!(loaded, BridgeConfig::default());
}

#[test]
fn test_malformed_file_is_parse_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[listen\nport = \"eighty\"").unwrap();

    assert!(matches!(load_config(&path), Err(ConfigError::ParseError(_))));
}

#[test]
fn test_wrong_type_is_parse_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[broadcast]\ntick_ms = \"fast\"\n").unwrap();

    assert!(matches!(load_config(&path), Err(ConfigError::ParseError(_))));
}

fn rejected(mutate: impl FnOnce(&mut BridgeConfig)) -> bool {
    let mut config = BridgeConfig::default();
    mutate(&mut config);
    matches!(config.validate(), Err(ConfigError::Invalid(_)))
}

#[test]
fn test_validation_rejects_unusable_settings() {
    assert!(rejected(|c| c.listen.host = " ".to_string()));
    assert!(rejected(|c| c.listen.port = 0));
    assert!(rejected(|c| c.sensors.wheel_circumference_m = -1.0));
    assert!(rejected(|c| c.sensors.wheel_circumference_m = f64::NAN));
    assert!(rejected(|c| {
        c.sensors.power = None;
        c.sensors.heart_rate = None;
    }));
    assert!(rejected(|c| c.sensors.heart_rate = Some(SensorTarget::default())));
    assert!(rejected(|c| c.broadcast.tick_ms = 0));
    assert!(rejected(|c| c.watchdog.cycling_timeout_ms = 0));
    assert!(rejected(|c| c.broadcast.queue_capacity = 0));

    assert!(!rejected(|c| c.sensors.power = None));
}

#[test]
fn test_file_settings_reach_runtime_configs() {
    let config: BridgeConfig = toml::from_str(
        r#"
        [sensors]
        scan_timeout_secs = 3
        reconnect_delay_secs = 1

        [sensors.cadence_speed]
        name_filter = "SPEED"

        [watchdog]
        cycling_timeout_ms = 1500

        [broadcast]
        tick_ms = 100
        queue_capacity = 4
        "#,
    )
    .unwrap();
    config.validate().unwrap();

    let session = config
        .sensors
        .session_config(Capability::CadenceSpeed)
        .unwrap();
    assert_eq!(session.scan_timeout.as_secs(), 3);
    assert_eq!(session.reconnect_delay.as_secs(), 1);
    assert_eq!(session.target.name_filter.as_deref(), Some("SPEED"));

    assert_eq!(
        config.watchdog.watchdog_config().cycling_timeout.as_millis(),
        1500
    );
    assert_eq!(config.broadcast.tick().as_millis(), 100);
    assert_eq!(config.broadcast.registry_config().queue_capacity, 4);
}
