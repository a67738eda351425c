//! Integration test modules.

mod config_test;
mod end_to_end_test;
mod sensor_mock;
mod watchdog_test;
