//! Integration tests for configuration loading.
//!
//! Loads real TOML files from temp directories and exercises the
//! `BENCH_BROKER_` environment override path. Tests touching process
//! environment run serially.

use std::fs;

use bench_broker::config::BrokerConfig;
use bench_broker::BenchState;
use serial_test::serial;

const SAMPLE: &str = r#"
[broker]
max_concurrent_jobs = 3

[health_check]
ping_timeout_sec = 2
retry_count = 1

[[benches]]
bench_id = "BENCH-001"
hardware_type = "radar_x_band"
state = "available"
location = "Lab A, coffin 1"
connection = { uut_ip = "192.168.1.10", uut_port = 5000, psu_ip = "192.168.1.20", psu_port = 1, ptp_ip = "192.168.1.30" }

[[benches]]
bench_id = "BENCH-002"
hardware_type = "radar_x_band"
state = "offline"
connection = { uut_ip = "192.168.1.11", psu_ip = "192.168.1.21", ptp_ip = "192.168.1.31" }
"#;

fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("benches.toml");
    fs::write(&path, content).unwrap();
    (dir, path)
}

#[test]
#[serial]
fn loads_inventory_from_toml() {
    let (_dir, path) = write_config(SAMPLE);

    let config = BrokerConfig::load_from(&path).unwrap();
    assert_eq!(config.broker.max_concurrent_jobs, 3);
    assert_eq!(config.health_check.ping_timeout_sec, 2);
    // Unset keys keep their defaults.
    assert_eq!(config.health_check.psu_verify_timeout_sec, 10);
    assert!(config.health_check.mark_offline_on_failure);

    assert_eq!(config.benches.len(), 2);
    assert_eq!(config.benches[0].bench_id, "BENCH-001");
    assert_eq!(config.benches[0].state, BenchState::Available);
    assert_eq!(config.benches[0].location, "Lab A, coffin 1");
    assert_eq!(config.benches[1].state, BenchState::Offline);
    assert_eq!(config.benches[1].connection.uut_port, 0);
}

#[test]
#[serial]
fn environment_overrides_the_file() {
    let (_dir, path) = write_config(SAMPLE);

    std::env::set_var("BENCH_BROKER__BROKER__MAX_CONCURRENT_JOBS", "7");
    let result = BrokerConfig::load_from(&path);
    std::env::remove_var("BENCH_BROKER__BROKER__MAX_CONCURRENT_JOBS");

    assert_eq!(result.unwrap().broker.max_concurrent_jobs, 7);
}

#[test]
#[serial]
fn unknown_state_string_fails_the_load() {
    let (_dir, path) = write_config(
        r#"
        [[benches]]
        bench_id = "BENCH-001"
        hardware_type = "radar_x_band"
        state = "degraded"
        connection = { uut_ip = "1.2.3.4", psu_ip = "1.2.3.5", ptp_ip = "1.2.3.6" }
        "#,
    );

    let err = BrokerConfig::load_from(&path).unwrap_err();
    assert!(err.to_string().contains("degraded"));
}

#[test]
#[serial]
fn duplicate_bench_ids_fail_validation() {
    let (_dir, path) = write_config(
        r#"
        [[benches]]
        bench_id = "BENCH-001"
        hardware_type = "radar_x_band"
        connection = { uut_ip = "1.2.3.4", psu_ip = "1.2.3.5", ptp_ip = "1.2.3.6" }

        [[benches]]
        bench_id = "BENCH-001"
        hardware_type = "radar_s_band"
        connection = { uut_ip = "1.2.3.7", psu_ip = "1.2.3.8", ptp_ip = "1.2.3.9" }
        "#,
    );

    let err = BrokerConfig::load_from(&path).unwrap_err();
    assert!(err.to_string().contains("duplicate bench_id"));
}

#[test]
#[serial]
fn missing_file_yields_defaults_for_empty_inventory() {
    // Figment tolerates a missing file; the result is an empty, valid
    // configuration (a broker with nothing to allocate).
    let dir = tempfile::tempdir().unwrap();
    let config = BrokerConfig::load_from(dir.path().join("nope.toml")).unwrap();
    assert!(config.benches.is_empty());
    assert_eq!(config.broker.max_concurrent_jobs, 4);
}
