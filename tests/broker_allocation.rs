//! Integration tests for bench allocation.
//!
//! Exercises the broker end to end with the scripted health checker: health
//! gating, double-allocation protection, the concurrency ceiling, release
//! semantics, and operator overrides.

use std::sync::Arc;

use bench_broker::config::{BenchDefinition, BrokerConfig, BrokerSection, HealthCheckConfig};
use bench_broker::health::{CHECK_PING_UUT, CHECK_VERIFY_PSU};
use bench_broker::{BenchBroker, BenchState, BrokerError, ConnectionInfo, ScriptedHealthChecker};

// =============================================================================
// Fixtures
// =============================================================================

fn bench_definition(id: &str, hw: &str, state: &str, last_octet: u8) -> BenchDefinition {
    BenchDefinition {
        bench_id: id.into(),
        hardware_type: hw.into(),
        state: state.parse().unwrap(),
        connection: ConnectionInfo {
            uut_ip: format!("192.168.1.{last_octet}"),
            uut_port: 5000,
            psu_ip: format!("192.168.1.{}", last_octet + 10),
            psu_port: 1,
            ptp_ip: format!("192.168.1.{}", last_octet + 20),
        },
        location: "Lab A".into(),
    }
}

/// Two x-band benches, one s-band, one l-band in maintenance — the smallest
/// inventory that exercises every admission path.
fn sample_config(max_concurrent_jobs: usize) -> BrokerConfig {
    BrokerConfig {
        broker: BrokerSection {
            max_concurrent_jobs,
            lock_dir: None,
        },
        health_check: HealthCheckConfig::default(),
        benches: vec![
            bench_definition("BENCH-001", "radar_x_band", "available", 10),
            bench_definition("BENCH-002", "radar_x_band", "available", 11),
            bench_definition("BENCH-003", "radar_s_band", "available", 12),
            bench_definition("BENCH-004", "radar_l_band", "maintenance", 13),
        ],
    }
}

fn broker_with_checker(
    max_concurrent_jobs: usize,
) -> (Arc<BenchBroker>, Arc<ScriptedHealthChecker>) {
    let checker = Arc::new(ScriptedHealthChecker::new());
    let broker = BenchBroker::new(sample_config(max_concurrent_jobs), checker.clone()).unwrap();
    (Arc::new(broker), checker)
}

// =============================================================================
// Basic allocation and release
// =============================================================================

#[tokio::test]
async fn allocation_returns_connection_metadata() {
    let (broker, _) = broker_with_checker(4);

    let grant = broker
        .request_bench("radar_s_band", Some("JOB-1"), false)
        .await
        .unwrap();

    assert_eq!(grant.bench_id, "BENCH-003");
    assert_eq!(grant.hardware_type, "radar_s_band");
    assert_eq!(grant.connection.uut_ip, "192.168.1.12");
    assert_eq!(grant.connection.psu_ip, "192.168.1.22");
    assert_eq!(grant.job_id, "JOB-1");
    assert_eq!(grant.location, "Lab A");
    assert!(grant.health_check.is_some());
}

#[tokio::test]
async fn allocation_marks_bench_busy() {
    let (broker, _) = broker_with_checker(4);

    let grant = broker
        .request_bench("radar_s_band", None, false)
        .await
        .unwrap();

    let status = broker.bench_status(&grant.bench_id).await.unwrap();
    assert_eq!(status.state, BenchState::Busy);
    assert_eq!(status.allocated_to.as_deref(), Some(grant.job_id.as_str()));
}

#[tokio::test]
async fn no_double_allocation_of_one_bench() {
    let (broker, _) = broker_with_checker(4);

    let first = broker
        .request_bench("radar_x_band", Some("JOB-1"), false)
        .await
        .unwrap();
    let second = broker
        .request_bench("radar_x_band", Some("JOB-2"), false)
        .await
        .unwrap();

    assert_ne!(first.bench_id, second.bench_id);
    assert_eq!(broker.current_allocations().await, 2);

    // Pool of that type is exhausted now.
    let err = broker
        .request_bench("radar_x_band", Some("JOB-3"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NoMatchingBench { .. }));
}

#[tokio::test]
async fn concurrent_requests_never_share_a_bench() {
    let (broker, _) = broker_with_checker(8);

    let mut handles = Vec::new();
    for i in 0..8 {
        let broker = broker.clone();
        handles.push(tokio::spawn(async move {
            broker
                .request_bench("radar_x_band", Some(&format!("JOB-{i}")), false)
                .await
        }));
    }

    let mut granted = Vec::new();
    for handle in handles {
        if let Ok(grant) = handle.await.unwrap() {
            granted.push(grant.bench_id);
        }
    }

    // Two x-band benches exist, so exactly two of eight racing requests win,
    // and they win different benches.
    granted.sort();
    assert_eq!(granted, vec!["BENCH-001", "BENCH-002"]);
}

#[tokio::test]
async fn release_returns_bench_to_pool() {
    let (broker, _) = broker_with_checker(4);

    let grant = broker
        .request_bench("radar_s_band", None, false)
        .await
        .unwrap();
    assert_eq!(broker.current_allocations().await, 1);

    assert!(broker.release_bench(&grant.bench_id).await);
    assert_eq!(broker.current_allocations().await, 0);

    let status = broker.bench_status(&grant.bench_id).await.unwrap();
    assert_eq!(status.state, BenchState::Available);
    assert!(status.allocated_to.is_none());

    // The bench is allocatable again.
    let again = broker
        .request_bench("radar_s_band", None, false)
        .await
        .unwrap();
    assert_eq!(again.bench_id, grant.bench_id);
}

#[tokio::test]
async fn release_is_idempotent_and_nonfatal() {
    let (broker, _) = broker_with_checker(4);

    // Never allocated: false, nothing changes.
    assert!(!broker.release_bench("BENCH-001").await);
    assert!(!broker.release_bench("BENCH-404").await);
    assert_eq!(broker.available_count(None).await, 3);

    let grant = broker
        .request_bench("radar_x_band", None, false)
        .await
        .unwrap();
    assert!(broker.release_bench(&grant.bench_id).await);
    // Exactly once: the second release is a no-op.
    assert!(!broker.release_bench(&grant.bench_id).await);
    assert_eq!(broker.available_count(None).await, 3);
}

// =============================================================================
// Concurrency ceiling
// =============================================================================

#[tokio::test]
async fn ceiling_blocks_further_requests_regardless_of_type() {
    let (broker, _) = broker_with_checker(2);

    broker
        .request_bench("radar_x_band", Some("JOB-1"), false)
        .await
        .unwrap();
    broker
        .request_bench("radar_x_band", Some("JOB-2"), false)
        .await
        .unwrap();

    // s-band has a free healthy bench, but the global ceiling wins.
    let err = broker
        .request_bench("radar_s_band", Some("JOB-3"), false)
        .await
        .unwrap_err();
    match err {
        BrokerError::ConcurrencyLimitExceeded { limit, active } => {
            assert_eq!(limit, 2);
            assert_eq!(active, 2);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn release_reopens_the_ceiling() {
    let (broker, _) = broker_with_checker(1);

    let grant = broker
        .request_bench("radar_x_band", None, false)
        .await
        .unwrap();
    assert!(matches!(
        broker.request_bench("radar_s_band", None, false).await,
        Err(BrokerError::ConcurrencyLimitExceeded { .. })
    ));

    broker.release_bench(&grant.bench_id).await;
    assert!(broker
        .request_bench("radar_s_band", None, false)
        .await
        .is_ok());
}

// =============================================================================
// Health-gated admission
// =============================================================================

#[tokio::test]
async fn unhealthy_candidate_is_skipped_and_marked_offline() {
    let (broker, checker) = broker_with_checker(4);
    checker.fail_check("BENCH-001", CHECK_PING_UUT);

    let grant = broker
        .request_bench("radar_x_band", None, false)
        .await
        .unwrap();
    assert_eq!(grant.bench_id, "BENCH-002");

    let status = broker.bench_status("BENCH-001").await.unwrap();
    assert_eq!(status.state, BenchState::Offline);
}

#[tokio::test]
async fn all_unhealthy_fails_with_zero_allocations() {
    let (broker, checker) = broker_with_checker(4);
    checker.fail_check("BENCH-001", CHECK_PING_UUT);
    checker.fail_check("BENCH-002", CHECK_VERIFY_PSU);

    let err = broker
        .request_bench("radar_x_band", None, false)
        .await
        .unwrap_err();
    match err {
        BrokerError::AllCandidatesUnhealthy {
            hardware_type,
            candidates,
        } => {
            assert_eq!(hardware_type, "radar_x_band");
            assert_eq!(candidates, 2);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(broker.current_allocations().await, 0);
    assert_eq!(
        broker.bench_status("BENCH-001").await.unwrap().state,
        BenchState::Offline
    );
    assert_eq!(
        broker.bench_status("BENCH-002").await.unwrap().state,
        BenchState::Offline
    );
}

#[tokio::test]
async fn offline_mark_is_sticky_until_operator_override() {
    let (broker, checker) = broker_with_checker(4);
    checker.fail_check("BENCH-003", CHECK_PING_UUT);

    assert!(broker
        .request_bench("radar_s_band", None, false)
        .await
        .is_err());

    // Even with the failure cleared, the bench stays offline: no automatic
    // re-probe happens within a session.
    checker.clear();
    let err = broker
        .request_bench("radar_s_band", None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NoMatchingBench { .. }));

    // Operator override brings it back.
    assert!(
        broker
            .set_bench_state("BENCH-003", BenchState::Available)
            .await
    );
    assert!(broker
        .request_bench("radar_s_band", None, false)
        .await
        .is_ok());
}

#[tokio::test]
async fn failed_candidates_stay_available_when_policy_disabled() {
    let mut config = sample_config(4);
    config.health_check.mark_offline_on_failure = false;

    let checker = Arc::new(ScriptedHealthChecker::new());
    checker.fail_check("BENCH-001", CHECK_PING_UUT);
    let broker = BenchBroker::new(config, checker.clone()).unwrap();

    let grant = broker
        .request_bench("radar_x_band", None, false)
        .await
        .unwrap();
    assert_eq!(grant.bench_id, "BENCH-002");

    // Skipped, but not condemned.
    assert_eq!(
        broker.bench_status("BENCH-001").await.unwrap().state,
        BenchState::Available
    );
}

#[tokio::test]
async fn skipped_health_check_leaves_no_result_in_metadata() {
    let (broker, checker) = broker_with_checker(4);
    // Would fail if consulted; skipping means it never is.
    checker.fail_check("BENCH-001", CHECK_PING_UUT);

    let grant = broker
        .request_bench("radar_x_band", None, true)
        .await
        .unwrap();
    assert_eq!(grant.bench_id, "BENCH-001");
    assert!(grant.health_check.is_none());
}

// =============================================================================
// Candidate exclusion
// =============================================================================

#[tokio::test]
async fn maintenance_bench_is_never_a_candidate() {
    let (broker, _) = broker_with_checker(4);

    // BENCH-004 is the only l-band bench and is in maintenance.
    let err = broker
        .request_bench("radar_l_band", None, false)
        .await
        .unwrap_err();
    match err {
        BrokerError::NoMatchingBench {
            hardware_type,
            available_types,
        } => {
            assert_eq!(hardware_type, "radar_l_band");
            assert!(!available_types.contains(&"radar_l_band".to_string()));
            assert!(available_types.contains(&"radar_x_band".to_string()));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn offline_bench_is_never_a_candidate() {
    let (broker, _) = broker_with_checker(4);
    broker.set_bench_state("BENCH-003", BenchState::Offline).await;

    assert!(matches!(
        broker.request_bench("radar_s_band", None, false).await,
        Err(BrokerError::NoMatchingBench { .. })
    ));
}

#[tokio::test]
async fn unknown_hardware_type_lists_what_is_available() {
    let (broker, _) = broker_with_checker(4);

    let err = broker
        .request_bench("radar_unknown", None, false)
        .await
        .unwrap_err();
    match err {
        BrokerError::NoMatchingBench {
            available_types, ..
        } => assert_eq!(available_types, vec!["radar_s_band", "radar_x_band"]),
        other => panic!("unexpected error: {other:?}"),
    }
}

// =============================================================================
// Administrative overrides and queries
// =============================================================================

#[tokio::test]
async fn forcing_maintenance_discards_the_allocation() {
    let (broker, _) = broker_with_checker(4);

    let grant = broker
        .request_bench("radar_x_band", Some("JOB-1"), false)
        .await
        .unwrap();
    assert_eq!(broker.current_allocations().await, 1);

    assert!(
        broker
            .set_bench_state(&grant.bench_id, BenchState::Maintenance)
            .await
    );

    // The in-flight job lost its claim; the record is gone.
    assert_eq!(broker.current_allocations().await, 0);
    let status = broker.bench_status(&grant.bench_id).await.unwrap();
    assert_eq!(status.state, BenchState::Maintenance);
    assert!(status.allocated_to.is_none());

    // Releasing afterwards is a no-op and must not resurrect availability.
    assert!(!broker.release_bench(&grant.bench_id).await);
    assert_eq!(
        broker.bench_status(&grant.bench_id).await.unwrap().state,
        BenchState::Maintenance
    );
}

#[tokio::test]
async fn available_count_filters_by_type() {
    let (broker, _) = broker_with_checker(4);

    assert_eq!(broker.available_count(None).await, 3);
    assert_eq!(broker.available_count(Some("radar_x_band")).await, 2);
    assert_eq!(broker.available_count(Some("radar_s_band")).await, 1);
    assert_eq!(broker.available_count(Some("radar_l_band")).await, 0);

    broker.request_bench("radar_x_band", None, false).await.unwrap();
    assert_eq!(broker.available_count(Some("radar_x_band")).await, 1);
    assert_eq!(broker.available_count(None).await, 2);
}

#[tokio::test]
async fn statuses_come_back_in_inventory_order() {
    let (broker, _) = broker_with_checker(4);

    let statuses = broker.all_bench_statuses().await;
    let ids: Vec<&str> = statuses.iter().map(|s| s.bench_id.as_str()).collect();
    assert_eq!(ids, vec!["BENCH-001", "BENCH-002", "BENCH-003", "BENCH-004"]);
    assert_eq!(statuses[3].state, BenchState::Maintenance);
}
