//! Pre-flight bench health checks.
//!
//! Before a bench is granted to a job, the broker verifies that its
//! components are actually reachable. The verification is a fixed, named
//! list of checks:
//!
//! - `ping_uut` — the radar unit under test answers a ping
//! - `verify_psu` — the power supply accepts a SCPI connection
//! - `ptp_connectivity` — the time-sync source is reachable
//!
//! Each check runs up to `retry_count` attempts and passes on the first
//! successful one. An attempt that errors counts as a failed attempt, not a
//! fatal fault: one misbehaving check can never abort the overall admission
//! decision. The bench is healthy iff every check's final verdict is a pass.
//!
//! The checker is pluggable behind the [`HealthCheck`] trait with two
//! variants: [`NetworkHealthChecker`] performs real network I/O, while
//! [`ScriptedHealthChecker`] returns configured verdicts so the broker's
//! behavior under partial failure can be exercised without hardware.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result as CheckResult};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::bench::{Bench, BenchId};
use crate::config::HealthCheckConfig;

/// Name of the UUT reachability check.
pub const CHECK_PING_UUT: &str = "ping_uut";
/// Name of the PSU communication check.
pub const CHECK_VERIFY_PSU: &str = "verify_psu";
/// Name of the time-sync reachability check.
pub const CHECK_PTP_CONNECTIVITY: &str = "ptp_connectivity";

/// All checks, in execution order.
pub const CHECK_NAMES: [&str; 3] = [CHECK_PING_UUT, CHECK_VERIFY_PSU, CHECK_PTP_CONNECTIVITY];

/// SCPI-over-TCP port of the power supply.
const PSU_SCPI_PORT: u16 = 5025;

// =============================================================================
// Result type
// =============================================================================

/// Outcome of a full health check on one bench.
///
/// Produced fresh per allocation attempt and never persisted; a copy travels
/// with the allocation metadata for report attachment.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    /// The bench that was checked.
    pub bench_id: BenchId,
    /// Conjunction of all per-check verdicts.
    pub healthy: bool,
    /// Final verdict per check name.
    pub checks: BTreeMap<String, bool>,
    /// Human-readable summary.
    pub message: String,
}

impl HealthCheckResult {
    /// Assemble a result (verdicts, overall flag, summary) from per-check
    /// outcomes.
    pub fn from_checks(bench_id: &str, checks: BTreeMap<String, bool>) -> Self {
        let healthy = checks.values().all(|passed| *passed);
        let message = if healthy {
            format!("Bench {bench_id}: all {} checks passed", checks.len())
        } else {
            let failed: Vec<&str> = checks
                .iter()
                .filter(|(_, passed)| !**passed)
                .map(|(name, _)| name.as_str())
                .collect();
            format!(
                "Bench {bench_id}: {} check(s) failed: {}",
                failed.len(),
                failed.join(", ")
            )
        };
        Self {
            bench_id: bench_id.to_string(),
            healthy,
            checks,
            message,
        }
    }

    /// Names of the checks that failed.
    pub fn failed_checks(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|(_, passed)| !**passed)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

// =============================================================================
// HealthCheck trait
// =============================================================================

/// A pre-flight verifier the broker consults before granting a bench.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Run all checks against the bench's connection info.
    async fn check_bench(&self, bench: &Bench) -> HealthCheckResult;
}

// =============================================================================
// NetworkHealthChecker — production variant
// =============================================================================

/// Health checker that performs real network I/O.
///
/// UUT and PTP reachability use the system `ping`; PSU communication is
/// verified by opening a TCP connection to the supply's SCPI port within the
/// configured timeout. No SCPI command is sent; reachability is the contract
/// here, the PSU driver owns the protocol.
pub struct NetworkHealthChecker {
    config: HealthCheckConfig,
}

impl NetworkHealthChecker {
    /// Create a checker with the given tuning.
    pub fn new(config: HealthCheckConfig) -> Self {
        Self { config }
    }

    /// Run one named check with the configured retry budget.
    ///
    /// The first passing attempt wins; erroring attempts are logged and
    /// counted as failures.
    async fn run_with_retry(&self, check_name: &str, bench: &Bench) -> bool {
        for attempt in 1..=self.config.retry_count {
            let outcome = match check_name {
                CHECK_PING_UUT => self.ping_host(&bench.connection.uut_ip).await,
                CHECK_VERIFY_PSU => self.probe_psu(&bench.connection.psu_ip).await,
                CHECK_PTP_CONNECTIVITY => self.ping_host(&bench.connection.ptp_ip).await,
                other => {
                    warn!(check = other, "unknown health check requested");
                    Ok(false)
                }
            };
            match outcome {
                Ok(true) => return true,
                Ok(false) => debug!(
                    check = check_name,
                    bench = %bench.id,
                    attempt,
                    retries = self.config.retry_count,
                    "health check attempt failed"
                ),
                Err(err) => warn!(
                    check = check_name,
                    bench = %bench.id,
                    attempt,
                    error = %err,
                    "health check attempt errored"
                ),
            }
        }
        false
    }

    /// ICMP reachability via the system `ping` binary.
    async fn ping_host(&self, host: &str) -> CheckResult<bool> {
        if host.is_empty() {
            anyhow::bail!("no address configured");
        }
        let timeout_sec = self.config.ping_timeout_sec;
        let mut command = tokio::process::Command::new("ping");
        if cfg!(windows) {
            command
                .arg("-n")
                .arg("1")
                .arg("-w")
                .arg((timeout_sec * 1000).to_string());
        } else {
            command
                .arg("-c")
                .arg("1")
                .arg("-W")
                .arg(timeout_sec.to_string());
        }
        let status = tokio::time::timeout(
            Duration::from_secs(timeout_sec + 5),
            command
                .arg(host)
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status(),
        )
        .await
        .context("ping did not finish in time")?
        .context("failed to spawn ping")?;
        Ok(status.success())
    }

    /// PSU reachability: a TCP connection to the SCPI port within the
    /// verification timeout.
    async fn probe_psu(&self, host: &str) -> CheckResult<bool> {
        if host.is_empty() {
            anyhow::bail!("no address configured");
        }
        let addr = format!("{host}:{PSU_SCPI_PORT}");
        let connect = tokio::net::TcpStream::connect(&addr);
        match tokio::time::timeout(
            Duration::from_secs(self.config.psu_verify_timeout_sec),
            connect,
        )
        .await
        {
            Ok(Ok(_stream)) => Ok(true),
            Ok(Err(err)) => {
                debug!(addr = %addr, error = %err, "PSU connection refused");
                Ok(false)
            }
            Err(_elapsed) => Ok(false),
        }
    }
}

#[async_trait]
impl HealthCheck for NetworkHealthChecker {
    async fn check_bench(&self, bench: &Bench) -> HealthCheckResult {
        debug!(bench = %bench.id, "starting health check");
        let mut checks = BTreeMap::new();
        for name in CHECK_NAMES {
            let passed = self.run_with_retry(name, bench).await;
            checks.insert(name.to_string(), passed);
        }
        let result = HealthCheckResult::from_checks(&bench.id, checks);
        if result.healthy {
            debug!(bench = %bench.id, "{}", result.message);
        } else {
            warn!(bench = %bench.id, "{}", result.message);
        }
        result
    }
}

// =============================================================================
// ScriptedHealthChecker — deterministic test double
// =============================================================================

/// Health checker with configurable verdicts and no I/O.
///
/// Every check passes unless a failure has been injected for that
/// (bench, check) pair. Ships in the library rather than behind `cfg(test)`
/// so integration tests and the CLI's mock mode can drive partial-failure
/// scenarios against the real broker.
#[derive(Default)]
pub struct ScriptedHealthChecker {
    failures: Mutex<HashMap<BenchId, HashSet<String>>>,
}

impl ScriptedHealthChecker {
    /// Create a checker where every check passes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure one check to fail for a bench.
    pub fn fail_check(&self, bench_id: &str, check_name: &str) {
        #[allow(clippy::unwrap_used)] // poisoned only if a test already panicked
        self.failures
            .lock()
            .unwrap()
            .entry(bench_id.to_string())
            .or_default()
            .insert(check_name.to_string());
    }

    /// Configure several checks to fail for a bench.
    pub fn fail_checks(&self, bench_id: &str, check_names: &[&str]) {
        for name in check_names {
            self.fail_check(bench_id, name);
        }
    }

    /// Remove all injected failures, restoring all-pass behavior.
    pub fn clear(&self) {
        #[allow(clippy::unwrap_used)]
        self.failures.lock().unwrap().clear();
    }
}

#[async_trait]
impl HealthCheck for ScriptedHealthChecker {
    async fn check_bench(&self, bench: &Bench) -> HealthCheckResult {
        let checks = {
            #[allow(clippy::unwrap_used)]
            let failures = self.failures.lock().unwrap();
            let failing = failures.get(&bench.id);
            CHECK_NAMES
                .iter()
                .map(|name| {
                    let passed = failing.map_or(true, |set| !set.contains(*name));
                    ((*name).to_string(), passed)
                })
                .collect::<BTreeMap<_, _>>()
        };
        HealthCheckResult::from_checks(&bench.id, checks)
    }
}
