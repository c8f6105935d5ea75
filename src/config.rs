//! Broker configuration loading.
//!
//! Strongly-typed configuration for the bench broker, loaded with figment
//! from:
//! 1. a TOML file (base configuration, default `config/benches.toml`)
//! 2. environment variables prefixed with `BENCH_BROKER__`, with `__`
//!    separating nesting levels (e.g.
//!    `BENCH_BROKER__BROKER__MAX_CONCURRENT_JOBS=2`)
//!
//! The inventory is declared as an array of `[[benches]]` tables; a
//! `[health_check]` table tunes the pre-flight checks and a `[broker]` table
//! holds the global ceiling and the lock directory.
//!
//! # Example
//! ```toml
//! [broker]
//! max_concurrent_jobs = 4
//!
//! [health_check]
//! ping_timeout_sec = 5
//! psu_verify_timeout_sec = 10
//! retry_count = 2
//! mark_offline_on_failure = true
//!
//! [[benches]]
//! bench_id = "BENCH-001"
//! hardware_type = "radar_x_band"
//! state = "available"
//! location = "Lab A, coffin 1"
//! connection = { uut_ip = "192.168.1.10", uut_port = 5000, psu_ip = "192.168.1.20", psu_port = 1, ptp_ip = "192.168.1.30" }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::bench::{Bench, BenchState, ConnectionInfo};
use crate::error::{BrokerError, Result};

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Global broker settings.
    #[serde(default)]
    pub broker: BrokerSection,
    /// Pre-flight health check tuning.
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Bench inventory.
    #[serde(default)]
    pub benches: Vec<BenchDefinition>,
}

/// Global broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSection {
    /// Maximum number of concurrently allocated benches.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Directory for cross-process instrument lock files.
    /// Defaults to `~/.bench_broker/locks` when unset.
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
}

/// Health check tuning, shared by all benches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Timeout for the UUT ping check, in seconds.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_sec: u64,
    /// Timeout for the PSU verification check, in seconds.
    #[serde(default = "default_psu_verify_timeout")]
    pub psu_verify_timeout_sec: u64,
    /// Attempts per check; the first passing attempt wins.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Whether a failed health check flips the bench to offline for the
    /// rest of the session.
    #[serde(default = "default_mark_offline")]
    pub mark_offline_on_failure: bool,
}

/// One bench record in the inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchDefinition {
    /// Unique identifier.
    pub bench_id: String,
    /// Caller-facing hardware category.
    pub hardware_type: String,
    /// Declared initial state. Unrecognized values fail the load.
    #[serde(default = "default_bench_state")]
    pub state: BenchState,
    /// Component endpoint addresses.
    pub connection: ConnectionInfo,
    /// Physical location, free text.
    #[serde(default)]
    pub location: String,
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_ping_timeout() -> u64 {
    5
}

fn default_psu_verify_timeout() -> u64 {
    10
}

fn default_retry_count() -> u32 {
    2
}

fn default_mark_offline() -> bool {
    true
}

fn default_bench_state() -> BenchState {
    BenchState::Available
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            lock_dir: None,
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            ping_timeout_sec: default_ping_timeout(),
            psu_verify_timeout_sec: default_psu_verify_timeout(),
            retry_count: default_retry_count(),
            mark_offline_on_failure: default_mark_offline(),
        }
    }
}

impl BenchDefinition {
    /// Split the record into the immutable descriptor and its declared state.
    pub fn into_parts(self) -> (Bench, BenchState) {
        (
            Bench {
                id: self.bench_id,
                hardware_type: self.hardware_type,
                connection: self.connection,
                location: self.location,
            },
            self.state,
        )
    }
}

impl BrokerConfig {
    /// Load configuration from the default path and environment variables.
    ///
    /// Environment variables can override configuration with prefix
    /// `BENCH_BROKER__`, e.g. `BENCH_BROKER__BROKER__MAX_CONCURRENT_JOBS=2`.
    pub fn load() -> Result<Self> {
        Self::load_from("config/benches.toml")
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BENCH_BROKER__").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after extraction.
    ///
    /// Catches values that parse but are logically wrong: duplicate or empty
    /// bench ids, empty hardware types, a zero job ceiling, a zero retry
    /// count (which would run no check attempts at all).
    pub fn validate(&self) -> Result<()> {
        if self.broker.max_concurrent_jobs == 0 {
            return Err(BrokerError::InvalidConfig(
                "max_concurrent_jobs must be at least 1".into(),
            ));
        }
        if self.health_check.retry_count == 0 {
            return Err(BrokerError::InvalidConfig(
                "health_check.retry_count must be at least 1".into(),
            ));
        }

        let mut ids = HashSet::new();
        for bench in &self.benches {
            if bench.bench_id.is_empty() {
                return Err(BrokerError::InvalidConfig(
                    "bench with empty bench_id".into(),
                ));
            }
            if bench.hardware_type.is_empty() {
                return Err(BrokerError::InvalidConfig(format!(
                    "bench '{}' has an empty hardware_type",
                    bench.bench_id
                )));
            }
            if !ids.insert(&bench.bench_id) {
                return Err(BrokerError::InvalidConfig(format!(
                    "duplicate bench_id: {}",
                    bench.bench_id
                )));
            }
        }

        Ok(())
    }
}
