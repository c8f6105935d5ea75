//! The bench allocation broker.
//!
//! `BenchBroker` bridges job execution with physical hardware state: it maps
//! a requested hardware type to a concrete bench, runs the pre-flight health
//! check, and guarantees that no two jobs ever occupy the same bench.
//!
//! All allocation state — the bench state table and the allocation map —
//! lives behind one async mutex that is held for the duration of a request,
//! *including* the potentially slow health check. That trades allocation
//! throughput for correctness: no two callers can observe or act on the same
//! available bench concurrently, so the admission decision needs no further
//! coordination. Requests are rare (one per test job) and the pool is small,
//! so the serialized health check is not a bottleneck in practice.
//!
//! # Usage
//!
//! ```rust,ignore
//! let config = BrokerConfig::load()?;
//! let checker = Arc::new(NetworkHealthChecker::new(config.health_check.clone()));
//! let broker = BenchBroker::new(config, checker)?;
//!
//! let grant = broker.request_bench("radar_x_band", Some("JOB-17"), false).await?;
//! // ... run tests against grant.connection ...
//! broker.release_bench(&grant.bench_id).await;
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bench::{Bench, BenchId, BenchState, BenchStatus, JobId};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::grant::AllocationMetadata;
use crate::health::HealthCheck;

/// Mutable allocation state, exclusively owned by the broker.
struct BrokerState {
    /// Current state per bench.
    states: HashMap<BenchId, BenchState>,
    /// bench -> occupying job. An entry exists iff the bench is busy.
    allocations: HashMap<BenchId, JobId>,
}

/// Broker granting exclusive access to a fixed inventory of test benches.
pub struct BenchBroker {
    /// Immutable descriptors in configuration order; candidate scans follow
    /// this order, first match wins.
    inventory: Vec<Bench>,
    state: Mutex<BrokerState>,
    health_checker: Arc<dyn HealthCheck>,
    max_concurrent_jobs: usize,
    mark_offline_on_failure: bool,
}

impl BenchBroker {
    /// Build a broker from validated configuration and a health checker.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidConfig`] when the configuration fails
    /// validation (duplicate bench ids, zero ceiling, ...).
    pub fn new(config: BrokerConfig, health_checker: Arc<dyn HealthCheck>) -> Result<Self> {
        config.validate()?;

        let max_concurrent_jobs = config.broker.max_concurrent_jobs;
        let mark_offline_on_failure = config.health_check.mark_offline_on_failure;

        let mut inventory = Vec::with_capacity(config.benches.len());
        let mut states = HashMap::with_capacity(config.benches.len());
        for definition in config.benches {
            let (bench, state) = definition.into_parts();
            states.insert(bench.id.clone(), state);
            inventory.push(bench);
        }

        info!(
            benches = inventory.len(),
            max_concurrent = max_concurrent_jobs,
            "bench broker initialized"
        );

        Ok(Self {
            inventory,
            state: Mutex::new(BrokerState {
                states,
                allocations: HashMap::new(),
            }),
            health_checker,
            max_concurrent_jobs,
            mark_offline_on_failure,
        })
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Request a bench of the given hardware type.
    ///
    /// Finds an available bench matching the type, verifies it with the
    /// health checker (unless `skip_health_check`), marks it busy and returns
    /// the grant metadata. A candidate that fails its health check is skipped
    /// and — when `mark_offline_on_failure` is set — flipped to offline so it
    /// is not retried for the rest of the session; recovery is an explicit
    /// [`set_bench_state`] override.
    ///
    /// When `job_id` is `None`, an id of the form `auto-<bench>-<suffix>` is
    /// generated.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::ConcurrencyLimitExceeded`] when the global ceiling is
    ///   reached, regardless of hardware type.
    /// - [`BrokerError::NoMatchingBench`] when no available bench of the type
    ///   exists; carries the types that do have availability.
    /// - [`BrokerError::AllCandidatesUnhealthy`] when every candidate failed
    ///   its health check; no allocation is made.
    ///
    /// [`set_bench_state`]: BenchBroker::set_bench_state
    pub async fn request_bench(
        &self,
        hardware_type: &str,
        job_id: Option<&str>,
        skip_health_check: bool,
    ) -> Result<AllocationMetadata> {
        let mut state = self.state.lock().await;

        info!(
            hardware_type,
            job_id = job_id.unwrap_or("<auto>"),
            "bench requested"
        );

        let active = state.allocations.len();
        if active >= self.max_concurrent_jobs {
            return Err(BrokerError::ConcurrencyLimitExceeded {
                limit: self.max_concurrent_jobs,
                active,
            });
        }

        let candidates = self.find_candidates(&state, hardware_type);
        if candidates.is_empty() {
            return Err(BrokerError::NoMatchingBench {
                hardware_type: hardware_type.to_string(),
                available_types: self.available_types(&state),
            });
        }
        debug!(
            hardware_type,
            count = candidates.len(),
            ?candidates,
            "candidate benches"
        );

        let tried = candidates.len();
        for bench_id in candidates {
            // Inventory membership is guaranteed by find_candidates.
            let Some(bench) = self.bench(&bench_id) else {
                continue;
            };

            let health_result = if skip_health_check {
                None
            } else {
                let result = self.health_checker.check_bench(bench).await;
                if !result.healthy {
                    warn!(bench = %bench.id, "{}", result.message);
                    if self.mark_offline_on_failure {
                        state.states.insert(bench.id.clone(), BenchState::Offline);
                        info!(bench = %bench.id, "bench marked offline after failed health check");
                    }
                    continue;
                }
                Some(result)
            };

            let job: JobId = match job_id {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => format!("auto-{}-{}", bench.id, Uuid::new_v4().simple()),
            };

            state.states.insert(bench.id.clone(), BenchState::Busy);
            state.allocations.insert(bench.id.clone(), job.clone());

            let metadata = AllocationMetadata::new(bench, job, health_result);
            info!(
                bench = %metadata.bench_id,
                job = %metadata.job_id,
                uut = %metadata.connection.uut_ip,
                "bench allocated"
            );
            return Ok(metadata);
        }

        Err(BrokerError::AllCandidatesUnhealthy {
            hardware_type: hardware_type.to_string(),
            candidates: tried,
        })
    }

    /// Release a previously allocated bench back to the pool.
    ///
    /// Returns `false` (non-fatal, logged) when the bench was not allocated;
    /// otherwise removes the allocation record and sets the bench available.
    pub async fn release_bench(&self, bench_id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.allocations.remove(bench_id) {
            Some(job) => {
                state
                    .states
                    .insert(bench_id.to_string(), BenchState::Available);
                info!(bench = bench_id, job = %job, "bench released, now available");
                true
            }
            None => {
                warn!(bench = bench_id, "release ignored: bench is not allocated");
                false
            }
        }
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Override a bench's state (e.g. force maintenance).
    ///
    /// Returns `false` when the bench is not in the inventory. Moving a busy
    /// bench to any non-busy state discards its allocation record: the
    /// in-flight job loses its claim. That is the intended behavior for
    /// operator-forced recovery and is logged loudly.
    pub async fn set_bench_state(&self, bench_id: &str, new_state: BenchState) -> bool {
        if self.bench(bench_id).is_none() {
            warn!(bench = bench_id, "state override ignored: unknown bench");
            return false;
        }

        let mut state = self.state.lock().await;
        let old_state = state
            .states
            .get(bench_id)
            .copied()
            .unwrap_or(BenchState::Offline);
        state.states.insert(bench_id.to_string(), new_state);

        if old_state == BenchState::Busy && new_state != BenchState::Busy {
            if let Some(job) = state.allocations.remove(bench_id) {
                warn!(
                    bench = bench_id,
                    job = %job,
                    "allocation discarded by state override; the job loses its claim"
                );
            }
        } else if new_state == BenchState::Busy && !state.allocations.contains_key(bench_id) {
            warn!(
                bench = bench_id,
                "bench forced busy without an allocation record (out-of-band reservation)"
            );
        }

        info!(
            bench = bench_id,
            from = %old_state,
            to = %new_state,
            "bench state changed"
        );
        true
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Point-in-time status of one bench, or `None` when unknown.
    pub async fn bench_status(&self, bench_id: &str) -> Option<BenchStatus> {
        let bench = self.bench(bench_id)?;
        let state = self.state.lock().await;
        Some(Self::status_of(bench, &state))
    }

    /// Statuses of all benches, in inventory order.
    pub async fn all_bench_statuses(&self) -> Vec<BenchStatus> {
        let state = self.state.lock().await;
        self.inventory
            .iter()
            .map(|bench| Self::status_of(bench, &state))
            .collect()
    }

    /// Number of available benches, optionally filtered by hardware type.
    pub async fn available_count(&self, hardware_type: Option<&str>) -> usize {
        let state = self.state.lock().await;
        self.inventory
            .iter()
            .filter(|bench| {
                hardware_type.map_or(true, |wanted| bench.hardware_type == wanted)
                    && state.states.get(&bench.id) == Some(&BenchState::Available)
            })
            .count()
    }

    /// The configured global concurrency ceiling.
    pub fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs
    }

    /// Number of currently allocated benches.
    pub async fn current_allocations(&self) -> usize {
        self.state.lock().await.allocations.len()
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn bench(&self, bench_id: &str) -> Option<&Bench> {
        self.inventory.iter().find(|bench| bench.id == bench_id)
    }

    /// Available benches of the wanted type, in inventory order.
    fn find_candidates(&self, state: &BrokerState, hardware_type: &str) -> Vec<BenchId> {
        self.inventory
            .iter()
            .filter(|bench| {
                bench.hardware_type == hardware_type
                    && state.states.get(&bench.id) == Some(&BenchState::Available)
            })
            .map(|bench| bench.id.clone())
            .collect()
    }

    /// Hardware types that currently have at least one available bench.
    fn available_types(&self, state: &BrokerState) -> Vec<String> {
        let types: BTreeSet<String> = self
            .inventory
            .iter()
            .filter(|bench| state.states.get(&bench.id) == Some(&BenchState::Available))
            .map(|bench| bench.hardware_type.clone())
            .collect();
        types.into_iter().collect()
    }

    fn status_of(bench: &Bench, state: &BrokerState) -> BenchStatus {
        BenchStatus {
            bench_id: bench.id.clone(),
            hardware_type: bench.hardware_type.clone(),
            state: state
                .states
                .get(&bench.id)
                .copied()
                .unwrap_or(BenchState::Offline),
            allocated_to: state.allocations.get(&bench.id).cloned(),
            location: bench.location.clone(),
            connection: bench.connection.clone(),
        }
    }
}
