//! Frequency interference arbitration for shared RF enclosures.
//!
//! A coffin (RF-isolated enclosure) holds up to four radars. Two radars
//! transmitting on the same frequency inside one enclosure jam each other,
//! so transmission rights are granted per frequency: one bench holds a
//! frequency at a time, everyone else is denied until it is released.
//!
//! Denial is non-blocking and carries no queue; a denied caller polls,
//! retries, or picks another bench. A conflict is an expected, frequent
//! outcome of shared-enclosure operation, so it is reported as `false`
//! rather than an error.
//!
//! The arbiter owns its own mutex: drivers call it outside the broker's
//! allocation critical section, possibly from several tasks at once. Grants
//! and releases are map operations that never block on I/O, so a plain
//! `std::sync::Mutex` is sufficient.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bench::BenchId;

/// Frequencies are matched at kHz granularity so that float noise in a
/// nominal "76.5 GHz" never splits one physical frequency into two keys.
type FreqKey = u64;

fn freq_key(frequency_ghz: f64) -> FreqKey {
    (frequency_ghz * 1_000_000.0).round() as FreqKey
}

/// An exclusive frequency grant held by a bench.
#[derive(Debug, Clone, Serialize)]
pub struct FrequencyAllocation {
    /// The holding bench.
    pub bench_id: BenchId,
    /// Granted transmission frequency in GHz.
    pub frequency_ghz: f64,
}

#[derive(Default)]
struct ArbiterState {
    /// frequency -> holding bench
    holders: HashMap<FreqKey, BenchId>,
    /// bench -> its grant
    allocations: HashMap<BenchId, FrequencyAllocation>,
}

/// In-process registry granting exclusive use of an RF frequency to one
/// bench at a time within a shared enclosure.
#[derive(Default)]
pub struct FrequencyArbiter {
    state: Mutex<ArbiterState>,
}

impl FrequencyArbiter {
    /// Create an arbiter with no grants.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request exclusive use of `frequency_ghz` for `bench_id`.
    ///
    /// Grants when the frequency has no holder or the holder is the same
    /// bench (idempotent re-grant). A bench that already holds a different
    /// frequency releases it as part of the new grant; a bench transmits on
    /// one frequency at a time.
    ///
    /// Returns `false` without blocking when another bench holds the
    /// frequency.
    pub fn request_frequency(&self, bench_id: &str, frequency_ghz: f64) -> bool {
        let key = freq_key(frequency_ghz);
        #[allow(clippy::unwrap_used)] // no panics while the mutex is held
        let mut state = self.state.lock().unwrap();

        if let Some(holder) = state.holders.get(&key) {
            if holder != bench_id {
                warn!(
                    frequency_ghz,
                    holder = %holder,
                    requester = %bench_id,
                    "frequency in use, request denied"
                );
                return false;
            }
            // Already ours.
            return true;
        }

        // Retuning: drop any previous grant this bench still holds.
        if let Some(previous) = state.allocations.remove(bench_id) {
            state.holders.remove(&freq_key(previous.frequency_ghz));
            debug!(
                bench = %bench_id,
                previous_ghz = previous.frequency_ghz,
                "released previous frequency on retune"
            );
        }

        state.holders.insert(key, bench_id.to_string());
        state.allocations.insert(
            bench_id.to_string(),
            FrequencyAllocation {
                bench_id: bench_id.to_string(),
                frequency_ghz,
            },
        );
        info!(frequency_ghz, bench = %bench_id, "frequency allocated");
        true
    }

    /// Release the frequency held by `bench_id`, if any.
    ///
    /// A no-op when the bench holds nothing; releasing never affects another
    /// bench's grant.
    pub fn release_frequency(&self, bench_id: &str) {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        if let Some(allocation) = state.allocations.remove(bench_id) {
            let key = freq_key(allocation.frequency_ghz);
            if state.holders.get(&key).map(String::as_str) == Some(bench_id) {
                state.holders.remove(&key);
            }
            info!(bench = %bench_id, frequency_ghz = allocation.frequency_ghz, "frequency released");
        }
    }

    /// Whether `frequency_ghz` currently has no holder.
    pub fn is_frequency_available(&self, frequency_ghz: f64) -> bool {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        !state.holders.contains_key(&freq_key(frequency_ghz))
    }

    /// All current grants, for diagnostics.
    pub fn active_allocations(&self) -> BTreeMap<BenchId, f64> {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        state
            .allocations
            .values()
            .map(|alloc| (alloc.bench_id.clone(), alloc.frequency_ghz))
            .collect()
    }
}
