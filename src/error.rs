//! Custom error types for the broker.
//!
//! This module defines the primary error type, `BrokerError`, used across the
//! crate. Using the `thiserror` crate, it provides a centralized and consistent
//! way to handle the different failure classes of the allocation path.
//!
//! ## Error Taxonomy
//!
//! - **`ConcurrencyLimitExceeded`**: the global job ceiling is already reached.
//!   Recoverable; the caller may retry once another job releases its bench.
//! - **`NoMatchingBench`**: no bench of the requested hardware type is
//!   currently available. Carries the set of types that do have availability
//!   so callers can diagnose a misconfigured request quickly.
//! - **`AllCandidatesUnhealthy`**: every available candidate of the requested
//!   type failed its pre-flight health check during this attempt. The failing
//!   benches have been marked offline (when the policy says so), so the same
//!   request will not hammer them again.
//! - **`LockAcquisitionTimeout`**: the cross-process instrument lock could not
//!   be obtained within the caller's timeout. Whether the holder was busy or
//!   stale-but-unreclaimable is visible only in the logs.
//! - **`Config` / `InvalidConfig`**: extraction errors from figment vs.
//!   semantic errors that pass parsing but are logically wrong (duplicate
//!   bench ids, a zero job ceiling). The latter are caught by
//!   [`crate::config::BrokerConfig::validate`].
//!
//! Allocation failures are surfaced to the caller as typed errors and never
//! silently retried by the broker itself; retry/backoff is the caller's
//! responsibility. Frequency conflicts are an expected outcome, not a fault,
//! and are reported as a boolean by the arbiter rather than through this enum.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the broker error type.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors produced by the bench broker and its locking primitives.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The global concurrency ceiling is already reached.
    #[error("maximum concurrent jobs reached ({limit}); currently {active} benches allocated")]
    ConcurrencyLimitExceeded {
        /// Configured ceiling.
        limit: usize,
        /// Allocations held when the request arrived.
        active: usize,
    },

    /// No available bench matches the requested hardware type.
    #[error("no available bench for hardware type '{hardware_type}'; types with availability: {available_types:?}")]
    NoMatchingBench {
        /// The type the caller asked for.
        hardware_type: String,
        /// Hardware types that currently have at least one available bench.
        available_types: Vec<String>,
    },

    /// Every available candidate of the requested type failed its health check.
    #[error("all {candidates} candidate bench(es) for hardware type '{hardware_type}' failed health checks")]
    AllCandidatesUnhealthy {
        /// The type the caller asked for.
        hardware_type: String,
        /// How many candidates were tried.
        candidates: usize,
    },

    /// The cross-process instrument lock was not obtained in time.
    #[error("could not acquire lock for instrument '{instrument}' within {waited:?}")]
    LockAcquisitionTimeout {
        /// Address of the shared instrument the lock protects.
        instrument: String,
        /// How long the caller was willing to wait.
        waited: Duration,
    },

    /// Configuration could not be extracted from its sources.
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but is semantically invalid.
    #[error("configuration validation error: {0}")]
    InvalidConfig(String),

    /// I/O failure, typically from the lock directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Whether the caller can reasonably retry the operation later.
    ///
    /// Ceiling and lock-timeout failures clear on their own once other jobs
    /// finish; the remaining variants need configuration or operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::ConcurrencyLimitExceeded { .. }
                | BrokerError::LockAcquisitionTimeout { .. }
        )
    }
}
