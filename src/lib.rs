//! # Bench Broker Core Library
//!
//! This crate brokers exclusive access to a small, fixed inventory of
//! physical radar test benches (unit under test + power supply + time-sync
//! source) shared by concurrent automated test jobs. Callers request a bench
//! by hardware type; the broker grants at most one caller per bench, verifies
//! the bench is actually reachable before granting it, and releases it
//! cleanly afterward — while multiple jobs, possibly on different host
//! machines, compete for the same limited pool.
//!
//! ## Crate Structure
//!
//! - **`bench`**: the inventory data model — bench descriptors, the closed
//!   state enumeration, and the status read-model returned by queries.
//! - **`broker`**: the `BenchBroker` itself: global concurrency ceiling,
//!   candidate scan, health-gated admission, release and administrative
//!   overrides, all under one coarse in-process lock.
//! - **`config`**: figment-based typed configuration (TOML + environment
//!   overrides) for the inventory, the health checks, and the broker.
//! - **`error`**: the `BrokerError` taxonomy shared across the crate.
//! - **`grant`**: allocation metadata handed to callers, flattened into
//!   key/value pairs for test-report attachment.
//! - **`health`**: the pluggable `HealthCheck` trait with a network-backed
//!   production checker and a scripted deterministic one for tests.
//! - **`lock`**: the cross-process advisory file lock serializing access to
//!   a physically shared instrument, with stale-holder reclaim.
//! - **`logging`**: tracing subscriber bootstrap used by the binary.
//! - **`rf`**: the frequency arbiter granting exclusive use of an RF
//!   frequency within a shared enclosure.

pub mod bench;
pub mod broker;
pub mod config;
pub mod error;
pub mod grant;
pub mod health;
pub mod lock;
pub mod logging;
pub mod rf;

pub use bench::{Bench, BenchState, BenchStatus, ConnectionInfo};
pub use broker::BenchBroker;
pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use grant::AllocationMetadata;
pub use health::{HealthCheck, HealthCheckResult, NetworkHealthChecker, ScriptedHealthChecker};
pub use lock::{InstrumentLock, InstrumentLockGuard};
pub use rf::FrequencyArbiter;
