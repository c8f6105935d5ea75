//! Bench inventory data model.
//!
//! A *bench* is a physical test station (radar unit under test, power supply,
//! time-sync link) addressable as a unit. The descriptor part of a bench is
//! immutable for the lifetime of a session; the mutable part (its state and
//! any job occupying it) is owned exclusively by the broker, which exposes
//! [`BenchStatus`] as the read-model for queries.
//!
//! State machine:
//!
//! ```text
//!   AVAILABLE ──request──▶ BUSY ──release──▶ AVAILABLE
//!       │                                        ▲
//!       └──health check failed──▶ OFFLINE ──operator override──┘
//!
//!   MAINTENANCE / OFFLINE are never auto-selected as candidates.
//! ```
//!
//! At most one job id is associated with a bench at any time, and that
//! association exists iff the bench is `Busy`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unique identifier of a bench (e.g. "BENCH-001").
pub type BenchId = String;

/// Identifier of the job occupying a bench.
pub type JobId = String;

// =============================================================================
// BenchState
// =============================================================================

/// Lifecycle state of a test bench.
///
/// Parsed from configuration case-insensitively; an unrecognized value is a
/// parse error, never a silent fallback to offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BenchState {
    /// Free for allocation.
    Available,
    /// Occupied by a job.
    Busy,
    /// Taken out of rotation by an operator.
    Maintenance,
    /// Unreachable or failed its pre-flight health check.
    Offline,
}

impl BenchState {
    /// Canonical lowercase name, as used in configuration and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            BenchState::Available => "available",
            BenchState::Busy => "busy",
            BenchState::Maintenance => "maintenance",
            BenchState::Offline => "offline",
        }
    }
}

impl fmt::Display for BenchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BenchState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "available" => Ok(BenchState::Available),
            "busy" => Ok(BenchState::Busy),
            "maintenance" => Ok(BenchState::Maintenance),
            "offline" => Ok(BenchState::Offline),
            other => Err(format!(
                "unknown bench state '{other}' (expected one of: available, busy, maintenance, offline)"
            )),
        }
    }
}

impl Serialize for BenchState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BenchState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Connection endpoints
// =============================================================================

/// Endpoint addresses of a bench's components.
///
/// Addresses are opaque to the broker; only the health checker and the
/// drivers interpret them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Unit-under-test address.
    pub uut_ip: String,
    /// Unit-under-test control port.
    #[serde(default)]
    pub uut_port: u16,
    /// Power supply address.
    pub psu_ip: String,
    /// Power supply output port (1 or 2 on a dual-output supply).
    #[serde(default)]
    pub psu_port: u16,
    /// Time-sync (PTP) source address.
    pub ptp_ip: String,
}

// =============================================================================
// Bench descriptor and status read-model
// =============================================================================

/// Immutable descriptor of a physical test bench.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bench {
    /// Unique identifier.
    pub id: BenchId,
    /// Caller-facing category used to match requests (e.g. "radar_x_band").
    pub hardware_type: String,
    /// Endpoint addresses of the bench's components.
    pub connection: ConnectionInfo,
    /// Physical location, free text.
    #[serde(default)]
    pub location: String,
}

/// Point-in-time view of a bench, returned by broker queries.
#[derive(Debug, Clone, Serialize)]
pub struct BenchStatus {
    /// Bench identifier.
    pub bench_id: BenchId,
    /// Hardware type of the bench.
    pub hardware_type: String,
    /// Current lifecycle state.
    pub state: BenchState,
    /// Job occupying the bench, if any. Present iff `state` is `Busy`.
    pub allocated_to: Option<JobId>,
    /// Physical location.
    pub location: String,
    /// Endpoint addresses.
    pub connection: ConnectionInfo,
}
