//! Allocation metadata handed to callers on a successful grant.
//!
//! The metadata is created at grant time, immutable afterwards, and has no
//! further interaction with the broker; callers attach it to their test
//! reports. [`AllocationMetadata::report_fields`] flattens it into ordered
//! key/value pairs for whatever reporting backend consumes it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bench::{Bench, BenchId, ConnectionInfo, JobId};
use crate::health::HealthCheckResult;

/// Everything a job needs to know about the bench it was granted.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationMetadata {
    /// Allocated bench.
    pub bench_id: BenchId,
    /// Hardware type that was requested and matched.
    pub hardware_type: String,
    /// Endpoint addresses of the bench components.
    pub connection: ConnectionInfo,
    /// Physical location of the bench.
    pub location: String,
    /// Job the bench was granted to.
    pub job_id: JobId,
    /// When the grant was made.
    pub allocated_at: DateTime<Utc>,
    /// Host the broker granting the bench runs on.
    pub allocated_on: String,
    /// The pre-flight health check that admitted the bench, or `None` when
    /// the check was skipped.
    pub health_check: Option<HealthCheckResult>,
}

impl AllocationMetadata {
    /// Build metadata for a grant made now, on this host.
    pub fn new(
        bench: &Bench,
        job_id: JobId,
        health_check: Option<HealthCheckResult>,
    ) -> Self {
        Self {
            bench_id: bench.id.clone(),
            hardware_type: bench.hardware_type.clone(),
            connection: bench.connection.clone(),
            location: bench.location.clone(),
            job_id,
            allocated_at: Utc::now(),
            allocated_on: local_hostname(),
            health_check,
        }
    }

    /// Flatten to ordered key/value string pairs for report attachment.
    ///
    /// `health_check_passed` is the tri-state the report format expects:
    /// "true"/"false" for a performed check, "skipped" otherwise.
    pub fn report_fields(&self) -> Vec<(String, String)> {
        let health = match &self.health_check {
            Some(result) => result.healthy.to_string(),
            None => "skipped".to_string(),
        };
        vec![
            ("bench_id".into(), self.bench_id.clone()),
            ("hardware_type".into(), self.hardware_type.clone()),
            ("job_id".into(), self.job_id.clone()),
            ("uut_ip".into(), self.connection.uut_ip.clone()),
            ("uut_port".into(), self.connection.uut_port.to_string()),
            ("psu_ip".into(), self.connection.psu_ip.clone()),
            ("psu_port".into(), self.connection.psu_port.to_string()),
            ("ptp_ip".into(), self.connection.ptp_ip.clone()),
            ("location".into(), self.location.clone()),
            ("allocated_at".into(), self.allocated_at.to_rfc3339()),
            ("allocated_on".into(), self.allocated_on.clone()),
            ("health_check_passed".into(), health),
        ]
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
