use std::time::Duration;

use crate::error::MeshError;
use crate::model::{Build, JobSpec};

/// Backoff before retry number `retried + 1`: the base delay doubled once
/// for every retry already performed.
pub fn retry_delay(base_secs: u64, retried: u32) -> Duration {
    let factor = 1u64.checked_shl(retried).unwrap_or(u64::MAX);
    Duration::from_secs(base_secs.saturating_mul(factor))
}

/// Whether a failed attempt should be retried.
pub fn should_retry(job: &JobSpec, build: &Build, error: &MeshError, retried: u32) -> bool {
    if retried >= job.max_retries {
        return false;
    }
    if matches!(error, MeshError::JobAborted(_)) || error.is_cancellation() {
        return false;
    }
    job.retry_condition.matches(build, &error.to_string())
}
