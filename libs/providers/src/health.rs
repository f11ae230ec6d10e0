use std::sync::Mutex;

use serde::Serialize;

use courier_core::now_epoch_ms;

/// Failure ratio at or above which a provider stops being considered
/// healthy for send candidate selection.
const UNHEALTHY_FAILURE_RATIO: f64 = 0.30;

#[derive(Clone, Copy, Debug, Default)]
struct HealthInner {
    success_count: u64,
    failure_count: u64,
    last_success_at: Option<i64>,
    last_failure_at: Option<i64>,
    avg_response_time_ms: f64,
}

/// Shared send-health bookkeeping for a provider instance. Every send path
/// records into this; the send router reads snapshots when filtering
/// candidates.
#[derive(Debug, Default)]
pub struct HealthMetrics {
    inner: Mutex<HealthInner>,
}

impl HealthMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, response_time_ms: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.success_count += 1;
        inner.last_success_at = Some(now_epoch_ms());
        // Running mean over successes only.
        let n = inner.success_count as f64;
        let delta = (response_time_ms - inner.avg_response_time_ms) / n;
        inner.avg_response_time_ms += delta;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failure_count += 1;
        inner.last_failure_at = Some(now_epoch_ms());
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.inner.lock().unwrap();
        HealthSnapshot {
            success_count: inner.success_count,
            failure_count: inner.failure_count,
            last_success_at: inner.last_success_at,
            last_failure_at: inner.last_failure_at,
            avg_response_time_ms: inner.avg_response_time_ms,
        }
    }
}

/// Point-in-time copy of a provider's health metrics, also exposed on the
/// admin status surface.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct HealthSnapshot {
    #[serde(rename = "successCount")]
    pub success_count: u64,
    #[serde(rename = "failureCount")]
    pub failure_count: u64,
    #[serde(rename = "lastSuccessAt")]
    pub last_success_at: Option<i64>,
    #[serde(rename = "lastFailureAt")]
    pub last_failure_at: Option<i64>,
    #[serde(rename = "avgResponseTimeMs")]
    pub avg_response_time_ms: f64,
}

impl HealthSnapshot {
    /// True when there are no observations yet, or the failure ratio is
    /// below the unhealthy threshold.
    pub fn failure_ratio_ok(&self) -> bool {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return true;
        }
        (self.failure_count as f64) / (total as f64) < UNHEALTHY_FAILURE_RATIO
    }
}
