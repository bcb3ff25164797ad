//! Sync Health Monitor
//!
//! Tracks the outcome and duration of every operation that passes through the
//! [`ExclusiveExecutor`](crate::executor::ExclusiveExecutor) and classifies the
//! overall health of synchronization. Counters are only ever mutated through the
//! executor's post-execution hook; everything else reads snapshots.

use crate::error::SyncError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Number of attempts kept for the rolling average.
pub const RECENT_SYNC_CAPACITY: usize = 50;
/// Number of attempts exposed through [`HealthStatus::recent_syncs`].
pub const REPORTED_RECENT_SYNCS: usize = 10;

/// Tunable classification thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// Consecutive failures at which status becomes `unhealthy`.
    pub unhealthy_consecutive_failures: u32,
    /// Consecutive failures at which status becomes `degraded`.
    pub degraded_consecutive_failures: u32,
    /// Error rate above which status becomes `degraded`.
    pub degraded_error_rate: f64,
    /// Average sync time (ms) above which an otherwise healthy system is `slow`.
    pub slow_sync_time_ms: u64,
    /// Average sync time (ms) above which archiving is recommended.
    pub large_dataset_sync_time_ms: u64,
    /// Error rate above which a connectivity check is recommended.
    pub high_error_rate: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            unhealthy_consecutive_failures: 3,
            degraded_consecutive_failures: 1,
            degraded_error_rate: 0.2,
            slow_sync_time_ms: 10_000,
            large_dataset_sync_time_ms: 15_000,
            high_error_rate: 0.1,
        }
    }
}

impl HealthThresholds {
    pub fn validate(&self) -> Result<(), String> {
        if self.unhealthy_consecutive_failures == 0 {
            return Err("unhealthy_consecutive_failures must be at least 1".to_string());
        }
        if self.degraded_consecutive_failures > self.unhealthy_consecutive_failures {
            return Err(
                "degraded_consecutive_failures cannot exceed unhealthy_consecutive_failures"
                    .to_string(),
            );
        }
        for (name, rate) in [
            ("degraded_error_rate", self.degraded_error_rate),
            ("high_error_rate", self.high_error_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(format!("{} must be within 0.0..=1.0 (got {})", name, rate));
            }
        }
        Ok(())
    }
}

/// Overall sync health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Slow,
}

impl SyncHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncHealth::Healthy => "healthy",
            SyncHealth::Degraded => "degraded",
            SyncHealth::Unhealthy => "unhealthy",
            SyncHealth::Slow => "slow",
        }
    }

    /// Healthy and slow systems still sync correctly.
    pub fn is_operational(self) -> bool {
        matches!(self, SyncHealth::Healthy | SyncHealth::Slow)
    }
}

impl fmt::Display for SyncHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One finished execution as seen by the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncAttemptRecord {
    pub label: String,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Rolling counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub total_attempts: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub consecutive_failures: u32,
    /// Mean duration over the recent-attempt window.
    pub average_sync_time_ms: f64,
    /// Completion time of the last successful sync.
    pub last_sync_time: Option<DateTime<Utc>>,
    pub session_start: DateTime<Utc>,
}

impl HealthMetrics {
    pub fn new() -> Self {
        Self {
            total_attempts: 0,
            successful_syncs: 0,
            failed_syncs: 0,
            consecutive_failures: 0,
            average_sync_time_ms: 0.0,
            last_sync_time: None,
            session_start: Utc::now(),
        }
    }

    /// `failed_syncs / total_attempts`, or 0 when nothing has run.
    pub fn error_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            0.0
        } else {
            self.failed_syncs as f64 / self.total_attempts as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            1.0
        } else {
            self.successful_syncs as f64 / self.total_attempts as f64
        }
    }
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Derived classification plus the reasons behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: SyncHealth,
    pub issues: Vec<String>,
    pub error_rate: f64,
    pub metrics: HealthMetrics,
    pub recent_syncs: Vec<SyncAttemptRecord>,
}

impl HealthStatus {
    /// Classify metrics against thresholds.
    ///
    /// Precedence: unhealthy, degraded, slow, healthy. `issues` names every
    /// threshold that was crossed, including ones that did not decide the status.
    pub fn evaluate(metrics: &HealthMetrics, thresholds: &HealthThresholds) -> Self {
        let error_rate = metrics.error_rate();
        let consecutive = metrics.consecutive_failures;
        let mut issues = Vec::new();

        let unhealthy = consecutive >= thresholds.unhealthy_consecutive_failures;
        if unhealthy {
            issues.push(format!("{} consecutive failures", consecutive));
        }

        let high_error_rate = error_rate > thresholds.degraded_error_rate;
        if high_error_rate {
            issues.push(format!("High error rate: {:.1}%", error_rate * 100.0));
        }

        let recent_failure = consecutive >= thresholds.degraded_consecutive_failures
            && consecutive > 0
            && !unhealthy;
        if recent_failure {
            issues.push(format!(
                "Most recent sync failed ({} consecutive failure{})",
                consecutive,
                if consecutive == 1 { "" } else { "s" }
            ));
        }

        let slow = metrics.average_sync_time_ms > thresholds.slow_sync_time_ms as f64;
        if slow {
            issues.push(format!(
                "Slow sync: {:.1}s average",
                metrics.average_sync_time_ms / 1000.0
            ));
        }

        let status = if unhealthy {
            SyncHealth::Unhealthy
        } else if high_error_rate || recent_failure {
            SyncHealth::Degraded
        } else if slow {
            SyncHealth::Slow
        } else {
            SyncHealth::Healthy
        };

        Self {
            status,
            issues,
            error_rate,
            metrics: metrics.clone(),
            recent_syncs: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct MonitorState {
    metrics: HealthMetrics,
    recent: VecDeque<SyncAttemptRecord>,
}

impl MonitorState {
    fn new() -> Self {
        Self {
            metrics: HealthMetrics::new(),
            recent: VecDeque::with_capacity(RECENT_SYNC_CAPACITY),
        }
    }
}

/// Observes executions and classifies sync health.
#[derive(Debug)]
pub struct HealthMonitor {
    thresholds: HealthThresholds,
    state: RwLock<MonitorState>,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            state: RwLock::new(MonitorState::new()),
        }
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Post-execution hook. Only the executor calls this.
    pub(crate) fn record_execution(&self, label: &str, duration: Duration, error: Option<&SyncError>) {
        let duration_ms = duration.as_millis() as u64;
        let record = SyncAttemptRecord {
            label: label.to_string(),
            duration_ms,
            success: error.is_none(),
            error: error.map(|e| e.to_string()),
            finished_at: Utc::now(),
        };

        let mut state = self.state.write();
        state.recent.push_front(record.clone());
        state.recent.truncate(RECENT_SYNC_CAPACITY);

        let metrics = &mut state.metrics;
        metrics.total_attempts += 1;
        if record.success {
            metrics.successful_syncs += 1;
            metrics.consecutive_failures = 0;
            metrics.last_sync_time = Some(record.finished_at);
        } else {
            metrics.failed_syncs += 1;
            metrics.consecutive_failures = metrics.consecutive_failures.saturating_add(1);
        }

        let window: u64 = state.recent.iter().map(|r| r.duration_ms).sum();
        let average = window as f64 / state.recent.len() as f64;
        state.metrics.average_sync_time_ms = average;

        let metrics = &state.metrics;
        if record.success {
            debug!(
                label,
                duration_ms,
                success_rate = metrics.success_rate(),
                "Recorded successful sync"
            );
            if duration_ms > self.thresholds.slow_sync_time_ms {
                warn!(
                    label,
                    duration_ms,
                    threshold_ms = self.thresholds.slow_sync_time_ms,
                    "Slow sync detected"
                );
            }
        } else {
            warn!(
                label,
                duration_ms,
                consecutive_failures = metrics.consecutive_failures,
                error_rate = metrics.error_rate(),
                error = record.error.as_deref().unwrap_or_default(),
                "Recorded failed sync"
            );
        }
    }

    pub fn metrics(&self) -> HealthMetrics {
        self.state.read().metrics.clone()
    }

    pub fn get_health_status(&self) -> HealthStatus {
        let state = self.state.read();
        let mut status = HealthStatus::evaluate(&state.metrics, &self.thresholds);
        status.recent_syncs = state
            .recent
            .iter()
            .take(REPORTED_RECENT_SYNCS)
            .cloned()
            .collect();
        status
    }

    /// Actionable text for a diagnostics UI.
    pub fn get_recommendations(&self) -> Vec<String> {
        let health = self.get_health_status();
        let metrics = &health.metrics;
        let mut recommendations = Vec::new();

        match health.status {
            SyncHealth::Unhealthy => {
                recommendations
                    .push("Repeated failures - check backend reachability and network stability".to_string());
                recommendations.push("Consider clearing local data and re-syncing".to_string());
            }
            SyncHealth::Degraded => {
                recommendations.push(
                    "Intermittent failures - syncs will retry; watch the error rate".to_string(),
                );
            }
            SyncHealth::Slow => {
                recommendations.push("Sync is slow - check network latency".to_string());
            }
            SyncHealth::Healthy => {}
        }

        if metrics.average_sync_time_ms > self.thresholds.large_dataset_sync_time_ms as f64 {
            recommendations.push("Large dataset detected - consider data archiving".to_string());
        }

        if health.error_rate > self.thresholds.high_error_rate {
            recommendations.push("High error rate - check backend connectivity".to_string());
        }

        recommendations
    }

    /// Zero all counters and history.
    pub fn reset_metrics(&self) {
        *self.state.write() = MonitorState::new();
        debug!("Sync health metrics reset");
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}
