//! Property-based tests for health and report classification

use chrono::Utc;
use proptest::prelude::*;
use syncguard::health::HealthMetrics;
use syncguard::{HealthStatus, HealthThresholds, OverallStatus, SyncHealth};

fn metrics_strategy() -> impl Strategy<Value = HealthMetrics> {
    (0u64..500, 0u64..500, 0u32..10, 0.0f64..30_000.0).prop_map(
        |(successful, failed, consecutive, average)| HealthMetrics {
            total_attempts: successful + failed,
            successful_syncs: successful,
            failed_syncs: failed,
            consecutive_failures: consecutive.min(failed as u32),
            average_sync_time_ms: average,
            last_sync_time: None,
            session_start: Utc::now(),
        },
    )
}

/// Unhealthy beats degraded beats slow beats healthy
#[test]
fn test_health_precedence_property() {
    let mut runner = proptest::test_runner::TestRunner::default();
    let thresholds = HealthThresholds::default();

    runner
        .run(&metrics_strategy(), |metrics| {
            let status = HealthStatus::evaluate(&metrics, &thresholds);
            let error_rate = metrics.error_rate();

            if metrics.consecutive_failures >= thresholds.unhealthy_consecutive_failures {
                prop_assert_eq!(status.status, SyncHealth::Unhealthy);
            } else if error_rate > thresholds.degraded_error_rate || metrics.consecutive_failures > 0 {
                prop_assert_eq!(status.status, SyncHealth::Degraded);
            } else if metrics.average_sync_time_ms > thresholds.slow_sync_time_ms as f64 {
                prop_assert_eq!(status.status, SyncHealth::Slow);
            } else {
                prop_assert_eq!(status.status, SyncHealth::Healthy);
                prop_assert!(status.issues.is_empty());
            }

            prop_assert!((0.0..=1.0).contains(&status.error_rate));
            prop_assert_eq!(status.status == SyncHealth::Healthy, status.issues.is_empty());
            Ok(())
        })
        .unwrap();
}

/// Rates stay complementary whenever anything has run
#[test]
fn test_error_and_success_rates_sum_to_one() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&metrics_strategy(), |metrics| {
            prop_assume!(metrics.total_attempts > 0);
            let sum = metrics.error_rate() + metrics.success_rate();
            prop_assert!((sum - 1.0).abs() < 1e-9);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_overall_status_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(0usize..50, 0usize..50, any::<bool>()), |(passed, failed, aborted)| {
            let status = OverallStatus::from_counts(passed, failed, aborted);
            let total = passed + failed;

            if aborted || total == 0 {
                prop_assert_eq!(status, OverallStatus::Critical);
            } else if failed == 0 {
                prop_assert_eq!(status, OverallStatus::AllSystemsGo);
            } else if passed * 2 < total {
                prop_assert_eq!(status, OverallStatus::Critical);
            } else {
                prop_assert_eq!(status, OverallStatus::Degraded);
            }

            // One more passing check never makes things worse.
            let improved = OverallStatus::from_counts(passed + 1, failed, aborted);
            prop_assert!(rank(improved) <= rank(status));
            Ok(())
        })
        .unwrap();
}

fn rank(status: OverallStatus) -> u8 {
    match status {
        OverallStatus::AllSystemsGo => 0,
        OverallStatus::Degraded => 1,
        OverallStatus::Critical => 2,
    }
}
