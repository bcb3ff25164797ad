//! Integration tests for health tracking through the orchestrator
//!
//! Tests cover:
//! - Failure streaks and recovery
//! - Quick status with misbehaving reachability probes
//! - Recommendations

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use syncguard::{
    ExecuteOptions, ProbeReport, QuickStatus, ReachabilityProbe, SyncHealth, SyncOrchestrator,
};

async fn fail(sync: &SyncOrchestrator<u32>) {
    let result = sync
        .execute_sync(
            async { Err(anyhow::anyhow!("backend returned 503")) },
            "transactions",
            ExecuteOptions::immediate(),
        )
        .await;
    assert!(result.is_err());
}

async fn succeed(sync: &SyncOrchestrator<u32>) {
    sync.execute_sync(async { Ok(1) }, "transactions", ExecuteOptions::immediate())
        .await
        .unwrap();
}

/// Reports reachable until switched off.
struct ToggleProbe {
    online: AtomicBool,
}

#[async_trait]
impl ReachabilityProbe for ToggleProbe {
    async fn probe(&self) -> anyhow::Result<ProbeReport> {
        if self.online.load(Ordering::SeqCst) {
            Ok(ProbeReport::reachable(12))
        } else {
            anyhow::bail!("connection refused")
        }
    }

    fn name(&self) -> &str {
        "firestore"
    }
}

struct PanickingProbe;

#[async_trait]
impl ReachabilityProbe for PanickingProbe {
    async fn probe(&self) -> anyhow::Result<ProbeReport> {
        panic!("probe state poisoned")
    }
}

#[tokio::test]
async fn test_three_failures_then_recovery() {
    let sync = SyncOrchestrator::<u32>::new();

    for _ in 0..3 {
        fail(&sync).await;
    }
    let health = sync.get_status().health;
    assert_eq!(health.status, SyncHealth::Unhealthy);
    assert_eq!(health.metrics.consecutive_failures, 3);
    assert!(health.issues.iter().any(|i| i.contains("3 consecutive failures")));

    let quick = sync.check_health().await;
    assert!(!quick.is_healthy);
    assert_eq!(quick.status, QuickStatus::IssuesDetected);
    let state_check = quick.checks.iter().find(|c| c.name == "health_state").unwrap();
    assert!(!state_check.is_passed());

    succeed(&sync).await;
    let health = sync.get_status().health;
    assert_eq!(health.metrics.consecutive_failures, 0);
    assert_eq!(health.metrics.successful_syncs, 1);
    assert_eq!(health.status, SyncHealth::Degraded);
    assert!(health.metrics.last_sync_time.is_some());
}

#[tokio::test]
async fn test_error_rate_decays_back_to_healthy() {
    let sync = SyncOrchestrator::<u32>::new();
    fail(&sync).await;
    for _ in 0..9 {
        succeed(&sync).await;
    }
    let health = sync.get_status().health;
    assert!((health.error_rate - 0.1).abs() < 1e-9);
    assert_eq!(health.status, SyncHealth::Healthy);
    assert!(sync.check_health().await.is_healthy);
}

#[tokio::test]
async fn test_recommendations_follow_status() {
    let sync = SyncOrchestrator::<u32>::new();
    assert!(sync.get_recommendations().is_empty());

    for _ in 0..3 {
        fail(&sync).await;
    }
    let recommendations = sync.get_recommendations();
    assert!(recommendations.iter().any(|r| r.contains("backend reachability")));
    assert!(recommendations.iter().any(|r| r.contains("High error rate")));
}

#[tokio::test]
async fn test_probe_error_yields_error_status_and_recovers() {
    let probe = Arc::new(ToggleProbe {
        online: AtomicBool::new(false),
    });
    let sync = SyncOrchestrator::<u32>::new().with_probe(probe.clone());

    let quick = sync.check_health().await;
    assert!(!quick.is_healthy);
    assert_eq!(quick.status, QuickStatus::Error);
    assert!(quick.error.as_deref().unwrap().contains("connection refused"));

    probe.online.store(true, Ordering::SeqCst);
    let quick = sync.check_health().await;
    assert!(quick.is_healthy);
    assert_eq!(quick.status, QuickStatus::Healthy);
    assert!(quick.error.is_none());
    let reachability = quick.checks.iter().find(|c| c.name == "reachability").unwrap();
    assert!(reachability.details.contains("firestore reachable in 12ms"));
}

#[tokio::test]
async fn test_panicking_probe_never_escapes_check_health() {
    let sync = SyncOrchestrator::<u32>::new().with_probe(Arc::new(PanickingProbe));
    let quick = sync.check_health().await;
    assert_eq!(quick.status, QuickStatus::Error);
    assert!(quick.error.unwrap().contains("probe state poisoned"));

    // The live system keeps working afterwards.
    succeed(&sync).await;
    assert_eq!(sync.get_status().health.metrics.successful_syncs, 1);
}

#[tokio::test]
async fn test_quick_status_serializes_screaming_status() {
    let sync = SyncOrchestrator::<u32>::new();
    fail(&sync).await;
    let value = serde_json::to_value(sync.check_health().await).unwrap();
    assert_eq!(value["status"], "ISSUES_DETECTED");
    assert_eq!(value["is_healthy"], false);
    assert!(value.get("error").is_none());
}
