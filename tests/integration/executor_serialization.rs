//! Integration tests for the exclusive executor
//!
//! Tests cover:
//! - Mutual exclusion under concurrent callers
//! - FIFO hand-off
//! - Release on error, panic and timeout
//! - Force-release recovery

use crate::integration::test_utils::OverlapRecorder;
use std::sync::Arc;
use std::time::Duration;
use syncguard::{ExclusiveExecutor, ExecutorConfig, HealthMonitor, SyncError};
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_never_overlap() {
    let executor = Arc::new(ExclusiveExecutor::default());
    let recorder = OverlapRecorder::default();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let executor = Arc::clone(&executor);
            let operation = recorder.operation(&format!("op-{}", i), Duration::from_millis(10), i);
            tokio::spawn(async move { executor.execute("writer", operation, None).await })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(recorder.peak(), 1);
    assert_eq!(recorder.runs(), 16);

    let state = executor.get_sync_status();
    assert!(!state.locked);
    assert_eq!(state.metrics.operations_completed, 16);
    assert!(state.metrics.max_lock_time_ms >= 10);
}

#[tokio::test(start_paused = true)]
async fn test_waiters_are_served_in_arrival_order() {
    let executor = Arc::new(ExclusiveExecutor::default());
    let recorder = OverlapRecorder::default();

    let holder = {
        let executor = Arc::clone(&executor);
        let operation = recorder.operation("holder", Duration::from_millis(50), 0);
        tokio::spawn(async move { executor.execute("holder", operation, None).await })
    };
    sleep(Duration::from_millis(1)).await;

    let mut waiters = Vec::new();
    for name in ["first", "second", "third"] {
        let executor = Arc::clone(&executor);
        let operation = recorder.operation(name, Duration::from_millis(1), 0);
        waiters.push(tokio::spawn(async move { executor.execute(name, operation, None).await }));
        sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(executor.get_sync_status().waiting, vec!["first", "second", "third"]);

    holder.await.unwrap().unwrap();
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }
    let order: Vec<String> = recorder.finished().into_iter().map(|(name, _)| name).collect();
    assert_eq!(order, ["holder", "first", "second", "third"]);
}

#[tokio::test(start_paused = true)]
async fn test_lock_released_after_error_and_panic() {
    let executor = ExclusiveExecutor::default();

    let err = executor
        .execute("failing", async { Err::<(), _>(anyhow::anyhow!("500 from backend")) }, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Operation { .. }));
    assert!(!executor.is_locked());

    let err = executor
        .execute(
            "panicking",
            async {
                if true {
                    panic!("malformed payload");
                }
                Ok(())
            },
            None,
        )
        .await
        .unwrap_err();
    match err {
        SyncError::OperationPanicked { label, message } => {
            assert_eq!(label, "panicking");
            assert!(message.contains("malformed payload"));
        }
        other => panic!("expected panic error, got {:?}", other),
    }
    assert!(!executor.is_locked());

    assert_eq!(executor.execute("after", async { Ok(7) }, None).await.unwrap(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_detaches_work_and_lock_frees_later() {
    let executor = Arc::new(ExclusiveExecutor::default());
    let recorder = OverlapRecorder::default();

    let err = executor
        .execute(
            "slow",
            recorder.operation("slow", Duration::from_millis(200), 1),
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(executor.is_locked());

    // The follow-up waits for the detached work before running.
    let value = executor
        .execute("next", recorder.operation("next", Duration::ZERO, 2), None)
        .await
        .unwrap();
    assert_eq!(value, 2);
    let order: Vec<String> = recorder.finished().into_iter().map(|(name, _)| name).collect();
    assert_eq!(order, ["slow", "next"]);
    assert!(!executor.is_locked());
}

#[tokio::test(start_paused = true)]
async fn test_force_release_rejects_waiters_and_ignores_stale_release() {
    let executor = Arc::new(ExclusiveExecutor::new(ExecutorConfig {
        stuck_lock_threshold_ms: 1_000,
    }));

    let stuck = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move {
            executor
                .execute(
                    "stuck",
                    async {
                        sleep(Duration::from_secs(10)).await;
                        Ok(())
                    },
                    None,
                )
                .await
        })
    };
    sleep(Duration::from_millis(5)).await;

    let waiter = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.execute("waiter", async { Ok(()) }, None).await })
    };
    sleep(Duration::from_millis(5)).await;

    assert!(executor.force_release());
    assert!(matches!(
        waiter.await.unwrap(),
        Err(SyncError::LockForceReleased { .. })
    ));

    let state = executor.get_sync_status();
    assert!(!state.locked);
    assert_eq!(state.force_releases, 1);

    // A new holder takes the lock; the stuck holder's late release must not free it.
    let fresh = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move {
            executor
                .execute(
                    "fresh",
                    async {
                        sleep(Duration::from_secs(20)).await;
                        Ok(())
                    },
                    None,
                )
                .await
        })
    };
    sleep(Duration::from_millis(5)).await;
    stuck.await.unwrap().unwrap();
    assert!(executor.is_locked());
    let status = executor.get_sync_status();
    assert_eq!(status.current_operation.as_deref(), Some("fresh"));
    // The force-released holder's ten seconds are not lock time.
    assert_eq!(status.metrics.operations_completed, 0);
    assert_eq!(status.metrics.max_lock_time_ms, 0);

    fresh.await.unwrap().unwrap();
    assert!(!executor.is_locked());
    let metrics = executor.get_sync_status().metrics;
    assert_eq!(metrics.operations_completed, 1);
    assert!(metrics.max_lock_time_ms >= 20_000);
}

#[tokio::test(start_paused = true)]
async fn test_health_monitor_observes_every_execution() {
    let health = Arc::new(HealthMonitor::default());
    let executor = ExclusiveExecutor::default().with_health_monitor(Arc::clone(&health));

    executor.execute("ok", async { Ok(()) }, None).await.unwrap();
    let _ = executor
        .execute("bad", async { Err::<(), _>(anyhow::anyhow!("nope")) }, None)
        .await;
    let _ = executor
        .execute(
            "late",
            async {
                sleep(Duration::from_millis(100)).await;
                Ok(())
            },
            Some(Duration::from_millis(10)),
        )
        .await;
    sleep(Duration::from_millis(200)).await;

    let metrics = health.metrics();
    assert_eq!(metrics.total_attempts, 3);
    assert_eq!(metrics.failed_syncs, 1);
    assert_eq!(metrics.successful_syncs, 2);
}
