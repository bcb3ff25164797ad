//! Integration tests for the debounced queue
//!
//! Tests cover:
//! - Same-type coalescing and supersede accounting
//! - Debounce restart and max-age forcing
//! - Flush ordering and batch draining
//! - Clear semantics

use crate::integration::test_utils::OverlapRecorder;
use std::sync::Arc;
use std::time::Duration;
use syncguard::{DebouncedQueue, ExclusiveExecutor, QueueConfig, SyncError};
use tokio::time::{sleep, Instant};

fn create_test_queue(config: QueueConfig) -> (DebouncedQueue<u32>, Arc<ExclusiveExecutor>) {
    let executor = Arc::new(ExclusiveExecutor::default());
    let queue = DebouncedQueue::new(Arc::clone(&executor), config);
    (queue, executor)
}

fn debounce(ms: u64) -> QueueConfig {
    QueueConfig {
        debounce_ms: ms,
        ..QueueConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_n_enqueues_yield_one_execution_of_last_operation() {
    let (queue, _executor) = create_test_queue(debounce(100));
    let recorder = OverlapRecorder::default();

    let tickets: Vec<_> = (0..7u32)
        .map(|n| queue.enqueue("envelopes", recorder.operation("envelopes", Duration::ZERO, n)))
        .collect();

    for ticket in tickets {
        assert_eq!(ticket.await.unwrap(), 6);
    }
    assert_eq!(recorder.runs(), 1);

    let stats = queue.get_stats();
    assert_eq!(stats.enqueued, 7);
    assert_eq!(stats.superseded, 6);
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.current_queue_size, 0);
}

#[tokio::test(start_paused = true)]
async fn test_entry_fires_after_quiet_period() {
    let (queue, _executor) = create_test_queue(debounce(100));
    let start = Instant::now();
    let ticket = queue.enqueue("bills", async { Ok(1) });

    sleep(Duration::from_millis(99)).await;
    assert_eq!(queue.get_stats().current_queue_size, 1);

    assert_eq!(ticket.await.unwrap(), 1);
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_max_age_forces_execution_under_constant_load() {
    let (queue, _executor) = create_test_queue(QueueConfig {
        debounce_ms: 100,
        max_queue_age_ms: 500,
        max_batch_size: 10,
    });
    let start = Instant::now();
    let mut ticket = queue.enqueue("transactions", async { Ok(0) });
    let mut next = 1u32;

    let value = loop {
        tokio::select! {
            result = &mut ticket => break result.unwrap(),
            _ = sleep(Duration::from_millis(50)) => {
                let n = next;
                next += 1;
                let _ = queue.enqueue("transactions", async move { Ok(n) });
            }
        }
    };

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_millis(600));
    assert!(value > 0);
}

#[tokio::test(start_paused = true)]
async fn test_flush_settles_all_distinct_types_in_order() {
    let (queue, _executor) = create_test_queue(debounce(10_000));
    let recorder = OverlapRecorder::default();
    let kinds = ["envelopes", "transactions", "bills", "debts", "goals"];

    let tickets: Vec<_> = kinds
        .iter()
        .enumerate()
        .map(|(n, kind)| queue.enqueue(*kind, recorder.operation(kind, Duration::from_millis(5), n as u32)))
        .collect();

    let results = queue.flush().await;
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(Result::is_ok));
    for (n, ticket) in tickets.into_iter().enumerate() {
        assert_eq!(ticket.await.unwrap(), n as u32);
    }

    let order: Vec<String> = recorder.finished().into_iter().map(|(name, _)| name).collect();
    assert_eq!(order, kinds);
    assert_eq!(recorder.peak(), 1);

    let stats = queue.get_stats();
    assert_eq!(stats.processed, 5);
    assert_eq!(stats.current_queue_size, 0);
    assert_eq!(stats.processing_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_flush_waits_for_entries_fired_before_it() {
    let (queue, _executor) = create_test_queue(debounce(10));
    let recorder = OverlapRecorder::default();
    let fired = queue.enqueue("bills", recorder.operation("bills", Duration::from_millis(200), 1));

    // Let the debounce timer hand the entry to the executor.
    sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.get_stats().processing_count, 1);

    let results = queue.flush().await;
    assert!(results.is_empty());
    assert_eq!(recorder.runs(), 1);
    assert_eq!(recorder.finished().len(), 1);
    let stats = queue.get_stats();
    assert_eq!(stats.processing_count, 0);
    assert_eq!(stats.processed, 1);
    assert_eq!(fired.await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_queued_timeout_reaches_every_coalesced_caller() {
    let (queue, executor) = create_test_queue(debounce(10));
    let first = queue.enqueue_with_timeout(
        "transactions",
        async { Ok(1) },
        Some(Duration::from_millis(500)),
    );
    let second = queue.enqueue_with_timeout(
        "transactions",
        async {
            sleep(Duration::from_millis(200)).await;
            Ok(2)
        },
        Some(Duration::from_millis(30)),
    );

    // The superseding enqueue's timeout applies to the coalesced entry.
    for ticket in [first, second] {
        let err = ticket.await.unwrap_err();
        assert!(err.is_timeout());
        assert!(matches!(err, SyncError::LockTimeout { timeout_ms: 30, .. }));
    }
    let stats = queue.get_stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.processed, 0);
    assert!(executor.get_sync_status().locked);

    sleep(Duration::from_millis(250)).await;
    assert!(!executor.get_sync_status().locked);
    assert_eq!(executor.get_sync_status().metrics.operations_completed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_flush_on_empty_queue_is_a_no_op() {
    let (queue, _executor) = create_test_queue(QueueConfig::default());
    assert!(queue.flush().await.is_empty());
    assert_eq!(queue.get_stats(), Default::default());
}

#[tokio::test(start_paused = true)]
async fn test_batch_cap_drains_without_waiting_for_debounce() {
    let (queue, _executor) = create_test_queue(QueueConfig {
        debounce_ms: 60_000,
        max_queue_age_ms: 120_000,
        max_batch_size: 4,
    });
    let start = Instant::now();
    let tickets: Vec<_> = (0..4u32)
        .map(|n| queue.enqueue(format!("collection-{}", n), async move { Ok(n) }))
        .collect();
    for ticket in tickets {
        ticket.await.unwrap();
    }
    assert!(start.elapsed() < Duration::from_millis(60_000));
    assert_eq!(queue.get_stats().processed, 4);
}

#[tokio::test(start_paused = true)]
async fn test_clear_cancels_and_never_runs() {
    let (queue, _executor) = create_test_queue(debounce(100));
    let recorder = OverlapRecorder::default();
    let first = queue.enqueue("goals", recorder.operation("goals", Duration::ZERO, 1));
    let second = queue.enqueue("debts", recorder.operation("debts", Duration::ZERO, 2));

    assert_eq!(queue.clear(), 2);
    assert!(matches!(first.await, Err(SyncError::Cancelled { .. })));
    assert!(matches!(second.await, Err(SyncError::Cancelled { .. })));

    sleep(Duration::from_millis(500)).await;
    assert_eq!(recorder.runs(), 0);
    let stats = queue.get_stats();
    assert_eq!(stats.current_queue_size, 0);
    assert_eq!(stats.cancelled, 2);
}

#[tokio::test(start_paused = true)]
async fn test_operation_error_reaches_every_coalesced_caller() {
    let (queue, _executor) = create_test_queue(debounce(20));
    let a = queue.enqueue("sync", async { Ok(1) });
    let b = queue.enqueue("sync", async { Err(anyhow::anyhow!("quota exceeded")) });

    for ticket in [a, b] {
        let err = ticket.await.unwrap_err();
        let inner = err.operation_error().unwrap();
        assert_eq!(inner.to_string(), "quota exceeded");
    }
    assert_eq!(queue.get_stats().failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_reset_stats_keeps_pending_entries_accounted() {
    let (queue, _executor) = create_test_queue(debounce(100));
    let ticket = queue.enqueue("envelopes", async { Ok(1) });
    let _ = queue.enqueue("envelopes", async { Ok(2) });
    queue.reset_stats();

    let stats = queue.get_stats();
    assert_eq!(stats.enqueued, 1);
    assert_eq!(stats.superseded, 0);
    assert_eq!(stats.current_queue_size, 1);

    assert_eq!(ticket.await.unwrap(), 2);
    let stats = queue.get_stats();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.enqueued - stats.superseded, stats.processed);
}
