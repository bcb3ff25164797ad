//! Debounced Sync Queue
//!
//! Coalesces bursts of same-kind sync requests into one eventual execution.
//! Each `operation_type` has at most one pending entry; enqueueing the same type
//! again replaces the pending operation (the superseded one is dropped without
//! ever being polled) and every caller of the coalesced entry receives the
//! winning operation's result.
//!
//! Each entry fires on whichever comes first: the debounce window elapsing
//! since its *last* enqueue, or the max queue age elapsing since its *first*
//! enqueue. Fired entries run through the shared
//! [`ExclusiveExecutor`](crate::executor::ExclusiveExecutor).

use crate::error::SyncError;
use crate::executor::ExclusiveExecutor;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A caller-supplied sync operation, boxed for storage in the queue.
pub type SyncFuture<T> = BoxFuture<'static, anyhow::Result<T>>;

type Completion<T> = oneshot::Sender<Result<T, SyncError>>;

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Quiet period after the last enqueue of a type before it fires.
    pub debounce_ms: u64,
    /// Upper bound on how long an entry may wait from its first enqueue.
    pub max_queue_age_ms: u64,
    /// Distinct pending entries at which the whole queue is drained at once.
    pub max_batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            max_queue_age_ms: 30_000,
            max_batch_size: 10,
        }
    }
}

impl QueueConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_queue_age(&self) -> Duration {
        Duration::from_millis(self.max_queue_age_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.debounce_ms == 0 {
            return Err("debounce_ms must be greater than zero".to_string());
        }
        if self.max_queue_age_ms < self.debounce_ms {
            return Err(format!(
                "max_queue_age_ms ({}) must be at least debounce_ms ({})",
                self.max_queue_age_ms, self.debounce_ms
            ));
        }
        if self.max_batch_size == 0 {
            return Err("max_batch_size must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Every enqueue call, including ones that superseded a pending entry
    pub enqueued: u64,
    /// Entries whose operation succeeded
    pub processed: u64,
    /// Entries whose operation failed
    pub failed: u64,
    /// Enqueues that replaced a pending operation of the same type
    pub superseded: u64,
    /// Entries discarded by `clear`
    pub cancelled: u64,
    /// Pending (not yet executing) entries
    pub current_queue_size: usize,
    /// Entries handed to the executor and not yet settled
    pub processing_count: usize,
}

/// Why a pending entry was handed to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireReason {
    DebounceElapsed,
    /// The max queue age forced execution during continuous enqueues.
    MaxAgeReached,
    BatchFull,
    Flushed,
}

impl FireReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FireReason::DebounceElapsed => "debounce_elapsed",
            FireReason::MaxAgeReached => "max_age_reached",
            FireReason::BatchFull => "batch_full",
            FireReason::Flushed => "flushed",
        }
    }
}

/// Identity of one pending entry, from first enqueue until it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(u64);

impl BatchId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        BatchId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

struct QueueEntry<T> {
    batch_id: BatchId,
    operation_type: String,
    operation: SyncFuture<T>,
    timeout: Option<Duration>,
    first_enqueued_at: Instant,
    last_enqueued_at: Instant,
    supersede_count: u32,
    waiters: Vec<Completion<T>>,
}

impl<T> QueueEntry<T> {
    fn next_deadline(&self, config: &QueueConfig) -> (Instant, FireReason) {
        let debounce_at = self.last_enqueued_at + config.debounce();
        let max_age_at = self.first_enqueued_at + config.max_queue_age();
        if max_age_at <= debounce_at {
            (max_age_at, FireReason::MaxAgeReached)
        } else {
            (debounce_at, FireReason::DebounceElapsed)
        }
    }
}

struct QueueState<T> {
    pending: HashMap<String, QueueEntry<T>>,
    /// Entries taken from `pending` whose callers have not been settled yet.
    in_flight: HashSet<BatchId>,
    /// In flight, but no longer waited on by `flush`.
    detached: HashSet<BatchId>,
    stats: QueueStats,
}

impl<T> QueueState<T> {
    fn take(&mut self, operation_type: &str) -> Option<QueueEntry<T>> {
        let entry = self.pending.remove(operation_type)?;
        self.in_flight.insert(entry.batch_id);
        self.stats.current_queue_size = self.pending.len();
        self.stats.processing_count = self.processing();
        Some(entry)
    }

    fn take_all(&mut self) -> Vec<QueueEntry<T>> {
        let mut entries: Vec<QueueEntry<T>> = self.pending.drain().map(|(_, e)| e).collect();
        entries.sort_by_key(|e| e.batch_id);
        self.in_flight.extend(entries.iter().map(|e| e.batch_id));
        self.stats.current_queue_size = 0;
        self.stats.processing_count = self.processing();
        entries
    }

    fn settle(&mut self, batch_id: BatchId, success: bool) {
        if !self.in_flight.remove(&batch_id) {
            self.detached.remove(&batch_id);
        }
        self.stats.processing_count = self.processing();
        if success {
            self.stats.processed += 1;
        } else {
            self.stats.failed += 1;
        }
    }

    fn processing(&self) -> usize {
        self.in_flight.len() + self.detached.len()
    }

    fn any_in_flight(&self, batches: &[BatchId]) -> bool {
        batches.iter().any(|id| self.in_flight.contains(id))
    }
}

enum TimerStep<T> {
    Fire(QueueEntry<T>, FireReason),
    Sleep(Instant),
    Gone,
}

/// Eventual result of an enqueued operation.
///
/// Registration happens when [`DebouncedQueue::enqueue`] is called; awaiting the
/// ticket only waits for the outcome. Dropping it does not withdraw the entry.
pub struct SyncTicket<T> {
    operation_type: String,
    rx: oneshot::Receiver<Result<T, SyncError>>,
}

impl<T> SyncTicket<T> {
    pub fn operation_type(&self) -> &str {
        &self.operation_type
    }
}

impl<T> Future for SyncTicket<T> {
    type Output = Result<T, SyncError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let received = ready!(Pin::new(&mut self.rx).poll(cx));
        Poll::Ready(received.unwrap_or_else(|_| {
            Err(SyncError::Cancelled {
                operation_type: self.operation_type.clone(),
            })
        }))
    }
}

/// Debounced, coalescing front of the executor.
///
/// Must be used from within a tokio runtime: timers run as spawned tasks.
pub struct DebouncedQueue<T> {
    state: Arc<Mutex<QueueState<T>>>,
    /// Signalled every time an in-flight entry settles.
    settled: Arc<Notify>,
    executor: Arc<ExclusiveExecutor>,
    config: QueueConfig,
}

impl<T> DebouncedQueue<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(executor: Arc<ExclusiveExecutor>, config: QueueConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                pending: HashMap::new(),
                in_flight: HashSet::new(),
                detached: HashSet::new(),
                stats: QueueStats::default(),
            })),
            settled: Arc::new(Notify::new()),
            executor,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Register `operation` under `operation_type`.
    pub fn enqueue<F>(&self, operation_type: impl Into<String>, operation: F) -> SyncTicket<T>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.enqueue_with_timeout(operation_type, operation, None)
    }

    /// Like [`enqueue`](Self::enqueue), bounding the caller's wait once the
    /// entry starts executing. A superseding enqueue replaces the timeout too.
    pub fn enqueue_with_timeout<F>(
        &self,
        operation_type: impl Into<String>,
        operation: F,
        timeout: Option<Duration>,
    ) -> SyncTicket<T>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let operation_type = operation_type.into();
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.stats.enqueued += 1;

        let new_batch = match state.pending.get_mut(&operation_type) {
            Some(entry) => {
                entry.operation = Box::pin(operation);
                entry.timeout = timeout;
                entry.last_enqueued_at = now;
                entry.supersede_count += 1;
                entry.waiters.push(tx);
                state.stats.superseded += 1;
                debug!(
                    operation_type = %operation_type,
                    batch_id = entry.batch_id.as_u64(),
                    supersede_count = entry.supersede_count,
                    waiters = entry.waiters.len(),
                    "Superseded pending sync operation"
                );
                None
            }
            None => {
                let batch_id = BatchId::next();
                state.pending.insert(
                    operation_type.clone(),
                    QueueEntry {
                        batch_id,
                        operation_type: operation_type.clone(),
                        operation: Box::pin(operation),
                        timeout,
                        first_enqueued_at: now,
                        last_enqueued_at: now,
                        supersede_count: 0,
                        waiters: vec![tx],
                    },
                );
                debug!(
                    operation_type = %operation_type,
                    batch_id = batch_id.as_u64(),
                    queue_size = state.pending.len(),
                    "Enqueued sync operation"
                );
                Some(batch_id)
            }
        };
        state.stats.current_queue_size = state.pending.len();
        let batch_full = state.pending.len() >= self.config.max_batch_size;
        drop(guard);

        if let Some(batch_id) = new_batch {
            self.spawn_timer(operation_type.clone(), batch_id);
        }
        if batch_full {
            info!(
                max_batch_size = self.config.max_batch_size,
                "Sync queue batch is full, draining"
            );
            self.spawn_drain(FireReason::BatchFull);
        }

        SyncTicket { operation_type, rx }
    }

    fn spawn_timer(&self, operation_type: String, batch_id: BatchId) {
        let state = Arc::clone(&self.state);
        let settled = Arc::clone(&self.settled);
        let executor = Arc::clone(&self.executor);
        let config = self.config.clone();

        tokio::spawn(async move {
            loop {
                let step = {
                    let mut guard = state.lock();
                    match guard.pending.get(&operation_type) {
                        Some(entry) if entry.batch_id == batch_id => {
                            let (deadline, reason) = entry.next_deadline(&config);
                            if Instant::now() >= deadline {
                                match guard.take(&operation_type) {
                                    Some(entry) => TimerStep::Fire(entry, reason),
                                    None => TimerStep::Gone,
                                }
                            } else {
                                TimerStep::Sleep(deadline)
                            }
                        }
                        // Flushed, cleared, or already fired.
                        _ => TimerStep::Gone,
                    }
                };

                match step {
                    TimerStep::Fire(entry, reason) => {
                        let _ = Self::process_entry(&state, &settled, &executor, entry, reason).await;
                        return;
                    }
                    TimerStep::Sleep(deadline) => tokio::time::sleep_until(deadline).await,
                    TimerStep::Gone => return,
                }
            }
        });
    }

    fn spawn_drain(&self, reason: FireReason) {
        let entries = self.state.lock().take_all();
        if entries.is_empty() {
            return;
        }
        let state = Arc::clone(&self.state);
        let settled = Arc::clone(&self.settled);
        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            for entry in entries {
                let _ = Self::process_entry(&state, &settled, &executor, entry, reason).await;
            }
        });
    }

    async fn process_entry(
        state: &Mutex<QueueState<T>>,
        settled: &Notify,
        executor: &ExclusiveExecutor,
        entry: QueueEntry<T>,
        reason: FireReason,
    ) -> Result<T, SyncError> {
        let QueueEntry {
            batch_id,
            operation_type,
            operation,
            timeout,
            first_enqueued_at,
            supersede_count,
            waiters,
            ..
        } = entry;
        let age_ms = first_enqueued_at.elapsed().as_millis() as u64;

        if reason == FireReason::MaxAgeReached {
            warn!(
                operation_type = %operation_type,
                batch_id = batch_id.as_u64(),
                age_ms,
                supersede_count,
                "Max queue age reached, forcing execution despite ongoing enqueues"
            );
        } else {
            info!(
                operation_type = %operation_type,
                batch_id = batch_id.as_u64(),
                reason = reason.as_str(),
                age_ms,
                supersede_count,
                waiters = waiters.len(),
                "Executing queued sync operation"
            );
        }

        let result = executor.execute(&operation_type, operation, timeout).await;

        state.lock().settle(batch_id, result.is_ok());
        if let Err(err) = &result {
            error!(
                operation_type = %operation_type,
                batch_id = batch_id.as_u64(),
                error = %err,
                "Queued sync operation failed"
            );
        }

        for tx in waiters {
            let _ = tx.send(result.clone());
        }
        settled.notify_waiters();
        result
    }

    /// Wait until none of `batches` is still in flight.
    async fn wait_settled(state: &Mutex<QueueState<T>>, settled: &Notify, batches: &[BatchId]) {
        loop {
            // Registered before the check so a settle in between is not missed.
            let notified = settled.notified();
            let outstanding = state.lock().any_in_flight(batches);
            if !outstanding {
                return;
            }
            notified.await;
        }
    }

    /// Execute every pending entry now, one at a time, in first-enqueue order.
    ///
    /// Entries already handed off by a timer, a batch drain or another flush
    /// settle first; when this returns nothing queued before the call is still
    /// outstanding. Entries are processed on a spawned task, so dropping the
    /// returned future does not abandon them.
    pub async fn flush(&self) -> Vec<Result<T, SyncError>> {
        let (earlier, entries) = {
            let mut guard = self.state.lock();
            let earlier: Vec<BatchId> = guard.in_flight.iter().copied().collect();
            (earlier, guard.take_all())
        };
        if entries.is_empty() && earlier.is_empty() {
            return Vec::new();
        }
        info!(
            count = entries.len(),
            in_flight = earlier.len(),
            "Flushing sync queue"
        );

        let state = Arc::clone(&self.state);
        let settled = Arc::clone(&self.settled);
        let executor = Arc::clone(&self.executor);
        let handle = tokio::spawn(async move {
            Self::wait_settled(&state, &settled, &earlier).await;
            let mut results = Vec::with_capacity(entries.len());
            for entry in entries {
                results.push(
                    Self::process_entry(&state, &settled, &executor, entry, FireReason::Flushed)
                        .await,
                );
            }
            results
        });

        match handle.await {
            Ok(results) => results,
            Err(join_error) => {
                error!(error = %join_error, "Sync queue flush task did not complete");
                Vec::new()
            }
        }
    }

    /// Stop waiting on entries that are already executing. They still settle
    /// their callers and stats when they finish, but a later `flush` no longer
    /// waits for them. Returns how many were detached.
    pub fn detach_in_flight(&self) -> usize {
        let count = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let count = state.in_flight.len();
            state.detached.extend(state.in_flight.drain());
            count
        };
        if count > 0 {
            warn!(count, "Detached in-flight sync operations from the queue");
            self.settled.notify_waiters();
        }
        count
    }

    /// Discard pending entries without executing them. Their callers receive
    /// [`SyncError::Cancelled`]. Returns how many entries were discarded.
    pub fn clear(&self) -> usize {
        let entries: Vec<QueueEntry<T>> = {
            let mut guard = self.state.lock();
            let entries: Vec<_> = guard.pending.drain().map(|(_, e)| e).collect();
            guard.stats.cancelled += entries.len() as u64;
            guard.stats.current_queue_size = 0;
            entries
        };

        let count = entries.len();
        for entry in entries {
            for tx in entry.waiters {
                let _ = tx.send(Err(SyncError::Cancelled {
                    operation_type: entry.operation_type.clone(),
                }));
            }
        }
        if count > 0 {
            info!(cancelled = count, "Cleared sync queue");
        }
        count
    }

    pub fn get_stats(&self) -> QueueStats {
        let guard = self.state.lock();
        let mut stats = guard.stats.clone();
        stats.current_queue_size = guard.pending.len();
        stats
    }

    /// Zero the counters. Entries still pending or executing are carried over
    /// as enqueued so every entry stays accounted for exactly once.
    pub fn reset_stats(&self) {
        let mut guard = self.state.lock();
        let current_queue_size = guard.pending.len();
        let processing_count = guard.processing();
        guard.stats = QueueStats {
            enqueued: (current_queue_size + processing_count) as u64,
            current_queue_size,
            processing_count,
            ..QueueStats::default()
        };
    }

    /// Operation types currently waiting, oldest first.
    pub fn pending_types(&self) -> Vec<String> {
        let guard = self.state.lock();
        let mut entries: Vec<(&BatchId, &String)> = guard
            .pending
            .values()
            .map(|e| (&e.batch_id, &e.operation_type))
            .collect();
        entries.sort();
        entries.into_iter().map(|(_, t)| t.clone()).collect()
    }
}
