//! Exclusive Executor
//!
//! A FIFO lock around the single sync critical section. Every operation runs
//! through [`ExclusiveExecutor::execute`]; at most one is in flight at a time and
//! the lock is released on every exit path (success, error, panic, timeout, or
//! the caller dropping its future).

use crate::error::SyncError;
use crate::health::HealthMonitor;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Lock hold time (ms) after which diagnostics report a possibly stuck lock.
    pub stuck_lock_threshold_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            stuck_lock_threshold_ms: 60_000,
        }
    }
}

/// Lock timing metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockMetrics {
    pub operations_completed: u64,
    /// Running mean of lock hold time.
    pub average_lock_time_ms: f64,
    pub max_lock_time_ms: u64,
}

impl LockMetrics {
    fn record(&mut self, held: Duration) {
        let held_ms = held.as_millis() as u64;
        self.operations_completed += 1;
        let n = self.operations_completed as f64;
        self.average_lock_time_ms += (held_ms as f64 - self.average_lock_time_ms) / n;
        self.max_lock_time_ms = self.max_lock_time_ms.max(held_ms);
    }
}

/// Read-only snapshot of the lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutexState {
    pub locked: bool,
    pub current_operation: Option<String>,
    /// Labels of queued waiters, in release order.
    pub waiting: Vec<String>,
    /// How long the current holder has held the lock.
    pub held_for_ms: Option<u64>,
    pub force_releases: u64,
    pub metrics: LockMetrics,
}

type Grant = Result<u64, SyncError>;

struct Waiter {
    id: u64,
    label: String,
    tx: oneshot::Sender<Grant>,
}

struct LockState {
    locked: bool,
    current_operation: Option<String>,
    held_since: Option<Instant>,
    /// Identifies the current holder; bumped on every grant and force release.
    epoch: u64,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    force_releases: u64,
    metrics: LockMetrics,
}

impl LockState {
    fn new() -> Self {
        Self {
            locked: false,
            current_operation: None,
            held_since: None,
            epoch: 0,
            waiters: VecDeque::new(),
            next_waiter_id: 1,
            force_releases: 0,
            metrics: LockMetrics::default(),
        }
    }

    fn grant(&mut self, label: &str) -> u64 {
        self.epoch += 1;
        self.locked = true;
        self.current_operation = Some(label.to_string());
        self.held_since = Some(Instant::now());
        self.epoch
    }

    /// Release the lock held under `epoch` and hand it to the next live waiter.
    fn release(&mut self, epoch: u64) {
        if !self.locked || self.epoch != epoch {
            // Force-released while this holder was still running.
            return;
        }
        while let Some(waiter) = self.waiters.pop_front() {
            let next_epoch = self.grant(&waiter.label);
            if waiter.tx.send(Ok(next_epoch)).is_ok() {
                return;
            }
        }
        self.locked = false;
        self.current_operation = None;
        self.held_since = None;
    }
}

/// Held lock. Dropping it releases the critical section.
struct LockGuard {
    state: Arc<Mutex<LockState>>,
    epoch: u64,
    label: String,
    acquired_at: Instant,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let held = self.acquired_at.elapsed();
        let mut state = self.state.lock();
        // A force-released holder no longer owns the lock; its hold time is not counted.
        if state.locked && state.epoch == self.epoch {
            state.metrics.record(held);
        }
        state.release(self.epoch);
        debug!(
            label = %self.label,
            held_ms = held.as_millis() as u64,
            "Released sync lock"
        );
    }
}

/// A queued acquisition. If dropped before the grant is consumed, it either
/// leaves the FIFO or passes on a grant it already received.
struct PendingAcquire {
    state: Arc<Mutex<LockState>>,
    waiter_id: u64,
    rx: Option<oneshot::Receiver<Grant>>,
}

impl Future for PendingAcquire {
    type Output = Result<Grant, oneshot::error::RecvError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Pending;
        };
        let grant = ready!(Pin::new(rx).poll(cx));
        // Consumed: nothing left for Drop to hand back.
        self.rx = None;
        Poll::Ready(grant)
    }
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let mut state = self.state.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == self.waiter_id) {
            state.waiters.remove(pos);
            return;
        }
        if let Ok(Ok(epoch)) = rx.try_recv() {
            state.release(epoch);
        }
    }
}

/// Guarantees at most one sync operation runs at a time.
pub struct ExclusiveExecutor {
    state: Arc<Mutex<LockState>>,
    health: Option<Arc<HealthMonitor>>,
    config: ExecutorConfig,
}

impl ExclusiveExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(LockState::new())),
            health: None,
            config,
        }
    }

    /// Report every execution's outcome and duration to `monitor`.
    pub fn with_health_monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.health = Some(monitor);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `operation` inside the critical section.
    ///
    /// Callers are served in arrival order. `timeout` bounds the caller's total
    /// wait (queueing plus running). If it elapses while the operation is
    /// running, the operation keeps going in the background and releases the
    /// lock when it finishes; the caller gets [`SyncError::LockTimeout`].
    pub async fn execute<T, F>(
        &self,
        label: &str,
        operation: F,
        timeout: Option<Duration>,
    ) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let Some(limit) = timeout else {
            let guard = self.acquire(label).await?;
            return Self::run_guarded(guard, operation, self.health.clone()).await;
        };

        let deadline = Instant::now() + limit;
        let timed_out = || SyncError::LockTimeout {
            label: label.to_string(),
            timeout_ms: limit.as_millis() as u64,
        };

        let guard = match tokio::time::timeout_at(deadline, self.acquire(label)).await {
            Ok(acquired) => acquired?,
            Err(_) => {
                warn!(label, timeout_ms = limit.as_millis() as u64, "Timed out waiting for sync lock");
                return Err(timed_out());
            }
        };

        let task = tokio::spawn(Self::run_guarded(guard, operation, self.health.clone()));
        match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(SyncError::OperationPanicked {
                label: label.to_string(),
                message: join_error.to_string(),
            }),
            Err(_) => {
                warn!(
                    label,
                    timeout_ms = limit.as_millis() as u64,
                    "Sync operation exceeded caller timeout; it will release the lock when it finishes"
                );
                Err(timed_out())
            }
        }
    }

    async fn acquire(&self, label: &str) -> Result<LockGuard, SyncError> {
        let (waiter_id, rx) = {
            let mut state = self.state.lock();
            if !state.locked {
                let epoch = state.grant(label);
                debug!(label, epoch, "Acquired sync lock");
                return Ok(self.guard(epoch, label));
            }
            let waiter_id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                id: waiter_id,
                label: label.to_string(),
                tx,
            });
            debug!(
                label,
                holder = state.current_operation.as_deref().unwrap_or_default(),
                position = state.waiters.len(),
                "Waiting for sync lock"
            );
            (waiter_id, rx)
        };

        let grant = PendingAcquire {
            state: Arc::clone(&self.state),
            waiter_id,
            rx: Some(rx),
        }
        .await;

        match grant {
            Ok(Ok(epoch)) => {
                debug!(label, epoch, "Acquired sync lock after waiting");
                Ok(self.guard(epoch, label))
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(SyncError::LockForceReleased {
                label: label.to_string(),
            }),
        }
    }

    fn guard(&self, epoch: u64, label: &str) -> LockGuard {
        LockGuard {
            state: Arc::clone(&self.state),
            epoch,
            label: label.to_string(),
            acquired_at: Instant::now(),
        }
    }

    async fn run_guarded<T, F>(
        guard: LockGuard,
        operation: F,
        health: Option<Arc<HealthMonitor>>,
    ) -> Result<T, SyncError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(operation).catch_unwind().await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(SyncError::operation(&guard.label, err)),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(label = %guard.label, %message, "Sync operation panicked");
                Err(SyncError::OperationPanicked {
                    label: guard.label.clone(),
                    message,
                })
            }
        };

        if let Some(monitor) = health {
            monitor.record_execution(&guard.label, elapsed, result.as_ref().err());
        }
        drop(guard);
        result
    }

    pub fn get_sync_status(&self) -> MutexState {
        let state = self.state.lock();
        MutexState {
            locked: state.locked,
            current_operation: state.current_operation.clone(),
            waiting: state.waiters.iter().map(|w| w.label.clone()).collect(),
            held_for_ms: state
                .held_since
                .map(|since| since.elapsed().as_millis() as u64),
            force_releases: state.force_releases,
            metrics: state.metrics.clone(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Unconditionally clear lock bookkeeping.
    ///
    /// Operator recovery only. An operation that is still running is not
    /// cancelled; its eventual release is ignored. Callers queued at this moment
    /// receive [`SyncError::LockForceReleased`]. Returns whether the lock was held.
    pub fn force_release(&self) -> bool {
        let mut state = self.state.lock();
        let was_locked = state.locked;
        let holder = state.current_operation.take();
        let held_ms = state
            .held_since
            .take()
            .map(|since| since.elapsed().as_millis() as u64);
        let waiters: Vec<Waiter> = state.waiters.drain(..).collect();

        state.epoch += 1;
        state.locked = false;
        state.force_releases += 1;
        drop(state);

        if was_locked {
            error!(
                holder = holder.as_deref().unwrap_or_default(),
                held_ms,
                waiters = waiters.len(),
                "Force-releasing held sync lock; the holder may still be running. This indicates a stuck operation"
            );
        } else {
            warn!(waiters = waiters.len(), "Force-release requested on an unlocked sync lock");
        }

        for waiter in waiters {
            let label = waiter.label.clone();
            let _ = waiter.tx.send(Err(SyncError::LockForceReleased { label }));
        }
        was_locked
    }

    pub fn reset_metrics(&self) {
        self.state.lock().metrics = LockMetrics::default();
    }
}

impl Default for ExclusiveExecutor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
