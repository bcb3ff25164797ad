//! Sync Orchestrator
//!
//! Single entry point for application code. Wires one queue, one executor,
//! one health monitor and one validator together. Applications build it once
//! at their composition root and share it behind an `Arc`.

use crate::config::SyncConfig;
use crate::diagnostics::{DiagnosticValidator, QueueObserver, QuickSyncStatus, ValidationReport};
use crate::error::SyncError;
use crate::executor::{ExclusiveExecutor, MutexState};
use crate::health::{HealthMonitor, HealthStatus};
use crate::probe::{ReachabilityProbe, RecordSource};
use crate::queue::{DebouncedQueue, QueueStats};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    /// Skips the debounce wait, never the lock queue.
    High,
}

/// Per-call options for [`SyncOrchestrator::execute_sync`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub priority: Priority,
    pub skip_queue: bool,
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    /// Bypass the debounced queue.
    pub fn immediate() -> Self {
        Self {
            skip_queue: true,
            ..Self::default()
        }
    }

    pub fn high_priority() -> Self {
        Self {
            priority: Priority::High,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn bypasses_queue(&self) -> bool {
        self.skip_queue || self.priority == Priority::High
    }
}

/// Aggregated live state. Built without I/O.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub queue: QueueStats,
    pub mutex: MutexState,
    pub health: HealthStatus,
    pub timestamp: DateTime<Utc>,
}

/// Facade over the sync core for operations producing `T`.
pub struct SyncOrchestrator<T> {
    queue: Arc<DebouncedQueue<T>>,
    executor: Arc<ExclusiveExecutor>,
    health: Arc<HealthMonitor>,
    validator: DiagnosticValidator,
}

impl<T> SyncOrchestrator<T>
where
    T: Clone + Send + 'static,
{
    /// Build with default configuration.
    pub fn new() -> Self {
        Self::build(&SyncConfig::default())
    }

    /// Build from a validated configuration.
    pub fn from_config(config: &SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: &SyncConfig) -> Self {
        let health = Arc::new(HealthMonitor::new(config.health.clone()));
        let executor = Arc::new(
            ExclusiveExecutor::new(config.executor.clone()).with_health_monitor(Arc::clone(&health)),
        );
        let queue = Arc::new(DebouncedQueue::new(Arc::clone(&executor), config.queue.clone()));
        let observer: Arc<dyn QueueObserver> = queue.clone();
        let validator = DiagnosticValidator::new(
            Arc::clone(&health),
            Arc::clone(&executor),
            config.diagnostics.clone(),
        )
        .with_queue(observer);

        info!(
            debounce_ms = config.queue.debounce_ms,
            max_queue_age_ms = config.queue.max_queue_age_ms,
            max_batch_size = config.queue.max_batch_size,
            "Sync orchestrator initialized"
        );

        Self {
            queue,
            executor,
            health,
            validator,
        }
    }

    /// Attach the reachability probe used by health checks.
    pub fn with_probe(self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        Self {
            validator: self.validator.with_probe(probe),
            ..self
        }
    }

    /// Attach the record snapshot scanned during validation.
    pub fn with_record_source(self, records: Arc<dyn RecordSource>) -> Self {
        Self {
            validator: self.validator.with_record_source(records),
            ..self
        }
    }

    /// Run `operation` through the queue, or straight through the executor for
    /// `skip_queue` and high-priority calls.
    ///
    /// Queued calls are registered when this is called, not when the returned
    /// future is first polled. The operation's own result or error is returned
    /// unchanged.
    pub fn execute_sync<F>(
        &self,
        operation: F,
        operation_type: &str,
        options: ExecuteOptions,
    ) -> BoxFuture<'_, Result<T, SyncError>>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if options.bypasses_queue() {
            debug!(
                operation_type,
                priority = ?options.priority,
                skip_queue = options.skip_queue,
                "Executing sync immediately"
            );
            let label = operation_type.to_string();
            Box::pin(async move { self.executor.execute(&label, operation, options.timeout).await })
        } else {
            Box::pin(
                self.queue
                    .enqueue_with_timeout(operation_type, operation, options.timeout),
            )
        }
    }

    /// Flush the queue, then run `operation` immediately.
    pub async fn force_sync<F>(&self, operation: F, operation_type: &str) -> Result<T, SyncError>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let flushed = self.queue.flush().await;
        info!(
            operation_type,
            flushed = flushed.len(),
            "Forcing sync after flushing queue"
        );
        self.executor.execute(operation_type, operation, None).await
    }

    /// Quick health check. Never fails.
    pub async fn check_health(&self) -> QuickSyncStatus {
        let status = self.validator.get_quick_sync_status().await;
        if !status.is_healthy {
            warn!(
                status = ?status.status,
                failed_checks = status.failed_checks,
                error = status.error.as_deref().unwrap_or_default(),
                "Sync health check reported problems"
            );
        }
        status
    }

    /// Full validation suite.
    pub async fn validate_sync(&self) -> Result<ValidationReport, SyncError> {
        self.validator.run_master_sync_validation().await
    }

    pub fn get_status(&self) -> SyncStatus {
        SyncStatus {
            queue: self.queue.get_stats(),
            mutex: self.executor.get_sync_status(),
            health: self.health.get_health_status(),
            timestamp: Utc::now(),
        }
    }

    /// Discard pending queued work. Returns how many entries were cancelled.
    pub fn clear_queue(&self) -> usize {
        self.queue.clear()
    }

    /// Operator recovery: clear lock bookkeeping. Returns whether it was held.
    pub fn force_release_mutex(&self) -> bool {
        self.executor.force_release()
    }

    /// Clear the queue, force-release the lock and zero all metrics. Queued
    /// operations that are still running are no longer waited on by `flush`.
    pub fn reset(&self) {
        let cleared = self.queue.clear();
        let was_locked = self.executor.force_release();
        let detached = self.queue.detach_in_flight();
        self.health.reset_metrics();
        self.executor.reset_metrics();
        self.queue.reset_stats();
        warn!(cleared, detached, was_locked, "Sync orchestrator reset");
    }

    pub fn get_recommendations(&self) -> Vec<String> {
        self.health.get_recommendations()
    }

    pub fn queue(&self) -> &DebouncedQueue<T> {
        &self.queue
    }

    pub fn executor(&self) -> &ExclusiveExecutor {
        &self.executor
    }

    pub fn health_monitor(&self) -> &HealthMonitor {
        &self.health
    }
}

impl<T> Default for SyncOrchestrator<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
