//! Diagnostic Validator
//!
//! Two entry points:
//!
//! - [`DiagnosticValidator::get_quick_sync_status`]: a cheap read of live health
//!   and lock state plus the injected reachability probe. Never fails.
//! - [`DiagnosticValidator::run_master_sync_validation`]: the full suite. Flow
//!   and edge-case phases run against a private sandbox executor and queue, so
//!   live sync state and health counters are never touched. The corruption
//!   phase only reads live bookkeeping and the optional record snapshot.

use crate::error::SyncError;
use crate::executor::{panic_message, ExclusiveExecutor, ExecutorConfig, MutexState};
use crate::health::{HealthMetrics, HealthMonitor, HealthThresholds};
use crate::probe::{check_records, ReachabilityProbe, RecordIssue, RecordIssueKind, RecordSource};
use crate::queue::{DebouncedQueue, QueueConfig, QueueStats};
use anyhow::{bail, ensure};
use chrono::{DateTime, Utc};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use futures::future::join_all;
use futures::FutureExt;
use owo_colors::OwoColorize;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};

/// Diagnostics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Upper bound on a reachability probe or record snapshot
    pub probe_timeout_ms: u64,
    /// Debounce window used by the sandbox queue
    pub sandbox_debounce_ms: u64,
    /// Max queue age used by the sandbox queue
    pub sandbox_max_queue_age_ms: u64,
    /// Upper bound on any single sandbox check
    pub step_timeout_ms: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 5_000,
            sandbox_debounce_ms: 20,
            sandbox_max_queue_age_ms: 100,
            step_timeout_ms: 5_000,
        }
    }
}

impl DiagnosticsConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    fn sandbox_debounce(&self) -> Duration {
        Duration::from_millis(self.sandbox_debounce_ms)
    }

    fn sandbox_queue(&self) -> QueueConfig {
        QueueConfig {
            debounce_ms: self.sandbox_debounce_ms,
            max_queue_age_ms: self.sandbox_max_queue_age_ms,
            max_batch_size: QueueConfig::default().max_batch_size,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.probe_timeout_ms == 0 || self.step_timeout_ms == 0 {
            return Err("probe_timeout_ms and step_timeout_ms must be greater than zero".to_string());
        }
        self.sandbox_queue()
            .validate()
            .map_err(|e| format!("sandbox queue: {}", e))?;
        if self.step_timeout_ms <= self.sandbox_max_queue_age_ms {
            return Err(format!(
                "step_timeout_ms ({}) must exceed sandbox_max_queue_age_ms ({})",
                self.step_timeout_ms, self.sandbox_max_queue_age_ms
            ));
        }
        Ok(())
    }
}

/// Read-only view of a queue's counters, for consistency checks.
pub trait QueueObserver: Send + Sync {
    fn queue_stats(&self) -> QueueStats;
}

impl<T> QueueObserver for DebouncedQueue<T>
where
    T: Clone + Send + 'static,
{
    fn queue_stats(&self) -> QueueStats {
        self.get_stats()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passed,
    Failed,
}

/// Outcome of one diagnostic check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub description: String,
    pub status: CheckStatus,
    pub details: String,
}

impl TestResult {
    pub fn passed(name: &str, description: &str, details: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            status: CheckStatus::Passed,
            details: details.into(),
        }
    }

    pub fn failed(name: &str, description: &str, details: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            status: CheckStatus::Failed,
            details: details.into(),
        }
    }

    pub fn is_passed(&self) -> bool {
        self.status == CheckStatus::Passed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuickStatus {
    Healthy,
    IssuesDetected,
    /// A check could not run at all
    Error,
}

/// Result of [`DiagnosticValidator::get_quick_sync_status`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickSyncStatus {
    pub is_healthy: bool,
    pub status: QuickStatus,
    pub last_checked: DateTime<Utc>,
    pub failed_checks: usize,
    pub checks: Vec<TestResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QuickSyncStatus {
    pub(crate) fn from_error(error: &SyncError) -> Self {
        Self {
            is_healthy: false,
            status: QuickStatus::Error,
            last_checked: Utc::now(),
            failed_checks: 0,
            checks: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPhase {
    HealthCheck,
    FlowValidation,
    EdgeCases,
    CorruptionCheck,
}

impl ValidationPhase {
    pub const ALL: [ValidationPhase; 4] = [
        ValidationPhase::HealthCheck,
        ValidationPhase::FlowValidation,
        ValidationPhase::EdgeCases,
        ValidationPhase::CorruptionCheck,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ValidationPhase::HealthCheck => "health_check",
            ValidationPhase::FlowValidation => "flow_validation",
            ValidationPhase::EdgeCases => "edge_cases",
            ValidationPhase::CorruptionCheck => "corruption_check",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            ValidationPhase::HealthCheck => "Health Check",
            ValidationPhase::FlowValidation => "Flow Validation",
            ValidationPhase::EdgeCases => "Edge Cases",
            ValidationPhase::CorruptionCheck => "Corruption Check",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    AllSystemsGo,
    Degraded,
    Critical,
}

impl OverallStatus {
    /// No failures is go. An aborted phase, an empty run, or a pass rate below
    /// 50% is critical. Anything in between is degraded.
    pub fn from_counts(passed: usize, failed: usize, any_phase_aborted: bool) -> Self {
        let total = passed + failed;
        if any_phase_aborted || total == 0 {
            return OverallStatus::Critical;
        }
        if failed == 0 {
            return OverallStatus::AllSystemsGo;
        }
        if (passed as f64) / (total as f64) < 0.5 {
            OverallStatus::Critical
        } else {
            OverallStatus::Degraded
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OverallStatus::AllSystemsGo => "ALL_SYSTEMS_GO",
            OverallStatus::Degraded => "DEGRADED",
            OverallStatus::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub phase: ValidationPhase,
    pub passed: usize,
    pub failed: usize,
    pub aborted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total_tests: usize,
    pub total_passed: usize,
    pub total_failed: usize,
    pub overall_status: OverallStatus,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub breakdown: Vec<PhaseSummary>,
}

/// Full validation report. Built fresh on every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub summary: ValidationSummary,
    pub health_check: Vec<TestResult>,
    pub flow_validation: Vec<TestResult>,
    pub edge_cases: Vec<TestResult>,
    pub corruption_check: Vec<TestResult>,
}

impl ValidationReport {
    pub fn results(&self, phase: ValidationPhase) -> &[TestResult] {
        match phase {
            ValidationPhase::HealthCheck => &self.health_check,
            ValidationPhase::FlowValidation => &self.flow_validation,
            ValidationPhase::EdgeCases => &self.edge_cases,
            ValidationPhase::CorruptionCheck => &self.corruption_check,
        }
    }

    /// Every failed check, with the phase it came from.
    pub fn failures(&self) -> Vec<(ValidationPhase, &TestResult)> {
        ValidationPhase::ALL
            .iter()
            .flat_map(|&phase| {
                self.results(phase)
                    .iter()
                    .filter(|r| !r.is_passed())
                    .map(move |r| (phase, r))
            })
            .collect()
    }

    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Validation(format!("Failed to serialize report: {}", e)))
    }
}

struct PhaseOutcome {
    results: Vec<TestResult>,
    aborted: bool,
}

/// Private executor, health monitor and queue for exercising sync paths.
struct Sandbox<T> {
    health: Arc<HealthMonitor>,
    executor: Arc<ExclusiveExecutor>,
    queue: DebouncedQueue<T>,
}

impl<T> Sandbox<T>
where
    T: Clone + Send + 'static,
{
    fn new(config: &DiagnosticsConfig, thresholds: &HealthThresholds) -> Self {
        let health = Arc::new(HealthMonitor::new(thresholds.clone()));
        let executor = Arc::new(
            ExclusiveExecutor::new(ExecutorConfig::default())
                .with_health_monitor(Arc::clone(&health)),
        );
        let queue = DebouncedQueue::new(Arc::clone(&executor), config.sandbox_queue());
        Self {
            health,
            executor,
            queue,
        }
    }
}

/// Counts runs and the peak number of operations running at once.
#[derive(Clone, Default)]
struct OverlapTracker {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    runs: Arc<AtomicUsize>,
}

impl OverlapTracker {
    fn operation(&self, hold: Duration) -> impl Future<Output = anyhow::Result<u64>> + Send + 'static {
        let tracker = self.clone();
        async move {
            let now = tracker.active.fetch_add(1, Ordering::SeqCst) + 1;
            tracker.peak.fetch_max(now, Ordering::SeqCst);
            tracker.runs.fetch_add(1, Ordering::SeqCst);
            sleep(hold).await;
            tracker.active.fetch_sub(1, Ordering::SeqCst);
            Ok(now as u64)
        }
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

/// Quick status checks and the master validation suite.
pub struct DiagnosticValidator {
    health: Arc<HealthMonitor>,
    executor: Arc<ExclusiveExecutor>,
    queue: Option<Arc<dyn QueueObserver>>,
    probe: Option<Arc<dyn ReachabilityProbe>>,
    records: Option<Arc<dyn RecordSource>>,
    config: DiagnosticsConfig,
}

impl DiagnosticValidator {
    pub fn new(
        health: Arc<HealthMonitor>,
        executor: Arc<ExclusiveExecutor>,
        config: DiagnosticsConfig,
    ) -> Self {
        Self {
            health,
            executor,
            queue: None,
            probe: None,
            records: None,
            config,
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn QueueObserver>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_record_source(mut self, records: Arc<dyn RecordSource>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn config(&self) -> &DiagnosticsConfig {
        &self.config
    }

    /// Cheap status read. Never fails: probe errors, panics and timeouts are
    /// reported as [`QuickStatus::Error`].
    pub async fn get_quick_sync_status(&self) -> QuickSyncStatus {
        match AssertUnwindSafe(self.collect_quick_status()).catch_unwind().await {
            Ok(status) => status,
            Err(panic) => {
                let err = SyncError::HealthCheck(format!(
                    "quick status check panicked: {}",
                    panic_message(panic.as_ref())
                ));
                warn!(error = %err, "Quick sync status degraded to ERROR");
                QuickSyncStatus::from_error(&err)
            }
        }
    }

    async fn collect_quick_status(&self) -> QuickSyncStatus {
        let mut checks = vec![self.health_state_check(), self.stuck_lock_check()];
        let mut probe_error = None;

        if let Some(probe) = &self.probe {
            match self.reachability_check(probe.as_ref()).await {
                Ok(check) => checks.push(check),
                Err(err) => {
                    warn!(error = %err, "Reachability probe could not run");
                    checks.push(TestResult::failed(
                        "reachability",
                        "Remote backend is reachable",
                        err.to_string(),
                    ));
                    probe_error = Some(err);
                }
            }
        }

        let failed_checks = checks.iter().filter(|c| !c.is_passed()).count();
        let status = if probe_error.is_some() {
            QuickStatus::Error
        } else if failed_checks > 0 {
            QuickStatus::IssuesDetected
        } else {
            QuickStatus::Healthy
        };

        QuickSyncStatus {
            is_healthy: failed_checks == 0,
            status,
            last_checked: Utc::now(),
            failed_checks,
            checks,
            error: probe_error.map(|e| e.to_string()),
        }
    }

    fn health_state_check(&self) -> TestResult {
        let status = self.health.get_health_status();
        let description = "Sync health is operational";
        if status.status.is_operational() {
            TestResult::passed(
                "health_state",
                description,
                format!(
                    "{} ({} attempts, {:.1}% errors)",
                    status.status,
                    status.metrics.total_attempts,
                    status.error_rate * 100.0
                ),
            )
        } else {
            TestResult::failed(
                "health_state",
                description,
                format!("{}: {}", status.status, status.issues.join("; ")),
            )
        }
    }

    fn stuck_lock_check(&self) -> TestResult {
        let state = self.executor.get_sync_status();
        let threshold_ms = self.executor.config().stuck_lock_threshold_ms;
        let description = "Sync lock is not stuck";
        match (state.current_operation.as_deref(), state.held_for_ms) {
            (Some(holder), Some(held_ms)) if held_ms > threshold_ms => TestResult::failed(
                "lock_state",
                description,
                format!(
                    "'{}' has held the lock for {}ms (threshold {}ms), {} waiting",
                    holder,
                    held_ms,
                    threshold_ms,
                    state.waiting.len()
                ),
            ),
            (Some(holder), _) => TestResult::passed(
                "lock_state",
                description,
                format!("held by '{}', {} waiting", holder, state.waiting.len()),
            ),
            _ => TestResult::passed("lock_state", description, "unlocked"),
        }
    }

    async fn reachability_check(&self, probe: &dyn ReachabilityProbe) -> Result<TestResult, SyncError> {
        let description = "Remote backend is reachable";
        let limit = self.config.probe_timeout();
        let outcome = timeout(limit, AssertUnwindSafe(probe.probe()).catch_unwind()).await;

        match outcome {
            Ok(Ok(Ok(report))) if report.reachable => Ok(TestResult::passed(
                "reachability",
                description,
                match report.latency_ms {
                    Some(ms) => format!("{} reachable in {}ms", probe.name(), ms),
                    None => format!("{} reachable", probe.name()),
                },
            )),
            Ok(Ok(Ok(report))) => Ok(TestResult::failed(
                "reachability",
                description,
                format!(
                    "{} unreachable: {}",
                    probe.name(),
                    report.detail.as_deref().unwrap_or("no detail")
                ),
            )),
            Ok(Ok(Err(err))) => Err(SyncError::HealthCheck(format!(
                "{} probe failed: {:#}",
                probe.name(),
                err
            ))),
            Ok(Err(panic)) => Err(SyncError::HealthCheck(format!(
                "{} probe panicked: {}",
                probe.name(),
                panic_message(panic.as_ref())
            ))),
            Err(_) => Err(SyncError::HealthCheck(format!(
                "{} probe timed out after {}ms",
                probe.name(),
                limit.as_millis()
            ))),
        }
    }

    /// Run every phase in order and build a report.
    ///
    /// Each phase contains its own failures, including panics, as failed
    /// results. Only an unusable diagnostics configuration is returned as an
    /// error.
    pub async fn run_master_sync_validation(&self) -> Result<ValidationReport, SyncError> {
        self.config.validate().map_err(SyncError::Validation)?;

        let started = Instant::now();
        let started_at = Utc::now();
        info!("Starting master sync validation");

        let health = self
            .run_phase(ValidationPhase::HealthCheck, self.health_phase())
            .await;
        let flow = self
            .run_phase(ValidationPhase::FlowValidation, self.flow_phase())
            .await;
        let edge = self
            .run_phase(ValidationPhase::EdgeCases, self.edge_case_phase())
            .await;
        let corruption = self
            .run_phase(ValidationPhase::CorruptionCheck, self.corruption_phase())
            .await;

        let outcomes = [&health, &flow, &edge, &corruption];
        let breakdown: Vec<PhaseSummary> = ValidationPhase::ALL
            .iter()
            .zip(outcomes.iter())
            .map(|(&phase, outcome)| {
                let passed = outcome.results.iter().filter(|r| r.is_passed()).count();
                PhaseSummary {
                    phase,
                    passed,
                    failed: outcome.results.len() - passed,
                    aborted: outcome.aborted,
                }
            })
            .collect();

        let total_passed: usize = breakdown.iter().map(|b| b.passed).sum();
        let total_failed: usize = breakdown.iter().map(|b| b.failed).sum();
        let any_aborted = breakdown.iter().any(|b| b.aborted);
        let overall_status = OverallStatus::from_counts(total_passed, total_failed, any_aborted);
        let duration_ms = started.elapsed().as_millis() as u64;

        info!(
            total_passed,
            total_failed,
            overall_status = overall_status.as_str(),
            duration_ms,
            "Master sync validation complete"
        );

        Ok(ValidationReport {
            summary: ValidationSummary {
                total_tests: total_passed + total_failed,
                total_passed,
                total_failed,
                overall_status,
                duration_ms,
                started_at,
                breakdown,
            },
            health_check: health.results,
            flow_validation: flow.results,
            edge_cases: edge.results,
            corruption_check: corruption.results,
        })
    }

    async fn run_phase<F>(&self, phase: ValidationPhase, run: F) -> PhaseOutcome
    where
        F: Future<Output = Vec<TestResult>>,
    {
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(results) => {
                let passed = results.iter().filter(|r| r.is_passed()).count();
                info!(
                    phase = phase.as_str(),
                    passed,
                    failed = results.len() - passed,
                    "Validation phase complete"
                );
                PhaseOutcome {
                    results,
                    aborted: false,
                }
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(phase = phase.as_str(), %message, "Validation phase aborted");
                PhaseOutcome {
                    results: vec![TestResult::failed(
                        phase.as_str(),
                        "Phase ran to completion",
                        format!("phase aborted: {}", message),
                    )],
                    aborted: true,
                }
            }
        }
    }

    /// Run one bounded check; errors, panics and timeouts become failures.
    async fn run_check<F>(&self, name: &str, description: &str, check: F) -> TestResult
    where
        F: Future<Output = anyhow::Result<String>>,
    {
        let limit = self.config.step_timeout();
        match timeout(limit, AssertUnwindSafe(check).catch_unwind()).await {
            Ok(Ok(Ok(details))) => TestResult::passed(name, description, details),
            Ok(Ok(Err(err))) => TestResult::failed(name, description, format!("{:#}", err)),
            Ok(Err(panic)) => TestResult::failed(
                name,
                description,
                format!("panicked: {}", panic_message(panic.as_ref())),
            ),
            Err(_) => TestResult::failed(
                name,
                description,
                format!("timed out after {}ms", limit.as_millis()),
            ),
        }
    }

    fn sandbox<T: Clone + Send + 'static>(&self) -> Sandbox<T> {
        Sandbox::new(&self.config, self.health.thresholds())
    }

    async fn health_phase(&self) -> Vec<TestResult> {
        let quick = self.get_quick_sync_status().await;
        let mut results = quick.checks;
        if let Some(error) = quick.error {
            if results.is_empty() {
                results.push(TestResult::failed(
                    "quick_status",
                    "Quick status could be collected",
                    error,
                ));
            }
        }
        results
    }

    async fn flow_phase(&self) -> Vec<TestResult> {
        vec![
            self.run_check(
                "debounce_coalescing",
                "Same-type bursts coalesce into one execution",
                self.check_debounce_coalescing(),
            )
            .await,
            self.run_check(
                "batch_flush",
                "Flush executes every pending entry in order",
                self.check_batch_flush(),
            )
            .await,
            self.run_check(
                "mutual_exclusion",
                "At most one operation runs at a time",
                self.check_mutual_exclusion(),
            )
            .await,
            self.run_check(
                "error_propagation",
                "Operation errors reach the caller and health monitor",
                self.check_error_propagation(),
            )
            .await,
            self.run_check(
                "bypass_ordering",
                "Direct execution runs before a pending queued entry",
                self.check_bypass_ordering(),
            )
            .await,
        ]
    }

    async fn check_debounce_coalescing(&self) -> anyhow::Result<String> {
        let sandbox = self.sandbox::<u64>();
        let runs = Arc::new(AtomicUsize::new(0));
        let tickets: Vec<_> = (1..=5u64)
            .map(|n| {
                let runs = Arc::clone(&runs);
                sandbox.queue.enqueue("envelopes", async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(n)
                })
            })
            .collect();

        let values = join_all(tickets)
            .await
            .into_iter()
            .collect::<Result<Vec<u64>, SyncError>>()?;
        let stats = sandbox.queue.get_stats();

        ensure!(
            runs.load(Ordering::SeqCst) == 1,
            "expected 1 execution, saw {}",
            runs.load(Ordering::SeqCst)
        );
        ensure!(
            values.iter().all(|&v| v == 5),
            "coalesced callers saw different results: {:?}",
            values
        );
        ensure!(stats.superseded == 4, "expected 4 superseded, saw {}", stats.superseded);
        Ok(format!(
            "5 enqueues coalesced into 1 execution ({} superseded)",
            stats.superseded
        ))
    }

    async fn check_batch_flush(&self) -> anyhow::Result<String> {
        let sandbox = self.sandbox::<u64>();
        let order = Arc::new(Mutex::new(Vec::new()));
        let kinds = ["envelopes", "transactions", "bills"];
        let tickets: Vec<_> = kinds
            .iter()
            .enumerate()
            .map(|(n, kind)| {
                let order = Arc::clone(&order);
                sandbox.queue.enqueue(*kind, async move {
                    order.lock().push(n);
                    Ok(n as u64)
                })
            })
            .collect();

        let results = sandbox.queue.flush().await;
        let stats = sandbox.queue.get_stats();
        for ticket in tickets {
            ticket.await?;
        }

        ensure!(results.len() == 3, "flush settled {} entries, expected 3", results.len());
        ensure!(results.iter().all(|r| r.is_ok()), "flush reported failures");
        let order = order.lock().clone();
        ensure!(order == vec![0, 1, 2], "execution order {:?}", order);
        ensure!(
            stats.current_queue_size == 0,
            "queue size {} after flush",
            stats.current_queue_size
        );
        Ok(format!("{} entries flushed in enqueue order", results.len()))
    }

    async fn check_mutual_exclusion(&self) -> anyhow::Result<String> {
        let sandbox = self.sandbox::<u64>();
        let tracker = OverlapTracker::default();
        let hold = self.config.sandbox_debounce() / 4;
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let executor = Arc::clone(&sandbox.executor);
                let operation = tracker.operation(hold);
                tokio::spawn(async move {
                    executor
                        .execute(&format!("writer-{}", i), operation, None)
                        .await
                })
            })
            .collect();

        for handle in join_all(handles).await {
            handle??;
        }
        ensure!(tracker.peak() == 1, "{} operations overlapped", tracker.peak());
        let state = sandbox.executor.get_sync_status();
        ensure!(!state.locked, "lock still held after all writers finished");
        ensure!(
            state.metrics.operations_completed == 4,
            "lock metrics recorded {} operations",
            state.metrics.operations_completed
        );
        Ok("4 concurrent writers ran one at a time".to_string())
    }

    async fn check_error_propagation(&self) -> anyhow::Result<String> {
        let sandbox = self.sandbox::<u64>();
        let outcome = sandbox
            .executor
            .execute(
                "failing-sync",
                async { Err::<u64, _>(anyhow::anyhow!("simulated backend failure")) },
                None,
            )
            .await;

        match &outcome {
            Err(err @ SyncError::Operation { .. })
                if err
                    .operation_error()
                    .is_some_and(|e| e.to_string() == "simulated backend failure") => {}
            other => bail!("unexpected outcome: {:?}", other),
        }

        let metrics = sandbox.health.metrics();
        ensure!(
            metrics.failed_syncs == 1 && metrics.consecutive_failures == 1,
            "health monitor recorded {} failures ({} consecutive)",
            metrics.failed_syncs,
            metrics.consecutive_failures
        );
        ensure!(!sandbox.executor.is_locked(), "lock held after failed operation");
        Ok("operation error surfaced unchanged and was recorded".to_string())
    }

    async fn check_bypass_ordering(&self) -> anyhow::Result<String> {
        let sandbox = self.sandbox::<u64>();
        let order = Arc::new(Mutex::new(Vec::new()));

        let queued_order = Arc::clone(&order);
        let ticket = sandbox.queue.enqueue("bills", async move {
            queued_order.lock().push("queued");
            Ok(1)
        });
        let bypass_order = Arc::clone(&order);
        sandbox
            .executor
            .execute(
                "bills",
                async move {
                    bypass_order.lock().push("bypass");
                    Ok(2)
                },
                None,
            )
            .await?;
        ticket.await?;

        let order = order.lock().clone();
        ensure!(order == vec!["bypass", "queued"], "execution order {:?}", order);
        Ok("bypass ran before the debounced entry".to_string())
    }

    async fn edge_case_phase(&self) -> Vec<TestResult> {
        let mut results = vec![
            self.run_check(
                "empty_payload",
                "An operation returning no data completes normally",
                self.check_empty_payload(),
            )
            .await,
            self.run_check(
                "concurrent_writers",
                "Concurrent queued and direct writers never overlap",
                self.check_concurrent_writers(),
            )
            .await,
            self.run_check(
                "clear_cancels_waiters",
                "Clearing the queue cancels pending callers",
                self.check_clear_cancels(),
            )
            .await,
            self.run_check(
                "timeout_releases_lock",
                "A timed-out caller does not leave the lock held",
                self.check_timeout_releases_lock(),
            )
            .await,
            self.run_check(
                "max_age_cap",
                "Continuous enqueues still execute within the max queue age",
                self.check_max_age_cap(),
            )
            .await,
        ];
        results.extend(record_fixture_checks());
        results
    }

    async fn check_empty_payload(&self) -> anyhow::Result<String> {
        let sandbox = self.sandbox::<Vec<Value>>();
        let ticket = sandbox.queue.enqueue("", async { Ok(Vec::new()) });
        let flushed = sandbox.queue.flush().await;
        let payload = ticket.await?;
        ensure!(payload.is_empty(), "expected empty payload");
        ensure!(flushed.len() == 1, "flush settled {} entries", flushed.len());
        ensure!(
            sandbox.queue.get_stats().processed == 1,
            "empty payload was not counted as processed"
        );
        Ok("empty payload synced without error".to_string())
    }

    async fn check_concurrent_writers(&self) -> anyhow::Result<String> {
        let sandbox = self.sandbox::<u64>();
        let tracker = OverlapTracker::default();
        let hold = self.config.sandbox_debounce() / 4;

        let queued: Vec<_> = (0..8)
            .map(|_| sandbox.queue.enqueue("transactions", tracker.operation(hold)))
            .collect();
        let direct: Vec<_> = (0..4)
            .map(|_| sandbox.executor.execute("direct-write", tracker.operation(hold), None))
            .collect();
        let (queued, direct) = futures::future::join(join_all(queued), join_all(direct)).await;

        for result in queued.into_iter().chain(direct) {
            result?;
        }
        ensure!(tracker.peak() == 1, "{} writers overlapped", tracker.peak());
        ensure!(
            tracker.runs() == 5,
            "expected 5 executions (1 coalesced + 4 direct), saw {}",
            tracker.runs()
        );
        Ok("12 writers, 5 executions, no overlap".to_string())
    }

    async fn check_clear_cancels(&self) -> anyhow::Result<String> {
        let sandbox = self.sandbox::<u64>();
        let ticket = sandbox.queue.enqueue("goals", async { Ok(1) });
        let cleared = sandbox.queue.clear();
        let outcome = ticket.await;
        ensure!(cleared == 1, "cleared {} entries", cleared);
        ensure!(
            outcome.as_ref().is_err_and(SyncError::is_cancelled),
            "caller saw {:?}",
            outcome
        );
        ensure!(
            sandbox.queue.get_stats().current_queue_size == 0,
            "queue not empty after clear"
        );
        Ok("pending caller resolved as cancelled".to_string())
    }

    async fn check_timeout_releases_lock(&self) -> anyhow::Result<String> {
        let sandbox = self.sandbox::<u64>();
        let hold = self.config.sandbox_debounce() * 2;
        let limit = self.config.sandbox_debounce() / 2;

        let outcome = sandbox
            .executor
            .execute(
                "slow-sync",
                async move {
                    sleep(hold).await;
                    Ok(1)
                },
                Some(limit),
            )
            .await;
        ensure!(
            outcome.as_ref().is_err_and(SyncError::is_timeout),
            "expected timeout, saw {:?}",
            outcome
        );

        let follow_up = sandbox.executor.execute("follow-up", async { Ok(2) }, None).await?;
        ensure!(follow_up == 2, "follow-up returned {}", follow_up);
        ensure!(!sandbox.executor.is_locked(), "lock still held");
        Ok("lock released after detached work finished".to_string())
    }

    async fn check_max_age_cap(&self) -> anyhow::Result<String> {
        let sandbox = self.sandbox::<u64>();
        let debounce = self.config.sandbox_debounce();
        let max_age = Duration::from_millis(self.config.sandbox_max_queue_age_ms);
        let started = Instant::now();

        let mut ticket = sandbox.queue.enqueue("transactions", async { Ok(0) });
        let mut enqueues = 1u64;
        let value = loop {
            tokio::select! {
                result = &mut ticket => break result?,
                _ = sleep(debounce / 2) => {
                    let n = enqueues;
                    enqueues += 1;
                    let _ = sandbox.queue.enqueue("transactions", async move { Ok(n) });
                }
            }
        };
        let elapsed = started.elapsed();

        ensure!(
            elapsed < max_age * 2,
            "entry waited {}ms with max age {}ms",
            elapsed.as_millis(),
            max_age.as_millis()
        );
        ensure!(value > 0, "the first operation ran instead of the latest");
        Ok(format!(
            "fired after {}ms under {} continuous enqueues",
            elapsed.as_millis(),
            enqueues
        ))
    }

    async fn corruption_phase(&self) -> Vec<TestResult> {
        let mut results = vec![
            check_health_metrics(&self.health.metrics()),
            check_lock_state(&self.executor.get_sync_status()),
        ];
        if let Some(queue) = &self.queue {
            results.push(check_queue_stats(&queue.queue_stats()));
        }
        if let Some(source) = &self.records {
            results.extend(self.check_record_source(source.as_ref()).await);
        }
        results
    }

    async fn check_record_source(&self, source: &dyn RecordSource) -> Vec<TestResult> {
        let limit = self.config.probe_timeout();
        let snapshot = match timeout(limit, AssertUnwindSafe(source.snapshot()).catch_unwind()).await
        {
            Ok(Ok(Ok(snapshot))) => snapshot,
            Ok(Ok(Err(err))) => {
                return vec![TestResult::failed(
                    "record_snapshot",
                    "Local records can be read",
                    format!("{:#}", err),
                )]
            }
            Ok(Err(panic)) => {
                return vec![TestResult::failed(
                    "record_snapshot",
                    "Local records can be read",
                    format!("panicked: {}", panic_message(panic.as_ref())),
                )]
            }
            Err(_) => {
                return vec![TestResult::failed(
                    "record_snapshot",
                    "Local records can be read",
                    format!("timed out after {}ms", limit.as_millis()),
                )]
            }
        };

        snapshot
            .iter()
            .map(|collection| {
                let name = format!("records:{}", collection.name);
                let description = "Records are structurally intact";
                let issues = check_records(&collection.records);
                let corrupt: Vec<&RecordIssue> =
                    issues.iter().filter(|i| i.kind.is_corruption()).collect();
                if corrupt.is_empty() {
                    TestResult::passed(
                        &name,
                        description,
                        format!("{} records, no corruption", collection.records.len()),
                    )
                } else {
                    TestResult::failed(&name, description, summarize_issues(&corrupt))
                }
            })
            .collect()
    }
}

fn summarize_issues(issues: &[&RecordIssue]) -> String {
    let mut parts: Vec<String> = issues
        .iter()
        .take(5)
        .map(|issue| {
            format!(
                "{:?} at #{}{}",
                issue.kind,
                issue.index,
                issue
                    .field
                    .as_deref()
                    .map(|f| format!(" ({})", f))
                    .unwrap_or_default()
            )
        })
        .collect();
    if issues.len() > 5 {
        parts.push(format!("and {} more", issues.len() - 5));
    }
    format!("{} issues: {}", issues.len(), parts.join(", "))
}

fn check_health_metrics(metrics: &HealthMetrics) -> TestResult {
    let name = "health_metrics";
    let description = "Health counters are internally consistent";
    let mut problems = Vec::new();
    if metrics.successful_syncs + metrics.failed_syncs != metrics.total_attempts {
        problems.push(format!(
            "{} successes + {} failures != {} attempts",
            metrics.successful_syncs, metrics.failed_syncs, metrics.total_attempts
        ));
    }
    if u64::from(metrics.consecutive_failures) > metrics.failed_syncs {
        problems.push(format!(
            "{} consecutive failures exceeds {} total failures",
            metrics.consecutive_failures, metrics.failed_syncs
        ));
    }
    if !metrics.average_sync_time_ms.is_finite() || metrics.average_sync_time_ms < 0.0 {
        problems.push(format!("average sync time is {}", metrics.average_sync_time_ms));
    }
    if problems.is_empty() {
        TestResult::passed(name, description, format!("{} attempts tracked", metrics.total_attempts))
    } else {
        TestResult::failed(name, description, problems.join("; "))
    }
}

fn check_lock_state(state: &MutexState) -> TestResult {
    let name = "lock_bookkeeping";
    let description = "Lock state and metrics are internally consistent";
    let mut problems = Vec::new();
    if state.locked != state.current_operation.is_some() {
        problems.push(format!(
            "locked={} but current operation is {:?}",
            state.locked, state.current_operation
        ));
    }
    if !state.locked && !state.waiting.is_empty() {
        problems.push(format!("{} waiters on an unlocked lock", state.waiting.len()));
    }
    if state.locked != state.held_for_ms.is_some() {
        problems.push("hold time does not match lock state".to_string());
    }
    let metrics = &state.metrics;
    if metrics.operations_completed > 0 && metrics.average_lock_time_ms > metrics.max_lock_time_ms as f64 {
        problems.push(format!(
            "average lock time {:.1}ms exceeds max {}ms",
            metrics.average_lock_time_ms, metrics.max_lock_time_ms
        ));
    }
    if problems.is_empty() {
        TestResult::passed(
            name,
            description,
            format!("{} operations completed", metrics.operations_completed),
        )
    } else {
        TestResult::failed(name, description, problems.join("; "))
    }
}

fn check_queue_stats(stats: &QueueStats) -> TestResult {
    let name = "queue_bookkeeping";
    let description = "Every enqueued entry is accounted for exactly once";
    let accounted = stats.processed
        + stats.failed
        + stats.cancelled
        + stats.current_queue_size as u64
        + stats.processing_count as u64;
    if stats.superseded > stats.enqueued {
        return TestResult::failed(
            name,
            description,
            format!("{} superseded exceeds {} enqueued", stats.superseded, stats.enqueued),
        );
    }
    let entries = stats.enqueued - stats.superseded;
    if accounted == entries {
        TestResult::passed(name, description, format!("{} entries accounted for", entries))
    } else {
        TestResult::failed(
            name,
            description,
            format!("{} entries enqueued but {} accounted for", entries, accounted),
        )
    }
}

fn record_fixture_checks() -> Vec<TestResult> {
    let description = "Record integrity checks classify fixture data correctly";

    let fixtures: Vec<(&str, Vec<Value>, Vec<RecordIssueKind>)> = vec![
        ("fixture_empty_dataset", Vec::new(), Vec::new()),
        (
            "fixture_corrupted_timestamps",
            vec![json!({
                "id": "test-corrupted-timestamps",
                "name": "Test Envelope",
                "lastModified": "invalid-date",
                "createdAt": "NaN",
                "updatedAt": -1,
            })],
            vec![RecordIssueKind::InvalidTimestamp; 3],
        ),
        (
            "fixture_duplicate_ids",
            vec![
                json!({"id": "duplicate-test", "name": "Original"}),
                json!({"id": "duplicate-test", "name": "Duplicate"}),
            ],
            vec![RecordIssueKind::DuplicateId],
        ),
        (
            "fixture_null_values",
            vec![json!({"id": "null-test", "name": null, "category": null})],
            vec![RecordIssueKind::NullField; 2],
        ),
        (
            "fixture_unicode",
            vec![
                json!({"id": "unicode-1", "name": "Café ☕"}),
                json!({"id": "unicode-2", "name": "日本語の予算"}),
                json!({"id": "unicode-3", "name": "🏠 Rent", "lastModified": 1_700_000_000_000u64}),
            ],
            Vec::new(),
        ),
    ];

    fixtures
        .into_iter()
        .map(|(name, records, expected)| {
            let found: Vec<RecordIssueKind> =
                check_records(&records).into_iter().map(|i| i.kind).collect();
            if found == expected {
                TestResult::passed(
                    name,
                    description,
                    format!("{} records, {} issues as expected", records.len(), found.len()),
                )
            } else {
                TestResult::failed(
                    name,
                    description,
                    format!("expected {:?}, found {:?}", expected, found),
                )
            }
        })
        .collect()
}

/// Format a section heading with bold/underline.
fn format_section_heading(title: &str) -> String {
    format!("{}", title.bold().underline())
}

fn colored_overall(status: OverallStatus) -> String {
    match status {
        OverallStatus::AllSystemsGo => status.as_str().green().to_string(),
        OverallStatus::Degraded => status.as_str().yellow().to_string(),
        OverallStatus::Critical => status.as_str().red().to_string(),
    }
}

fn status_label(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Passed => "passed",
        CheckStatus::Failed => "FAILED",
    }
}

fn results_table(results: &[TestResult]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Check", "Status", "Details"]);
    for result in results {
        table.add_row(vec![
            result.name.clone(),
            status_label(result.status).to_string(),
            result.details.clone(),
        ]);
    }
    table
}

/// Format a validation report as human-readable text.
pub fn format_validation_report_text(report: &ValidationReport) -> String {
    let summary = &report.summary;
    let mut out = String::new();
    out.push_str(&format!("{}\n\n", format_section_heading("Sync Validation")));
    out.push_str(&format!("  Overall: {}\n", colored_overall(summary.overall_status)));
    out.push_str(&format!(
        "  Tests: {}/{} passed in {}ms\n\n",
        summary.total_passed, summary.total_tests, summary.duration_ms
    ));

    for phase in summary.breakdown.iter() {
        let mut title = format!(
            "{} ({}/{})",
            phase.phase.title(),
            phase.passed,
            phase.passed + phase.failed
        );
        if phase.aborted {
            title.push_str(" aborted");
        }
        out.push_str(&format!("{}\n\n", format_section_heading(&title)));
        let results = report.results(phase.phase);
        if results.is_empty() {
            out.push_str("  No checks ran.\n\n");
            continue;
        }
        out.push_str(&format!("{}\n\n", results_table(results)));
    }
    out
}

/// Format a quick status as human-readable text.
pub fn format_quick_status_text(status: &QuickSyncStatus) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n\n", format_section_heading("Sync Status")));
    let label = match status.status {
        QuickStatus::Healthy => "HEALTHY".green().to_string(),
        QuickStatus::IssuesDetected => "ISSUES_DETECTED".yellow().to_string(),
        QuickStatus::Error => "ERROR".red().to_string(),
    };
    out.push_str(&format!("  Status: {}\n", label));
    out.push_str(&format!("  Checked: {}\n", status.last_checked.to_rfc3339()));
    if let Some(error) = &status.error {
        out.push_str(&format!("  Error: {}\n", error));
    }
    out.push('\n');
    if !status.checks.is_empty() {
        out.push_str(&format!("{}\n", results_table(&status.checks)));
    }
    out
}
