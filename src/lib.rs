//! Syncguard: Sync Orchestration Core
//!
//! Decides when and how caller-supplied sync operations run. Bursts of local
//! edits are coalesced by a debounced queue, every write goes through a single
//! FIFO critical section, and each outcome feeds a health monitor that the
//! diagnostic validator and orchestrator report on.
//!
//! ```no_run
//! use std::sync::Arc;
//! use syncguard::{ExecuteOptions, SyncOrchestrator};
//!
//! # async fn run() -> Result<(), syncguard::SyncError> {
//! let sync: Arc<SyncOrchestrator<u64>> = Arc::new(SyncOrchestrator::new());
//! let pushed = sync
//!     .execute_sync(async { Ok(42) }, "envelopes", ExecuteOptions::default())
//!     .await?;
//! assert_eq!(pushed, 42);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod health;
pub mod logging;
pub mod orchestrator;
pub mod probe;
pub mod queue;

pub use config::{ConfigLoader, SyncConfig};
pub use diagnostics::{
    DiagnosticValidator, DiagnosticsConfig, OverallStatus, QuickStatus, QuickSyncStatus,
    TestResult, ValidationReport,
};
pub use error::SyncError;
pub use executor::{ExclusiveExecutor, ExecutorConfig, MutexState};
pub use health::{HealthMonitor, HealthStatus, HealthThresholds, SyncHealth};
pub use orchestrator::{ExecuteOptions, Priority, SyncOrchestrator, SyncStatus};
pub use probe::{ProbeReport, ReachabilityProbe, RecordCollection, RecordSource};
pub use queue::{DebouncedQueue, QueueConfig, QueueStats, SyncTicket};
