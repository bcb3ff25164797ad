//! Merge rules: defaults, override order, conflict handling.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
///
/// Only scheduling keys are pinned here; every other key falls back to its
/// serde default when no source sets it.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("queue.debounce_ms", 2_000i64)?
        .set_default("queue.max_queue_age_ms", 30_000i64)?
        .set_default("queue.max_batch_size", 10i64)?
        .set_default("executor.stuck_lock_threshold_ms", 60_000i64)
}
