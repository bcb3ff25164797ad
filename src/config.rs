//! Configuration System
//!
//! Layered configuration for the sync core. Sources, lowest precedence first:
//! built-in defaults, the global user file, the application's
//! `config/syncguard.toml`, the environment-specific `config/{SYNCGUARD_ENV}.toml`,
//! then `SYNCGUARD__SECTION__KEY` environment variables.

use crate::diagnostics::DiagnosticsConfig;
use crate::error::SyncError;
use crate::executor::ExecutorConfig;
use crate::health::HealthThresholds;
use crate::logging::{validate_logging_config, LoggingConfig};
use crate::queue::QueueConfig;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

mod merge {
    pub(crate) mod merge_policy;
}

mod sources {
    pub(crate) mod app_file;
    pub(crate) mod global_file;
}

pub use sources::global_file::global_config_path;

/// Prefix for environment overrides, e.g. `SYNCGUARD__QUEUE__DEBOUNCE_MS=500`.
pub const ENV_PREFIX: &str = "SYNCGUARD";

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Health classification thresholds
    #[serde(default)]
    pub health: HealthThresholds,

    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SyncConfig {
    /// Validate every section, reporting all problems at once.
    pub fn validate(&self) -> Result<(), SyncError> {
        let mut errors = Vec::new();

        if let Err(e) = self.queue.validate() {
            errors.push(format!("queue: {}", e));
        }
        if self.executor.stuck_lock_threshold_ms == 0 {
            errors.push("executor: stuck_lock_threshold_ms must be greater than zero".to_string());
        }
        if let Err(e) = self.health.validate() {
            errors.push(format!("health: {}", e));
        }
        if let Err(e) = self.diagnostics.validate() {
            errors.push(format!("diagnostics: {}", e));
        }
        if let Err(e) = validate_logging_config(&self.logging) {
            errors.push(format!("logging: {}", e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )))
        }
    }

    /// Render as TOML, e.g. to seed a config file.
    pub fn to_toml(&self) -> Result<String, SyncError> {
        toml::to_string_pretty(self)
            .map_err(|e| SyncError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Parse TOML. Missing sections and keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, SyncError> {
        let config: SyncConfig = toml::from_str(source)
            .map_err(|e| SyncError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }
}

/// Builds a [`SyncConfig`] from the layered sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration, optionally including the application's `config/`
    /// directory under `app_root`.
    pub fn load(app_root: Option<&Path>) -> Result<SyncConfig, SyncError> {
        let mut builder = merge::merge_policy::builder_with_defaults()?;
        builder = sources::global_file::add_to_builder(builder)?;
        if let Some(root) = app_root {
            builder = sources::app_file::add_to_builder(builder, root)?;
        }
        builder = builder.add_source(env_source());

        let config: SyncConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load a single file on top of the defaults, ignoring every other source.
    pub fn load_from_file(path: &Path) -> Result<SyncConfig, SyncError> {
        if !path.exists() {
            return Err(SyncError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let config: SyncConfig = merge::merge_policy::builder_with_defaults()?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults only.
    pub fn defaults() -> Result<SyncConfig, SyncError> {
        let config: SyncConfig = Config::builder().build()?.try_deserialize()?;
        Ok(config)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
