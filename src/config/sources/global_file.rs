//! Global config file source: $XDG_CONFIG_HOME/syncguard/config.toml or the
//! platform config directory.

use config::builder::DefaultState;
use config::ConfigBuilder;
use config::ConfigError;
use config::File;
use directories::ProjectDirs;
use std::path::PathBuf;
use tracing::debug;

/// Path to global config file.
pub fn global_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "syncguard").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Add global config file source to builder if it exists.
pub fn add_to_builder(
    mut builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    if let Some(path) = global_config_path() {
        if path.exists() {
            let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
            builder = builder.add_source(File::from(canonical).required(false));
        } else {
            debug!(config_path = %path.display(), "No global sync configuration file");
        }
    }
    Ok(builder)
}
