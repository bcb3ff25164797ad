//! Integration tests for layered configuration loading
//!
//! Precedence, lowest first: defaults, global file, app file, environment
//! file, environment variables.

use crate::integration::test_utils::with_isolated_env;
use std::fs;
use std::path::Path;
use syncguard::config::global_config_path;
use syncguard::{ConfigLoader, SyncConfig, SyncError, SyncOrchestrator};
use tempfile::TempDir;

fn write_global(test_dir: &TempDir, contents: &str) {
    let dir = test_dir.path().join("syncguard");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("config.toml"), contents).unwrap();
}

fn write_app(app_root: &Path, file: &str, contents: &str) {
    let dir = app_root.join("config");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(file), contents).unwrap();
}

#[test]
fn test_no_sources_yields_defaults() {
    let test_dir = TempDir::new().unwrap();
    let config = with_isolated_env(&test_dir, &[], || ConfigLoader::load(None)).unwrap();
    assert_eq!(config, SyncConfig::default());
}

#[test]
fn test_global_path_follows_xdg_config_home() {
    let test_dir = TempDir::new().unwrap();
    let path = with_isolated_env(&test_dir, &[], global_config_path).unwrap();
    assert_eq!(path, test_dir.path().join("syncguard").join("config.toml"));
}

#[test]
fn test_each_layer_overrides_the_one_below() {
    let test_dir = TempDir::new().unwrap();
    let app_root = test_dir.path().join("app");

    write_global(
        &test_dir,
        "[queue]\ndebounce_ms = 100\nmax_queue_age_ms = 1000\nmax_batch_size = 3\n\n[health]\nslow_sync_time_ms = 4000\n",
    );
    write_app(&app_root, "syncguard.toml", "[queue]\ndebounce_ms = 200\nmax_queue_age_ms = 2000\n");
    write_app(&app_root, "staging.toml", "[queue]\ndebounce_ms = 300\n");

    let config = with_isolated_env(
        &test_dir,
        &[
            ("SYNCGUARD_ENV", "staging"),
            ("SYNCGUARD__QUEUE__DEBOUNCE_MS", "400"),
        ],
        || ConfigLoader::load(Some(&app_root)),
    )
    .unwrap();

    assert_eq!(config.queue.debounce_ms, 400);
    assert_eq!(config.queue.max_queue_age_ms, 2_000);
    assert_eq!(config.queue.max_batch_size, 3);
    assert_eq!(config.health.slow_sync_time_ms, 4_000);
    assert_eq!(config.executor.stuck_lock_threshold_ms, 60_000);
}

#[test]
fn test_environment_file_defaults_to_development() {
    let test_dir = TempDir::new().unwrap();
    let app_root = test_dir.path().join("app");
    write_app(&app_root, "development.toml", "[executor]\nstuck_lock_threshold_ms = 5000\n");
    write_app(&app_root, "production.toml", "[executor]\nstuck_lock_threshold_ms = 90000\n");

    let config = with_isolated_env(&test_dir, &[], || {
        std::env::remove_var("SYNCGUARD_ENV");
        ConfigLoader::load(Some(&app_root))
    })
    .unwrap();
    assert_eq!(config.executor.stuck_lock_threshold_ms, 5_000);
}

#[test]
fn test_invalid_layered_value_is_rejected() {
    let test_dir = TempDir::new().unwrap();
    let result = with_isolated_env(&test_dir, &[("SYNCGUARD__QUEUE__MAX_BATCH_SIZE", "0")], || {
        ConfigLoader::load(None)
    });
    match result {
        Err(SyncError::Config(message)) => assert!(message.contains("queue:")),
        other => panic!("expected config error, got {:?}", other),
    }
}

#[test]
fn test_malformed_file_surfaces_config_error() {
    let test_dir = TempDir::new().unwrap();
    write_global(&test_dir, "[queue\ndebounce_ms = ");
    let result = with_isolated_env(&test_dir, &[], || ConfigLoader::load(None));
    assert!(matches!(result, Err(SyncError::Config(_))));
}

#[test]
fn test_loaded_config_drives_orchestrator() {
    let test_dir = TempDir::new().unwrap();
    let app_root = test_dir.path().join("app");
    write_app(
        &app_root,
        "syncguard.toml",
        "[queue]\ndebounce_ms = 50\nmax_batch_size = 2\n\n[diagnostics]\nprobe_timeout_ms = 750\n",
    );

    let config = with_isolated_env(&test_dir, &[], || ConfigLoader::load(Some(&app_root))).unwrap();
    let sync = SyncOrchestrator::<u32>::from_config(&config).unwrap();
    assert_eq!(sync.queue().config().debounce_ms, 50);
    assert_eq!(sync.queue().config().max_batch_size, 2);
    assert_eq!(config.diagnostics.probe_timeout_ms, 750);
}

#[test]
fn test_rendered_config_loads_back_from_file() {
    let test_dir = TempDir::new().unwrap();
    let mut config = SyncConfig::default();
    config.queue.debounce_ms = 1_250;
    config.health.unhealthy_consecutive_failures = 5;
    config.logging.format = "json".to_string();

    let path = test_dir.path().join("rendered.toml");
    fs::write(&path, config.to_toml().unwrap()).unwrap();
    assert_eq!(ConfigLoader::load_from_file(&path).unwrap(), config);
}
