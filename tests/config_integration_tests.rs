//! Integration tests for ConfigManager and configuration file handling
//!
//! These tests verify:
//! - Configuration loading and saving
//! - Defaults for missing files and missing keys
//! - Environment variable overrides
//! - Building a worker pool from loaded settings

use camino::Utf8PathBuf;
use std::fs;
use taskdepot::{ConfigManager, PoolSettings, RuntimeConfig, WorkerPool};
use tempfile::TempDir;

fn create_test_config_dir() -> (TempDir, Utf8PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
    (temp_dir, config_path)
}

#[test]
fn test_create_config_manager() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    assert_eq!(manager.config_dir(), &config_path);
    assert_eq!(manager.config_path(), &config_path.join("taskdepot.yaml"));
}

#[test]
fn test_creates_missing_directory() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let nested = config_path.join("a").join("b");

    ConfigManager::new(&nested).unwrap();
    assert!(nested.exists());
}

#[test]
fn test_load_defaults_without_file() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    let config = manager.load().unwrap();
    assert_eq!(config.pool, PoolSettings::default());
    assert_eq!(config.logging.dir, "logs");
}

#[test]
fn test_save_and_load_round_trip() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    let mut config = RuntimeConfig::default();
    config.pool.max_threads = 3;
    config.pool.stack_size = Some(512 * 1024);
    config.pool.thread_name = "saved-worker".to_string();
    config.logging.console = false;
    manager.save(&config).unwrap();

    let loaded = manager.load().unwrap();
    assert_eq!(loaded.pool, config.pool);
    assert!(!loaded.logging.console);
}

#[test]
fn test_partial_file_keeps_defaults() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();
    fs::write(manager.config_path(), "pool:\n  keep_alive_ms: 250\n").unwrap();

    let config = manager.load().unwrap();
    assert_eq!(config.pool.keep_alive_ms, 250);
    assert_eq!(config.pool.thread_name, "taskdepot-worker");
    assert_eq!(config.pool.max_threads, 0);
}

#[test]
fn test_environment_override() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();
    fs::write(manager.config_path(), "logging:\n  prefix: from-file\n").unwrap();

    // Only this test reads the prefix, so the process-wide variable is safe here
    unsafe { std::env::set_var("TASKDEPOT_LOGGING__PREFIX", "from-env") };
    let config = manager.load();
    unsafe { std::env::remove_var("TASKDEPOT_LOGGING__PREFIX") };

    assert_eq!(config.unwrap().logging.prefix, "from-env");
}

#[test]
fn test_pool_from_loaded_settings() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();
    fs::write(manager.config_path(), "pool:\n  max_threads: 2\n").unwrap();

    let config = manager.load().unwrap();
    let pool = WorkerPool::new(&config.pool).unwrap();
    assert_eq!(pool.max_threads(), 2);
    assert_eq!(pool.active_count(), 0);
}
