//! Data models for the taskdepot runtime.
//!
//! This module contains the configuration structures shared by the runtime:
//! - [`RuntimeConfig`]: Top-level configuration loaded from `taskdepot.yaml`
//! - [`PoolSettings`]: Size and thread parameters of the bounded worker pool
//! - [`LoggingSettings`]: Log directory, file prefix and verbosity
//!
//! All structs derive `Serialize`/`Deserialize` and default every field, so a partial
//! YAML file (or none at all) still yields a complete configuration.

pub mod config;

pub use config::{LoggingSettings, PoolSettings, RuntimeConfig};
