use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

/// Pool size used when the platform cannot report its parallelism
const FALLBACK_MAX_THREADS: usize = 4;

/// Runtime configuration from taskdepot.yaml
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub pool: PoolSettings,
    pub logging: LoggingSettings,
}

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum number of concurrently running workers (0 = available parallelism)
    pub max_threads: usize,

    /// Name given to every worker thread
    pub thread_name: String,

    /// Worker stack size in bytes (platform default if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_size: Option<usize>,

    /// How long an idle worker thread is kept before it exits
    pub keep_alive_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_threads: 0,
            thread_name: "taskdepot-worker".to_string(),
            stack_size: None,
            keep_alive_ms: 10_000,
        }
    }
}

impl PoolSettings {
    /// The effective worker bound, resolving 0 to the available parallelism
    pub fn resolved_max_threads(&self) -> usize {
        if self.max_threads > 0 {
            return self.max_threads;
        }
        thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(FALLBACK_MAX_THREADS)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Directory for rotating log files
    pub dir: String,

    /// Prefix of the log file names
    pub prefix: String,

    /// Log at debug level instead of info
    pub debug: bool,

    /// Also log to the console
    pub console: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
            prefix: "taskdepot".to_string(),
            debug: false,
            console: true,
        }
    }
}
