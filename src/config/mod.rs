use crate::models::RuntimeConfig;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, Environment, File, FileFormat};
use std::fs;

/// File name of the runtime configuration inside the config directory
pub const CONFIG_FILE_NAME: &str = "taskdepot.yaml";

/// Prefix of environment variables overriding the configuration file
pub const ENV_PREFIX: &str = "TASKDEPOT";

/// Configuration manager for loading and saving the runtime configuration.
///
/// Values are layered, later sources winning:
/// - built-in defaults
/// - `taskdepot.yaml` in the config directory (optional)
/// - `TASKDEPOT_*` environment variables, with `__` between nested keys
///   (e.g. `TASKDEPOT_POOL__MAX_THREADS=8`)
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    config_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager with the specified configuration directory.
    ///
    /// The directory is created if it does not exist.
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            config_path: config_dir.join(CONFIG_FILE_NAME),
            config_dir,
        })
    }

    /// Load the runtime configuration.
    ///
    /// # Returns
    /// The layered configuration; defaults if neither file nor variables are present
    pub fn load(&self) -> Result<RuntimeConfig> {
        self.load_with(Self::environment())
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn load_with(&self, environment: Environment) -> Result<RuntimeConfig> {
        if !self.config_path.exists() {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                self.config_path
            );
        }

        let layered = Config::builder()
            .add_source(File::new(self.config_path.as_str(), FileFormat::Yaml).required(false))
            .add_source(environment)
            .build()
            .with_context(|| format!("Failed to read config: {}", self.config_path))?;

        let config: RuntimeConfig = layered
            .try_deserialize()
            .with_context(|| format!("Failed to parse config: {}", self.config_path))?;

        tracing::info!("Loaded runtime config from {}", self.config_path);
        Ok(config)
    }

    /// Save the runtime configuration file.
    ///
    /// # Arguments
    /// * `config` - The RuntimeConfig to save
    pub fn save(&self, config: &RuntimeConfig) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(config).context("Failed to serialize config to YAML")?;

        fs::write(&self.config_path, yaml_string)
            .with_context(|| format!("Failed to write config: {}", self.config_path))?;

        tracing::info!("Saved runtime config to {}", self.config_path);
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    /// Get the configuration file path.
    pub fn config_path(&self) -> &Utf8Path {
        &self.config_path
    }
}
