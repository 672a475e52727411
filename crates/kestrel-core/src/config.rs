//! Instrumentation settings.
//!
//! Sources, later ones overriding earlier ones:
//! 1. built-in defaults
//! 2. the file passed to [`InstrumentationConfig::load`] (format by extension)
//! 3. `KESTREL_*` environment variables, e.g. `KESTREL_PROFILING_RATE=2.5`

use std::path::{Path, PathBuf};

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of the environment variables read by [`InstrumentationConfig::load`].
pub const CONFIG_ENV_PREFIX: &str = "KESTREL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("profiling_rate must be a percentage between 0 and 100, got {0}")]
    ProfilingRate(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentationConfig {
    /// Percentage of invocations to profile, `0` disables profiling.
    pub profiling_rate: f64,
    pub metrics_enabled: bool,
    /// Directory profile files are written to.
    pub profile_dir: PathBuf,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            profiling_rate: 0.0,
            metrics_enabled: false,
            profile_dir: PathBuf::from("profiles"),
        }
    }
}

impl InstrumentationConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(
            path,
            Environment::with_prefix(CONFIG_ENV_PREFIX).try_parsing(true),
        )
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config: Self = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.profiling_rate) {
            return Err(ConfigError::ProfilingRate(self.profiling_rate));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_profiling_rate(mut self, rate: f64) -> Self {
        self.profiling_rate = rate;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_profile_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.profile_dir = dir.into();
        self
    }
}
