//! Configuration management for TubeCast.
//!
//! Supports three-layer configuration loading:
//! 1. Built-in defaults
//! 2. TOML config file (`~/.tubecast/config.toml`)
//! 3. Environment variable overrides (`TUBECAST_` prefix)

mod types;

pub use types::{
    DatabaseConfig, DispatchConfig, LimitsConfig, LlmConfig, MaintenanceConfig, QueueConfig,
};

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

/// Top-level configuration for the TubeCast engine.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Data storage configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Queue worker pools and lease settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Per-batch dispatch pacing.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Account and quota thresholds.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// LLM provider configuration for AI comment synthesis.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Maintenance loop intervals and the quota-reset timezone.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

impl Config {
    /// Default config file path: `~/.tubecast/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tubecast")
            .join("config.toml")
    }

    /// Load configuration from the given path, apply env overrides, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|_| ConfigError::NotFound {
            path: path.display().to_string(),
        })?;

        let mut config: Config =
            toml::from_str(&contents).map_err(|source| ConfigError::Toml { source })?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from the default path, falling back to pure defaults when the
    /// file does not exist (env overrides and validation still apply).
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let mut config = Config::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Variables use the `TUBECAST_` prefix: `TUBECAST_DB_PATH`,
    /// `TUBECAST_LLM_API_KEY`, `TUBECAST_QUOTA_TZ`.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("TUBECAST_DB_PATH") {
            self.database.path = val;
        }
        if let Ok(val) = env::var("TUBECAST_LLM_API_KEY") {
            self.llm.api_key = val;
        }
        if let Ok(val) = env::var("TUBECAST_QUOTA_TZ") {
            self.maintenance.quota_reset_timezone = val;
        }
    }

    /// Validate the configuration, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.schedule_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "queue.schedule_concurrency".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.queue.post_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "queue.post_concurrency".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.queue.view_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "queue.view_concurrency".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.queue.lease_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "queue.lease_secs".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.dispatch.dispatch_ceiling_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "dispatch.dispatch_ceiling_secs".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self
            .maintenance
            .quota_reset_timezone
            .parse::<chrono_tz::Tz>()
            .is_err()
        {
            return Err(ConfigError::Invalid {
                field: "maintenance.quota_reset_timezone".to_string(),
                reason: format!(
                    "'{}' is not a valid IANA timezone",
                    self.maintenance.quota_reset_timezone
                ),
            });
        }
        Ok(())
    }

    /// Render the default configuration as a TOML document (for `init`).
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}
