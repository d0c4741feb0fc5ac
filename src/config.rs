// Session configuration
//
// Read from a TOML file; every key has a default so an empty file is valid.
// CLI flags are applied on top by main.

use crate::error::ConfigError;
use crate::queue::Durability;
use crate::sync::ThrottleController;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
pub const DEFAULT_NORMAL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_POWER_SAVING_INTERVAL_SECS: u64 = 300;
/// Background execution budgets on mobile hosts are around 30 seconds
pub const DEFAULT_GRANT_BUDGET_SECS: u64 = 25;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Falls back to the id persisted in the queue
    pub device_id: Option<String>,
    pub queue_dir: Option<PathBuf>,
    pub endpoint_url: Option<String>,
    pub max_batch_size: usize,
    pub normal_interval_secs: u64,
    pub power_saving_interval_secs: u64,
    pub grant_budget_secs: u64,
    pub request_timeout_secs: u64,
    pub durability: Durability,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            queue_dir: None,
            endpoint_url: None,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            normal_interval_secs: DEFAULT_NORMAL_INTERVAL_SECS,
            power_saving_interval_secs: DEFAULT_POWER_SAVING_INTERVAL_SECS,
            grant_budget_secs: DEFAULT_GRANT_BUDGET_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            durability: Durability::default(),
        }
    }
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.power_saving_interval_secs <= self.normal_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "power_saving_interval_secs ({}) must exceed normal_interval_secs ({})",
                self.power_saving_interval_secs, self.normal_interval_secs
            )));
        }
        if self.grant_budget_secs == 0 {
            return Err(ConfigError::Invalid(
                "grant_budget_secs must be at least 1".to_string(),
            ));
        }
        if let Some(device_id) = &self.device_id {
            if device_id.trim().is_empty() {
                return Err(ConfigError::Invalid("device_id is empty".to_string()));
            }
        }
        Ok(())
    }

    /// Configured queue directory with `~` expanded, or the platform default
    pub fn queue_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.queue_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => default_queue_dir(),
        }
    }

    pub fn grant_budget(&self) -> Duration {
        Duration::from_secs(self.grant_budget_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn throttle(&self) -> Result<ThrottleController, ConfigError> {
        ThrottleController::new(
            Duration::from_secs(self.normal_interval_secs),
            Duration::from_secs(self.power_saving_interval_secs),
        )
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}

/// `<data dir>/fixsync/queue`, e.g. `~/.local/share/fixsync/queue`
pub fn default_queue_dir() -> Result<PathBuf, ConfigError> {
    let data_dir = dirs::data_local_dir().ok_or_else(|| {
        ConfigError::Invalid("Cannot determine data directory (HOME not set)".to_string())
    })?;
    Ok(data_dir.join("fixsync").join("queue"))
}
