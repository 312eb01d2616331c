use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thread_priority::{ThreadPriority, ThreadPriorityValue};

use crate::error::ConfigError;
use crate::messaging::QueueOptions;

const LOG_TARGET: &str = "media_bus::config";

/// Smallest accepted delivery-thread stack size
const MIN_STACK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// `tracing` filter used when `RUST_LOG` is not set
    pub log_filter: String,

    /// Log directory; the platform config directory when unset
    pub log_dir: Option<PathBuf>,

    /// Prefix for delivery thread names (`<prefix>-<owner>`)
    pub thread_name_prefix: String,

    /// Stack size for delivery threads in bytes
    pub delivery_stack_size: Option<usize>,

    /// Delivery thread priority on the cross-platform 0..=99 scale
    pub delivery_priority: Option<u8>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            log_dir: None,
            thread_name_prefix: "msgq".to_string(),
            delivery_stack_size: None,
            delivery_priority: None,
        }
    }
}

impl BusConfig {
    /// Load configuration from the executable's `config` directory.
    /// Creates default config if file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, writing the defaults there if the
    /// file is missing
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = BusConfig::default();
            config.save_to(path)?;
            tracing::info!(target: LOG_TARGET, "Created default config at: {}", path.display());
            return Ok(config);
        }

        let load_failed = |source: Box<dyn std::error::Error + Send + Sync>| ConfigError::LoadFailed {
            path: path.display().to_string(),
            source,
        };
        let content = fs::read_to_string(path).map_err(|e| load_failed(e.into()))?;
        let config: BusConfig = serde_json::from_str(&content).map_err(|e| load_failed(e.into()))?;
        config.validate()?;

        tracing::info!(target: LOG_TARGET, "Loaded config from: {}", path.display());
        Ok(config)
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_failed = |source: Box<dyn std::error::Error + Send + Sync>| ConfigError::SaveFailed {
            path: path.display().to_string(),
            source,
        };

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| save_failed(e.into()))?;
        }

        let json = serde_json::to_string_pretty(self).map_err(|e| save_failed(e.into()))?;
        fs::write(path, json).map_err(|e| save_failed(e.into()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_name_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("thread_name_prefix is empty".to_string()));
        }
        if let Some(size) = self.delivery_stack_size {
            if size < MIN_STACK_SIZE {
                return Err(ConfigError::Invalid(format!(
                    "delivery_stack_size {} is below {}",
                    size, MIN_STACK_SIZE
                )));
            }
        }
        if let Some(priority) = self.delivery_priority {
            if ThreadPriorityValue::try_from(priority).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "delivery_priority {} is outside 0..=99",
                    priority
                )));
            }
        }
        Ok(())
    }

    /// Delivery thread options for a queue owned by `owner`
    pub fn queue_options(&self, owner: &str) -> QueueOptions {
        QueueOptions {
            thread_name: Some(format!("{}-{}", self.thread_name_prefix, owner)),
            stack_size: self.delivery_stack_size,
            priority: self
                .delivery_priority
                .and_then(|value| ThreadPriorityValue::try_from(value).ok())
                .map(ThreadPriority::Crossplatform),
        }
    }

    /// Log directory, falling back to `<config dir>/MediaBus/logs`
    pub fn log_directory(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .map(|dir| dir.join("MediaBus").join("logs"))
                .unwrap_or_else(|| PathBuf::from("logs"))
        })
    }

    /// Get the config file path (in app's base directory)
    fn config_path() -> Result<PathBuf, ConfigError> {
        let exe_path = env::current_exe().map_err(|e| ConfigError::LoadFailed {
            path: "<current executable>".to_string(),
            source: Box::new(e),
        })?;
        let exe_dir = exe_path
            .parent()
            .ok_or_else(|| ConfigError::Invalid("could not determine executable directory".to_string()))?;

        Ok(exe_dir.join("config").join("media-bus.json"))
    }
}
