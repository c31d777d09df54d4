use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wavepipe_backends::TransferMode;
use wavepipe_rt::queue::RING_INCREMENT;

use crate::recovery::SuspendPolicy;

pub const DEFAULT_VOLUME_ELEMENT: &str = "PCM Playback Volume";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Persisted engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hardware identifier to open. `None` picks the backend default.
    pub device: Option<String>,
    /// Prefer the memory-mapped direct session over the queued stream.
    pub prefer_direct: bool,
    pub transfer: TransferMode,
    /// Mixer element used for stream volume.
    pub volume_element: String,
    pub suspend_retries: u32,
    pub suspend_interval_ms: u64,
    /// Slots added each time a command ring fills up.
    pub ring_increment: usize,
    /// SCHED_FIFO priority for engine threads, Linux only.
    pub realtime_priority: Option<i32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let suspend = SuspendPolicy::default();
        Self {
            device: None,
            prefer_direct: false,
            transfer: TransferMode::Auto,
            volume_element: DEFAULT_VOLUME_ELEMENT.to_string(),
            suspend_retries: suspend.retries,
            suspend_interval_ms: suspend.interval.as_millis() as u64,
            ring_increment: RING_INCREMENT,
            realtime_priority: None,
        }
    }
}

impl EngineConfig {
    pub fn suspend_policy(&self) -> SuspendPolicy {
        SuspendPolicy {
            retries: self.suspend_retries,
            interval: Duration::from_millis(self.suspend_interval_ms),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, json).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `WAVEPIPE_DEVICE` and `WAVEPIPE_PREFER_DIRECT`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(
            env::var("WAVEPIPE_DEVICE").ok(),
            env::var("WAVEPIPE_PREFER_DIRECT").ok(),
        );
    }

    fn apply_overrides(&mut self, device: Option<String>, prefer_direct: Option<String>) {
        if let Some(device) = device.filter(|value| !value.is_empty()) {
            self.device = Some(device);
        }
        if let Some(value) = prefer_direct {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.prefer_direct = true,
                "0" | "false" | "no" | "off" => self.prefer_direct = false,
                other => tracing::warn!(value = other, "ignoring WAVEPIPE_PREFER_DIRECT"),
            }
        }
    }
}

/// Default location of the settings file.
pub fn settings_path() -> Option<PathBuf> {
    let mut base = dirs::config_dir()?;
    base.push("wavepipe");
    base.push("engine.json");
    Some(base)
}

/// Loads settings from disk and the environment. Returns defaults if the file
/// is missing or unreadable.
pub fn load() -> EngineConfig {
    let mut config = match settings_path() {
        Some(path) if path.exists() => EngineConfig::load_from(&path).unwrap_or_else(|err| {
            tracing::warn!(%err, "failed to load engine settings, using defaults");
            EngineConfig::default()
        }),
        _ => EngineConfig::default(),
    };
    config.apply_env_overrides();
    config
}

/// Saves settings to the default location.
pub fn save(config: &EngineConfig) {
    let Some(path) = settings_path() else {
        return;
    };
    if let Err(err) = config.save_to(&path) {
        tracing::warn!(%err, "failed to write engine settings");
    }
}
