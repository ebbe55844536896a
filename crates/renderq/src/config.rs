//! Farm configuration: an explicit structure passed into the resolver,
//! command builder, and worker pool at construction time.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::render::DeviceBackend;

fn default_max_archive_bytes() -> u64 {
    50 * 1024 * 1024 * 1024
}

fn default_worker_count() -> usize {
    1
}

fn default_staleness_secs() -> i64 {
    3600
}

fn default_tail_lines() -> usize {
    40
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_kill_grace_ms() -> u64 {
    5000
}

fn default_samples() -> u32 {
    128
}

fn default_resolution() -> (u32, u32) {
    (1920, 1080)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmConfig {
    /// Path to the headless renderer binary.
    pub renderer_binary: PathBuf,

    /// Device backend requested by default for new jobs.
    pub default_device: DeviceBackend,

    /// Whether callers may fall back to CPU when the GPU backend is
    /// unavailable. The command builder itself never downgrades.
    #[serde(default)]
    pub cpu_fallback_enabled: bool,

    /// Root under which each job gets a private working directory.
    pub working_dir_root: PathBuf,

    /// Root under which finished outputs are stored per job.
    pub artifact_dir_root: PathBuf,

    /// Uploads larger than this are rejected before extraction.
    #[serde(default = "default_max_archive_bytes")]
    pub max_archive_bytes: u64,

    /// Number of worker threads. Doubles as the GPU contention knob:
    /// keep at 1 when a single device must not be shared.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Jobs non-terminal for longer than this are treated as orphaned.
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: i64,

    /// How many trailing output lines to keep as the failure diagnostic.
    #[serde(default = "default_tail_lines")]
    pub diagnostic_tail_lines: usize,

    /// Interval at which the driver polls subprocess liveness and the
    /// cancellation flag.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Grace period between the stop signal and the forced kill.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Render sample count applied when a request does not specify one.
    #[serde(default = "default_samples")]
    pub default_samples: u32,

    /// Output resolution applied when a request does not specify one.
    #[serde(default = "default_resolution")]
    pub default_resolution: (u32, u32),

    /// Optional SQLite path for persisting job records across restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<FarmConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<FarmConfig, ConfigError> {
    let config: FarmConfig = serde_json::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &FarmConfig) -> Result<(), ConfigError> {
    if config.renderer_binary.as_os_str().is_empty() {
        return Err(ConfigError::Validation {
            message: "renderer_binary must not be empty".to_string(),
        });
    }

    if config.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "worker_count must be at least 1".to_string(),
        });
    }

    if config.max_archive_bytes == 0 {
        return Err(ConfigError::Validation {
            message: "max_archive_bytes must be positive".to_string(),
        });
    }

    if config.poll_interval_ms == 0 {
        return Err(ConfigError::Validation {
            message: "poll_interval_ms must be positive".to_string(),
        });
    }

    if config.default_device == DeviceBackend::Cpu && config.cpu_fallback_enabled {
        return Err(ConfigError::Validation {
            message: "cpu_fallback_enabled is meaningless when default_device is cpu".to_string(),
        });
    }

    let (width, height) = config.default_resolution;
    if width == 0 || height == 0 {
        return Err(ConfigError::Validation {
            message: "default_resolution dimensions must be positive".to_string(),
        });
    }

    Ok(())
}
