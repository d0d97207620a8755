//! Engine configuration.
//!
//! Values come from defaults, then an optional TOML file, then explicit
//! overrides applied by the caller (CLI flags / environment). Call
//! [`EngineConfig::validate`] before starting a batch; a rejected config is
//! fatal to the whole batch.

use std::path::Path;
use std::time::Duration;

use emuval_state::RunSettings;
use serde::{Deserialize, Serialize};

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Recognized engine options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of candidates validated concurrently.
    pub concurrency: usize,
    /// Wall-clock budget for one candidate, environment start through teardown.
    pub candidate_timeout_secs: u64,
    /// Ceiling for a single test inside a harness.
    pub test_timeout_secs: u64,
    /// Emulator version pinned for the run.
    pub emulator_version: String,
    /// Emulator image (without tag).
    pub emulator_image: String,
    /// Trend dead-band in percentage points.
    pub trend_dead_band_pct: f64,
    /// Number of sealed runs considered for capability history.
    pub trend_history_len: usize,
    pub health_timeout_secs: u64,
    pub health_poll_interval_ms: u64,
    /// Retries after the first failed environment start.
    pub start_retries: u32,
    pub start_backoff_ms: u64,
    /// Grace budget for teardown once the candidate deadline has fired.
    pub teardown_timeout_secs: u64,
    /// First host port handed out by the allocator.
    pub port_base: u16,
    /// Distance between consecutive allocator slots.
    pub port_stride: u16,
    /// Number of allocator slots.
    pub port_slots: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            candidate_timeout_secs: 300,
            test_timeout_secs: 60,
            emulator_version: "latest".to_string(),
            emulator_image: "localstack/localstack".to_string(),
            trend_dead_band_pct: 2.0,
            trend_history_len: 12,
            health_timeout_secs: 60,
            health_poll_interval_ms: 1_000,
            start_retries: 2,
            start_backoff_ms: 500,
            teardown_timeout_secs: 60,
            port_base: 5100,
            port_stride: 10,
            port_slots: 64,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file. Missing keys keep their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.port_slots == 0 || self.port_stride == 0 {
            return Err(ConfigError::Invalid(
                "port_slots and port_stride must be non-zero".to_string(),
            ));
        }
        if self.concurrency > self.port_slots {
            return Err(ConfigError::Invalid(format!(
                "concurrency {} exceeds the {} available port slots",
                self.concurrency, self.port_slots
            )));
        }
        if self.port_slots > usize::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "port_slots {} exceeds 65535",
                self.port_slots
            )));
        }
        let port_end =
            u64::from(self.port_base) + u64::from(self.port_stride) * self.port_slots as u64;
        if port_end > u64::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "port range {}..{} exceeds 65535",
                self.port_base, port_end
            )));
        }
        if self.candidate_timeout_secs == 0 || self.test_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        if self.test_timeout_secs > self.candidate_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "test timeout {}s exceeds candidate timeout {}s",
                self.test_timeout_secs, self.candidate_timeout_secs
            )));
        }
        if self.health_timeout_secs == 0 || self.health_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "health check timeout and poll interval must be non-zero".to_string(),
            ));
        }
        if !self.trend_dead_band_pct.is_finite() || self.trend_dead_band_pct < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "trend dead-band must be a non-negative number, got {}",
                self.trend_dead_band_pct
            )));
        }
        if self.emulator_version.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "emulator version must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn candidate_timeout(&self) -> Duration {
        Duration::from_secs(self.candidate_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs)
    }

    /// Snapshot pinned into the run record.
    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            concurrency: self.concurrency,
            candidate_timeout_secs: self.candidate_timeout_secs,
            test_timeout_secs: self.test_timeout_secs,
            emulator_version: self.emulator_version.clone(),
        }
    }
}
