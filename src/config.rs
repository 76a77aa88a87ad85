//! Scheduler configuration using Figment
//!
//! Configuration is layered:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `ISP_SCHED_`; nested keys use a
//!    double underscore (`ISP_SCHED_LOG__LEVEL=debug`)
//!
//! # Example
//! ```no_run
//! use isp_sched::config::SchedulerConfig;
//!
//! let config = SchedulerConfig::load_from("config/isp_sched.toml")?;
//! println!("frames per slot: {}", config.frames_per_slot);
//! # Ok::<(), isp_sched::error::ConfigError>(())
//! ```

use crate::error::ConfigError;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment prefix for overrides.
pub const ENV_PREFIX: &str = "ISP_SCHED_";

/// Scheduler tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Frames in each slot's primary manager
    pub frames_per_slot: usize,
    /// Frames in each slot's late manager
    pub late_frames_per_slot: usize,
    /// Outward notification queue depth
    pub notify_capacity: usize,
    /// Force-stop attempts per queue
    pub force_stop_retries: u32,
    /// Sleep between force-stop attempts, in milliseconds
    pub force_stop_interval_ms: u64,
    /// Leader lag (in frames) that triggers head self-healing
    pub late_lag_threshold: u32,
    /// Warn when fewer free frames remain at internal synthesis
    pub free_low_watermark: usize,
    /// Entries in each slot's diagnostic ring
    pub debug_ring_depth: usize,
    /// Bound on the OTF disable wait, in milliseconds
    pub otf_disable_timeout_ms: u64,
    /// Log one internal-frame completion out of this many
    pub internal_done_log_period: u32,
    /// Logging settings
    pub log: LogConfig,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (pretty, compact, json)
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            frames_per_slot: 16,
            late_frames_per_slot: 8,
            notify_capacity: 64,
            force_stop_retries: 150,
            force_stop_interval_ms: 1,
            late_lag_threshold: 2,
            free_low_watermark: 3,
            debug_ring_depth: 32,
            otf_disable_timeout_ms: 100,
            internal_done_log_period: 30,
            log: LogConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by the environment only.
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = Self::figment().extract()?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Defaults, then `path` (if it exists), then the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Self::figment()
            .merge(Toml::file(path.as_ref()))
            .merge(Self::env())
            .extract()?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    fn env() -> Env {
        Env::prefixed(ENV_PREFIX).split("__")
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(SchedulerConfig::default())).merge(Self::env())
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.log.level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.log.format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.log.format,
                valid_formats.join(", ")
            ));
        }

        if self.frames_per_slot == 0 {
            return Err("frames_per_slot must be at least 1".to_string());
        }
        if self.late_frames_per_slot == 0 {
            return Err("late_frames_per_slot must be at least 1".to_string());
        }
        if self.notify_capacity == 0 {
            return Err("notify_capacity must be at least 1".to_string());
        }
        if self.force_stop_retries == 0 {
            return Err("force_stop_retries must be at least 1".to_string());
        }
        if self.late_lag_threshold < 2 {
            return Err(format!(
                "late_lag_threshold {} too small: a lag of one frame is normal",
                self.late_lag_threshold
            ));
        }
        if self.free_low_watermark > self.frames_per_slot {
            return Err(format!(
                "free_low_watermark {} exceeds frames_per_slot {}",
                self.free_low_watermark, self.frames_per_slot
            ));
        }
        if self.internal_done_log_period == 0 {
            return Err("internal_done_log_period must be at least 1".to_string());
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Sleep between force-stop attempts.
    #[must_use]
    pub fn force_stop_interval(&self) -> Duration {
        Duration::from_millis(self.force_stop_interval_ms)
    }

    /// Bound on the OTF disable wait.
    #[must_use]
    pub fn otf_disable_timeout(&self) -> Duration {
        Duration::from_millis(self.otf_disable_timeout_ms)
    }
}
