//! Runtime Configuration
//!
//! Configuration for the collector, the safety checks and logging. Use
//! `RuntimeConfig::default()` for sensible defaults, the builder for
//! programmatic setup, or `RuntimeConfig::from_env()` to read the
//! environment.
//!
//! # Environment Variables
//!
//! All environment variables use the `MARROW_` prefix:
//!
//! - `MARROW_GC_THRESHOLD` — initial allocation countdown before the first
//!   automatic collection (default 1024).
//! - `MARROW_GC_MIN_THRESHOLD` — floor for the recalibrated countdown after
//!   a collection (default 1024).
//! - `MARROW_LOG_LEVEL` — `trace` .. `error`, `off`.
//! - `MARROW_LOG_FORMAT` — `plain` or `json`.
//! - `MARROW_SAFETY_CHECKS` — force the shared-pointer integrity checks on
//!   or off (default: on in debug builds).
//!
//! # Example
//!
//! ```rust,ignore
//! use marrow::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::builder()
//!     .gc_threshold(4096)
//!     .safety_checks(true)
//!     .build()
//!     .unwrap();
//! marrow::init_with_config(config);
//! ```

use std::env;
use std::fmt;
use std::sync::OnceLock;

use crate::log::{LogFormat, LogLevel};

/// Collector trigger configuration.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Initial allocation countdown before the first automatic collection.
    /// Default: 1024.
    pub initial_countdown: i64,

    /// Floor for the countdown recalibrated after each collection
    /// (`max(2 * live, min_countdown)`). Default: 1024.
    pub min_countdown: i64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            initial_countdown: 1024,
            min_countdown: 1024,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Minimum log level. Default: Info.
    pub level: LogLevel,

    /// Output format. Default: plain text.
    pub format: LogFormat,
}

/// Safety-check configuration for the shared-pointer engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyConfig {
    /// Force the integrity checks on or off.
    /// `None` (default) enables them in debug builds only.
    pub checks: Option<bool>,
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Collector trigger configuration.
    pub collector: CollectorConfig,

    /// Logging configuration.
    pub log: LogConfig,

    /// Safety-check configuration.
    pub safety: SafetyConfig,
}

impl RuntimeConfig {
    /// Create a new builder for `RuntimeConfig`.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set keep their default values; invalid values
    /// are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_i64("MARROW_GC_THRESHOLD") {
            if val > 0 {
                config.collector.initial_countdown = val;
            }
        }

        if let Some(val) = parse_env_i64("MARROW_GC_MIN_THRESHOLD") {
            if val > 0 {
                config.collector.min_countdown = val;
            }
        }

        if let Some(val) = env::var("MARROW_LOG_LEVEL").ok().and_then(|s| LogLevel::parse(&s)) {
            config.log.level = val;
        }

        if let Some(val) = env::var("MARROW_LOG_FORMAT").ok().and_then(|s| LogFormat::parse(&s)) {
            config.log.format = val;
        }

        if let Some(val) = parse_env_bool("MARROW_SAFETY_CHECKS") {
            config.safety.checks = Some(val);
        }

        config
    }
}

/// Parse an i64 environment variable.
fn parse_env_i64(name: &str) -> Option<i64> {
    env::var(name).ok()?.trim().parse().ok()
}

/// Parse a boolean environment variable.
///
/// Accepts `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive).
fn parse_env_bool(name: &str) -> Option<bool> {
    match env::var(name).ok()?.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Error produced when building an invalid configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The allocation countdown must be positive.
    InvalidCountdown(i64),
    /// The countdown floor must be positive.
    InvalidMinCountdown(i64),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidCountdown(v) => {
                write!(f, "gc threshold must be positive, got {}", v)
            }
            ConfigError::InvalidMinCountdown(v) => {
                write!(f, "gc minimum threshold must be positive, got {}", v)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial allocation countdown.
    pub fn gc_threshold(mut self, countdown: i64) -> Self {
        self.config.collector.initial_countdown = countdown;
        self
    }

    /// Set the countdown floor used after recalibration.
    pub fn min_gc_threshold(mut self, countdown: i64) -> Self {
        self.config.collector.min_countdown = countdown;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Set the log format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log.format = format;
        self
    }

    /// Force the shared-pointer integrity checks on or off.
    pub fn safety_checks(mut self, enabled: bool) -> Self {
        self.config.safety.checks = Some(enabled);
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        if self.config.collector.initial_countdown <= 0 {
            return Err(ConfigError::InvalidCountdown(
                self.config.collector.initial_countdown,
            ));
        }
        if self.config.collector.min_countdown <= 0 {
            return Err(ConfigError::InvalidMinCountdown(
                self.config.collector.min_countdown,
            ));
        }
        Ok(self.config)
    }
}

/// Global runtime configuration.
static RUNTIME_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Install a configuration and apply it to the runtime subsystems.
///
/// Only the first installation wins; later calls still re-apply the log and
/// collector settings of the stored configuration.
pub fn install(config: RuntimeConfig) {
    let _ = RUNTIME_CONFIG.set(config);
    let config = RUNTIME_CONFIG.get().cloned().unwrap_or_default();
    crate::log::set_level(config.log.level);
    crate::log::set_format(config.log.format);
    crate::gc::set_collect_thresholds(
        config.collector.initial_countdown,
        config.collector.min_countdown,
    );
}

/// Get the installed runtime configuration, if any.
pub fn runtime_config() -> Option<&'static RuntimeConfig> {
    RUNTIME_CONFIG.get()
}

/// Whether the shared-pointer integrity checks are enabled.
///
/// Defaults to the build profile (on with debug assertions) unless the
/// installed configuration overrides it.
pub fn safety_checks_enabled() -> bool {
    RUNTIME_CONFIG
        .get()
        .and_then(|c| c.safety.checks)
        .unwrap_or(cfg!(debug_assertions))
}
