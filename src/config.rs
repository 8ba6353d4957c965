//! Rig configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/rig.toml`)
//! 2. environment variables prefixed with `FLUIDIC_RIG_`, nested with `__`
//!
//! Every field has a default, so an empty or missing file yields a fully
//! simulated rig.
//!
//! # Example
//! ```no_run
//! use fluidic_rig::config::RigConfig;
//!
//! // FLUIDIC_RIG_PUMP__PORT=/dev/ttyUSB0 overrides pump.port
//! let config = RigConfig::load_from("config/rig.toml")?;
//! println!("Pump on {}", config.pump.port);
//! # Ok::<(), figment::Error>(())
//! ```

use crate::experiment::EngineSettings;
use crate::hardware::reconnect::RetryPolicy;
use crate::limits::{
    DEFAULT_CURRENT_LIMIT, EVENT_CHANNEL_CAPACITY, RECONNECT_ATTEMPTS, RECONNECT_COOLDOWN,
    SAMPLE_INTERVAL, SMU_MAX_CURRENT_LIMIT, SMU_MIN_CURRENT_LIMIT, SWEEP_SETTLE_DELAY,
};
use crate::recorder::RecorderSettings;
use crate::safety::SafetyThresholds;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/rig.toml";

/// Prefix of overriding environment variables.
pub const ENV_PREFIX: &str = "FLUIDIC_RIG_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Application settings.
    pub application: ApplicationConfig,
    /// Pump transport.
    pub pump: PumpConfig,
    /// SMU transport.
    pub smu: SmuConfig,
    /// Safety interlocks.
    pub safety: SafetyConfig,
    /// Data files.
    pub recorder: RecorderConfig,
    /// Engine timing.
    pub engine: EngineConfig,
    /// Forced reconnect policy.
    pub reconnect: ReconnectConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log output (pretty, compact, json).
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Fluidic Rig".to_string(),
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

/// Pump serial link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Serial port or `tcp://host:port`. Empty means simulate.
    pub port: String,
    /// Baud rate of a serial port.
    pub baud_rate: u32,
    /// Bound on each query (ms).
    pub timeout_ms: u64,
    /// Force simulation.
    pub simulate: bool,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 9600,
            timeout_ms: 1000,
            simulate: false,
        }
    }
}

/// SMU link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmuConfig {
    /// `tcp://host:port`, `serial://PORT?baud=N` or empty.
    pub resource: String,
    /// Resources probed with `*IDN?` when `resource` is empty.
    pub candidates: Vec<String>,
    /// Bound on each query (ms).
    pub timeout_ms: u64,
    /// Force simulation.
    pub simulate: bool,
    /// Compliance current used when a run does not give one (A).
    pub default_current_limit: f64,
}

impl Default for SmuConfig {
    fn default() -> Self {
        Self {
            resource: String::new(),
            candidates: Vec::new(),
            timeout_ms: 1000,
            simulate: false,
            default_current_limit: DEFAULT_CURRENT_LIMIT,
        }
    }
}

/// Safety thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Lowest reservoir level (fraction).
    pub min_level_fraction: f64,
    /// Highest pressure (bar).
    pub max_pressure: f64,
    /// Highest temperature (°C).
    pub max_temperature: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        let defaults = SafetyThresholds::default();
        Self {
            min_level_fraction: defaults.min_level_fraction,
            max_pressure: defaults.max_pressure,
            max_temperature: defaults.max_temperature,
        }
    }
}

/// Data file settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Output directory.
    pub data_dir: PathBuf,
    /// Single-character field delimiter.
    pub delimiter: String,
    /// chrono format of the file name timestamp.
    pub timestamp_format: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        let defaults = RecorderSettings::default();
        Self {
            data_dir: defaults.data_dir,
            delimiter: char::from(defaults.delimiter).to_string(),
            timestamp_format: defaults.timestamp_format,
        }
    }
}

/// Engine timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tick period of timed steps (ms).
    pub sample_interval_ms: u64,
    /// Settle delay of sweeps (ms).
    pub sweep_settle_ms: u64,
    /// Capacity of the event channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: SAMPLE_INTERVAL.as_millis() as u64,
            sweep_settle_ms: SWEEP_SETTLE_DELAY.as_millis() as u64,
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// Forced reconnect policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Attempts before falling back to simulation.
    pub max_attempts: u32,
    /// Pause between attempts (ms).
    pub cooldown_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: RECONNECT_ATTEMPTS,
            cooldown_ms: RECONNECT_COOLDOWN.as_millis() as u64,
        }
    }
}

impl RigConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment.
    ///
    /// A missing file is not an error. Environment variables override the
    /// file, e.g. `FLUIDIC_RIG_SAFETY__MAX_PRESSURE=50`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Render as TOML, e.g. to seed a new configuration file.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.pump.baud_rate == 0 {
            return Err("pump.baud_rate must be > 0".into());
        }
        if self.pump.timeout_ms == 0 || self.smu.timeout_ms == 0 {
            return Err("device timeouts must be > 0 ms".into());
        }
        let limit = self.smu.default_current_limit;
        if !(SMU_MIN_CURRENT_LIMIT..=SMU_MAX_CURRENT_LIMIT).contains(&limit) {
            return Err(format!(
                "smu.default_current_limit {limit} outside [{SMU_MIN_CURRENT_LIMIT}, {SMU_MAX_CURRENT_LIMIT}] A"
            ));
        }

        let level = self.safety.min_level_fraction;
        if !(0.0..=1.0).contains(&level) {
            return Err(format!("safety.min_level_fraction {level} outside [0, 1]"));
        }
        let maxima = [self.safety.max_pressure, self.safety.max_temperature];
        if !maxima.iter().all(|v| v.is_finite() && *v > 0.0) {
            return Err("safety maxima must be > 0".into());
        }

        self.delimiter_byte()?;
        if self.recorder.timestamp_format.trim().is_empty() {
            return Err("recorder.timestamp_format must not be empty".into());
        }

        if self.engine.sample_interval_ms == 0 {
            return Err("engine.sample_interval_ms must be > 0".into());
        }
        if self.engine.event_capacity == 0 {
            return Err("engine.event_capacity must be > 0".into());
        }

        Ok(())
    }

    fn delimiter_byte(&self) -> Result<u8, String> {
        let delimiter = &self.recorder.delimiter;
        match delimiter.as_bytes() {
            [byte] if delimiter.is_ascii() && !byte.is_ascii_alphanumeric() => Ok(*byte),
            _ => Err(format!(
                "recorder.delimiter '{delimiter}' must be one ASCII punctuation or whitespace character"
            )),
        }
    }

    /// Safety thresholds.
    pub fn safety_thresholds(&self) -> SafetyThresholds {
        SafetyThresholds {
            min_level_fraction: self.safety.min_level_fraction,
            max_pressure: self.safety.max_pressure,
            max_temperature: self.safety.max_temperature,
        }
    }

    /// Recorder settings. Call [`RigConfig::validate`] first.
    pub fn recorder_settings(&self) -> Result<RecorderSettings, String> {
        Ok(RecorderSettings {
            data_dir: self.recorder.data_dir.clone(),
            delimiter: self.delimiter_byte()?,
            timestamp_format: self.recorder.timestamp_format.clone(),
        })
    }

    /// Engine settings.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            sample_interval: Duration::from_millis(self.engine.sample_interval_ms),
            sweep_settle: Duration::from_millis(self.engine.sweep_settle_ms),
            event_capacity: self.engine.event_capacity,
        }
    }

    /// Reconnect policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.reconnect.max_attempts,
            cooldown: Duration::from_millis(self.reconnect.cooldown_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = RigConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pump.baud_rate, 9600);
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.engine_settings(), EngineSettings::default());
        assert_eq!(config.safety_thresholds(), SafetyThresholds::default());
        assert_eq!(config.recorder_settings().unwrap().delimiter, b',');
    }

    #[test]
    #[serial]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[pump]\nport = \"/dev/ttyUSB0\"\n\n[safety]\nmax_pressure = 50.0\n\n[recorder]\ndelimiter = \";\""
        )
        .unwrap();

        let config = RigConfig::load_from(file.path()).unwrap();
        assert_eq!(config.pump.port, "/dev/ttyUSB0");
        assert_eq!(config.pump.baud_rate, 9600);
        assert_eq!(config.safety.max_pressure, 50.0);
        assert_eq!(config.safety.max_temperature, 100.0);
        assert_eq!(config.recorder_settings().unwrap().delimiter, b';');
    }

    #[test]
    #[serial]
    fn test_rendered_toml_loads_back() {
        let mut config = RigConfig::default();
        config.smu.candidates = vec!["tcp://192.168.0.20:5025".into()];
        config.engine.sample_interval_ms = 500;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", config.to_toml_string().unwrap()).unwrap();
        assert_eq!(RigConfig::load_from(file.path()).unwrap(), config);
    }

    #[test]
    #[serial]
    fn test_missing_file_gives_defaults() {
        let config = RigConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config, RigConfig::default());
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[safety]\nmax_temperature = 80.0").unwrap();

        std::env::set_var("FLUIDIC_RIG_SAFETY__MAX_TEMPERATURE", "60.0");
        std::env::set_var("FLUIDIC_RIG_SMU__SIMULATE", "true");
        let config = RigConfig::load_from(file.path());
        std::env::remove_var("FLUIDIC_RIG_SAFETY__MAX_TEMPERATURE");
        std::env::remove_var("FLUIDIC_RIG_SMU__SIMULATE");

        let config = config.unwrap();
        assert_eq!(config.safety.max_temperature, 60.0);
        assert!(config.smu.simulate);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = RigConfig::default();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.recorder.delimiter = "ab".into();
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.safety.min_level_fraction = 1.5;
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.smu.default_current_limit = 2.0;
        assert!(config.validate().is_err());
    }
}
