//! Configuration system using Figment.
//!
//! Strongly-typed configuration loaded from a TOML file merged with
//! environment variables prefixed `FROG_DAQ_`. Example:
//! `FROG_DAQ_APPLICATION_LOG_LEVEL=debug` overrides `[application].log_level`.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FrogError, FrogResult};

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrogConfig {
    /// Application settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Delay stage settings.
    #[serde(default)]
    pub stage: StageConfig,
    /// Spectrometer settings.
    #[serde(default)]
    pub spectrometer: SpectrometerConfig,
    /// Default scan range.
    #[serde(default)]
    pub scan: ScanConfig,
    /// Data export settings.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name; also names the per-user data directory for T0.
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Which driver backs the delay stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    /// Simulated stage.
    Mock,
    /// Thorlabs Kinesis controller.
    Kinesis,
}

/// Delay stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Driver selection.
    #[serde(default = "default_stage_kind")]
    pub kind: StageKind,
    /// Serial port of the motion controller.
    #[serde(default = "default_stage_port")]
    pub port: String,
    /// Actuator scale in encoder counts per millimeter.
    #[serde(default = "default_counts_per_mm")]
    pub counts_per_mm: f64,
    /// Soft travel limits (lower, upper) in microns, fixed after connect.
    #[serde(default = "default_travel_limits")]
    pub travel_limits_um: (f64, f64),
    /// Distance kept clear of the travel limits, microns.
    #[serde(default = "default_edge_buffer")]
    pub edge_buffer_um: f64,
    /// Backlash overshoot for the scan start approach, microns.
    #[serde(default = "default_backlash")]
    pub backlash_um: f64,
    /// Motion poll cadence in milliseconds (floored at 1 ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Optional cap on manual jog size, femtoseconds of delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_jog_fs: Option<f64>,
}

/// Which driver backs the spectrometer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpectrometerKind {
    /// Emulated spectrometer.
    Mock,
    /// Ocean Optics instrument.
    Oceanoptics,
}

/// Spectrometer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrometerConfig {
    /// Driver selection.
    #[serde(default = "default_spectrometer_kind")]
    pub kind: SpectrometerKind,
    /// Serial port of the instrument.
    #[serde(default = "default_spectrometer_port")]
    pub port: String,
    /// Integration time applied at connect, microseconds.
    #[serde(default = "default_integration_time")]
    pub integration_time_micros: u64,
    /// Scans averaged per spectrum, applied at connect.
    #[serde(default = "default_scans_to_avg")]
    pub scans_to_avg: u32,
}

/// Default scan range, femtoseconds relative to T0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// First sampled delay.
    #[serde(default = "default_scan_start")]
    pub start_fs: f64,
    /// Last delay within the scan envelope.
    #[serde(default = "default_scan_end")]
    pub end_fs: f64,
    /// Step between samples.
    #[serde(default = "default_scan_step")]
    pub step_fs: f64,
}

/// Data export settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory spectrogram exports land in.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_app_name() -> String {
    "frog_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stage_kind() -> StageKind {
    StageKind::Mock
}

fn default_stage_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_counts_per_mm() -> f64 {
    crate::hardware::kinesis::Z8_COUNTS_PER_MM
}

fn default_travel_limits() -> (f64, f64) {
    (0.0, 20_000.0)
}

fn default_edge_buffer() -> f64 {
    crate::stage::DEFAULT_EDGE_BUFFER_UM
}

fn default_backlash() -> f64 {
    25.0
}

fn default_poll_interval_ms() -> u64 {
    5
}

fn default_spectrometer_kind() -> SpectrometerKind {
    SpectrometerKind::Mock
}

fn default_spectrometer_port() -> String {
    "/dev/ttyUSB1".to_string()
}

fn default_integration_time() -> u64 {
    30_000
}

fn default_scans_to_avg() -> u32 {
    1
}

fn default_scan_start() -> f64 {
    -100.0
}

fn default_scan_end() -> f64 {
    100.0
}

fn default_scan_step() -> f64 {
    1.0
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            kind: default_stage_kind(),
            port: default_stage_port(),
            counts_per_mm: default_counts_per_mm(),
            travel_limits_um: default_travel_limits(),
            edge_buffer_um: default_edge_buffer(),
            backlash_um: default_backlash(),
            poll_interval_ms: default_poll_interval_ms(),
            max_jog_fs: None,
        }
    }
}

impl Default for SpectrometerConfig {
    fn default() -> Self {
        Self {
            kind: default_spectrometer_kind(),
            port: default_spectrometer_port(),
            integration_time_micros: default_integration_time(),
            scans_to_avg: default_scans_to_avg(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            start_fs: default_scan_start(),
            end_fs: default_scan_end(),
            step_fs: default_scan_step(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

impl Default for FrogConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            stage: StageConfig::default(),
            spectrometer: SpectrometerConfig::default(),
            scan: ScanConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl FrogConfig {
    /// Load configuration from `config/frog_daq.toml` and the environment.
    pub fn load() -> FrogResult<Self> {
        Self::load_from("config/frog_daq.toml")
    }

    /// Load configuration from a specific TOML file merged with
    /// `FROG_DAQ_`-prefixed environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> FrogResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FROG_DAQ_").split("_"))
            .extract()
            .map_err(|err| FrogError::Configuration(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the default configuration as a TOML template.
    pub fn sample() -> FrogResult<String> {
        toml::to_string_pretty(&Self::default())
            .map_err(|err| FrogError::Configuration(err.to_string()))
    }

    /// Validate values that parse but may be logically invalid.
    pub fn validate(&self) -> FrogResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(FrogError::Configuration(format!(
                "invalid log_level '{}'; must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let (lower, upper) = self.stage.travel_limits_um;
        if lower >= upper {
            return Err(FrogError::Configuration(format!(
                "travel limits must be ordered, got ({lower}, {upper})"
            )));
        }
        if self.stage.edge_buffer_um < 0.0 || self.stage.backlash_um < 0.0 {
            return Err(FrogError::Configuration(
                "edge buffer and backlash must be non-negative".into(),
            ));
        }

        if self.scan.step_fs == 0.0 {
            return Err(FrogError::Configuration("scan step must be nonzero".into()));
        }

        Ok(())
    }
}
