//! Configuration system using Figment
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `ITPMON_` (`__` separates sections)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! ITPMON_APPLICATION__LOG_LEVEL=debug
//! ITPMON_ACCESS_LINK__HOST=10.0.0.12
//! ITPMON_ACQUISITION__FREQUENCY_INDEX=2
//! ```
//!
//! # Example
//!
//! ```no_run
//! use itp_monitor::config::Settings;
//!
//! let settings = Settings::load(Some("monitor.toml".as_ref()))?;
//! println!("Polling every {:?}", settings.poll_interval());
//! # Ok::<(), itp_monitor::config::ConfigError>(())
//! ```

use crate::core::{Calibration, Endpoint};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "ITPMON_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Merging the providers or deserializing failed
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Values loaded but are inconsistent
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::LoadError(Box::new(err))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Access link (SCUD) connection
    pub access_link: AccessLinkConfig,
    /// Process link (IPT) connection
    pub process_link: ProcessLinkConfig,
    /// Polling cadence and timeouts
    pub acquisition: AcquisitionConfig,
    /// Reactivity coefficient tables
    pub calibration: CalibrationConfig,
    /// Row logger
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Capacity of each event broadcast stream
    pub broadcast_channel_capacity: usize,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "ITP Monitor".to_string(),
            log_level: "info".to_string(),
            broadcast_channel_capacity: 1024,
        }
    }
}

/// Access link (Modbus/TCP) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessLinkConfig {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Modbus unit identifier
    pub unit_id: u8,
    /// First input register of the channel block
    pub start_register: u16,
    /// Fixed number of channels per snapshot
    pub channels: usize,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for AccessLinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            start_register: 0,
            channels: 15,
            connect_timeout_ms: 3000,
        }
    }
}

/// Process link (line protocol over TCP) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessLinkConfig {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Request line sent once per read, without terminator
    pub request: String,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ProcessLinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4001,
            request: "IPT?".to_string(),
            connect_timeout_ms: 3000,
        }
    }
}

/// Polling cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Selectable polling frequencies in Hz
    pub frequencies_hz: Vec<u32>,
    /// Index of the active entry in `frequencies_hz`
    pub frequency_index: usize,
    /// Upper bound on one read exchange
    pub read_timeout_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            frequencies_hz: vec![1, 10, 20, 30, 40],
            frequency_index: 0,
            read_timeout_ms: 500,
        }
    }
}

/// Reactivity coefficient tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Decay constants, 1/s
    pub lambdas: Vec<f64>,
    /// Weights matching `lambdas`
    pub alphas: Vec<f64>,
}

impl Default for CalibrationConfig {
    /// Six-group delayed-neutron constants for U-235 thermal fission.
    fn default() -> Self {
        Self {
            lambdas: vec![0.0124, 0.0305, 0.111, 0.301, 1.14, 3.01],
            alphas: vec![0.000215, 0.001424, 0.001274, 0.002568, 0.000748, 0.000273],
        }
    }
}

/// Row logger configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// CSV file rows are appended to; logging is off when unset
    pub log_file: Option<PathBuf>,
    /// Column names of the access-link channels, in channel order
    pub channel_names: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let names = [
            "P1k", "Tcold", "Thot", "Ppg", "H10", "H9", "H8", "Lkd", "Lpg", "C", "Cp", "F", "N1",
            "Ntg", "AO",
        ];
        Self {
            log_file: None,
            channel_names: names.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Settings {
    /// Load defaults, then `path` (if given), then `ITPMON_*` environment overrides,
    /// and validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate settings from an already assembled figment.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.access_link.port == 0 || self.process_link.port == 0 {
            return invalid("link ports must be non-zero".into());
        }
        if self.access_endpoint() == self.process_endpoint() {
            return invalid(format!(
                "access and process links both point at {}",
                self.access_endpoint()
            ));
        }
        if self.access_link.channels == 0 {
            return invalid("access_link.channels must be at least 1".into());
        }
        let frequency = self
            .acquisition
            .frequencies_hz
            .get(self.acquisition.frequency_index)
            .copied();
        match frequency {
            None => {
                return invalid(format!(
                    "frequency_index {} out of range for {} frequencies",
                    self.acquisition.frequency_index,
                    self.acquisition.frequencies_hz.len()
                ))
            }
            Some(0) => return invalid("polling frequency must be non-zero".into()),
            Some(_) => {}
        }
        if self.acquisition.read_timeout_ms == 0 {
            return invalid("read_timeout_ms must be non-zero".into());
        }
        if self.application.broadcast_channel_capacity == 0 {
            return invalid("broadcast_channel_capacity must be non-zero".into());
        }
        if let Err(e) = self.calibration().validate() {
            return invalid(e.to_string());
        }
        if self.storage.channel_names.len() != self.access_link.channels {
            return invalid(format!(
                "{} channel names configured for {} channels",
                self.storage.channel_names.len(),
                self.access_link.channels
            ));
        }
        Ok(())
    }

    /// Address of the access link
    pub fn access_endpoint(&self) -> Endpoint {
        Endpoint::new(self.access_link.host.clone(), self.access_link.port)
    }

    /// Address of the process link
    pub fn process_endpoint(&self) -> Endpoint {
        Endpoint::new(self.process_link.host.clone(), self.process_link.port)
    }

    /// Active polling frequency in Hz.
    pub fn poll_frequency_hz(&self) -> u32 {
        self.acquisition
            .frequencies_hz
            .get(self.acquisition.frequency_index)
            .copied()
            .unwrap_or(1)
            .max(1)
    }

    /// Interval between poll ticks for the active frequency.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.poll_frequency_hz()))
    }

    /// Upper bound on each link read
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.acquisition.read_timeout_ms)
    }

    /// Calibration tables as configured
    pub fn calibration(&self) -> Calibration {
        Calibration {
            lambdas: self.calibration.lambdas.clone(),
            alphas: self.calibration.alphas.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.poll_interval(), Duration::from_secs(1));
        assert_eq!(settings.storage.channel_names.len(), 15);
    }

    #[test]
    fn test_frequency_selection() {
        let mut settings = Settings::default();
        settings.acquisition.frequency_index = 1;
        assert_eq!(settings.poll_interval(), Duration::from_millis(100));

        settings.acquisition.frequency_index = 9;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_same_endpoint_rejected() {
        let mut settings = Settings::default();
        settings.process_link.port = settings.access_link.port;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("both point at"));
    }

    #[test]
    fn test_mismatched_calibration_rejected() {
        let mut settings = Settings::default();
        settings.calibration.alphas.pop();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_toml_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "monitor.toml",
                r#"
                [access_link]
                host = "10.0.0.5"
                port = 1502

                [acquisition]
                frequency_index = 2

                [calibration]
                lambdas = [1.0]
                alphas = [1.0]
                "#,
            )?;
            jail.set_env("ITPMON_APPLICATION__LOG_LEVEL", "debug");

            let settings = Settings::load(Some(Path::new("monitor.toml")))
                .map_err(|e| e.to_string())?;

            assert_eq!(settings.access_link.host, "10.0.0.5");
            assert_eq!(settings.access_link.port, 1502);
            assert_eq!(settings.application.log_level, "debug");
            assert_eq!(settings.poll_interval(), Duration::from_millis(50));
            assert_eq!(settings.calibration().lambdas, vec![1.0]);
            Ok(())
        });
    }
}
