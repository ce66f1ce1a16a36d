//! Configuration loading and validation

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    color::{ColorSpace, WhitePoint, WhitePointCatalog, Xyz},
    spectral::Viewing,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub measurement: MeasurementConfig,
    #[serde(default, rename = "white_point", skip_serializing_if = "Vec::is_empty")]
    pub white_points: Vec<WhitePointConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Serial port of the instrument
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_calibration_timeout")]
    pub calibration_timeout_ms: u64,
    /// Timeout for each frame of a measurement
    #[serde(default = "default_step_timeout")]
    pub step_timeout_ms: u64,
    /// How long to wait for the measure button
    #[serde(default = "default_button_timeout")]
    pub button_timeout_ms: u64,
    /// Pause after opening the port before the handshake
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            handshake_timeout_ms: default_handshake_timeout(),
            calibration_timeout_ms: default_calibration_timeout(),
            step_timeout_ms: default_step_timeout(),
            button_timeout_ms: default_button_timeout(),
            settle_ms: default_settle(),
        }
    }
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    19_200
}

fn default_handshake_timeout() -> u64 {
    1_000
}

fn default_calibration_timeout() -> u64 {
    5_000
}

fn default_step_timeout() -> u64 {
    1_500
}

fn default_button_timeout() -> u64 {
    15_000
}

fn default_settle() -> u64 {
    1_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Illuminant and observer, e.g. `D65/10`
    #[serde(default = "default_viewing")]
    pub viewing: String,
    #[serde(default = "default_space")]
    pub space: String,
    #[serde(default = "default_averaging_count")]
    pub averaging_count: u32,
    #[serde(default = "default_averaging_delay")]
    pub averaging_delay_ms: u64,
    /// Wait for the device button instead of triggering from the host
    #[serde(default)]
    pub wait_for_button: bool,
    #[serde(default = "default_xyz_tolerance")]
    pub xyz_tolerance: f64,
    /// Value the device reports for 100 % reflectance
    #[serde(default = "default_reflectance_scale")]
    pub reflectance_scale: f64,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            viewing: default_viewing(),
            space: default_space(),
            averaging_count: default_averaging_count(),
            averaging_delay_ms: default_averaging_delay(),
            wait_for_button: false,
            xyz_tolerance: default_xyz_tolerance(),
            reflectance_scale: default_reflectance_scale(),
        }
    }
}

fn default_viewing() -> String {
    "D65/10".to_string()
}

fn default_space() -> String {
    "LAB".to_string()
}

fn default_averaging_count() -> u32 {
    1
}

fn default_averaging_delay() -> u64 {
    500
}

fn default_xyz_tolerance() -> f64 {
    0.1
}

fn default_reflectance_scale() -> f64 {
    100.0
}

/// A user-defined reference white.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhitePointConfig {
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Loads `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, crate::Error> {
        if path.exists() {
            Self::load(path)
        } else {
            log::debug!("{} not found, using default configuration", path.display());
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, crate::Error> {
        let config: Config =
            toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, crate::Error> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.device.baud_rate == 0 {
            return Err(crate::Error::Config("baud_rate must be positive".to_string()));
        }
        if self.measurement.averaging_count == 0 {
            return Err(crate::Error::Config(
                "averaging_count must be at least 1".to_string(),
            ));
        }
        if !(self.measurement.reflectance_scale > 0.0) {
            return Err(crate::Error::Config(
                "reflectance_scale must be positive".to_string(),
            ));
        }
        if !(self.measurement.xyz_tolerance >= 0.0) {
            return Err(crate::Error::Config(
                "xyz_tolerance must not be negative".to_string(),
            ));
        }
        self.viewing()?;
        self.space()?;
        for wp in &self.white_points {
            if !(wp.y > 0.0) {
                return Err(crate::Error::Config(format!(
                    "white point {} needs a positive Y",
                    wp.name
                )));
            }
        }
        Ok(())
    }

    pub fn viewing(&self) -> Result<Viewing, crate::Error> {
        self.measurement.viewing.parse()
    }

    pub fn space(&self) -> Result<ColorSpace, crate::Error> {
        self.measurement.space.parse()
    }

    /// Built-in white points plus the configured ones.
    pub fn white_point_catalog(&self) -> WhitePointCatalog {
        let mut catalog = WhitePointCatalog::new();
        for wp in &self.white_points {
            catalog.register(WhitePoint::custom(wp.name.clone(), Xyz::new(wp.x, wp.y, wp.z)));
        }
        catalog
    }
}
