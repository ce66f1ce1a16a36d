//! From device captures to finished colour results.
//!
//! The orchestrator owns a [`DeviceSession`] and a [`ColorScience`] backend.
//! It averages raw spectra when asked to, converts once, and hands each
//! [`MeasurementResult`] to the registered callbacks in registration order.
//! A callback that fails or panics is logged and skipped; the result still
//! reaches the remaining callbacks and the caller.

use std::{
    collections::BTreeMap,
    panic::{self, AssertUnwindSafe},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    chart::{Chart, MeasurementSink},
    color::{AdaptationMethod, CieColorScience, ColorScience, ColorSpace, Lab, Rgb, WhitePoint, Xyz},
    config::Config,
    session::{DeviceSession, SpectralMeasurement},
    spectral::{average_spectra, same_grid, SpectralConverter, Viewing},
    transport::Transport,
    Identifier, Warning,
};

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

type Callback = Box<dyn FnMut(&MeasurementResult) -> Result<(), CallbackError> + Send>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    pub identifier: Identifier,
    pub viewing: Viewing,
    pub whitepoint: WhitePoint,
    /// The space the caller asked for; all three are always filled in.
    pub space: ColorSpace,
    pub xyz: Xyz,
    pub lab: Lab,
    /// sRGB on `[0, 255]`.
    pub rgb: Rgb,
    /// Averaged percent reflectance.
    pub spd: Vec<f64>,
    pub wavelengths: Vec<f64>,
    /// The instrument's own estimate from the first capture.
    pub device_xyz: Option<Xyz>,
    pub samples: u32,
    pub warnings: Vec<Warning>,
    pub metadata: BTreeMap<String, String>,
}

impl MeasurementResult {
    /// Components in the requested space.
    pub fn values(&self) -> [f64; 3] {
        match self.space {
            ColorSpace::Xyz => self.xyz.to_array(),
            ColorSpace::Lab => [self.lab.l, self.lab.a, self.lab.b],
            ColorSpace::Rgb => self.rgb.to_array(),
        }
    }

    /// CIE76 difference between the two results' LAB values.
    pub fn delta_e(&self, other: &MeasurementResult) -> f64 {
        self.lab.delta_e(&other.lab)
    }

    pub fn is_similar(&self, other: &MeasurementResult, threshold: f64) -> bool {
        self.delta_e(other) <= threshold
    }

    pub fn spd_pairs(&self) -> Vec<(f64, f64)> {
        self.wavelengths
            .iter()
            .copied()
            .zip(self.spd.iter().copied())
            .collect()
    }

    pub fn has_integrity_warning(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, Warning::DataIntegrity { .. }))
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl core::fmt::Display for MeasurementResult {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.space {
            ColorSpace::Xyz => write!(f, "XYZ {} ({})", self.xyz, self.viewing),
            ColorSpace::Lab => write!(f, "{} ({})", self.lab, self.viewing),
            ColorSpace::Rgb => write!(f, "RGB {} #{}", self.rgb, rgb_hex(&self.rgb)),
        }
    }
}

fn rgb_hex(rgb: &Rgb) -> String {
    Rgb::new(rgb.r / 255.0, rgb.g / 255.0, rgb.b / 255.0).to_hex()
}

#[derive(Clone, Debug)]
pub struct OrchestratorOptions {
    /// Pause between the captures of an averaged measurement.
    pub averaging_delay: Duration,
    /// Start each measurement from the device button rather than the host.
    pub wait_for_button: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for OrchestratorOptions {
    fn from(config: &Config) -> Self {
        Self {
            averaging_delay: Duration::from_millis(config.measurement.averaging_delay_ms),
            wait_for_button: config.measurement.wait_for_button,
        }
    }
}

pub struct MeasurementOrchestrator<T> {
    session: DeviceSession<T>,
    science: Box<dyn ColorScience>,
    options: OrchestratorOptions,
    callbacks: Vec<Callback>,
}

impl<T: Transport> MeasurementOrchestrator<T> {
    pub fn new(session: DeviceSession<T>, options: OrchestratorOptions) -> Self {
        Self::with_science(session, Box::new(CieColorScience::default()), options)
    }

    pub fn with_science(
        session: DeviceSession<T>,
        science: Box<dyn ColorScience>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            session,
            science,
            options,
            callbacks: Vec::new(),
        }
    }

    /// Orchestrator for a session using the settings in `config`.
    pub fn from_config(session: DeviceSession<T>, config: &Config) -> Self {
        let converter = SpectralConverter::new(config.measurement.reflectance_scale);
        Self::with_science(
            session,
            Box::new(CieColorScience::new(converter)),
            OrchestratorOptions::from(config),
        )
    }

    pub fn session(&self) -> &DeviceSession<T> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut DeviceSession<T> {
        &mut self.session
    }

    pub fn into_session(self) -> DeviceSession<T> {
        self.session
    }

    pub fn science(&self) -> &dyn ColorScience {
        self.science.as_ref()
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Registers a callback run after every completed measurement.
    pub fn on_measurement<F>(&mut self, callback: F)
    where
        F: FnMut(&MeasurementResult) -> Result<(), CallbackError> + Send + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// One full cycle: capture `averaging_count` times, average the raw
    /// spectra, convert and dispatch.
    pub async fn measure(
        &mut self,
        space: ColorSpace,
        viewing: Viewing,
        averaging_count: u32,
    ) -> crate::Result<MeasurementResult> {
        let button = self.options.wait_for_button;
        self.measure_with(space, viewing, averaging_count, button).await
    }

    async fn measure_with(
        &mut self,
        space: ColorSpace,
        viewing: Viewing,
        averaging_count: u32,
        button: bool,
    ) -> crate::Result<MeasurementResult> {
        let captures = self.capture(averaging_count.max(1), button).await?;
        let result = self.convert(&captures, space, viewing)?;
        self.dispatch(&result);
        Ok(result)
    }

    async fn capture(&mut self, count: u32, button: bool) -> crate::Result<Vec<SpectralMeasurement>> {
        let step_timeout = self.session.options().step_timeout;
        let pending = if button {
            let timeout = self.session.options().button_timeout;
            self.session.wait_for_button(timeout).await?
        } else {
            self.session.trigger_measurement().await?
        };
        let mut captures = vec![self.session.read_measurement(pending, step_timeout).await?];

        for i in 1..count {
            if !self.options.averaging_delay.is_zero() {
                tokio::time::sleep(self.options.averaging_delay).await;
            }
            log::debug!("capture {} of {count}", i + 1);
            captures.push(self.session.measure().await?);
        }
        Ok(captures)
    }

    fn convert(
        &self,
        captures: &[SpectralMeasurement],
        space: ColorSpace,
        viewing: Viewing,
    ) -> crate::Result<MeasurementResult> {
        let Some(first) = captures.first() else {
            return Err(crate::Error::InvalidSpectrum("no captures".to_string()));
        };
        if captures.iter().any(|c| !same_grid(&c.wavelengths, &first.wavelengths)) {
            return Err(crate::Error::InvalidSpectrum(
                "captures were taken on different wavelength grids".to_string(),
            ));
        }
        let spectra: Vec<Vec<f64>> = captures.iter().map(|c| c.spd.clone()).collect();
        let spd = average_spectra(&spectra)?;

        let whitepoint = viewing.white_point()?;
        let xyz = self.science.spectrum_to_xyz(&spd, &first.wavelengths, &viewing)?;
        let lab = self.science.xyz_to_lab(&xyz, &whitepoint);
        let display_xyz = if whitepoint.xyz == WhitePoint::D65_2.xyz {
            xyz
        } else {
            self.science
                .adapt_xyz(&xyz, &whitepoint, &WhitePoint::D65_2, AdaptationMethod::Bradford)?
        };
        let rgb = self.science.xyz_to_rgb(&display_xyz, true);

        let mut metadata = first.raw.clone();
        metadata.insert("trigger".to_string(), format!("{:?}", first.trigger));
        if let Some(info) = self.session.info() {
            metadata.insert("device".to_string(), info.name.clone());
            metadata.insert("serial".to_string(), info.serial.clone());
            metadata.insert("firmware".to_string(), info.firmware.clone());
        }

        let result = MeasurementResult {
            identifier: uuid::Uuid::new_v4(),
            viewing,
            whitepoint,
            space,
            xyz,
            lab,
            rgb,
            spd,
            wavelengths: first.wavelengths.clone(),
            device_xyz: first.device_xyz,
            samples: captures.len() as u32,
            warnings: captures.iter().flat_map(|c| c.warnings.iter().cloned()).collect(),
            metadata,
        };
        log::info!("Measured {result}");
        Ok(result)
    }

    fn dispatch(&mut self, result: &MeasurementResult) {
        for (index, callback) in self.callbacks.iter_mut().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(result))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("measurement callback {index} failed: {e}"),
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_default();
                    log::warn!("measurement callback {index} panicked: {message}");
                }
            }
        }
    }

    /// Measures every patch of `chart` in order, one button press each, and
    /// streams the results into `sink`. Stops at the first failed patch.
    pub async fn read_chart(
        &mut self,
        chart: &Chart,
        sink: &mut dyn MeasurementSink,
        space: ColorSpace,
        viewing: Viewing,
        averaging_count: u32,
    ) -> crate::Result<usize> {
        for (index, patch) in chart.patches().iter().enumerate() {
            log::info!("Patch {} of {}: {}", index + 1, chart.len(), patch.id);
            let result = self.measure_with(space, viewing, averaging_count, true).await?;
            if let Some(error) = patch.delta_e(&result) {
                log::info!("{}: delta E {error:.2} from expected", patch.id);
            }
            sink.write(&patch.id, &result)?;
        }
        sink.finish()?;
        Ok(chart.len())
    }
}
