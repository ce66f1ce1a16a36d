//! CIE reference curves, the process-wide loader that caches them, and the
//! spline resampling that lines them up with device wavelengths.

use std::str::FromStr;

use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Serialize};

use crate::{color::WhitePoint, Warning};

pub mod converter;
mod data;
pub mod spline;

pub use converter::{average_spectra, same_grid, SpectralConverter};
pub use spline::CubicSpline;

/// Two wavelengths closer than this are the same sample.
pub const WAVELENGTH_TOLERANCE: f64 = 1e-9;

/// Immutable wavelength to value mapping.
#[derive(Clone, Debug, PartialEq)]
pub struct ReferenceCurve {
    name: String,
    wavelengths: Vec<f64>,
    values: Vec<f64>,
}

impl ReferenceCurve {
    pub fn new(name: impl Into<String>, wavelengths: Vec<f64>, values: Vec<f64>) -> crate::Result<Self> {
        let name = name.into();
        if wavelengths.len() != values.len() {
            return Err(crate::Error::ReferenceData(format!(
                "{name}: {} wavelengths but {} values",
                wavelengths.len(),
                values.len()
            )));
        }
        if wavelengths.is_empty() {
            return Err(crate::Error::ReferenceData(format!("{name}: empty curve")));
        }
        if wavelengths.windows(2).any(|w| w[1] <= w[0]) {
            return Err(crate::Error::ReferenceData(format!(
                "{name}: wavelengths are not strictly increasing"
            )));
        }
        Ok(Self {
            name,
            wavelengths,
            values,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wavelengths(&self) -> &[f64] {
        &self.wavelengths
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn domain(&self) -> (f64, f64) {
        (self.wavelengths[0], self.wavelengths[self.wavelengths.len() - 1])
    }

    pub fn contains(&self, wavelength: f64) -> bool {
        let (lo, hi) = self.domain();
        wavelength >= lo - WAVELENGTH_TOLERANCE && wavelength <= hi + WAVELENGTH_TOLERANCE
    }

    fn sample_at(&self, wavelength: f64) -> Option<f64> {
        let idx = self
            .wavelengths
            .partition_point(|l| *l < wavelength - WAVELENGTH_TOLERANCE);
        self.wavelengths
            .get(idx)
            .filter(|l| (**l - wavelength).abs() <= WAVELENGTH_TOLERANCE)
            .map(|_| self.values[idx])
    }
}

/// A curve evaluated at the subset of requested wavelengths it covers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Resampled {
    pub wavelengths: Vec<f64>,
    pub values: Vec<f64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Observer {
    /// CIE 1931 2 degree.
    Cie1931TwoDegree,
    /// CIE 1964 10 degree.
    #[default]
    Cie1964TenDegree,
}

impl Observer {
    fn index(&self) -> usize {
        match self {
            Observer::Cie1931TwoDegree => 0,
            Observer::Cie1964TenDegree => 1,
        }
    }

    pub fn degrees(&self) -> u8 {
        match self {
            Observer::Cie1931TwoDegree => 2,
            Observer::Cie1964TenDegree => 10,
        }
    }
}

impl FromStr for Observer {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().trim_end_matches("deg").trim_end_matches('°') {
            "2" | "1931" | "cie1931" => Ok(Observer::Cie1931TwoDegree),
            "10" | "1964" | "cie1964" => Ok(Observer::Cie1964TenDegree),
            _ => Err(crate::Error::UnknownObserver(s.to_string())),
        }
    }
}

impl core::fmt::Display for Observer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.degrees())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Illuminant {
    #[default]
    D65,
    D50,
    A,
    E,
}

impl Illuminant {
    pub const ALL: [Illuminant; 4] = [Illuminant::D65, Illuminant::D50, Illuminant::A, Illuminant::E];

    fn index(&self) -> usize {
        match self {
            Illuminant::D65 => 0,
            Illuminant::D50 => 1,
            Illuminant::A => 2,
            Illuminant::E => 3,
        }
    }
}

impl FromStr for Illuminant {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "D65" => Ok(Illuminant::D65),
            "D50" => Ok(Illuminant::D50),
            "A" => Ok(Illuminant::A),
            "E" => Ok(Illuminant::E),
            _ => Err(crate::Error::UnknownIlluminant(s.to_string())),
        }
    }
}

impl core::fmt::Display for Illuminant {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Illuminant::D65 => "D65",
            Illuminant::D50 => "D50",
            Illuminant::A => "A",
            Illuminant::E => "E",
        };
        f.write_str(name)
    }
}

/// Illuminant and observer pair, written `D65/10`. A bare illuminant name
/// uses the 10 degree observer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewing {
    pub illuminant: Illuminant,
    pub observer: Observer,
}

impl Viewing {
    pub const fn new(illuminant: Illuminant, observer: Observer) -> Self {
        Self {
            illuminant,
            observer,
        }
    }

    /// Reference white for this viewing condition from the catalog. Entries
    /// that exist for one observer only (`A`, `C`, `E`) serve both.
    pub fn white_point(&self) -> crate::Result<WhitePoint> {
        WhitePoint::lookup(&self.to_string())
            .or_else(|| WhitePoint::lookup(&self.illuminant.to_string()))
            .ok_or_else(|| crate::Error::UnknownWhitePoint(self.to_string()))
    }
}

impl FromStr for Viewing {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (illuminant, observer) = match s.split_once('/') {
            Some((illuminant, observer)) => (illuminant.parse()?, observer.parse()?),
            None => (s.parse()?, Observer::default()),
        };
        Ok(Self::new(illuminant, observer))
    }
}

impl core::fmt::Display for Viewing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.illuminant, self.observer)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ObserverCurves {
    pub observer: Observer,
    pub x_bar: ReferenceCurve,
    pub y_bar: ReferenceCurve,
    pub z_bar: ReferenceCurve,
}

static GLOBAL_LOADER: Lazy<SpectrumDataLoader> = Lazy::new(SpectrumDataLoader::new);

/// Loads each reference table at most once and hands out shared references
/// for the lifetime of the loader. Concurrent first loads race on the cell,
/// only one result is kept.
#[derive(Debug, Default)]
pub struct SpectrumDataLoader {
    observers: [OnceCell<ObserverCurves>; 2],
    illuminants: [OnceCell<ReferenceCurve>; 4],
}

impl SpectrumDataLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide loader.
    pub fn global() -> &'static SpectrumDataLoader {
        &GLOBAL_LOADER
    }

    pub fn load_observer(&self, observer: Observer) -> crate::Result<&ObserverCurves> {
        self.observers[observer.index()].get_or_try_init(|| data::observer(observer))
    }

    pub fn load_observer_by_name(&self, name: &str) -> crate::Result<&ObserverCurves> {
        self.load_observer(name.parse()?)
    }

    pub fn load_illuminant(&self, illuminant: Illuminant) -> crate::Result<&ReferenceCurve> {
        self.illuminants[illuminant.index()].get_or_try_init(|| data::illuminant(illuminant))
    }

    pub fn load_illuminant_by_name(&self, name: &str) -> crate::Result<&ReferenceCurve> {
        let name = name.split_once('/').map_or(name, |(illuminant, _)| illuminant);
        self.load_illuminant(name.parse()?)
    }

    /// Evaluates `curve` at `targets` with a natural cubic spline. Targets
    /// outside the curve's domain are left out of the result. When every
    /// target is already a sample of the curve no spline is fitted.
    pub fn resample(curve: &ReferenceCurve, targets: &[f64]) -> crate::Result<Resampled> {
        let (lo, hi) = curve.domain();
        let wavelengths: Vec<f64> = targets.iter().copied().filter(|l| curve.contains(*l)).collect();
        let exact: Vec<Option<f64>> = wavelengths.iter().map(|l| curve.sample_at(*l)).collect();

        if exact.iter().all(Option::is_some) {
            return Ok(Resampled {
                values: exact.into_iter().flatten().collect(),
                wavelengths,
            });
        }

        let spline = CubicSpline::new(curve.wavelengths(), curve.values())?;
        let mut values = Vec::with_capacity(wavelengths.len());
        for (wavelength, sample) in wavelengths.iter().zip(exact) {
            let value = match sample {
                Some(value) => value,
                None => spline.eval(wavelength.clamp(lo, hi)).ok_or_else(|| {
                    crate::Error::ReferenceData(format!(
                        "{wavelength} nm outside {} domain",
                        curve.name()
                    ))
                })?,
            };
            values.push(value);
        }
        Ok(Resampled {
            wavelengths,
            values,
        })
    }
}

/// `Some` when consecutive wavelengths are not evenly spaced.
pub fn check_spacing(wavelengths: &[f64]) -> Option<Warning> {
    let steps: Vec<f64> = wavelengths.windows(2).map(|w| w[1] - w[0]).collect();
    let min_step = steps.iter().copied().fold(f64::INFINITY, f64::min);
    let max_step = steps.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if steps.len() > 1 && max_step - min_step > 1e-6 {
        Some(Warning::NonUniformSpacing { min_step, max_step })
    } else {
        None
    }
}
