use crate::{color::Xyz, Warning};

use super::{check_spacing, SpectrumDataLoader, Viewing, WAVELENGTH_TOLERANCE};

/// Samples below zero by less than this (on the unit reflectance scale) are
/// rounding noise and clamp to zero.
pub const NEGATIVE_TOLERANCE: f64 = -1e-3;

/// Integrates a reflectance spectrum against an observer and illuminant.
#[derive(Clone, Debug)]
pub struct SpectralConverter {
    loader: &'static SpectrumDataLoader,
    reflectance_scale: f64,
}

impl Default for SpectralConverter {
    fn default() -> Self {
        Self::new(100.0)
    }
}

impl SpectralConverter {
    /// `reflectance_scale` is the value that means 100 % reflectance in the
    /// input, 100.0 for the device's percent output.
    pub fn new(reflectance_scale: f64) -> Self {
        Self {
            loader: SpectrumDataLoader::global(),
            reflectance_scale,
        }
    }

    pub fn with_loader(mut self, loader: &'static SpectrumDataLoader) -> Self {
        self.loader = loader;
        self
    }

    pub fn reflectance_scale(&self) -> f64 {
        self.reflectance_scale
    }

    pub fn spectrum_to_xyz(&self, spd: &[f64], wavelengths: &[f64], viewing: &Viewing) -> crate::Result<Xyz> {
        let (xyz, warnings) = self.integrate(spd, wavelengths, viewing)?;
        for warning in warnings {
            log::warn!("{warning}");
        }
        Ok(xyz)
    }

    /// Like [`spectrum_to_xyz`](Self::spectrum_to_xyz) but hands the
    /// non-fatal findings back instead of logging them.
    pub fn integrate(
        &self,
        spd: &[f64],
        wavelengths: &[f64],
        viewing: &Viewing,
    ) -> crate::Result<(Xyz, Vec<Warning>)> {
        if spd.len() != wavelengths.len() {
            return Err(crate::Error::InvalidSpectrum(format!(
                "{} samples for {} wavelengths",
                spd.len(),
                wavelengths.len()
            )));
        }
        if spd.is_empty() {
            return Err(crate::Error::InvalidSpectrum("empty spectrum".to_string()));
        }
        if wavelengths.windows(2).any(|w| w[1] <= w[0]) {
            return Err(crate::Error::InvalidSpectrum(
                "wavelengths are not strictly increasing".to_string(),
            ));
        }
        let reflectance = self.normalize(spd, wavelengths)?;
        let warnings: Vec<Warning> = check_spacing(wavelengths).into_iter().collect();

        let cmf = self.loader.load_observer(viewing.observer)?;
        let illuminant = self.loader.load_illuminant(viewing.illuminant)?;

        // Only wavelengths every reference curve covers take part in the sum.
        let (matched, samples): (Vec<f64>, Vec<f64>) = wavelengths
            .iter()
            .zip(&reflectance)
            .filter(|(l, _)| {
                cmf.x_bar.contains(**l) && illuminant.contains(**l)
            })
            .map(|(l, r)| (*l, *r))
            .unzip();
        if matched.is_empty() {
            return Err(crate::Error::InvalidSpectrum(format!(
                "no overlap between {:.0}-{:.0} nm and the reference data",
                wavelengths[0],
                wavelengths[wavelengths.len() - 1]
            )));
        }
        if matched.len() < wavelengths.len() {
            log::debug!(
                "{} of {} samples outside the reference domain",
                wavelengths.len() - matched.len(),
                wavelengths.len()
            );
        }

        let x_bar = SpectrumDataLoader::resample(&cmf.x_bar, &matched)?.values;
        let y_bar = SpectrumDataLoader::resample(&cmf.y_bar, &matched)?.values;
        let z_bar = SpectrumDataLoader::resample(&cmf.z_bar, &matched)?.values;
        let power = SpectrumDataLoader::resample(illuminant, &matched)?.values;

        let norm: f64 = power.iter().zip(&y_bar).map(|(i, y)| i * y).sum();
        if norm <= 0.0 {
            return Err(crate::Error::ReferenceData(format!(
                "illuminant {} has no luminance over the measured range",
                viewing.illuminant
            )));
        }
        let k = 100.0 / norm;

        let mut xyz = Xyz::default();
        for i in 0..matched.len() {
            let weighted = samples[i] * power[i];
            xyz.x += weighted * x_bar[i];
            xyz.y += weighted * y_bar[i];
            xyz.z += weighted * z_bar[i];
        }
        Ok((Xyz::new(k * xyz.x, k * xyz.y, k * xyz.z), warnings))
    }

    fn normalize(&self, spd: &[f64], wavelengths: &[f64]) -> crate::Result<Vec<f64>> {
        spd.iter()
            .zip(wavelengths)
            .map(|(value, wavelength)| {
                if !value.is_finite() {
                    return Err(crate::Error::InvalidSpectrum(format!(
                        "non-finite sample {value} at {wavelength} nm"
                    )));
                }
                let scaled = value / self.reflectance_scale;
                if scaled < NEGATIVE_TOLERANCE {
                    return Err(crate::Error::InvalidSpectrum(format!(
                        "negative sample {value} at {wavelength} nm"
                    )));
                }
                Ok(scaled.max(0.0))
            })
            .collect()
    }
}

/// Average of several spectra sample by sample.
pub fn average_spectra(spectra: &[Vec<f64>]) -> crate::Result<Vec<f64>> {
    let Some(first) = spectra.first() else {
        return Err(crate::Error::InvalidSpectrum("nothing to average".to_string()));
    };
    if spectra.iter().any(|s| s.len() != first.len()) {
        return Err(crate::Error::InvalidSpectrum(
            "spectra to average differ in length".to_string(),
        ));
    }
    let count = spectra.len() as f64;
    Ok((0..first.len())
        .map(|i| spectra.iter().map(|s| s[i]).sum::<f64>() / count)
        .collect())
}

/// True when both grids hold the same wavelengths.
pub fn same_grid(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= WAVELENGTH_TOLERANCE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        color::WhitePoint,
        spd::spd_wavelengths,
        spectral::{Illuminant, Observer},
    };

    fn device_grid() -> Vec<f64> {
        spd_wavelengths()
    }

    #[test]
    fn test_flat_reflector_has_y_100() {
        let converter = SpectralConverter::default();
        let wavelengths = device_grid();
        let flat = vec![100.0; wavelengths.len()];
        for illuminant in Illuminant::ALL {
            for observer in [Observer::Cie1931TwoDegree, Observer::Cie1964TenDegree] {
                let viewing = Viewing::new(illuminant, observer);
                let xyz = converter.spectrum_to_xyz(&flat, &wavelengths, &viewing).unwrap();
                assert!((xyz.y - 100.0).abs() < 1e-9, "{viewing}: {xyz}");
            }
        }
    }

    #[test]
    fn test_full_range_matches_catalog_white() {
        let converter = SpectralConverter::default();
        let wavelengths: Vec<f64> = (0..=80).map(|i| 380.0 + 5.0 * i as f64).collect();
        let flat = vec![100.0; wavelengths.len()];
        for (viewing, white) in [("D65/10", WhitePoint::D65_10), ("D50/2", WhitePoint::D50_2)] {
            let xyz = converter
                .spectrum_to_xyz(&flat, &wavelengths, &viewing.parse().unwrap())
                .unwrap();
            assert!(xyz.max_difference(&white.xyz) < 0.05, "{viewing}: {xyz}");
        }
    }

    #[test]
    fn test_out_of_domain_samples_are_excluded() {
        let converter = SpectralConverter::default();
        let wavelengths: Vec<f64> = (0..=50).map(|i| 300.0 + 10.0 * i as f64).collect();
        let flat = vec![100.0; wavelengths.len()];
        let xyz = converter
            .spectrum_to_xyz(&flat, &wavelengths, &Viewing::default())
            .unwrap();
        assert!((xyz.y - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_off_grid_wavelengths_use_spline() {
        let converter = SpectralConverter::default();
        let wavelengths: Vec<f64> = (0..30).map(|i| 402.5 + 10.0 * i as f64).collect();
        let flat = vec![50.0; wavelengths.len()];
        let xyz = converter
            .spectrum_to_xyz(&flat, &wavelengths, &Viewing::default())
            .unwrap();
        assert!((xyz.y - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_spectra() {
        let converter = SpectralConverter::default();
        let wavelengths = device_grid();
        let viewing = Viewing::default();

        let mut spd = vec![40.0; wavelengths.len()];
        spd[3] = f64::NAN;
        assert!(matches!(
            converter.spectrum_to_xyz(&spd, &wavelengths, &viewing),
            Err(crate::Error::InvalidSpectrum(_))
        ));

        spd[3] = -5.0;
        assert!(matches!(
            converter.spectrum_to_xyz(&spd, &wavelengths, &viewing),
            Err(crate::Error::InvalidSpectrum(_))
        ));

        // Within tolerance: clamps to zero.
        spd[3] = -0.05;
        assert!(converter.spectrum_to_xyz(&spd, &wavelengths, &viewing).is_ok());

        assert!(converter.spectrum_to_xyz(&spd[..10], &wavelengths, &viewing).is_err());
        assert!(converter.spectrum_to_xyz(&[50.0], &[900.0], &viewing).is_err());
    }

    #[test]
    fn test_non_uniform_spacing_is_a_warning() {
        let converter = SpectralConverter::default();
        let wavelengths = [400.0, 410.0, 430.0, 440.0, 470.0];
        let (xyz, warnings) = converter
            .integrate(&[80.0; 5], &wavelengths, &Viewing::default())
            .unwrap();
        assert!((xyz.y - 80.0).abs() < 1e-9);
        assert!(matches!(warnings[..], [Warning::NonUniformSpacing { .. }]));
    }

    #[test]
    fn test_average_spectra() {
        let avg = average_spectra(&[vec![1.0, 2.0], vec![3.0, 6.0]]).unwrap();
        assert_eq!(avg, vec![2.0, 4.0]);
        assert!(average_spectra(&[]).is_err());
        assert!(average_spectra(&[vec![1.0], vec![1.0, 2.0]]).is_err());
        assert!(same_grid(&[400.0, 410.0], &[400.0, 410.0]));
        assert!(!same_grid(&[400.0], &[400.0, 410.0]));
    }
}
