//! Embedded CIE reference tables, 5 nm from 380 to 780 nm.

use serde::Deserialize;

use super::{Illuminant, Observer, ObserverCurves, ReferenceCurve};

const CIE_1931_2DEG: &str = include_str!("../../data/cie_1931_2deg.csv");
const CIE_1964_10DEG: &str = include_str!("../../data/cie_1964_10deg.csv");
const CIE_ILLUM_D65: &str = include_str!("../../data/cie_illum_d65.csv");
const CIE_ILLUM_D50: &str = include_str!("../../data/cie_illum_d50.csv");

const TABLE_START: f64 = 380.0;
const TABLE_END: f64 = 780.0;
const TABLE_STEP: f64 = 5.0;

#[derive(Debug, Deserialize)]
struct ObserverRow {
    wavelength: f64,
    x: f64,
    y: f64,
    z: f64,
}

#[derive(Debug, Deserialize)]
struct IlluminantRow {
    wavelength: f64,
    value: f64,
}

fn reader(text: &'static str) -> csv::Reader<&'static [u8]> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes())
}

pub(crate) fn observer(observer: Observer) -> crate::Result<ObserverCurves> {
    let text = match observer {
        Observer::Cie1931TwoDegree => CIE_1931_2DEG,
        Observer::Cie1964TenDegree => CIE_1964_10DEG,
    };
    let mut wavelengths = Vec::new();
    let (mut x, mut y, mut z) = (Vec::new(), Vec::new(), Vec::new());
    for row in reader(text).deserialize::<ObserverRow>() {
        let row = row?;
        wavelengths.push(row.wavelength);
        x.push(row.x);
        y.push(row.y);
        z.push(row.z);
    }
    log::debug!("loaded {observer} observer, {} samples", wavelengths.len());
    Ok(ObserverCurves {
        observer,
        x_bar: ReferenceCurve::new(format!("{observer} x"), wavelengths.clone(), x)?,
        y_bar: ReferenceCurve::new(format!("{observer} y"), wavelengths.clone(), y)?,
        z_bar: ReferenceCurve::new(format!("{observer} z"), wavelengths, z)?,
    })
}

pub(crate) fn illuminant(illuminant: Illuminant) -> crate::Result<ReferenceCurve> {
    let curve = match illuminant {
        Illuminant::D65 => table(illuminant, CIE_ILLUM_D65)?,
        Illuminant::D50 => table(illuminant, CIE_ILLUM_D50)?,
        Illuminant::A => {
            let wavelengths = grid();
            let values = wavelengths.iter().map(|l| planckian_a(*l)).collect();
            ReferenceCurve::new(illuminant.to_string(), wavelengths, values)?
        }
        Illuminant::E => {
            let wavelengths = grid();
            let values = vec![100.0; wavelengths.len()];
            ReferenceCurve::new(illuminant.to_string(), wavelengths, values)?
        }
    };
    log::debug!("loaded illuminant {illuminant}, {} samples", curve.len());
    Ok(curve)
}

fn table(illuminant: Illuminant, text: &'static str) -> crate::Result<ReferenceCurve> {
    let mut wavelengths = Vec::new();
    let mut values = Vec::new();
    for row in reader(text).deserialize::<IlluminantRow>() {
        let row = row?;
        wavelengths.push(row.wavelength);
        values.push(row.value);
    }
    ReferenceCurve::new(illuminant.to_string(), wavelengths, values)
}

fn grid() -> Vec<f64> {
    let steps = ((TABLE_END - TABLE_START) / TABLE_STEP).round() as usize;
    (0..=steps)
        .map(|i| TABLE_START + TABLE_STEP * i as f64)
        .collect()
}

/// CIE illuminant A in the CIE 15 form: c2 = 1.435e7 nm K at 2848 K, which is
/// 2856 K on the current value of c2. Normalized to 100 at 560 nm.
fn planckian_a(wavelength: f64) -> f64 {
    const C2_OVER_T: f64 = 1.435e7 / 2848.0;
    100.0
        * (560.0 / wavelength).powi(5)
        * ((C2_OVER_T / 560.0).exp() - 1.0)
        / ((C2_OVER_T / wavelength).exp() - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_cover_visible_range() {
        for obs in [Observer::Cie1931TwoDegree, Observer::Cie1964TenDegree] {
            let curves = observer(obs).unwrap();
            assert_eq!(curves.y_bar.len(), 81);
            assert_eq!(curves.y_bar.domain(), (380.0, 780.0));
        }
        for ill in Illuminant::ALL {
            assert_eq!(illuminant(ill).unwrap().len(), 81, "{ill}");
        }
    }

    #[test]
    fn test_normalized_at_560() {
        for ill in Illuminant::ALL {
            let curve = illuminant(ill).unwrap();
            let idx = curve.wavelengths().iter().position(|l| *l == 560.0).unwrap();
            assert!((curve.values()[idx] - 100.0).abs() < 1e-9, "{ill}");
        }
    }

    #[test]
    fn test_illuminant_a_reference_values() {
        // CIE 15 tabulates A at 380 nm as 9.7951 and at 780 nm as 241.675.
        assert!((planckian_a(380.0) - 9.7951).abs() < 0.01);
        assert!((planckian_a(780.0) - 241.675).abs() < 0.1);
    }
}
