//! Tristimulus color types and the conversions between them.
//!
//! All XYZ values are on the Y = 100 scale. Conversions are exposed through
//! the [`ColorScience`] capability so a backend can be chosen once, at
//! construction, by whoever owns the pipeline.

use std::str::FromStr;

use palette::{convert::FromColorUnclamped, white_point::D65, LinSrgb, Srgb};
use serde::{Deserialize, Serialize};

use crate::spectral::{SpectralConverter, Viewing};

pub mod adaptation;
pub mod white_point;

pub use adaptation::AdaptationMethod;
pub use white_point::{WhitePoint, WhitePointCatalog};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Xyz {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Xyz {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn to_array(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    /// Largest per-component absolute difference.
    pub fn max_difference(&self, other: &Xyz) -> f64 {
        (self.x - other.x)
            .abs()
            .max((self.y - other.y).abs())
            .max((self.z - other.z).abs())
    }
}

impl core::fmt::Display for Xyz {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({:.4}, {:.4}, {:.4})", self.x, self.y, self.z)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Lab {
    pub l: f64,
    pub a: f64,
    pub b: f64,
}

impl Lab {
    pub const fn new(l: f64, a: f64, b: f64) -> Self {
        Self { l, a, b }
    }

    /// CIE76 color difference.
    pub fn delta_e(&self, other: &Lab) -> f64 {
        ((self.l - other.l).powi(2) + (self.a - other.a).powi(2) + (self.b - other.b).powi(2)).sqrt()
    }
}

impl core::fmt::Display for Lab {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "L*{:.2} a*{:.2} b*{:.2}", self.l, self.a, self.b)
    }
}

/// sRGB, either on `[0, 1]` or rounded onto `[0, 255]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl Rgb {
    pub const fn new(r: f64, g: f64, b: f64) -> Self {
        Self { r, g, b }
    }

    pub fn to_array(&self) -> [f64; 3] {
        [self.r, self.g, self.b]
    }

    pub fn to_hex(&self) -> String {
        let channel = |c: f64| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        hex::encode_upper([channel(self.r), channel(self.g), channel(self.b)])
    }
}

impl core::fmt::Display for Rgb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({:.4}, {:.4}, {:.4})", self.r, self.g, self.b)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorSpace {
    Xyz,
    #[default]
    Lab,
    Rgb,
}

impl FromStr for ColorSpace {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "XYZ" => Ok(ColorSpace::Xyz),
            "LAB" | "CIELAB" => Ok(ColorSpace::Lab),
            "RGB" | "SRGB" => Ok(ColorSpace::Rgb),
            _ => Err(crate::Error::UnknownColorSpace(s.to_string())),
        }
    }
}

impl core::fmt::Display for ColorSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ColorSpace::Xyz => write!(f, "XYZ"),
            ColorSpace::Lab => write!(f, "LAB"),
            ColorSpace::Rgb => write!(f, "RGB"),
        }
    }
}

const EPSILON: f64 = 216.0 / 24389.0; // (6/29)^3
const DELTA: f64 = 6.0 / 29.0;

fn lab_f(t: f64) -> f64 {
    if t > EPSILON {
        t.cbrt()
    } else {
        t / (3.0 * DELTA * DELTA) + 4.0 / 29.0
    }
}

fn lab_f_inv(t: f64) -> f64 {
    if t > DELTA {
        t * t * t
    } else {
        3.0 * DELTA * DELTA * (t - 4.0 / 29.0)
    }
}

/// Relative XYZ (Y = 1) under the sRGB reference white.
type SrgbXyz = palette::Xyz<D65, f64>;

/// The six conversions the measurement pipeline depends on, plus the RGB/LAB
/// shortcuts derived from them.
pub trait ColorScience: Send + Sync {
    fn spectrum_to_xyz(&self, spd: &[f64], wavelengths: &[f64], viewing: &Viewing) -> crate::Result<Xyz>;

    fn adapt_xyz(
        &self,
        xyz: &Xyz,
        source: &WhitePoint,
        destination: &WhitePoint,
        method: AdaptationMethod,
    ) -> crate::Result<Xyz>;

    fn xyz_to_lab(&self, xyz: &Xyz, white: &WhitePoint) -> Lab;

    fn lab_to_xyz(&self, lab: &Lab, white: &WhitePoint) -> Xyz;

    /// D65 sRGB, gamma encoded and clamped.
    fn xyz_to_rgb(&self, xyz: &Xyz, out_255: bool) -> Rgb;

    fn rgb_to_xyz(&self, rgb: &Rgb, in_255: bool) -> Xyz;

    fn rgb_to_lab(&self, rgb: &Rgb, in_255: bool, white: &WhitePoint) -> Lab {
        self.xyz_to_lab(&self.rgb_to_xyz(rgb, in_255), white)
    }

    fn lab_to_rgb(&self, lab: &Lab, white: &WhitePoint, out_255: bool) -> Rgb {
        self.xyz_to_rgb(&self.lab_to_xyz(lab, white), out_255)
    }
}

/// Standard CIE colorimetry backed by the embedded reference tables.
#[derive(Clone, Debug, Default)]
pub struct CieColorScience {
    converter: SpectralConverter,
}

impl CieColorScience {
    pub fn new(converter: SpectralConverter) -> Self {
        Self { converter }
    }

    pub fn converter(&self) -> &SpectralConverter {
        &self.converter
    }
}

impl ColorScience for CieColorScience {
    fn spectrum_to_xyz(&self, spd: &[f64], wavelengths: &[f64], viewing: &Viewing) -> crate::Result<Xyz> {
        self.converter.spectrum_to_xyz(spd, wavelengths, viewing)
    }

    fn adapt_xyz(
        &self,
        xyz: &Xyz,
        source: &WhitePoint,
        destination: &WhitePoint,
        method: AdaptationMethod,
    ) -> crate::Result<Xyz> {
        method.adapt(xyz, &source.xyz, &destination.xyz)
    }

    fn xyz_to_lab(&self, xyz: &Xyz, white: &WhitePoint) -> Lab {
        let fx = lab_f(xyz.x / white.xyz.x);
        let fy = lab_f(xyz.y / white.xyz.y);
        let fz = lab_f(xyz.z / white.xyz.z);
        Lab::new(116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz))
    }

    fn lab_to_xyz(&self, lab: &Lab, white: &WhitePoint) -> Xyz {
        let fy = (lab.l + 16.0) / 116.0;
        let fx = fy + lab.a / 500.0;
        let fz = fy - lab.b / 200.0;
        Xyz::new(
            white.xyz.x * lab_f_inv(fx),
            white.xyz.y * lab_f_inv(fy),
            white.xyz.z * lab_f_inv(fz),
        )
    }

    fn xyz_to_rgb(&self, xyz: &Xyz, out_255: bool) -> Rgb {
        let linear: LinSrgb<f64> = LinSrgb::from_color_unclamped(SrgbXyz::new(
            xyz.x / 100.0,
            xyz.y / 100.0,
            xyz.z / 100.0,
        ));
        let clamped: LinSrgb<f64> = LinSrgb::new(
            linear.red.clamp(0.0, 1.0),
            linear.green.clamp(0.0, 1.0),
            linear.blue.clamp(0.0, 1.0),
        );
        let encoded: Srgb<f64> = Srgb::from_linear(clamped);
        let (r, g, b) = encoded.into_components();
        if out_255 {
            Rgb::new((r * 255.0).round(), (g * 255.0).round(), (b * 255.0).round())
        } else {
            Rgb::new(r, g, b)
        }
    }

    fn rgb_to_xyz(&self, rgb: &Rgb, in_255: bool) -> Xyz {
        let scale = if in_255 { 255.0 } else { 1.0 };
        let encoded: Srgb<f64> = Srgb::new(rgb.r / scale, rgb.g / scale, rgb.b / scale);
        let linear: LinSrgb<f64> = encoded.into_linear();
        let xyz = SrgbXyz::from_color_unclamped(linear);
        Xyz::new(xyz.x * 100.0, xyz.y * 100.0, xyz.z * 100.0)
    }
}
