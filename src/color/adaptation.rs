//! Von Kries style chromatic adaptation in a choice of cone-response bases.

use std::str::FromStr;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use super::Xyz;

#[rustfmt::skip]
fn bradford() -> Matrix3<f64> {
    Matrix3::new(
        0.8951, 0.2664, -0.1614,
        -0.7502, 1.7135, 0.0367,
        0.0389, -0.0685, 1.0296,
    )
}

#[rustfmt::skip]
fn cat02() -> Matrix3<f64> {
    Matrix3::new(
        0.7328, 0.4296, -0.1624,
        -0.7036, 1.6975, 0.0061,
        0.0030, 0.0136, 0.9834,
    )
}

#[rustfmt::skip]
fn von_kries() -> Matrix3<f64> {
    Matrix3::new(
        0.4002, 0.7075, -0.0807,
        -0.2280, 1.1500, 0.0612,
        0.0, 0.0, 0.9184,
    )
}

fn vector(xyz: &Xyz) -> Vector3<f64> {
    Vector3::new(xyz.x, xyz.y, xyz.z)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdaptationMethod {
    #[default]
    Bradford,
    Cat02,
    VonKries,
}

impl AdaptationMethod {
    pub const ALL: [AdaptationMethod; 3] = [
        AdaptationMethod::Bradford,
        AdaptationMethod::Cat02,
        AdaptationMethod::VonKries,
    ];

    pub fn cone_matrix(&self) -> Matrix3<f64> {
        match self {
            AdaptationMethod::Bradford => bradford(),
            AdaptationMethod::Cat02 => cat02(),
            AdaptationMethod::VonKries => von_kries(),
        }
    }

    /// `M⁻¹ · diag(dst / src) · M` in this method's cone space.
    pub fn matrix(&self, source: &Xyz, destination: &Xyz) -> Result<Matrix3<f64>, crate::Error> {
        let cone = self.cone_matrix();
        let inverse = cone.try_inverse().ok_or_else(|| {
            crate::Error::ReferenceData(format!("{self:?} cone matrix is singular"))
        })?;
        let src = cone * vector(source);
        let dst = cone * vector(destination);
        if src.iter().any(|c| c.abs() < f64::EPSILON) {
            return Err(crate::Error::UnknownWhitePoint(format!(
                "source white {source} has a zero cone response"
            )));
        }
        let scale = Matrix3::from_diagonal(&dst.component_div(&src));
        Ok(inverse * scale * cone)
    }

    pub fn adapt(&self, xyz: &Xyz, source: &Xyz, destination: &Xyz) -> Result<Xyz, crate::Error> {
        if source == destination {
            return Ok(*xyz);
        }
        let adapted = self.matrix(source, destination)? * vector(xyz);
        Ok(Xyz::new(adapted.x, adapted.y, adapted.z))
    }
}

impl FromStr for AdaptationMethod {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "bradford" => Ok(AdaptationMethod::Bradford),
            "cat02" => Ok(AdaptationMethod::Cat02),
            "vonkries" | "kries" => Ok(AdaptationMethod::VonKries),
            _ => Err(crate::Error::UnknownAdaptation(s.to_string())),
        }
    }
}

impl core::fmt::Display for AdaptationMethod {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AdaptationMethod::Bradford => write!(f, "bradford"),
            AdaptationMethod::Cat02 => write!(f, "cat02"),
            AdaptationMethod::VonKries => write!(f, "vonkries"),
        }
    }
}
