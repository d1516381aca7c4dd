//! Radial lens distortion.
//!
//! Only the three radial terms of the Brown-Conrady model are ever estimated.
//! The tangential terms `p1`/`p2` exist in the five-term layout shared with
//! the usual calibration tools but are always zero here.

use nalgebra::{RealField, Vector2};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Distortion models known to the host camera.
///
/// Only [`DistortionModel::Polynomial`] and [`DistortionModel::Brown`] map onto
/// the radial `(k1, k2, k3)` triple; the other two are carried so that a host
/// snapshot survives a round trip, and they degrade to zero distortion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DistortionModel {
    #[default]
    Polynomial,
    Division,
    Nuke,
    Brown,
}

impl DistortionModel {
    /// Whether the model carries the radial `k1, k2, k3` terms.
    pub fn is_radial(&self) -> bool {
        matches!(self, DistortionModel::Polynomial | DistortionModel::Brown)
    }
}

impl fmt::Display for DistortionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DistortionModel::Polynomial => "POLYNOMIAL",
            DistortionModel::Division => "DIVISION",
            DistortionModel::Nuke => "NUKE",
            DistortionModel::Brown => "BROWN",
        };
        f.write_str(name)
    }
}

/// Radial distortion terms.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DistortionCoefficients {
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
}

impl DistortionCoefficients {
    pub const ZERO: DistortionCoefficients = DistortionCoefficients {
        k1: 0.0,
        k2: 0.0,
        k3: 0.0,
    };

    pub fn new(k1: f64, k2: f64, k3: f64) -> Self {
        Self { k1, k2, k3 }
    }

    /// The five-term layout `[k1, k2, p1, p2, k3]` with zero tangential terms.
    pub fn to_opencv(&self) -> [f64; 5] {
        [self.k1, self.k2, 0.0, 0.0, self.k3]
    }

    /// Reads the radial terms back out of a five-term vector. The tangential
    /// entries are ignored.
    pub fn from_opencv(coefficients: &[f64; 5]) -> Self {
        Self::new(coefficients[0], coefficients[1], coefficients[4])
    }

    pub fn is_zero(&self) -> bool {
        self.k1 == 0.0 && self.k2 == 0.0 && self.k3 == 0.0
    }

    pub fn is_finite(&self) -> bool {
        self.k1.is_finite() && self.k2.is_finite() && self.k3.is_finite()
    }

    /// `1 + k1 r^2 + k2 r^4 + k3 r^6`
    pub fn radial_factor(&self, r2: f64) -> f64 {
        1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3))
    }

    /// Applies distortion to a normalized image point.
    pub fn distort(&self, point: &Vector2<f64>) -> Vector2<f64> {
        point * self.radial_factor(point.norm_squared())
    }

    /// Removes distortion from a normalized image point with Newton iterations.
    ///
    /// Returns `None` when the iteration does not settle, which happens for
    /// points far outside the range where the polynomial is monotonic.
    pub fn undistort(&self, distorted: &Vector2<f64>) -> Option<Vector2<f64>> {
        if self.is_zero() {
            return Some(*distorted);
        }

        const EPS: f64 = 1e-12;
        const MAX_ITERATIONS: u32 = 50;

        let mut point = *distorted;
        for _ in 0..MAX_ITERATIONS {
            let (x, y) = (point.x, point.y);
            let r2 = x * x + y * y;
            let radial = self.radial_factor(r2);
            let error = point * radial - distorted;
            if error.norm() < EPS {
                return Some(point);
            }

            // d(radial)/d(r^2)
            let d_radial = self.k1 + r2 * (2.0 * self.k2 + 3.0 * self.k3 * r2);
            let j00 = radial + 2.0 * x * x * d_radial;
            let j01 = 2.0 * x * y * d_radial;
            let j11 = radial + 2.0 * y * y * d_radial;
            let det = j00 * j11 - j01 * j01;
            if det.abs() < 1e-15 {
                return None;
            }

            point.x -= (j11 * error.x - j01 * error.y) / det;
            point.y -= (j00 * error.y - j01 * error.x) / det;
        }

        let residual = point * self.radial_factor(point.norm_squared()) - distorted;
        (residual.norm() < 1e-8).then_some(point)
    }
}

/// Generic radial distortion used inside the solver residuals.
pub(crate) fn distort_generic<T: RealField>(x: T, y: T, k1: T, k2: T, k3: T) -> (T, T) {
    let r2 = x.clone() * x.clone() + y.clone() * y.clone();
    let radial = T::one() + r2.clone() * (k1 + r2.clone() * (k2 + r2 * k3));
    (x * radial.clone(), y * radial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_opencv_layout() {
        let d = DistortionCoefficients::new(-0.1, 0.02, 0.003);
        assert_eq!(d.to_opencv(), [-0.1, 0.02, 0.0, 0.0, 0.003]);
        assert_eq!(DistortionCoefficients::from_opencv(&d.to_opencv()), d);
    }

    #[test]
    fn test_undistort_inverts_distort() {
        let d = DistortionCoefficients::new(-0.12, 0.03, -0.004);
        for &(x, y) in &[(0.0, 0.0), (0.1, -0.2), (-0.35, 0.25), (0.4, 0.3)] {
            let p = Vector2::new(x, y);
            let distorted = d.distort(&p);
            let undistorted = d.undistort(&distorted).unwrap();
            assert_relative_eq!(undistorted, p, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_generic_matches_f64() {
        let d = DistortionCoefficients::new(0.05, -0.01, 0.002);
        let p = Vector2::new(0.3, -0.15);
        let expected = d.distort(&p);
        let (x, y) = distort_generic(p.x, p.y, d.k1, d.k2, d.k3);
        assert_relative_eq!(x, expected.x, epsilon = 1e-15);
        assert_relative_eq!(y, expected.y, epsilon = 1e-15);
    }

    #[test]
    fn test_radial_models() {
        assert!(DistortionModel::Polynomial.is_radial());
        assert!(DistortionModel::Brown.is_radial());
        assert!(!DistortionModel::Division.is_radial());
        assert!(!DistortionModel::Nuke.is_radial());
        assert_eq!(DistortionModel::Nuke.to_string(), "NUKE");
    }
}
