//! Snapshot of the host application's tracking camera and the conversions
//! between it and the solver-side [`PinholeModel`].

use crate::camera::{
    CameraIntrinsics, CameraModelError, DistortionCoefficients, DistortionModel, PinholeModel,
    Resolution,
};
use crate::optimization::CalibrationFlags;
use crate::warning::Warning;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;

/// Brown-Conrady coefficients as stored by the host. Only `k1..k3` take part
/// in solving; `k4` and the tangential terms are preserved untouched.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrownCoefficients {
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub k4: f64,
    pub p1: f64,
    pub p2: f64,
}

/// Per-image camera metadata as the host stores it.
///
/// The focal length lives in millimetres together with the sensor width, and
/// the principal point is in pixels measured from the bottom-left corner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingCamera {
    pub focal_length_mm: f64,
    pub sensor_width_mm: f64,
    /// Principal point in pixels, origin bottom-left.
    pub principal_point: [f64; 2],
    pub distortion_model: DistortionModel,
    pub polynomial: DistortionCoefficients,
    pub division: [f64; 2],
    pub nuke: [f64; 2],
    pub brown: BrownCoefficients,
}

impl Default for TrackingCamera {
    fn default() -> Self {
        Self {
            focal_length_mm: 50.0,
            sensor_width_mm: 36.0,
            principal_point: [0.0, 0.0],
            distortion_model: DistortionModel::Polynomial,
            polynomial: DistortionCoefficients::ZERO,
            division: [0.0, 0.0],
            nuke: [0.0, 0.0],
            brown: BrownCoefficients::default(),
        }
    }
}

impl TrackingCamera {
    /// Default camera for an image, with the principal point at its centre.
    pub fn for_image(resolution: &Resolution) -> Self {
        Self {
            principal_point: [resolution.width_f64() / 2.0, resolution.height_f64() / 2.0],
            ..Self::default()
        }
    }

    pub fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Focal length converted to pixels for an image of the given width.
    pub fn focal_length_pixels(&self, resolution: &Resolution) -> Result<f64, CameraModelError> {
        if !(self.sensor_width_mm.is_finite() && self.sensor_width_mm > 0.0) {
            return Err(CameraModelError::SensorWidthMustBePositive);
        }
        Ok(self.focal_length_mm * resolution.width_f64() / self.sensor_width_mm)
    }

    pub fn set_focal_length_pixels(&mut self, focal_length: f64, resolution: &Resolution) {
        self.focal_length_mm = focal_length * self.sensor_width_mm / resolution.width_f64();
    }

    /// Solver intrinsics: focal length in pixels and a top-origin principal point.
    pub fn intrinsics(&self, resolution: &Resolution) -> Result<CameraIntrinsics, CameraModelError> {
        CameraIntrinsics::new(
            self.focal_length_pixels(resolution)?,
            self.principal_point[0],
            resolution.height_f64() - self.principal_point[1],
            *resolution,
        )
    }

    /// Radial terms of the active distortion model.
    ///
    /// Models without radial terms give zero distortion and a
    /// [`Warning::UnsupportedDistortionModel`].
    pub fn distortion(&self) -> (DistortionCoefficients, Option<Warning>) {
        match self.distortion_model {
            DistortionModel::Polynomial => (self.polynomial, None),
            DistortionModel::Brown => (
                DistortionCoefficients::new(self.brown.k1, self.brown.k2, self.brown.k3),
                None,
            ),
            other => {
                let warning = Warning::UnsupportedDistortionModel {
                    model: other.to_string(),
                };
                warn!("{warning}");
                (DistortionCoefficients::ZERO, Some(warning))
            }
        }
    }

    /// The solver camera for this snapshot, plus any warning raised while
    /// reading the distortion.
    pub fn pinhole_model(
        &self,
        resolution: &Resolution,
    ) -> Result<(PinholeModel, Option<Warning>), CameraModelError> {
        let intrinsics = self.intrinsics(resolution)?;
        let (distortion, warning) = self.distortion();
        Ok((PinholeModel::new(intrinsics, distortion), warning))
    }

    /// Writes refined values back, touching only the fields selected in `flags`.
    ///
    /// Unflagged fields are left exactly as they are so that host values never
    /// pick up floating point noise from the round trip through pixels.
    pub fn apply_calibration(
        &mut self,
        refined: &PinholeModel,
        flags: &CalibrationFlags,
    ) -> Vec<Warning> {
        let resolution = refined.intrinsics.resolution;
        let mut warnings = Vec::new();

        if flags.refine_focal_length {
            self.set_focal_length_pixels(refined.intrinsics.focal_length, &resolution);
        }
        if flags.refine_principal_point {
            self.principal_point = [
                refined.intrinsics.cx,
                resolution.height_f64() - refined.intrinsics.cy,
            ];
        }

        if flags.refines_distortion() {
            let target = match self.distortion_model {
                DistortionModel::Polynomial => Some((
                    &mut self.polynomial.k1,
                    &mut self.polynomial.k2,
                    &mut self.polynomial.k3,
                )),
                DistortionModel::Brown => Some((
                    &mut self.brown.k1,
                    &mut self.brown.k2,
                    &mut self.brown.k3,
                )),
                _ => None,
            };

            match target {
                Some((k1, k2, k3)) => {
                    if flags.refine_k1 {
                        *k1 = refined.distortion.k1;
                    }
                    if flags.refine_k2 {
                        *k2 = refined.distortion.k2;
                    }
                    if flags.refine_k3 {
                        *k3 = refined.distortion.k3;
                    }
                }
                None => {
                    let warning = Warning::UnsupportedDistortionModel {
                        model: self.distortion_model.to_string(),
                    };
                    warn!("{warning}; refined distortion not written back");
                    warnings.push(warning);
                }
            }
        }

        warnings
    }
}
