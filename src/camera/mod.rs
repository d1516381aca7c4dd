//! Camera intrinsics, radial distortion and the host camera snapshot.
//!
//! The solvers work with a [`PinholeModel`]: one focal length in pixels, a
//! principal point measured from the top-left corner of the image and three
//! radial distortion terms. The host application stores its cameras
//! differently (focal length in millimetres, principal point measured from the
//! bottom, several distortion models), which is what [`TrackingCamera`]
//! captures together with the conversions in both directions.

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod distortion;
pub mod pinhole;
pub mod tracking;

pub use distortion::{DistortionCoefficients, DistortionModel};
pub use pinhole::PinholeModel;
pub use tracking::{BrownCoefficients, TrackingCamera};

/// Image size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn width_f64(&self) -> f64 {
        f64::from(self.width)
    }

    pub fn height_f64(&self) -> f64 {
        f64::from(self.height)
    }

    /// Width divided by height.
    pub fn aspect(&self) -> f64 {
        self.width_f64() / self.height_f64()
    }
}

/// Pinhole intrinsics with a single focal length.
///
/// The principal point is expressed in pixels with the origin at the top-left
/// corner of the image and y pointing down, which is the convention used by
/// every solver in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    /// Focal length in pixels.
    pub focal_length: f64,
    pub cx: f64,
    pub cy: f64,
    pub resolution: Resolution,
}

impl CameraIntrinsics {
    /// Creates validated intrinsics.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::FocalLengthMustBePositive`]
    /// * [`CameraModelError::PrincipalPointMustBeFinite`]
    /// * [`CameraModelError::InvalidResolution`]
    pub fn new(
        focal_length: f64,
        cx: f64,
        cy: f64,
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        let intrinsics = Self {
            focal_length,
            cx,
            cy,
            resolution,
        };
        validation::validate_intrinsics(&intrinsics)?;
        Ok(intrinsics)
    }

    /// Builds intrinsics from a 3x3 camera matrix `[[f,0,cx],[0,f,cy],[0,0,1]]`.
    ///
    /// Only `K[0][0]` is read for the focal length since the aspect ratio is
    /// fixed to one everywhere in this crate.
    pub fn from_matrix(k: &Matrix3<f64>, resolution: Resolution) -> Result<Self, CameraModelError> {
        Self::new(k[(0, 0)], k[(0, 2)], k[(1, 2)], resolution)
    }

    /// The camera matrix `K`.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.focal_length,
            0.0,
            self.cx,
            0.0,
            self.focal_length,
            self.cy,
            0.0,
            0.0,
            1.0,
        )
    }

    /// Maps a pixel to normalized image coordinates (before undistortion).
    pub fn pixel_to_normalized(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            (pixel.x - self.cx) / self.focal_length,
            (pixel.y - self.cy) / self.focal_length,
        )
    }

    /// Maps normalized image coordinates to a pixel.
    pub fn normalized_to_pixel(&self, normalized: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            self.focal_length * normalized.x + self.cx,
            self.focal_length * normalized.y + self.cy,
        )
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Image resolution must be non-zero, got {width}x{height}")]
    InvalidResolution { width: u32, height: u32 },
    #[error("Sensor width must be positive")]
    SensorWidthMustBePositive,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Numerical error: {0}")]
    NumericalError(String),
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraModelError {
    fn from(err: std::io::Error) -> Self {
        CameraModelError::IOError(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for CameraModelError {
    fn from(err: yaml_rust::ScanError) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CameraModelError {
    fn from(err: serde_yaml::Error) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

/// Trait defining the core functionality for camera models
pub trait CameraModel {
    /// Project a point given in the camera frame (x right, y down, z forward)
    /// to pixel coordinates.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError>;

    /// Unproject pixel coordinates to a unit-length ray in the camera frame.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError>;

    /// Load camera parameters from a YAML file
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError>
    where
        Self: Sized;

    /// Save camera parameters to a YAML file
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraModelError>;

    fn get_resolution(&self) -> Resolution;

    fn get_intrinsics(&self) -> CameraIntrinsics;

    /// Distortion in the five-term `[k1, k2, p1, p2, k3]` layout.
    fn get_distortion(&self) -> Vec<f64>;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &CameraIntrinsics) -> Result<(), CameraModelError> {
        if !intrinsics.focal_length.is_finite() || intrinsics.focal_length <= 0.0 {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        validate_resolution(&intrinsics.resolution)
    }

    pub fn validate_resolution(resolution: &Resolution) -> Result<(), CameraModelError> {
        if resolution.width == 0 || resolution.height == 0 {
            return Err(CameraModelError::InvalidResolution {
                width: resolution.width,
                height: resolution.height,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_intrinsics() -> CameraIntrinsics {
        CameraIntrinsics::new(1000.0, 500.0, 400.0, Resolution::new(1000, 800)).unwrap()
    }

    #[test]
    fn test_matrix_round_trip() {
        let intrinsics = sample_intrinsics();
        let k = intrinsics.matrix();
        assert_eq!(k[(0, 0)], 1000.0);
        assert_eq!(k[(1, 1)], 1000.0);
        assert_eq!(k[(2, 2)], 1.0);
        assert_eq!(k[(0, 1)], 0.0);

        let back = CameraIntrinsics::from_matrix(&k, intrinsics.resolution).unwrap();
        assert_eq!(back, intrinsics);
    }

    #[test]
    fn test_pixel_normalized_mapping() {
        let intrinsics = sample_intrinsics();
        let pixel = Vector2::new(750.0, 150.0);
        let normalized = intrinsics.pixel_to_normalized(&pixel);
        assert_relative_eq!(normalized.x, 0.25);
        assert_relative_eq!(normalized.y, -0.25);
        let back = intrinsics.normalized_to_pixel(&normalized);
        assert_relative_eq!(back, pixel, epsilon = 1e-12);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let resolution = Resolution::new(640, 480);
        assert!(matches!(
            CameraIntrinsics::new(0.0, 320.0, 240.0, resolution),
            Err(CameraModelError::FocalLengthMustBePositive)
        ));
        assert!(matches!(
            CameraIntrinsics::new(f64::NAN, 320.0, 240.0, resolution),
            Err(CameraModelError::FocalLengthMustBePositive)
        ));
        assert!(matches!(
            CameraIntrinsics::new(500.0, f64::INFINITY, 240.0, resolution),
            Err(CameraModelError::PrincipalPointMustBeFinite)
        ));
        assert!(matches!(
            CameraIntrinsics::new(500.0, 320.0, 240.0, Resolution::new(0, 480)),
            Err(CameraModelError::InvalidResolution { .. })
        ));
    }
}
