//! Implements the pinhole camera with radial distortion.
//!
//! This is the camera every solver in the crate works with: a single focal
//! length in pixels, a principal point measured from the top-left corner and
//! the radial `k1, k2, k3` terms. It adheres to the [`CameraModel`] trait
//! defined in the parent `camera` module ([`crate::camera`]).

use crate::camera::{
    validation, CameraIntrinsics, CameraModel, CameraModelError, DistortionCoefficients,
    Resolution,
};
use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use yaml_rust::YamlLoader;

/// Identifier written to the `camera_model` field of the YAML layout.
const MODEL_NAME: &str = "pinhole_radial";

/// Pinhole camera with radial distortion.
///
/// # Examples
///
/// ```rust
/// use image_matcher::camera::{CameraIntrinsics, CameraModel, DistortionCoefficients, PinholeModel, Resolution};
/// use nalgebra::Vector3;
///
/// let intrinsics = CameraIntrinsics::new(800.0, 320.0, 240.0, Resolution::new(640, 480)).unwrap();
/// let model = PinholeModel::new(intrinsics, DistortionCoefficients::ZERO);
///
/// let pixel = model.project(&Vector3::new(0.0, 0.0, 2.0)).unwrap();
/// assert_eq!(pixel.x, 320.0);
/// assert_eq!(pixel.y, 240.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PinholeModel {
    pub intrinsics: CameraIntrinsics,
    pub distortion: DistortionCoefficients,
}

impl PinholeModel {
    /// Creates a model from intrinsics and distortion without validating them.
    ///
    /// # Arguments
    ///
    /// * `intrinsics` - Focal length, principal point and resolution, all in pixels.
    /// * `distortion` - Radial coefficients; use [`DistortionCoefficients::ZERO`]
    ///   for an ideal pinhole.
    ///
    /// Call [`CameraModel::validate_params`] before handing user input to a solver.
    pub fn new(intrinsics: CameraIntrinsics, distortion: DistortionCoefficients) -> Self {
        Self {
            intrinsics,
            distortion,
        }
    }

    /// Builds a model from a camera matrix and a five-term distortion vector.
    ///
    /// # Arguments
    ///
    /// * `k` - The 3x3 camera matrix. `fx` is used as the focal length.
    /// * `distortion` - `[k1, k2, p1, p2, k3]`. The tangential terms are dropped.
    /// * `resolution` - Image size in pixels.
    ///
    /// # Errors
    ///
    /// The errors of [`CameraModel::validate_params`].
    pub fn from_matrix(
        k: &Matrix3<f64>,
        distortion: &[f64; 5],
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        let model = Self::new(
            CameraIntrinsics::from_matrix(k, resolution)?,
            DistortionCoefficients::from_opencv(distortion),
        );
        model.validate_params()?;
        Ok(model)
    }

    /// Projects a world point through a world-to-camera pose.
    ///
    /// # Arguments
    ///
    /// * `rotation`, `translation` - World-to-camera pose in the solver frame
    ///   (x right, y down, looking down +z).
    /// * `point_world` - The point in world coordinates.
    ///
    /// # Return Value
    ///
    /// The distorted pixel, origin at the top-left corner.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: if the point is not in front of the camera.
    pub fn project_world(
        &self,
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
        point_world: &Vector3<f64>,
    ) -> Result<Vector2<f64>, CameraModelError> {
        self.project(&(rotation * point_world + translation))
    }

    /// Maps a pixel to undistorted normalized image coordinates, i.e. the
    /// `(x/z, y/z)` of the ray through that pixel.
    ///
    /// The radial model has no closed-form inverse, so the distorted
    /// normalized point is inverted with Newton iterations.
    ///
    /// # Arguments
    ///
    /// * `pixel` - Pixel coordinates, origin at the top-left corner.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::NumericalError`]: if the iteration does not converge,
    ///   e.g. for pixels outside the range where the distortion is invertible.
    pub fn undistort_pixel(&self, pixel: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let distorted = self.intrinsics.pixel_to_normalized(pixel);
        self.distortion.undistort(&distorted).ok_or_else(|| {
            CameraModelError::NumericalError(format!(
                "undistortion did not converge for pixel ({:.3}, {:.3})",
                pixel.x, pixel.y
            ))
        })
    }

    /// Whether a pixel lies inside the image.
    ///
    /// The lower edges are inclusive and the upper edges exclusive, so
    /// `(width, height)` itself is outside.
    pub fn contains(&self, pixel: &Vector2<f64>) -> bool {
        pixel.x >= 0.0
            && pixel.y >= 0.0
            && pixel.x < self.intrinsics.resolution.width_f64()
            && pixel.y < self.intrinsics.resolution.height_f64()
    }
}

impl CameraModel for PinholeModel {
    /// Projects a camera-frame point to pixels.
    ///
    /// `u = f * x' * (1 + k1 r^2 + k2 r^4 + k3 r^6) + cx` with `x' = X / Z`,
    /// and likewise for `v`. Projections outside the image are returned as is
    /// since reprojection diagnostics need them.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: if the point is not in front of the camera.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let normalized = Vector2::new(point_3d.x / point_3d.z, point_3d.y / point_3d.z);
        let distorted = self.distortion.distort(&normalized);
        Ok(self.intrinsics.normalized_to_pixel(&distorted))
    }

    /// Unprojects a pixel to a unit ray in the camera frame.
    ///
    /// # Arguments
    ///
    /// * `point_2d` - Pixel coordinates, origin at the top-left corner.
    ///
    /// # Return Value
    ///
    /// A unit `Vector3` with positive `z`.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::NumericalError`]: if the undistortion iteration does not converge.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let undistorted = self.undistort_pixel(point_2d)?;
        Ok(Vector3::new(undistorted.x, undistorted.y, 1.0).normalize())
    }

    /// Loads a model from the `cam0` YAML layout written by
    /// [`PinholeModel::save_to_yaml`].
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::IOError`]: If there's an issue reading the file.
    /// * [`CameraModelError::YamlError`]: If the YAML content is malformed.
    /// * [`CameraModelError::InvalidParams`]: If expected fields are missing or mistyped.
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)?;
        let doc = docs
            .first()
            .ok_or_else(|| CameraModelError::YamlError("empty YAML document".to_string()))?;

        let intrinsics_yaml = doc["cam0"]["intrinsics"].as_vec().ok_or_else(|| {
            CameraModelError::InvalidParams("YAML missing 'intrinsics' or not an array".to_string())
        })?;
        let distortion_yaml = doc["cam0"]["distortion"].as_vec().ok_or_else(|| {
            CameraModelError::InvalidParams("YAML missing 'distortion' or not an array".to_string())
        })?;
        let resolution_yaml = doc["cam0"]["resolution"].as_vec().ok_or_else(|| {
            CameraModelError::InvalidParams("YAML missing 'resolution' or not an array".to_string())
        })?;

        if intrinsics_yaml.len() != 3 || distortion_yaml.len() != 3 || resolution_yaml.len() != 2 {
            return Err(CameraModelError::InvalidParams(
                "expected 3 intrinsics, 3 distortion terms and 2 resolution entries".to_string(),
            ));
        }

        let float = |value: &yaml_rust::Yaml, name: &str| {
            value
                .as_f64()
                .or_else(|| value.as_i64().map(|v| v as f64))
                .ok_or_else(|| CameraModelError::InvalidParams(format!("Invalid {name}: not a float")))
        };
        let integer = |value: &yaml_rust::Yaml, name: &str| {
            value
                .as_i64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    CameraModelError::InvalidParams(format!("Invalid {name}: not an integer"))
                })
        };

        let resolution = Resolution {
            width: integer(&resolution_yaml[0], "width")?,
            height: integer(&resolution_yaml[1], "height")?,
        };
        let intrinsics = CameraIntrinsics {
            focal_length: float(&intrinsics_yaml[0], "focal_length")?,
            cx: float(&intrinsics_yaml[1], "cx")?,
            cy: float(&intrinsics_yaml[2], "cy")?,
            resolution,
        };
        let distortion = DistortionCoefficients {
            k1: float(&distortion_yaml[0], "k1")?,
            k2: float(&distortion_yaml[1], "k2")?,
            k3: float(&distortion_yaml[2], "k3")?,
        };

        let model = PinholeModel {
            intrinsics,
            distortion,
        };
        model.validate_params()?;

        Ok(model)
    }

    /// Saves the model in the `cam0` YAML layout.
    ///
    /// The layout stores `intrinsics: [f, cx, cy]`, `distortion: [k1, k2, k3]`
    /// and `resolution: [width, height]` under a `camera_model` tag.
    ///
    /// # Arguments
    ///
    /// * `path` - Destination file. An existing file is overwritten.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::IOError`]: if the file cannot be created or written.
    /// * [`CameraModelError::YamlError`]: if serialization fails.
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        let key = |name: &str| serde_yaml::Value::String(name.to_string());

        let camera = serde_yaml::Mapping::from_iter([
            (key("camera_model"), key(MODEL_NAME)),
            (
                key("intrinsics"),
                serde_yaml::to_value(vec![
                    self.intrinsics.focal_length,
                    self.intrinsics.cx,
                    self.intrinsics.cy,
                ])?,
            ),
            (
                key("distortion"),
                serde_yaml::to_value(vec![
                    self.distortion.k1,
                    self.distortion.k2,
                    self.distortion.k3,
                ])?,
            ),
            (
                key("resolution"),
                serde_yaml::to_value(vec![
                    self.intrinsics.resolution.width,
                    self.intrinsics.resolution.height,
                ])?,
            ),
        ]);
        let yaml = serde_yaml::Mapping::from_iter([(key("cam0"), serde_yaml::Value::Mapping(camera))]);

        let yaml_string = serde_yaml::to_string(&yaml)?;
        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;

        Ok(())
    }

    /// Checks the intrinsics and that every distortion term is finite.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::FocalLengthMustBePositive`]
    /// * [`CameraModelError::PrincipalPointMustBeFinite`]
    /// * [`CameraModelError::InvalidResolution`]: for a zero width or height.
    /// * [`CameraModelError::InvalidParams`]: for a non-finite distortion coefficient.
    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        if !self.distortion.is_finite() {
            return Err(CameraModelError::InvalidParams(
                "distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the image size the intrinsics refer to.
    fn get_resolution(&self) -> Resolution {
        self.intrinsics.resolution
    }

    /// Returns a copy of the intrinsics.
    fn get_intrinsics(&self) -> CameraIntrinsics {
        self.intrinsics
    }

    /// Returns the distortion in OpenCV order `[k1, k2, p1, p2, k3]` with
    /// zero tangential terms.
    fn get_distortion(&self) -> Vec<f64> {
        self.distortion.to_opencv().to_vec()
    }
}
