//! Host scene state that a solve is applied to: the per-image scene camera
//! and the render settings it is viewed through.

use crate::camera::{Resolution, TrackingCamera};
use crate::coordinates;
use crate::geometry::CameraTransform;
use serde::{Deserialize, Serialize};

/// Which sensor dimension the lens angle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensorFit {
    /// The larger render dimension.
    #[default]
    Auto,
    Horizontal,
    Vertical,
}

/// Output resolution of the host scene.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub resolution_x: u32,
    pub resolution_y: u32,
    pub pixel_aspect_x: f64,
    pub pixel_aspect_y: f64,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            resolution_x: 1920,
            resolution_y: 1080,
            pixel_aspect_x: 1.0,
            pixel_aspect_y: 1.0,
        }
    }
}

impl RenderSettings {
    /// Render settings matching an image one to one.
    pub fn for_image(resolution: &Resolution) -> Self {
        Self {
            resolution_x: resolution.width,
            resolution_y: resolution.height,
            ..Self::default()
        }
    }

    /// Width including the pixel aspect.
    pub fn width(&self) -> f64 {
        self.pixel_aspect_x * self.resolution_x as f64
    }

    pub fn height(&self) -> f64 {
        self.pixel_aspect_y * self.resolution_y as f64
    }

    pub fn aspect(&self) -> f64 {
        self.width() / self.height()
    }
}

/// The perspective camera created for each matched image.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneCamera {
    pub transform: CameraTransform,
    pub lens_mm: f64,
    pub sensor_width: f64,
    pub sensor_height: f64,
    pub sensor_fit: SensorFit,
    pub shift_x: f64,
    pub shift_y: f64,
    pub clip_start: f64,
    pub clip_end: f64,
}

impl Default for SceneCamera {
    fn default() -> Self {
        Self {
            transform: CameraTransform::identity(),
            lens_mm: 50.0,
            sensor_width: 36.0,
            sensor_height: 24.0,
            sensor_fit: SensorFit::Auto,
            shift_x: 0.0,
            shift_y: 0.0,
            clip_start: 0.1,
            clip_end: 100.0,
        }
    }
}

impl SceneCamera {
    /// Places the camera at a solved pose and matches its lens to the
    /// tracking camera so the image lines up with the render.
    ///
    /// The sensor is fitted along the image axis that the render aspect
    /// allows, and the lens shift moves the optical centre onto the
    /// tracking camera's principal point.
    pub fn apply_pose(
        &mut self,
        transform: &CameraTransform,
        tracking: &TrackingCamera,
        image: &Resolution,
        render: &RenderSettings,
    ) {
        let (width, height) = (image.width_f64(), image.height_f64());

        self.transform = *transform;
        self.lens_mm = tracking.focal_length_mm;
        self.sensor_width = tracking.sensor_width_mm;
        self.sensor_height = tracking.sensor_width_mm * height / width;

        let horizontal = render.aspect() <= width / height;
        self.sensor_fit = if horizontal {
            SensorFit::Horizontal
        } else {
            SensorFit::Vertical
        };
        let reference = if horizontal { width } else { height };

        let [cx, cy] = tracking.principal_point;
        self.shift_x = (width * 0.5 - cx) / reference;
        self.shift_y = (height * 0.5 - cy) / reference;
    }

    /// Lens angle in radians along the sensor fit axis.
    pub fn angle(&self) -> f64 {
        let sensor = match self.sensor_fit {
            SensorFit::Vertical => self.sensor_height,
            SensorFit::Auto | SensorFit::Horizontal => self.sensor_width,
        };
        2.0 * (sensor / (2.0 * self.lens_mm)).atan()
    }

    /// Vertical field of view in degrees for Y-up consumers.
    pub fn fov_degrees(&self, render: &RenderSettings) -> f64 {
        coordinates::field_of_view(self.angle(), render.width(), render.height(), self.sensor_fit)
            .to_degrees()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Vector3};

    fn tracking(principal_point: [f64; 2]) -> TrackingCamera {
        TrackingCamera {
            focal_length_mm: 35.0,
            sensor_width_mm: 36.0,
            principal_point,
            ..TrackingCamera::default()
        }
    }

    #[test]
    fn test_apply_pose_centred() {
        let image = Resolution::new(1920, 1080);
        let transform = CameraTransform::from_world_to_camera(
            &Matrix3::identity(),
            &Vector3::new(0.0, 0.0, 4.0),
        );
        let mut camera = SceneCamera::default();
        camera.apply_pose(
            &transform,
            &tracking([960.0, 540.0]),
            &image,
            &RenderSettings::for_image(&image),
        );

        assert_eq!(camera.transform, transform);
        assert_eq!(camera.lens_mm, 35.0);
        assert_relative_eq!(camera.sensor_height, 20.25);
        assert_eq!(camera.sensor_fit, SensorFit::Horizontal);
        assert_eq!(camera.shift_x, 0.0);
        assert_eq!(camera.shift_y, 0.0);
    }

    #[test]
    fn test_apply_pose_shift_and_fit() {
        let image = Resolution::new(1920, 1080);
        let mut camera = SceneCamera::default();

        camera.apply_pose(
            &CameraTransform::identity(),
            &tracking([1000.0, 500.0]),
            &image,
            &RenderSettings::for_image(&image),
        );
        assert_relative_eq!(camera.shift_x, -40.0 / 1920.0);
        assert_relative_eq!(camera.shift_y, 40.0 / 1920.0);

        // A render wider than the image: fit vertically.
        let panorama = RenderSettings {
            resolution_x: 3840,
            resolution_y: 1080,
            ..RenderSettings::default()
        };
        camera.apply_pose(
            &CameraTransform::identity(),
            &tracking([1000.0, 500.0]),
            &image,
            &panorama,
        );
        assert_eq!(camera.sensor_fit, SensorFit::Vertical);
        assert_relative_eq!(camera.shift_x, -40.0 / 1080.0);
    }

    #[test]
    fn test_angle_and_fov() {
        let camera = SceneCamera {
            lens_mm: 18.0,
            sensor_width: 36.0,
            sensor_fit: SensorFit::Horizontal,
            ..SceneCamera::default()
        };
        assert_relative_eq!(camera.angle(), std::f64::consts::FRAC_PI_2, epsilon = 1e-12);

        let square = RenderSettings {
            resolution_x: 1000,
            resolution_y: 1000,
            ..RenderSettings::default()
        };
        assert_relative_eq!(camera.fov_degrees(&square), 90.0, epsilon = 1e-9);
    }
}
