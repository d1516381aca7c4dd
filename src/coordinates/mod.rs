//! Conversions between the host's Z-up world and the Y-up convention of
//! web 3D engines, used when exporting solved cameras.
//!
//! All functions are pure. Positions convert exactly since they only permute
//! and negate components.

use crate::scene::SensorFit;
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use std::f64::consts::FRAC_1_SQRT_2;

/// `(x, y, z)` in Z-up to `(x, z, -y)` in Y-up.
pub fn position_to_yup(p: &Vector3<f64>) -> Vector3<f64> {
    Vector3::new(p.x, p.z, -p.y)
}

/// `(x, y, z)` in Y-up back to `(x, -z, y)` in Z-up.
pub fn position_from_yup(p: &Vector3<f64>) -> Vector3<f64> {
    Vector3::new(p.x, -p.z, p.y)
}

/// Rotation of -90 degrees about X, right-multiplied onto the camera
/// orientation before the axis swap, as glTF exporters do.
fn yup_correction() -> UnitQuaternion<f64> {
    UnitQuaternion::new_unchecked(Quaternion::new(FRAC_1_SQRT_2, -FRAC_1_SQRT_2, 0.0, 0.0))
}

/// Orientation as `[w, x, y, z]`, no correction.
pub fn quaternion_native(q: &UnitQuaternion<f64>) -> [f64; 4] {
    [q.w, q.i, q.j, q.k]
}

/// Orientation for Y-up consumers as `[x, y, z, w]`.
pub fn quaternion_yup(q: &UnitQuaternion<f64>) -> [f64; 4] {
    let corrected = q * yup_correction();
    [corrected.i, corrected.k, -corrected.j, corrected.w]
}

/// Vertical field of view in radians, as a Y-up perspective camera expects it.
///
/// `angle` is the host lens angle along the sensor fit axis; `width` and
/// `height` are the render size including pixel aspect.
pub fn field_of_view(angle: f64, width: f64, height: f64, fit: SensorFit) -> f64 {
    let aspect = width / height;
    let horizontal_angle = if width >= height {
        fit != SensorFit::Vertical
    } else {
        fit == SensorFit::Horizontal
    };

    if horizontal_angle {
        2.0 * ((angle * 0.5).tan() / aspect).atan()
    } else {
        angle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_position_round_trip_is_exact() {
        let points = [
            Vector3::new(1.25, -3.5, 7.0),
            Vector3::new(-0.1, 0.2, -0.3),
            Vector3::new(1e-300, -1e300, 0.0),
        ];
        for p in points {
            assert_eq!(position_to_yup(&position_from_yup(&p)), p);
            assert_eq!(position_from_yup(&position_to_yup(&p)), p);
        }
        assert_eq!(
            position_to_yup(&Vector3::new(1.0, 2.0, 3.0)),
            Vector3::new(1.0, 3.0, -2.0)
        );
    }

    #[test]
    fn test_quaternion_orders() {
        let q = UnitQuaternion::from_euler_angles(0.3, -0.2, 1.1);
        let native = quaternion_native(&q);
        assert_eq!(native, [q.w, q.i, q.j, q.k]);

        // A camera looking straight down in Z-up looks down -Y in Y-up.
        let yup = quaternion_yup(&UnitQuaternion::identity());
        assert_relative_eq!(yup[0], -FRAC_1_SQRT_2, epsilon = 1e-15);
        assert_relative_eq!(yup[1], 0.0, epsilon = 1e-15);
        assert_relative_eq!(yup[2], 0.0, epsilon = 1e-15);
        assert_relative_eq!(yup[3], FRAC_1_SQRT_2, epsilon = 1e-15);

        let norm: f64 = quaternion_yup(&q).iter().map(|v| v * v).sum();
        assert_relative_eq!(norm, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_yup_quaternion_matches_converted_view() {
        let q = UnitQuaternion::from_euler_angles(0.4, 0.1, -0.7);
        let host_view = q * Vector3::new(0.0, 0.0, -1.0);

        let [x, y, z, w] = quaternion_yup(&q);
        let yup = UnitQuaternion::new_normalize(Quaternion::new(w, x, y, z));
        let yup_view = yup * Vector3::new(0.0, 0.0, -1.0);

        assert_relative_eq!(yup_view, position_to_yup(&host_view), epsilon = 1e-12);
    }

    #[test]
    fn test_field_of_view() {
        let angle = FRAC_PI_2;
        // Landscape, auto fit: horizontal angle converted to vertical.
        let fov = field_of_view(angle, 1920.0, 1080.0, SensorFit::Auto);
        assert_relative_eq!(fov, 2.0 * (1080.0_f64 / 1920.0).atan(), epsilon = 1e-12);
        // Landscape, vertical fit: already vertical.
        assert_eq!(field_of_view(angle, 1920.0, 1080.0, SensorFit::Vertical), angle);
        // Portrait, auto fit: the angle is along the long (vertical) side.
        assert_eq!(field_of_view(angle, 1080.0, 1920.0, SensorFit::Auto), angle);
        // Portrait, horizontal fit.
        assert_relative_eq!(
            field_of_view(angle, 1080.0, 1920.0, SensorFit::Horizontal),
            2.0 * (1920.0_f64 / 1080.0).atan(),
            epsilon = 1e-12
        );
    }
}
