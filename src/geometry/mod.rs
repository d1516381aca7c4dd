//! Rigid transforms, rotation helpers and the linear pose initializers.
//!
//! Two camera frames meet in this crate. The solvers use the computer vision
//! frame (x right, y down, looking down +z). The host scene uses a camera that
//! looks down its local -z with y up. [`CameraTransform`] is the host-side
//! world transform of a camera and converts from the solver convention.

use nalgebra::{Matrix3, Matrix4, RealField, UnitQuaternion, Vector3};

pub mod epnp;
pub mod p3p;
pub mod planar;
pub mod raycast;

pub use raycast::TriangleMesh;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("need at least {required} points, got {actual}")]
    TooFewPoints { required: usize, actual: usize },
    #[error("degenerate point configuration: {0}")]
    DegenerateConfiguration(&'static str),
    #[error("singular value decomposition failed")]
    SvdFailed,
    #[error("linear solve produced a non-finite pose")]
    NonFinite,
}

/// Basis change between the solver camera frame and the host camera frame.
pub fn cv_to_host_basis() -> Matrix3<f64> {
    Matrix3::from_diagonal(&Vector3::new(1.0, -1.0, -1.0))
}

/// World transform of a camera in the host convention (camera looks down its
/// local -z, y up). No scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraTransform {
    pub rotation: Matrix3<f64>,
    pub location: Vector3<f64>,
}

impl CameraTransform {
    /// A camera at the world origin with the host axes aligned to the world
    /// axes, so it looks down world -z.
    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            location: Vector3::zeros(),
        }
    }

    /// Converts a world-to-camera pose in the solver convention.
    ///
    /// `rot = R^T B` and `loc = -R^T t` with `B = diag(1, -1, -1)`.
    pub fn from_world_to_camera(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Self {
        let cv_to_world = rotation.transpose();
        Self {
            rotation: cv_to_world * cv_to_host_basis(),
            location: -(cv_to_world * translation),
        }
    }

    /// The inverse of [`CameraTransform::from_world_to_camera`].
    pub fn to_world_to_camera(&self) -> (Matrix3<f64>, Vector3<f64>) {
        let cv_to_world = self.rotation * cv_to_host_basis();
        let rotation = cv_to_world.transpose();
        let translation = -(rotation * self.location);
        (rotation, translation)
    }

    /// 4x4 world matrix `Translation(location) * rotation`.
    pub fn matrix_world(&self) -> Matrix4<f64> {
        let mut matrix = Matrix4::identity();
        matrix.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        matrix.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.location);
        matrix
    }

    /// Unit quaternion of the rotation part.
    pub fn quaternion(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_matrix(&self.rotation)
    }

    /// Direction the camera looks at in world space (its local -z axis).
    pub fn view_direction(&self) -> Vector3<f64> {
        -self.rotation.column(2).into_owned()
    }

    /// Whether every rotation and location entry is finite.
    ///
    /// Exported transforms must pass this check; a failed solve can leave
    /// `NaN` entries behind.
    pub fn is_finite(&self) -> bool {
        self.rotation.iter().all(|v| v.is_finite()) && self.location.iter().all(|v| v.is_finite())
    }
}

/// Skew-symmetric cross product matrix of `w`.
pub fn skew<T: RealField>(w: &Vector3<T>) -> Matrix3<T> {
    Matrix3::new(
        T::zero(),
        -w.z.clone(),
        w.y.clone(),
        w.z.clone(),
        T::zero(),
        -w.x.clone(),
        -w.y.clone(),
        w.x.clone(),
        T::zero(),
    )
}

/// Rodrigues' formula for a rotation vector.
///
/// Below a tiny angle the second order series is used instead, which keeps the
/// derivative at the origin exact when `T` is a dual number.
pub fn exp_so3<T: RealField>(w: &Vector3<T>) -> Matrix3<T> {
    let theta_squared = w.norm_squared();
    let k = skew(w);
    let k_squared = &k * &k;

    if theta_squared < nalgebra::convert::<f64, T>(1e-12) {
        Matrix3::identity() + k + k_squared * nalgebra::convert::<f64, T>(0.5)
    } else {
        let theta = theta_squared.clone().sqrt();
        let a = theta.clone().sin() / theta.clone();
        let b = (T::one() - theta.cos()) / theta_squared;
        Matrix3::identity() + k * a + k_squared * b
    }
}

/// Closest rotation to `m` in the Frobenius sense.
pub fn project_to_so3(m: &Matrix3<f64>) -> Result<Matrix3<f64>, GeometryError> {
    let svd = m.svd(true, true);
    let u = svd.u.ok_or(GeometryError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(GeometryError::SvdFailed)?;

    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let flip = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, -1.0));
        rotation = u * flip * v_t;
    }
    Ok(rotation)
}

/// Centroid and the covariance eigen decomposition of a point set, with the
/// eigenpairs sorted by decreasing eigenvalue.
pub(crate) fn principal_axes(points: &[Vector3<f64>]) -> (Vector3<f64>, [f64; 3], Matrix3<f64>) {
    let n = points.len().max(1) as f64;
    let centroid = points.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;

    let mut covariance = Matrix3::zeros();
    for p in points {
        let d = p - centroid;
        covariance += d * d.transpose();
    }
    covariance /= n;

    let eigen = covariance.symmetric_eigen();
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let values = order.map(|i| eigen.eigenvalues[i].max(0.0));
    let axes = Matrix3::from_columns(&order.map(|i| eigen.eigenvectors.column(i).into_owned()));
    (centroid, values, axes)
}

/// Kabsch alignment: the rigid transform taking `from` onto `to`.
pub(crate) fn align_point_sets(
    from: &[Vector3<f64>],
    to: &[Vector3<f64>],
) -> Result<(Matrix3<f64>, Vector3<f64>), GeometryError> {
    let n = from.len().min(to.len());
    if n < 3 {
        return Err(GeometryError::TooFewPoints {
            required: 3,
            actual: n,
        });
    }

    let centroid_from = from.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n as f64;
    let centroid_to = to.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n as f64;

    let mut h = Matrix3::zeros();
    for (a, b) in from.iter().zip(to.iter()) {
        h += (b - centroid_to) * (a - centroid_from).transpose();
    }

    let rotation = project_to_so3(&h)?;
    let translation = centroid_to - rotation * centroid_from;
    Ok((rotation, translation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    #[test]
    fn test_identity_pose_looks_down_world_z() {
        // A solver camera at the origin looking down +z becomes a host camera
        // whose local -z points along world +z.
        let transform = CameraTransform::from_world_to_camera(&Matrix3::identity(), &Vector3::zeros());
        assert_relative_eq!(transform.view_direction(), Vector3::new(0.0, 0.0, 1.0));
        assert_relative_eq!(transform.rotation, cv_to_host_basis());
    }

    #[test]
    fn test_world_transform_round_trip() {
        let rotation = Rotation3::from_euler_angles(0.3, -0.2, 1.1).into_inner();
        let translation = Vector3::new(0.5, -2.0, 7.0);

        let transform = CameraTransform::from_world_to_camera(&rotation, &translation);
        assert_relative_eq!(transform.rotation.determinant(), 1.0, epsilon = 1e-12);

        let (r, t) = transform.to_world_to_camera();
        assert_relative_eq!(r, rotation, epsilon = 1e-12);
        assert_relative_eq!(t, translation, epsilon = 1e-12);

        // The camera centre maps to the camera-frame origin.
        assert_relative_eq!(rotation * transform.location + translation, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_matrix_world_layout() {
        let transform = CameraTransform {
            rotation: Rotation3::from_euler_angles(0.1, 0.2, 0.3).into_inner(),
            location: Vector3::new(1.0, 2.0, 3.0),
        };
        let m = transform.matrix_world();
        assert_eq!(m[(0, 3)], 1.0);
        assert_eq!(m[(1, 3)], 2.0);
        assert_eq!(m[(2, 3)], 3.0);
        assert_eq!(m[(3, 3)], 1.0);
        assert_eq!(m[(3, 0)], 0.0);
        assert_relative_eq!(m.fixed_view::<3, 3>(0, 0).into_owned(), transform.rotation);
    }

    #[test]
    fn test_exp_so3_matches_nalgebra() {
        let w = Vector3::new(0.2, -0.5, 0.9);
        let expected = Rotation3::new(w).into_inner();
        assert_relative_eq!(exp_so3(&w), expected, epsilon = 1e-12);
        assert_relative_eq!(exp_so3(&Vector3::<f64>::zeros()), Matrix3::identity());
    }

    #[test]
    fn test_project_to_so3_fixes_reflection() {
        let reflection = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, -1.0));
        let rotation = project_to_so3(&reflection).unwrap();
        assert_relative_eq!(rotation.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_align_point_sets() {
        let rotation = Rotation3::from_euler_angles(-0.4, 0.25, 0.6).into_inner();
        let translation = Vector3::new(3.0, -1.0, 2.0);
        let from = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 2.0, 0.0),
            Vector3::new(0.0, 0.0, 3.0),
        ];
        let to: Vec<_> = from.iter().map(|p| rotation * p + translation).collect();

        let (r, t) = align_point_sets(&from, &to).unwrap();
        assert_relative_eq!(r, rotation, epsilon = 1e-10);
        assert_relative_eq!(t, translation, epsilon = 1e-10);
    }
}
