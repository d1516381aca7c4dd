//! Reprojection residuals for `tiny_solver`.
//!
//! Every residual is generic over `T: RealField` so the solver can evaluate it
//! with dual numbers for automatic differentiation. Poses are parameterised as
//! `[w, t]`: a rotation vector `w` applied on the left of a fixed base
//! rotation (`R = exp(w) * R0`) and the translation `t`, both in the
//! world-to-camera direction.

use crate::camera::distortion::distort_generic;
use crate::camera::PinholeModel;
use crate::geometry::exp_so3;
use crate::optimization::{columns2, columns3};
use nalgebra::{DVector, Matrix2xX, Matrix3, Matrix3xX, RealField, Vector2, Vector3};
use tiny_solver::factors::Factor;

/// Name of the pose parameter block.
pub(crate) const POSE: &str = "pose";

fn constant<T: RealField>(value: f64) -> T {
    nalgebra::convert(value)
}

/// Intrinsics and distortion in the scalar type of the solver.
struct GenericCamera<T> {
    focal_length: T,
    cx: T,
    cy: T,
    k1: T,
    k2: T,
    k3: T,
}

impl<T: RealField> GenericCamera<T> {
    fn from_model(model: &PinholeModel) -> Self {
        Self {
            focal_length: constant(model.intrinsics.focal_length),
            cx: constant(model.intrinsics.cx),
            cy: constant(model.intrinsics.cy),
            k1: constant(model.distortion.k1),
            k2: constant(model.distortion.k2),
            k3: constant(model.distortion.k3),
        }
    }

    fn project(&self, point_camera: &Vector3<T>) -> (T, T) {
        // Keeps the residual finite if an iterate pushes a point behind the camera.
        let min_depth = constant::<T>(1e-9);
        let z = if point_camera.z > min_depth {
            point_camera.z.clone()
        } else {
            min_depth
        };
        let x = point_camera.x.clone() / z.clone();
        let y = point_camera.y.clone() / z;
        let (xd, yd) = distort_generic(x, y, self.k1.clone(), self.k2.clone(), self.k3.clone());
        (
            self.focal_length.clone() * xd + self.cx.clone(),
            self.focal_length.clone() * yd + self.cy.clone(),
        )
    }
}

/// Rotation and translation from a `[w, t]` pose block.
fn pose_from_params<T: RealField>(
    pose: &DVector<T>,
    base_rotation: &Matrix3<f64>,
) -> (Matrix3<T>, Vector3<T>) {
    let w = Vector3::new(pose[0].clone(), pose[1].clone(), pose[2].clone());
    let rotation = exp_so3(&w) * base_rotation.map(constant::<T>);
    let translation = Vector3::new(pose[3].clone(), pose[4].clone(), pose[5].clone());
    (rotation, translation)
}

/// Applies a solved `[w, t]` block to the base rotation.
pub(crate) fn apply_pose_params(
    pose: &DVector<f64>,
    base_rotation: &Matrix3<f64>,
) -> (Matrix3<f64>, Vector3<f64>) {
    pose_from_params(pose, base_rotation)
}

/// Initial `[w, t]` block: no rotation update on top of the base rotation.
pub(crate) fn initial_pose_params(translation: &Vector3<f64>) -> DVector<f64> {
    DVector::from_vec(vec![
        0.0,
        0.0,
        0.0,
        translation.x,
        translation.y,
        translation.z,
    ])
}

fn reprojection_residuals<T: RealField>(
    camera: &GenericCamera<T>,
    rotation: &Matrix3<T>,
    translation: &Vector3<T>,
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
) -> DVector<T> {
    let mut residuals = DVector::zeros(points2d.len() * 2);
    for (i, (p3d, p2d)) in points3d.iter().zip(points2d).enumerate() {
        let point_world = p3d.map(constant::<T>);
        let point_camera = rotation * point_world + translation;
        let (u, v) = camera.project(&point_camera);
        residuals[i * 2] = u - constant::<T>(p2d.x);
        residuals[i * 2 + 1] = v - constant::<T>(p2d.y);
    }
    residuals
}

fn to_columns(
    points3d: &Matrix3xX<f64>,
    points2d: &Matrix2xX<f64>,
) -> (Vec<Vector3<f64>>, Vec<Vector2<f64>>) {
    (columns3(points3d), columns2(points2d))
}

/// Reprojection error of all points for a pose, with the camera held constant.
#[derive(Debug, Clone)]
pub(crate) struct PoseReprojectionCost {
    camera: PinholeModel,
    base_rotation: Matrix3<f64>,
    points3d: Vec<Vector3<f64>>,
    points2d: Vec<Vector2<f64>>,
}

impl PoseReprojectionCost {
    pub fn new(
        camera: PinholeModel,
        base_rotation: Matrix3<f64>,
        points3d: &Matrix3xX<f64>,
        points2d: &Matrix2xX<f64>,
    ) -> Self {
        let (points3d, points2d) = to_columns(points3d, points2d);
        Self {
            camera,
            base_rotation,
            points3d,
            points2d,
        }
    }
}

impl<T: RealField> Factor<T> for PoseReprojectionCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let (rotation, translation) = pose_from_params(&params[0], &self.base_rotation);
        let camera = GenericCamera::from_model(&self.camera);
        reprojection_residuals(
            &camera,
            &rotation,
            &translation,
            &self.points3d,
            &self.points2d,
        )
    }
}

/// A group of intrinsic parameters that is either entirely free or entirely
/// held at its guess value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IntrinsicBlock {
    FocalLength,
    PrincipalPoint,
    K1,
    K2,
    K3,
}

impl IntrinsicBlock {
    pub const ALL: [IntrinsicBlock; 5] = [
        IntrinsicBlock::FocalLength,
        IntrinsicBlock::PrincipalPoint,
        IntrinsicBlock::K1,
        IntrinsicBlock::K2,
        IntrinsicBlock::K3,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            IntrinsicBlock::FocalLength => "focal_length",
            IntrinsicBlock::PrincipalPoint => "principal_point",
            IntrinsicBlock::K1 => "k1",
            IntrinsicBlock::K2 => "k2",
            IntrinsicBlock::K3 => "k3",
        }
    }

    /// Current values of this block in `model`.
    pub fn values(&self, model: &PinholeModel) -> DVector<f64> {
        match self {
            IntrinsicBlock::FocalLength => DVector::from_element(1, model.intrinsics.focal_length),
            IntrinsicBlock::PrincipalPoint => {
                DVector::from_vec(vec![model.intrinsics.cx, model.intrinsics.cy])
            }
            IntrinsicBlock::K1 => DVector::from_element(1, model.distortion.k1),
            IntrinsicBlock::K2 => DVector::from_element(1, model.distortion.k2),
            IntrinsicBlock::K3 => DVector::from_element(1, model.distortion.k3),
        }
    }

    /// Writes solved values of this block into `model`.
    pub fn write(&self, values: &DVector<f64>, model: &mut PinholeModel) {
        match self {
            IntrinsicBlock::FocalLength => model.intrinsics.focal_length = values[0],
            IntrinsicBlock::PrincipalPoint => {
                model.intrinsics.cx = values[0];
                model.intrinsics.cy = values[1];
            }
            IntrinsicBlock::K1 => model.distortion.k1 = values[0],
            IntrinsicBlock::K2 => model.distortion.k2 = values[0],
            IntrinsicBlock::K3 => model.distortion.k3 = values[0],
        }
    }

    fn assign<T: RealField>(&self, values: &DVector<T>, camera: &mut GenericCamera<T>) {
        match self {
            IntrinsicBlock::FocalLength => camera.focal_length = values[0].clone(),
            IntrinsicBlock::PrincipalPoint => {
                camera.cx = values[0].clone();
                camera.cy = values[1].clone();
            }
            IntrinsicBlock::K1 => camera.k1 = values[0].clone(),
            IntrinsicBlock::K2 => camera.k2 = values[0].clone(),
            IntrinsicBlock::K3 => camera.k3 = values[0].clone(),
        }
    }
}

/// Reprojection error for single-view calibration.
///
/// Parameters are the pose block followed by one block per entry of `free`,
/// in order. Intrinsic blocks not listed in `free` are read from `guess` as
/// constants, so the optimizer never sees them.
#[derive(Debug, Clone)]
pub(crate) struct CalibrationReprojectionCost {
    guess: PinholeModel,
    free: Vec<IntrinsicBlock>,
    base_rotation: Matrix3<f64>,
    points3d: Vec<Vector3<f64>>,
    points2d: Vec<Vector2<f64>>,
}

impl CalibrationReprojectionCost {
    pub fn new(
        guess: PinholeModel,
        free: Vec<IntrinsicBlock>,
        base_rotation: Matrix3<f64>,
        points3d: &Matrix3xX<f64>,
        points2d: &Matrix2xX<f64>,
    ) -> Self {
        let (points3d, points2d) = to_columns(points3d, points2d);
        Self {
            guess,
            free,
            base_rotation,
            points3d,
            points2d,
        }
    }

    /// Parameter block names in the order `residual_func` expects them.
    pub fn block_names(&self) -> Vec<&'static str> {
        std::iter::once(POSE)
            .chain(self.free.iter().map(|b| b.name()))
            .collect()
    }
}

impl<T: RealField> Factor<T> for CalibrationReprojectionCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let (rotation, translation) = pose_from_params(&params[0], &self.base_rotation);

        let mut camera = GenericCamera::from_model(&self.guess);
        for (block, values) in self.free.iter().zip(&params[1..]) {
            block.assign(values, &mut camera);
        }

        reprojection_residuals(
            &camera,
            &rotation,
            &translation,
            &self.points3d,
            &self.points2d,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::test_support::{
        project_points, sample_camera, sample_pose, sample_world_points,
    };
    use approx::assert_relative_eq;

    #[test]
    fn test_pose_residual_zero_at_truth() {
        let camera = sample_camera();
        let (rotation, translation) = sample_pose();
        let points_3d = sample_world_points(8);
        let points_2d = project_points(&camera, &rotation, &translation, &points_3d);

        let cost = PoseReprojectionCost::new(camera, rotation, &points_3d, &points_2d);
        let residuals: DVector<f64> = cost.residual_func(&[initial_pose_params(&translation)]);

        assert_eq!(residuals.len(), 16);
        assert!(residuals.amax() < 1e-9);
    }

    #[test]
    fn test_calibration_residual_uses_free_blocks() {
        let camera = sample_camera();
        let (rotation, translation) = sample_pose();
        let points_3d = sample_world_points(8);
        let points_2d = project_points(&camera, &rotation, &translation, &points_3d);

        let mut guess = camera;
        guess.intrinsics.focal_length = 1000.0;
        let cost = CalibrationReprojectionCost::new(
            guess,
            vec![IntrinsicBlock::FocalLength],
            rotation,
            &points_3d,
            &points_2d,
        );
        assert_eq!(cost.block_names(), vec!["pose", "focal_length"]);

        let pose = initial_pose_params(&translation);
        let at_guess: DVector<f64> =
            cost.residual_func(&[pose.clone(), DVector::from_element(1, 1000.0)]);
        let at_truth: DVector<f64> =
            cost.residual_func(&[pose, DVector::from_element(1, 1200.0)]);
        assert!(at_guess.amax() > 1.0);
        assert!(at_truth.amax() < 1e-9);
    }

    #[test]
    fn test_block_values_round_trip() {
        let camera = sample_camera();
        let mut copy = camera;
        copy.intrinsics.cx = 0.0;
        copy.distortion.k1 = 0.0;
        for block in IntrinsicBlock::ALL {
            block.write(&block.values(&camera), &mut copy);
        }
        assert_eq!(copy, camera);
    }

    #[test]
    fn test_apply_pose_params() {
        let (rotation, translation) = sample_pose();
        let (r, t) = apply_pose_params(&initial_pose_params(&translation), &rotation);
        assert_relative_eq!(r, rotation, epsilon = 1e-15);
        assert_eq!(t, translation);
    }
}
