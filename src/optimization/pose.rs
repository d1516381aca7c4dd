//! Camera pose from 2D-3D correspondences with known intrinsics.
//!
//! The observations are undistorted to normalized coordinates and candidate
//! poses are taken from every EPnP beta approximation, from P3P on each point
//! triple of small sets and, for planar point sets, from a homography. The
//! best candidates are each refined with `tiny_solver` while the camera stays
//! fixed, and the refined pose with the lowest reprojection error wins.

use crate::camera::{CameraModel, PinholeModel};
use crate::geometry::epnp::LinearPose;
use crate::geometry::{epnp, p3p, planar, CameraTransform, GeometryError};
use crate::optimization::factors::{
    apply_pose_params, initial_pose_params, PoseReprojectionCost, POSE,
};
use crate::optimization::{
    check_correspondences, columns2, columns3, Optimizer, SolveError, SolverOptions,
};

use log::{debug, info, warn};
use nalgebra::{Matrix2xX, Matrix3, Matrix3xX, Vector2, Vector3};
use std::collections::HashMap;
use std::fmt;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Minimum number of correspondences for a pose solve.
pub const MIN_POSE_POINTS: usize = 4;

/// Message attached to a pose solve that produced no usable pose.
pub const POSE_FAILED_MESSAGE: &str = "solvePnP failed!";

/// Largest point count for which P3P candidates are added.
const P3P_MAX_POINTS: usize = 6;

/// At most this many linear candidates are refined.
const MAX_REFINED_STARTS: usize = 12;

/// Pixel RMS below which the remaining starts are skipped.
const EXACT_FIT_ERROR: f64 = 1e-9;

/// Result of a pose solve.
///
/// `rotation` and `translation` map world points into the solver camera frame
/// (x right, y down, looking down +z). Use [`PoseSolution::camera_transform`]
/// for the host-side world transform.
#[derive(Debug, Clone)]
pub struct PoseSolution {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    /// RMS reprojection error in pixels, per coordinate.
    pub reprojection_error: f64,
    pub converged: bool,
    /// Every 3D point reprojected through the solved pose, in pixels.
    pub reprojected_points: Matrix2xX<f64>,
    /// Operator-facing summary of the solve.
    pub message: String,
}

impl PoseSolution {
    fn failed(num_points: usize) -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
            reprojection_error: f64::NAN,
            converged: false,
            reprojected_points: Matrix2xX::from_element(num_points, f64::NAN),
            message: POSE_FAILED_MESSAGE.to_string(),
        }
    }

    /// Host world transform of the solved camera, if the solve converged.
    pub fn camera_transform(&self) -> Option<CameraTransform> {
        self.converged
            .then(|| CameraTransform::from_world_to_camera(&self.rotation, &self.translation))
    }
}

/// Two-stage pose solver state.
#[derive(Clone)]
pub struct PoseOptimizationCost {
    model: PinholeModel,
    points3d: Matrix3xX<f64>,
    points2d: Matrix2xX<f64>,
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
    /// Linear estimates, best first, waiting for refinement.
    candidates: Vec<LinearPose>,
    options: SolverOptions,
}

impl PoseOptimizationCost {
    /// Creates a solver with an identity initial pose.
    ///
    /// # Arguments
    ///
    /// * `model` - Camera with known intrinsics and distortion.
    /// * `points3d` - World points, one per column.
    /// * `points2d` - Pixel observations (top-left origin), one per column.
    pub fn new(
        model: PinholeModel,
        points3d: Matrix3xX<f64>,
        points2d: Matrix2xX<f64>,
        options: SolverOptions,
    ) -> Self {
        Self {
            model,
            points3d,
            points2d,
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
            candidates: Vec::new(),
            options,
        }
    }

    /// Current world-to-camera pose.
    pub fn pose(&self) -> (Matrix3<f64>, Vector3<f64>) {
        (self.rotation, self.translation)
    }

    /// Reprojects every point through the current pose. Points that end up
    /// behind the camera give `NaN`.
    pub fn reprojected_points(&self) -> Matrix2xX<f64> {
        self.reproject(&self.rotation, &self.translation)
    }

    /// Per-coordinate RMS reprojection error, `sqrt(sum |d|^2 / 2n)`.
    pub fn reprojection_error(&self) -> f64 {
        self.rms_error(&self.reprojected_points())
    }

    fn reproject(&self, rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix2xX<f64> {
        let mut projected = Matrix2xX::from_element(self.points3d.ncols(), f64::NAN);
        for (i, p) in self.points3d.column_iter().enumerate() {
            if let Ok(pixel) = self.model.project_world(rotation, translation, &p.into_owned()) {
                projected.set_column(i, &pixel);
            }
        }
        projected
    }

    fn rms_error(&self, projected: &Matrix2xX<f64>) -> f64 {
        let n = self.points2d.ncols();
        if n == 0 {
            return f64::NAN;
        }
        let sum: f64 = (projected - &self.points2d).norm_squared();
        (sum / (2 * n) as f64).sqrt()
    }

    /// Packages the current state as a [`PoseSolution`].
    ///
    /// A finite pose counts as converged whatever its error, except on a
    /// minimal set of [`MIN_POSE_POINTS`] points, where an error above
    /// [`SolverOptions::max_minimal_set_error`] marks the pose as ambiguous.
    pub fn solution(&self) -> PoseSolution {
        let finite = self.rotation.iter().chain(self.translation.iter()).all(|v| v.is_finite());
        if !finite {
            return PoseSolution::failed(self.points3d.ncols());
        }

        let reprojection_error = self.reprojection_error();
        let limit = self.options.max_minimal_set_error;
        let ambiguous = self.points3d.ncols() <= MIN_POSE_POINTS
            && (reprojection_error.is_nan() || reprojection_error > limit);
        let message = if ambiguous {
            format!(
                "{POSE_FAILED_MESSAGE} Reprojection Error: {reprojection_error:.2} exceeds {limit:.2} with only {} points",
                self.points3d.ncols()
            )
        } else {
            format!("Reprojection Error: {reprojection_error:.2}")
        };
        PoseSolution {
            rotation: self.rotation,
            translation: self.translation,
            reprojection_error,
            converged: !ambiguous,
            reprojected_points: self.reprojected_points(),
            message,
        }
    }

    /// Runs Levenberg-Marquardt from one start and returns the refined pose.
    fn refine_from(
        &self,
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
    ) -> Result<(Matrix3<f64>, Vector3<f64>), SolveError> {
        let mut problem = tiny_solver::Problem::new();
        let cost = PoseReprojectionCost::new(self.model, *rotation, &self.points3d, &self.points2d);
        problem.add_residual_block(self.points2d.ncols() * 2, &[POSE], Box::new(cost), None);

        let mut initial_values = HashMap::new();
        initial_values.insert(POSE.to_string(), initial_pose_params(translation));

        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(
                &problem,
                &initial_values,
                Some(self.options.optimizer_options()),
            )
            .ok_or_else(|| SolveError::SolverDivergence("pose refinement failed".to_string()))?;

        let pose = result
            .get(POSE)
            .ok_or_else(|| SolveError::SolverDivergence("pose block missing".to_string()))?;
        let (rotation, translation) = apply_pose_params(pose, rotation);
        if !rotation.iter().chain(translation.iter()).all(|v| v.is_finite()) {
            return Err(SolveError::SolverDivergence(
                "pose refinement produced non-finite values".to_string(),
            ));
        }
        Ok((rotation, translation))
    }

    fn normalized_observations(&self) -> Result<Vec<Vector2<f64>>, SolveError> {
        columns2(&self.points2d)
            .iter()
            .map(|p| self.model.undistort_pixel(p).map_err(SolveError::from))
            .collect()
    }
}

impl fmt::Debug for PoseOptimizationCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PoseOptimizationCost Summary:\n model: {:?}\n points3d size: {}, points2d size: {} ",
            self.model,
            self.points3d.ncols(),
            self.points2d.ncols(),
        )
    }
}

impl Optimizer for PoseOptimizationCost {
    /// Collects the EPnP, P3P and planar homography estimates.
    ///
    /// The candidates are kept best first for [`Optimizer::optimize`] and the
    /// current pose is set to the one with the lowest linear error.
    fn linear_estimation(&mut self) -> Result<(), SolveError> {
        let world = columns3(&self.points3d);
        let normalized = self.normalized_observations()?;

        let mut candidates = Vec::new();
        let mut last_error: Option<GeometryError> = None;

        match epnp::epnp_candidates(&world, &normalized) {
            Ok(poses) => candidates.extend(poses),
            Err(err) => last_error = Some(err),
        }
        if planar::is_planar(&world) {
            match planar::solve_planar(&world, &normalized) {
                Ok(pose) => candidates.push(pose),
                Err(err) => last_error = Some(err),
            }
        }
        if world.len() <= P3P_MAX_POINTS {
            candidates.extend(p3p::p3p_candidates(&world, &normalized));
        }

        candidates.sort_by(|a, b| a.error.total_cmp(&b.error));
        let candidates = distinct_poses(candidates);
        let best = candidates.first().ok_or_else(|| {
            SolveError::SolverDivergence(
                last_error.map_or_else(|| "no pose candidate".to_string(), |e| e.to_string()),
            )
        })?;

        debug!(
            "{} linear pose candidates, best normalized RMS {:.3e}",
            candidates.len(),
            best.error
        );
        self.rotation = best.rotation;
        self.translation = best.translation;
        self.candidates = candidates;
        Ok(())
    }

    /// Levenberg-Marquardt refinement of the six pose parameters.
    ///
    /// Right after [`Optimizer::linear_estimation`] every stored candidate is
    /// refined and the lowest final error wins; later calls refine the
    /// current pose only.
    fn optimize(&mut self, verbose: bool) -> Result<(), SolveError> {
        check_correspondences(&self.points3d, &self.points2d, 1)?;

        let starts: Vec<(Matrix3<f64>, Vector3<f64>)> = if self.candidates.is_empty() {
            vec![(self.rotation, self.translation)]
        } else {
            std::mem::take(&mut self.candidates)
                .into_iter()
                .take(MAX_REFINED_STARTS)
                .map(|c| (c.rotation, c.translation))
                .collect()
        };

        if verbose {
            info!("Starting pose refinement from {} start(s)...", starts.len());
            info!("Initial reprojection error: {:.6}", self.reprojection_error());
        }

        let mut best: Option<(Matrix3<f64>, Vector3<f64>, f64)> = None;
        let mut last_error = None;
        for (rotation, translation) in starts {
            let (rotation, translation) = match self.refine_from(&rotation, &translation) {
                Ok(pose) => pose,
                Err(err) => {
                    debug!("Skipping a pose start: {err}");
                    last_error = Some(err);
                    continue;
                }
            };
            let error = self.rms_error(&self.reproject(&rotation, &translation));
            let error = if error.is_nan() { f64::INFINITY } else { error };
            debug!("Refined start reprojection error {error:.3e}");
            if best.as_ref().map_or(true, |b| error < b.2) {
                best = Some((rotation, translation, error));
            }
            if error <= EXACT_FIT_ERROR {
                break;
            }
        }

        let (rotation, translation, _) = best.ok_or_else(|| {
            last_error.unwrap_or_else(|| SolveError::SolverDivergence("pose refinement failed".to_string()))
        })?;
        self.rotation = rotation;
        self.translation = translation;

        if verbose {
            info!("Final reprojection error: {:.6}", self.reprojection_error());
        }
        Ok(())
    }

    fn get_model(&self) -> &PinholeModel {
        &self.model
    }
}

/// Drops candidates that repeat an earlier pose, keeping the input order.
fn distinct_poses(candidates: Vec<LinearPose>) -> Vec<LinearPose> {
    let mut kept: Vec<LinearPose> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let repeated = kept.iter().any(|k| {
            (k.rotation - candidate.rotation).amax() < 1e-6
                && (k.translation - candidate.translation).amax()
                    < 1e-6 * (1.0 + candidate.translation.amax())
        });
        if !repeated {
            kept.push(candidate);
        }
    }
    kept
}

/// Solves for the camera pose.
///
/// A degenerate configuration is not an `Err`: the solution comes back with
/// `converged = false`, a `NaN` error and [`POSE_FAILED_MESSAGE`], and the
/// caller must leave its camera untouched. A four-point solve whose error
/// stays above [`SolverOptions::max_minimal_set_error`] is reported the same
/// way but keeps its pose and error for inspection. The input arrays are not
/// modified.
///
/// # Errors
///
/// * [`SolveError::MismatchedPointCounts`] if the arrays differ in length.
/// * [`SolveError::InsufficientPoints`] with fewer than [`MIN_POSE_POINTS`] points.
/// * [`SolveError::Camera`] if the camera parameters are invalid.
pub fn solve_pose(
    points_3d: &Matrix3xX<f64>,
    points_2d: &Matrix2xX<f64>,
    camera: &PinholeModel,
    options: &SolverOptions,
) -> Result<PoseSolution, SolveError> {
    check_correspondences(points_3d, points_2d, MIN_POSE_POINTS)?;
    camera.validate_params()?;

    let mut cost = PoseOptimizationCost::new(
        *camera,
        points_3d.clone(),
        points_2d.clone(),
        options.clone(),
    );

    if let Err(err) = cost.linear_estimation() {
        warn!("{POSE_FAILED_MESSAGE} {err}");
        return Ok(PoseSolution::failed(points_3d.ncols()));
    }
    if let Err(err) = cost.optimize(options.verbose) {
        warn!("{err}; keeping the linear pose estimate");
    }

    let solution = cost.solution();
    if solution.converged {
        info!("{}", solution.message);
    } else {
        warn!("{}", solution.message);
    }
    Ok(solution)
}
