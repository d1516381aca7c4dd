//! Single-view camera calibration.
//!
//! Starting from an intrinsics guess, the pose is first solved with the guess
//! held fixed, then the pose and the selected intrinsic groups are refined
//! together. Groups that are not selected never enter the optimizer: they are
//! constants of the residual, so their values come back bit for bit.

use crate::camera::{CameraModel, PinholeModel};
use crate::geometry::CameraTransform;
use crate::optimization::factors::{
    apply_pose_params, initial_pose_params, CalibrationReprojectionCost, IntrinsicBlock,
};
use crate::optimization::pose::PoseOptimizationCost;
use crate::optimization::{
    check_correspondences, CalibrationFlags, Optimizer, SolveError, SolverOptions,
};

use log::{info, warn};
use nalgebra::{Matrix2xX, Matrix3, Matrix3xX, Vector3};
use std::collections::HashMap;
use std::fmt;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Minimum number of correspondences for a calibration.
pub const MIN_CALIBRATION_POINTS: usize = 6;

/// Result of a calibration.
#[derive(Debug, Clone)]
pub struct CalibrationSolution {
    /// Refined camera. Groups not selected by the flags equal the guess.
    pub model: PinholeModel,
    /// Overall RMS reprojection error in pixels, `sqrt(sum |d|^2 / n)`.
    pub reprojection_error: f64,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub message: String,
}

impl CalibrationSolution {
    pub fn camera_transform(&self) -> CameraTransform {
        CameraTransform::from_world_to_camera(&self.rotation, &self.translation)
    }
}

impl CalibrationFlags {
    fn free_blocks(&self) -> Vec<IntrinsicBlock> {
        IntrinsicBlock::ALL
            .into_iter()
            .filter(|block| match block {
                IntrinsicBlock::FocalLength => self.refine_focal_length,
                IntrinsicBlock::PrincipalPoint => self.refine_principal_point,
                IntrinsicBlock::K1 => self.refine_k1,
                IntrinsicBlock::K2 => self.refine_k2,
                IntrinsicBlock::K3 => self.refine_k3,
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct CalibrationOptimizationCost {
    model: PinholeModel,
    flags: CalibrationFlags,
    points3d: Matrix3xX<f64>,
    points2d: Matrix2xX<f64>,
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
    options: SolverOptions,
}

impl CalibrationOptimizationCost {
    pub fn new(
        guess: PinholeModel,
        flags: CalibrationFlags,
        points3d: Matrix3xX<f64>,
        points2d: Matrix2xX<f64>,
        options: SolverOptions,
    ) -> Self {
        Self {
            model: guess,
            flags,
            points3d,
            points2d,
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
            options,
        }
    }

    pub fn pose(&self) -> (Matrix3<f64>, Vector3<f64>) {
        (self.rotation, self.translation)
    }

    /// RMS reprojection error over all points, `sqrt(sum |d|^2 / n)`.
    /// Points behind the camera make the error infinite.
    pub fn reprojection_error(&self) -> f64 {
        let n = self.points3d.ncols();
        if n == 0 {
            return f64::NAN;
        }
        let mut sum = 0.0;
        for (p3, p2) in self.points3d.column_iter().zip(self.points2d.column_iter()) {
            match self
                .model
                .project_world(&self.rotation, &self.translation, &p3.into_owned())
            {
                Ok(pixel) => sum += (pixel - p2).norm_squared(),
                Err(_) => return f64::INFINITY,
            }
        }
        (sum / n as f64).sqrt()
    }

    pub fn solution(&self) -> CalibrationSolution {
        let reprojection_error = self.reprojection_error();
        CalibrationSolution {
            model: self.model,
            reprojection_error,
            rotation: self.rotation,
            translation: self.translation,
            message: format!("Reprojection Error: {reprojection_error:.2}"),
        }
    }
}

impl fmt::Debug for CalibrationOptimizationCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CalibrationOptimizationCost Summary:\n model: {:?}\n flags: {:?}\n points3d size: {}, points2d size: {} ",
            self.model,
            self.flags,
            self.points3d.ncols(),
            self.points2d.ncols(),
        )
    }
}

impl Optimizer for CalibrationOptimizationCost {
    /// Solves the pose with the guess intrinsics held fixed.
    fn linear_estimation(&mut self) -> Result<(), SolveError> {
        let mut pose = PoseOptimizationCost::new(
            self.model,
            self.points3d.clone(),
            self.points2d.clone(),
            self.options.clone(),
        );
        pose.linear_estimation()?;
        if let Err(err) = pose.optimize(false) {
            warn!("{err}; calibration starts from the linear pose");
        }
        (self.rotation, self.translation) = pose.pose();
        Ok(())
    }

    fn optimize(&mut self, verbose: bool) -> Result<(), SolveError> {
        check_correspondences(&self.points3d, &self.points2d, 1)?;

        let free = self.flags.free_blocks();
        if verbose {
            info!(
                "Refining pose and {:?}",
                free.iter().map(|b| b.name()).collect::<Vec<_>>()
            );
            info!("Initial reprojection error: {:.6}", self.reprojection_error());
        }

        let cost = CalibrationReprojectionCost::new(
            self.model,
            free.clone(),
            self.rotation,
            &self.points3d,
            &self.points2d,
        );
        let block_names = cost.block_names();

        let mut problem = tiny_solver::Problem::new();
        problem.add_residual_block(
            self.points2d.ncols() * 2,
            &block_names,
            Box::new(cost),
            None,
        );

        let mut initial_values = HashMap::new();
        initial_values.insert(
            block_names[0].to_string(),
            initial_pose_params(&self.translation),
        );
        for block in &free {
            initial_values.insert(block.name().to_string(), block.values(&self.model));
        }

        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(
                &problem,
                &initial_values,
                Some(self.options.optimizer_options()),
            )
            .ok_or_else(|| SolveError::SolverDivergence("calibration failed".to_string()))?;

        let pose = result
            .get(block_names[0])
            .ok_or_else(|| SolveError::SolverDivergence("pose block missing".to_string()))?;
        let (rotation, translation) = apply_pose_params(pose, &self.rotation);

        let mut model = self.model;
        for block in &free {
            let values = result.get(block.name()).ok_or_else(|| {
                SolveError::SolverDivergence(format!("{} block missing", block.name()))
            })?;
            block.write(values, &mut model);
        }

        let finite = rotation.iter().chain(translation.iter()).all(|v| v.is_finite());
        if !finite || model.validate_params().is_err() {
            return Err(SolveError::SolverDivergence(
                "calibration produced an invalid camera".to_string(),
            ));
        }

        self.model = model;
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

/// Refines the intrinsics selected by `flags`, together with the pose.
///
/// With no flags set only the pose is solved and the guess comes back as is.
///
/// # Errors
///
/// * [`SolveError::MismatchedPointCounts`] if the arrays differ in length.
/// * [`SolveError::InsufficientPoints`] with fewer than [`MIN_CALIBRATION_POINTS`] points.
/// * [`SolveError::Camera`] if the guess is not a valid camera.
/// * [`SolveError::SolverDivergence`] if no pose can be found or the
///   refinement fails.
pub fn calibrate(
    points_3d: &Matrix3xX<f64>,
    points_2d: &Matrix2xX<f64>,
    guess: &PinholeModel,
    flags: &CalibrationFlags,
    options: &SolverOptions,
) -> Result<CalibrationSolution, SolveError> {
    check_correspondences(points_3d, points_2d, MIN_CALIBRATION_POINTS)?;
    guess.validate_params()?;

    let mut cost = CalibrationOptimizationCost::new(
        *guess,
        *flags,
        points_3d.clone(),
        points_2d.clone(),
        options.clone(),
    );
    cost.linear_estimation()?;
    if flags.refines_anything() {
        cost.optimize(options.verbose)?;
    }

    let solution = cost.solution();
    info!("{}", solution.message);
    Ok(solution)
}
