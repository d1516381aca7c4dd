//! The `optimization` module holds the pose and calibration solvers.
//!
//! Both solvers follow the same two-stage pattern, captured by the
//! [`Optimizer`] trait:
//! 1. A linear estimation step that gives initial poses (EPnP, P3P on small
//!    sets and a planar homography, all on undistorted observations).
//! 2. A non-linear Levenberg-Marquardt refinement with `tiny_solver`. The
//!    pose solver refines several starts and keeps the lowest final error.
//!
//! The pose solver refines only the six pose parameters. The calibration
//! solver additionally refines the subset of intrinsics selected by
//! [`CalibrationFlags`], with every other parameter fixed inside the
//! optimizer so that it is returned untouched.

use crate::camera::{CameraModelError, PinholeModel};
use crate::geometry::GeometryError;
use nalgebra::{Matrix2xX, Matrix3xX, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tiny_solver::optimizer::OptimizerOptions;

pub mod calibration;
pub mod factors;
pub mod pose;

pub use calibration::{calibrate, CalibrationOptimizationCost, CalibrationSolution};
pub use pose::{solve_pose, PoseOptimizationCost, PoseSolution};

#[derive(thiserror::Error, Debug)]
pub enum SolveError {
    #[error("not enough complete point matches: need at least {required}, got {actual}")]
    InsufficientPoints { required: usize, actual: usize },
    #[error("point count mismatch: {points_3d} 3D points but {points_2d} 2D points")]
    MismatchedPointCounts { points_3d: usize, points_2d: usize },
    #[error("no complete point matches: each match needs both a 2D and a 3D point")]
    NoCompleteCorrespondences,
    #[error("solver failed: {0}")]
    SolverDivergence(String),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
}

impl From<GeometryError> for SolveError {
    fn from(err: GeometryError) -> Self {
        SolveError::SolverDivergence(err.to_string())
    }
}

/// Which intrinsic parameters the calibration solver may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationFlags {
    pub refine_focal_length: bool,
    pub refine_principal_point: bool,
    pub refine_k1: bool,
    pub refine_k2: bool,
    pub refine_k3: bool,
}

impl Default for CalibrationFlags {
    fn default() -> Self {
        Self {
            refine_focal_length: true,
            refine_principal_point: false,
            refine_k1: false,
            refine_k2: false,
            refine_k3: false,
        }
    }
}

impl CalibrationFlags {
    pub fn all() -> Self {
        Self::from_bits(0b11111)
    }

    pub fn none() -> Self {
        Self::from_bits(0)
    }

    /// Flags from the low five bits, in field order starting at bit 0.
    pub fn from_bits(bits: u8) -> Self {
        Self {
            refine_focal_length: bits & 0b00001 != 0,
            refine_principal_point: bits & 0b00010 != 0,
            refine_k1: bits & 0b00100 != 0,
            refine_k2: bits & 0b01000 != 0,
            refine_k3: bits & 0b10000 != 0,
        }
    }

    pub fn refines_distortion(&self) -> bool {
        self.refine_k1 || self.refine_k2 || self.refine_k3
    }

    pub fn refines_anything(&self) -> bool {
        self.refine_focal_length || self.refine_principal_point || self.refines_distortion()
    }
}

/// Levenberg-Marquardt settings shared by both solvers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub max_iterations: usize,
    pub min_abs_error_decrease: f64,
    pub min_rel_error_decrease: f64,
    pub min_error: f64,
    /// Log per-stage progress at `info` level.
    pub verbose: bool,
    /// Pixel RMS above which a pose solved from exactly four points is not
    /// reported as converged.
    pub max_minimal_set_error: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            min_abs_error_decrease: 1e-12,
            min_rel_error_decrease: 1e-12,
            min_error: 1e-16,
            verbose: false,
            max_minimal_set_error: 2.0,
        }
    }
}

impl SolverOptions {
    pub fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn optimizer_options(&self) -> OptimizerOptions {
        OptimizerOptions {
            max_iteration: self.max_iterations,
            min_abs_error_decrease_threshold: self.min_abs_error_decrease,
            min_rel_error_decrease_threshold: self.min_rel_error_decrease,
            min_error_threshold: self.min_error,
            ..OptimizerOptions::default()
        }
    }
}

/// A trait for the two-stage solvers.
///
/// Implementors hold the camera model, the correspondences and the current
/// pose estimate; both methods update that state in place.
pub trait Optimizer {
    /// Computes an initial world-to-camera pose from a closed-form solver.
    ///
    /// # Errors
    ///
    /// Returns [`SolveError::SolverDivergence`] when no linear solver yields a
    /// usable pose (degenerate configuration or a singular system).
    fn linear_estimation(&mut self) -> Result<(), SolveError>;

    /// Refines the current estimate with Levenberg-Marquardt.
    ///
    /// # Arguments
    ///
    /// * `verbose` - If `true`, progress is logged at `info` level.
    fn optimize(&mut self, verbose: bool) -> Result<(), SolveError>;

    /// The camera model in its current state.
    fn get_model(&self) -> &PinholeModel;
}

/// Checks the correspondence arrays against a solver's minimum point count.
pub(crate) fn check_correspondences(
    points_3d: &Matrix3xX<f64>,
    points_2d: &Matrix2xX<f64>,
    required: usize,
) -> Result<(), SolveError> {
    if points_3d.ncols() != points_2d.ncols() {
        return Err(SolveError::MismatchedPointCounts {
            points_3d: points_3d.ncols(),
            points_2d: points_2d.ncols(),
        });
    }
    if points_3d.ncols() < required {
        return Err(SolveError::InsufficientPoints {
            required,
            actual: points_3d.ncols(),
        });
    }
    Ok(())
}

pub(crate) fn columns3(points: &Matrix3xX<f64>) -> Vec<Vector3<f64>> {
    points.column_iter().map(|c| c.into_owned()).collect()
}

pub(crate) fn columns2(points: &Matrix2xX<f64>) -> Vec<Vector2<f64>> {
    points.column_iter().map(|c| c.into_owned()).collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Synthetic scenes shared by the solver tests.

    use crate::camera::{CameraIntrinsics, DistortionCoefficients, PinholeModel, Resolution};
    use nalgebra::{Matrix2xX, Matrix3, Matrix3xX, Rotation3, Vector3};

    /// Routes solver logs to the test output; run with `RUST_LOG=debug`.
    pub fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    pub fn sample_camera() -> PinholeModel {
        PinholeModel::new(
            CameraIntrinsics::new(1200.0, 650.0, 470.0, Resolution::new(1280, 960)).unwrap(),
            DistortionCoefficients::new(-0.08, 0.02, 0.0),
        )
    }

    pub fn sample_pose() -> (Matrix3<f64>, Vector3<f64>) {
        (
            Rotation3::from_euler_angles(0.15, -0.25, 0.1).into_inner(),
            Vector3::new(0.3, -0.2, 8.0),
        )
    }

    /// A box-shaped cloud of points with spread in all three axes.
    pub fn sample_world_points(n: usize) -> Matrix3xX<f64> {
        Matrix3xX::from_fn(n, |row, i| {
            let t = i as f64;
            match row {
                0 => 2.0 * (0.7 * t).sin() + 0.1 * t - 0.1 * n as f64 / 2.0,
                1 => 1.6 * (1.3 * t + 0.4).cos(),
                _ => 1.5 * (0.5 * t + 1.0).sin(),
            }
        })
    }

    pub fn project_points(
        camera: &PinholeModel,
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
        points_3d: &Matrix3xX<f64>,
    ) -> Matrix2xX<f64> {
        let mut points_2d = Matrix2xX::zeros(points_3d.ncols());
        for (i, p) in points_3d.column_iter().enumerate() {
            let pixel = camera
                .project_world(rotation, translation, &p.into_owned())
                .unwrap();
            points_2d.set_column(i, &pixel);
        }
        points_2d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_bits_cover_all_combinations() {
        let mut seen = std::collections::HashSet::new();
        for bits in 0..32u8 {
            let flags = CalibrationFlags::from_bits(bits);
            assert!(seen.insert((
                flags.refine_focal_length,
                flags.refine_principal_point,
                flags.refine_k1,
                flags.refine_k2,
                flags.refine_k3
            )));
        }
        assert!(!CalibrationFlags::none().refines_anything());
        assert!(CalibrationFlags::all().refines_distortion());
        assert!(CalibrationFlags::default().refine_focal_length);
    }

    #[test]
    fn test_check_correspondences() {
        let p3 = Matrix3xX::<f64>::zeros(3);
        let p2 = Matrix2xX::<f64>::zeros(3);
        assert!(matches!(
            check_correspondences(&p3, &p2, 4),
            Err(SolveError::InsufficientPoints {
                required: 4,
                actual: 3
            })
        ));
        assert!(matches!(
            check_correspondences(&p3, &Matrix2xX::zeros(2), 1),
            Err(SolveError::MismatchedPointCounts {
                points_3d: 3,
                points_2d: 2
            })
        ));
        assert!(check_correspondences(&p3, &p2, 3).is_ok());
    }

    #[test]
    fn test_solver_options_from_yaml() {
        let options: SolverOptions = serde_yaml::from_str("max_iterations: 50\nverbose: true\n").unwrap();
        assert_eq!(options.max_iterations, 50);
        assert!(options.verbose);
        assert_eq!(options.min_error, SolverOptions::default().min_error);
        assert_eq!(options.max_minimal_set_error, 2.0);
        assert_eq!(options.optimizer_options().max_iteration, 50);
    }
}
