//! Image Matcher
//!
//! Recovers the pose and intrinsics of a photograph's camera from points
//! matched by hand between the image and a 3D reference model, then places a
//! matching camera in the host scene and exports it for web viewers.
//!
//! The crate is organised around the flow of a single solve:
//! - [`matches`] holds the per-image point matches and extracts complete
//!   correspondences in pixel coordinates.
//! - [`camera`] converts the host's tracking camera into a pinhole model
//!   with radial distortion, and back.
//! - [`optimization`] runs the pose (PnP) and calibration solvers, a linear
//!   initializer followed by Levenberg-Marquardt with `tiny-solver`.
//! - [`scene`] and [`coordinates`] apply a solved pose to the scene camera
//!   and convert it between Z-up and Y-up frames.
//! - [`export`] writes every camera to JSON.
//! - [`session`] ties the above together for a set of images.

pub mod camera;
pub mod coordinates;
pub mod export;
pub mod geometry;
pub mod matches;
pub mod optimization;
pub mod scene;
pub mod session;
pub mod util;
pub mod warning;

// Re-export commonly used types
pub use camera::{
    CameraIntrinsics, CameraModel, CameraModelError, PinholeModel, Resolution, TrackingCamera,
};

pub use optimization::{
    calibrate, solve_pose, CalibrationFlags, CalibrationSolution, Optimizer, PoseSolution,
    SolveError, SolverOptions,
};

pub use export::{ExportError, ExportMode};
pub use session::{Session, SessionError};
pub use warning::Warning;
