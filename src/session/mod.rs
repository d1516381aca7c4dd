//! The image-matching session: every matched image with its camera, point
//! matches and solve state, plus the settings shared between them.
//!
//! Images live in an ordered arena addressed by name. Solving and
//! calibrating always work on the active image.

use crate::camera::{CameraModelError, PinholeModel, Resolution, TrackingCamera};
use crate::export::{self, CameraRecord, ExportError, ExportMode};
use crate::geometry::TriangleMesh;
use crate::matches::{extract_correspondences, Correspondences, PointMatchList};
use crate::optimization::{
    calibrate, solve_pose, CalibrationFlags, CalibrationSolution, PoseSolution, SolveError,
    SolverOptions,
};
use crate::scene::{RenderSettings, SceneCamera};
use crate::util::{image_resolution, UtilError};
use crate::warning::Warning;
use log::{info, warn};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("Image of same name already loaded: {0}")]
    DuplicateImage(String),
    #[error("No image named {0}")]
    UnknownImage(String),
    #[error("No active image")]
    NoActiveImage,
    #[error("No 3D model selected")]
    MissingModel,
    #[error("Invalid image path: {0}")]
    InvalidImagePath(String),
    #[error(transparent)]
    Solve(#[from] SolveError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
    #[error(transparent)]
    Util(#[from] UtilError),
}

/// One matched image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMatch {
    /// File name, unique within the session.
    pub name: String,
    pub resolution: Resolution,
    pub tracking_camera: TrackingCamera,
    pub point_matches: PointMatchList,
    pub camera: SceneCamera,
    /// Whether `camera` holds a solved pose.
    pub solved: bool,
}

impl ImageMatch {
    pub fn new(name: impl Into<String>, resolution: Resolution) -> Self {
        Self {
            name: name.into(),
            resolution,
            tracking_camera: TrackingCamera::for_image(&resolution),
            point_matches: PointMatchList::new(),
            camera: SceneCamera::default(),
            solved: false,
        }
    }
}

/// Outcome of a pose solve on the active image.
#[derive(Debug, Clone)]
pub struct PoseReport {
    pub solution: PoseSolution,
    pub warnings: Vec<Warning>,
    /// The matches the solve ran on. Their warning is moved to `warnings`.
    pub correspondences: Correspondences,
    /// The fixed camera the pose was solved with.
    pub camera: PinholeModel,
}

/// Outcome of a calibration on the active image.
#[derive(Debug, Clone)]
pub struct CalibrationReport {
    pub solution: CalibrationSolution,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    pub image_matches: Vec<ImageMatch>,
    active: Option<usize>,
    pub flags: CalibrationFlags,
    pub options: SolverOptions,
    pub render: RenderSettings,
    /// Reference model, needed for export.
    pub model: Option<TriangleMesh>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an image file, reading its size from the file header. The new
    /// image becomes active.
    pub fn add_image<P: AsRef<Path>>(&mut self, path: P) -> Result<usize, SessionError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SessionError::InvalidImagePath(path.display().to_string()))?;
        if self.position(&name).is_some() {
            return Err(SessionError::DuplicateImage(name));
        }

        let resolution = image_resolution(path)?;
        self.add_image_with_resolution(name, resolution)
    }

    /// Adds an image by name and size without touching the filesystem.
    pub fn add_image_with_resolution(
        &mut self,
        name: impl Into<String>,
        resolution: Resolution,
    ) -> Result<usize, SessionError> {
        let name = name.into();
        if self.position(&name).is_some() {
            return Err(SessionError::DuplicateImage(name));
        }
        crate::camera::validation::validate_resolution(&resolution)?;

        info!(
            "Added image {name} ({}x{})",
            resolution.width, resolution.height
        );
        self.image_matches.push(ImageMatch::new(name, resolution));
        let index = self.image_matches.len() - 1;
        self.active = Some(index);
        Ok(index)
    }

    pub fn image(&self, name: &str) -> Option<&ImageMatch> {
        self.image_matches.iter().find(|m| m.name == name)
    }

    pub fn image_mut(&mut self, name: &str) -> Option<&mut ImageMatch> {
        self.image_matches.iter_mut().find(|m| m.name == name)
    }

    pub fn set_active(&mut self, name: &str) -> Result<(), SessionError> {
        let index = self
            .position(name)
            .ok_or_else(|| SessionError::UnknownImage(name.to_string()))?;
        self.active = Some(index);
        Ok(())
    }

    pub fn active_image(&self) -> Option<&ImageMatch> {
        self.active.and_then(|i| self.image_matches.get(i))
    }

    pub fn active_image_mut(&mut self) -> Option<&mut ImageMatch> {
        self.active.and_then(move |i| self.image_matches.get_mut(i))
    }

    /// Solves the active image's camera pose from its point matches.
    ///
    /// The scene camera is only moved when the solve converged; otherwise it
    /// keeps its previous state and the report carries the failure message.
    pub fn solve_active_pose(&mut self) -> Result<PoseReport, SessionError> {
        let options = self.options.clone();
        let render = self.render;
        let image = self.active_image_mut().ok_or(SessionError::NoActiveImage)?;

        let mut correspondences =
            extract_correspondences(image.point_matches.as_slice(), &image.resolution)?;
        let (camera, distortion_warning) = image.tracking_camera.pinhole_model(&image.resolution)?;
        let warnings: Vec<Warning> = correspondences
            .warning
            .take()
            .into_iter()
            .chain(distortion_warning)
            .collect();

        let solution = solve_pose(
            &correspondences.points_3d,
            &correspondences.points_2d,
            &camera,
            &options,
        )?;

        match solution.camera_transform() {
            Some(transform) => {
                image
                    .camera
                    .apply_pose(&transform, &image.tracking_camera, &image.resolution, &render);
                image.solved = true;
                info!("Solved pose of {}: {}", image.name, solution.message);
            }
            None => warn!("Pose of {} left unchanged: {}", image.name, solution.message),
        }

        Ok(PoseReport {
            solution,
            warnings,
            correspondences,
            camera,
        })
    }

    /// Refines the active image's tracking camera with the session flags.
    /// Only flagged fields are written back.
    pub fn calibrate_active(&mut self) -> Result<CalibrationReport, SessionError> {
        let options = self.options.clone();
        let flags = self.flags;
        let image = self.active_image_mut().ok_or(SessionError::NoActiveImage)?;

        let correspondences =
            extract_correspondences(image.point_matches.as_slice(), &image.resolution)?;
        let (guess, distortion_warning) = image.tracking_camera.pinhole_model(&image.resolution)?;

        let solution = calibrate(
            &correspondences.points_3d,
            &correspondences.points_2d,
            &guess,
            &flags,
            &options,
        )?;

        let write_back = image.tracking_camera.apply_calibration(&solution.model, &flags);
        info!("Calibrated {}: {}", image.name, solution.message);

        let warnings = correspondences
            .warning
            .into_iter()
            .chain(distortion_warning)
            .chain(write_back)
            .collect();
        Ok(CalibrationReport { solution, warnings })
    }

    /// Export records for every image, with centre points cast onto the model.
    pub fn camera_records(&self) -> Result<Vec<CameraRecord>, SessionError> {
        let model = self.model.as_ref().ok_or(SessionError::MissingModel)?;
        Ok(self
            .image_matches
            .iter()
            .map(|image| CameraRecord {
                camera: image.camera.clone(),
                ground_intersection: Some(model.centre_point(&image.camera.transform)),
                image_filename: image.name.clone(),
            })
            .collect())
    }

    /// Writes every image's camera to a JSON file and returns the path used.
    pub fn export(&self, path: &Path, mode: ExportMode) -> Result<PathBuf, SessionError> {
        let records = self.camera_records()?;
        let document = export::serialize(&records, mode, &self.render)?;
        Ok(export::write_json(&document, path)?)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.image_matches.iter().position(|m| m.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraModel, DistortionModel};
    use crate::geometry::CameraTransform;
    use crate::matches::PointMatch;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Rotation3, Vector2, Vector3};

    const WIDTH: u32 = 1280;
    const HEIGHT: u32 = 960;

    fn world_points() -> Vec<Vector3<f64>> {
        (0..10)
            .map(|i| {
                let t = i as f64;
                Vector3::new(
                    1.5 * (0.9 * t).sin(),
                    1.2 * (0.6 * t + 0.3).cos(),
                    0.8 * (1.7 * t).sin(),
                )
            })
            .collect()
    }

    /// A session with one image whose markers come from a known camera.
    fn solvable_session() -> (Session, Matrix3<f64>, Vector3<f64>) {
        let mut session = Session::new();
        session
            .add_image_with_resolution("photo.jpg", Resolution::new(WIDTH, HEIGHT))
            .unwrap();

        let rotation = Rotation3::from_euler_angles(2.9, 0.2, -0.4).into_inner();
        let translation = Vector3::new(0.2, -0.1, 9.0);

        let image = session.image_mut("photo.jpg").unwrap();
        let (camera, _) = image.tracking_camera.pinhole_model(&image.resolution).unwrap();
        let (w, h) = (WIDTH as f64, HEIGHT as f64);

        let matches = world_points()
            .into_iter()
            .map(|p| {
                let pixel = camera.project(&(rotation * p + translation)).unwrap();
                PointMatch::new(Vector2::new(pixel.x / w, (h - pixel.y) / h), p)
            })
            .collect();
        image.point_matches = PointMatchList::from_matches(matches);

        (session, rotation, translation)
    }

    #[test]
    fn test_duplicate_and_unknown_images() {
        let mut session = Session::new();
        session
            .add_image_with_resolution("a.jpg", Resolution::new(10, 10))
            .unwrap();
        assert!(matches!(
            session.add_image_with_resolution("a.jpg", Resolution::new(10, 10)),
            Err(SessionError::DuplicateImage(_))
        ));
        assert!(matches!(
            session.set_active("b.jpg"),
            Err(SessionError::UnknownImage(_))
        ));
        assert!(matches!(
            session.add_image_with_resolution("c.jpg", Resolution::new(0, 10)),
            Err(SessionError::Camera(_))
        ));
    }

    #[test]
    fn test_add_image_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.png");
        image::RgbImage::new(32, 24).save(&path).unwrap();

        let mut session = Session::new();
        session.add_image(&path).unwrap();
        let image = session.active_image().unwrap();
        assert_eq!(image.name, "shot.png");
        assert_eq!(image.resolution, Resolution::new(32, 24));
        assert_eq!(image.tracking_camera.principal_point, [16.0, 12.0]);
        assert!(matches!(
            session.add_image(&path),
            Err(SessionError::DuplicateImage(_))
        ));
    }

    #[test]
    fn test_solve_active_pose_moves_camera() {
        let (mut session, rotation, translation) = solvable_session();
        let report = session.solve_active_pose().unwrap();

        assert!(report.solution.converged);
        assert!(report.warnings.is_empty());
        assert_eq!(report.correspondences.len(), report.solution.reprojected_points.ncols());
        assert!(report.correspondences.warning.is_none());

        let image = session.active_image().unwrap();
        assert!(image.solved);
        let expected = CameraTransform::from_world_to_camera(&rotation, &translation);
        assert_relative_eq!(image.camera.transform.location, expected.location, epsilon = 1e-6);
        assert_relative_eq!(image.camera.transform.rotation, expected.rotation, epsilon = 1e-6);
        assert_eq!(image.camera.lens_mm, image.tracking_camera.focal_length_mm);
    }

    #[test]
    fn test_failed_pose_leaves_camera() {
        let mut session = Session::new();
        session
            .add_image_with_resolution("flat.jpg", Resolution::new(WIDTH, HEIGHT))
            .unwrap();
        let image = session.active_image_mut().unwrap();
        image.point_matches = PointMatchList::from_matches(
            (0..5)
                .map(|i| {
                    PointMatch::new(
                        Vector2::new(0.1 + 0.1 * i as f64, 0.5),
                        Vector3::new(i as f64, 0.0, 0.0),
                    )
                })
                .collect(),
        );
        let before = image.camera.clone();

        let report = session.solve_active_pose().unwrap();
        assert!(!report.solution.converged);
        let image = session.active_image().unwrap();
        assert_eq!(image.camera, before);
        assert!(!image.solved);
    }

    #[test]
    fn test_solve_reports_incomplete_and_too_few() {
        let (mut session, _, _) = solvable_session();
        let image = session.active_image_mut().unwrap();
        image.point_matches.add_point_3d(Vector3::new(5.0, 5.0, 5.0));
        image.point_matches.add_point_3d(Vector3::new(6.0, 5.0, 5.0));
        let report = session.solve_active_pose().unwrap();
        assert_eq!(
            report.warnings,
            vec![Warning::IncompleteCorrespondences { skipped: 2 }]
        );

        let image = session.active_image_mut().unwrap();
        let few: Vec<PointMatch> = image.point_matches.iter().take(3).copied().collect();
        image.point_matches = PointMatchList::from_matches(few);
        assert!(matches!(
            session.solve_active_pose(),
            Err(SessionError::Solve(SolveError::InsufficientPoints {
                required: 4,
                actual: 3
            }))
        ));
    }

    #[test]
    fn test_calibrate_active_writes_flagged_fields() {
        let (mut session, _, _) = solvable_session();
        let image = session.active_image_mut().unwrap();
        let truth_focal = image.tracking_camera.focal_length_mm;
        image.tracking_camera.focal_length_mm = truth_focal * 1.05;
        image.tracking_camera.distortion_model = DistortionModel::Nuke;
        let principal_point = image.tracking_camera.principal_point;

        session.flags = CalibrationFlags {
            refine_focal_length: true,
            refine_k1: true,
            ..CalibrationFlags::none()
        };
        let report = session.calibrate_active().unwrap();

        let image = session.active_image().unwrap();
        assert_relative_eq!(image.tracking_camera.focal_length_mm, truth_focal, epsilon = 1e-4);
        assert_eq!(image.tracking_camera.principal_point, principal_point);
        assert!(report
            .warnings
            .iter()
            .all(|w| matches!(w, Warning::UnsupportedDistortionModel { .. })));
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn test_export_requires_model() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, _, _) = solvable_session();
        session.solve_active_pose().unwrap();

        assert!(matches!(
            session.export(&dir.path().join("out"), ExportMode::Native),
            Err(SessionError::MissingModel)
        ));

        session.model = Some(TriangleMesh::new(
            vec![
                Vector3::new(-10.0, -10.0, 0.0),
                Vector3::new(10.0, -10.0, 0.0),
                Vector3::new(0.0, 10.0, 0.0),
            ],
            vec![[0, 1, 2]],
        ));
        let written = session
            .export(&dir.path().join("out"), ExportMode::Converted)
            .unwrap();
        assert_eq!(written, dir.path().join("out.json"));

        let document = export::read_json(&written).unwrap();
        assert_eq!(document.image_matches.len(), 1);
        assert_eq!(document.image_matches[0].image_filename, "photo.jpg");
        assert!(document.image_matches[0].camera_fov.is_some());
    }
}
