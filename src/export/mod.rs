//! JSON export of solved cameras.
//!
//! The document has a single `image_matches` array with one object per
//! image. In [`ExportMode::Native`] values stay in the host's Z-up frame and
//! the lens is given as a focal length; [`ExportMode::Converted`] targets
//! Y-up web engines and gives a vertical field of view in degrees instead.

use crate::coordinates::{position_to_yup, quaternion_native, quaternion_yup};
use crate::scene::{RenderSettings, SceneCamera};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum ExportError {
    #[error("cannot write export file {}: {source}", path.display())]
    ExportTargetUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{field} of image {image} is not a finite number")]
    NonFiniteValue { field: &'static str, image: String },
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportMode {
    #[default]
    Native,
    Converted,
}

/// A solved camera together with what the export needs besides it.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraRecord {
    pub camera: SceneCamera,
    /// Where the camera's central ray meets the model. Written as zeros when
    /// unknown.
    pub ground_intersection: Option<Vector3<f64>>,
    pub image_filename: String,
}

/// One exported camera. Field order is the order written to the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportCamera {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_focal_length: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_fov: Option<f64>,
    pub camera_quaternion: [f64; 4],
    pub camera_position: [f64; 3],
    pub camera_near: f64,
    pub camera_far: f64,
    pub centre_model_point: [f64; 3],
    pub image_filename: String,
}

impl ExportCamera {
    fn from_record(record: &CameraRecord, mode: ExportMode, render: &RenderSettings) -> Self {
        let camera = &record.camera;
        let quaternion = camera.transform.quaternion();
        let centre = record.ground_intersection.unwrap_or_else(Vector3::zeros);

        let (focal_length, fov, quaternion, position, centre) = match mode {
            ExportMode::Native => (
                Some(camera.lens_mm),
                None,
                quaternion_native(&quaternion),
                camera.transform.location,
                centre,
            ),
            ExportMode::Converted => (
                None,
                Some(camera.fov_degrees(render)),
                quaternion_yup(&quaternion),
                position_to_yup(&camera.transform.location),
                position_to_yup(&centre),
            ),
        };

        Self {
            camera_focal_length: focal_length,
            camera_fov: fov,
            camera_quaternion: quaternion,
            camera_position: position.into(),
            camera_near: camera.clip_start,
            camera_far: camera.clip_end,
            centre_model_point: centre.into(),
            image_filename: record.image_filename.clone(),
        }
    }

    fn check_finite(&self) -> Result<(), ExportError> {
        let image = &self.image_filename;
        if let Some(focal_length) = self.camera_focal_length {
            check_finite("camera_focal_length", &[focal_length], image)?;
        }
        if let Some(fov) = self.camera_fov {
            check_finite("camera_fov", &[fov], image)?;
        }
        check_finite("camera_quaternion", &self.camera_quaternion, image)?;
        check_finite("camera_position", &self.camera_position, image)?;
        check_finite("camera_near", &[self.camera_near], image)?;
        check_finite("camera_far", &[self.camera_far], image)?;
        check_finite("centre_model_point", &self.centre_model_point, image)
    }
}

fn check_finite(field: &'static str, values: &[f64], image: &str) -> Result<(), ExportError> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(ExportError::NonFiniteValue {
            field,
            image: image.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExportDocument {
    pub image_matches: Vec<ExportCamera>,
}

impl ExportDocument {
    /// Pretty JSON with four-space indentation.
    pub fn to_json(&self) -> Result<String, ExportError> {
        let mut buffer = Vec::new();
        self.write_to(&mut buffer)?;
        // serde_json only emits UTF-8.
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    fn write_to<W: Write>(&self, writer: W) -> Result<(), serde_json::Error> {
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(writer, formatter);
        self.serialize(&mut serializer)
    }
}

/// Builds the export document for a set of solved cameras.
///
/// `render` is only used for the field of view in converted mode.
///
/// # Errors
///
/// [`ExportError::NonFiniteValue`] if any exported number is NaN or infinite.
pub fn serialize(
    cameras: &[CameraRecord],
    mode: ExportMode,
    render: &RenderSettings,
) -> Result<ExportDocument, ExportError> {
    let image_matches = cameras
        .iter()
        .map(|record| {
            let camera = ExportCamera::from_record(record, mode, render);
            camera.check_finite()?;
            Ok(camera)
        })
        .collect::<Result<Vec<_>, ExportError>>()?;

    Ok(ExportDocument { image_matches })
}

/// `path` with `.json` appended unless it already ends in `.json`.
pub fn json_path(path: &Path) -> PathBuf {
    if path.to_string_lossy().ends_with(".json") {
        path.to_path_buf()
    } else {
        let mut with_suffix = path.as_os_str().to_owned();
        with_suffix.push(".json");
        PathBuf::from(with_suffix)
    }
}

/// Writes the document and returns the path actually written.
///
/// The file is written in place; a failed write may leave a partial file.
pub fn write_json(document: &ExportDocument, path: &Path) -> Result<PathBuf, ExportError> {
    let path = json_path(path);
    let unwritable = |source| ExportError::ExportTargetUnwritable {
        path: path.clone(),
        source,
    };

    let file = File::create(&path).map_err(unwritable)?;
    let mut writer = BufWriter::new(file);
    document.write_to(&mut writer).map_err(|err| {
        if err.is_io() {
            unwritable(err.into())
        } else {
            ExportError::Serialization(err)
        }
    })?;
    writer.flush().map_err(unwritable)?;

    log::info!(
        "Exported {} image matches to {}",
        document.image_matches.len(),
        path.display()
    );
    Ok(path)
}

/// Reads a document written by [`write_json`].
pub fn read_json(path: &Path) -> Result<ExportDocument, ExportError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::CameraTransform;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn record(name: &str, location: Vector3<f64>) -> CameraRecord {
        let rotation = Rotation3::from_euler_angles(0.1, 0.2, -0.3).into_inner();
        CameraRecord {
            camera: SceneCamera {
                transform: CameraTransform::from_world_to_camera(&rotation, &location),
                lens_mm: 35.0,
                ..SceneCamera::default()
            },
            ground_intersection: Some(Vector3::new(1.0, 2.0, 0.0)),
            image_filename: name.to_string(),
        }
    }

    #[test]
    fn test_round_trip_two_cameras() {
        let dir = tempfile::tempdir().unwrap();
        let cameras = vec![
            record("front.jpg", Vector3::new(0.0, 0.0, 5.0)),
            record("side.jpg", Vector3::new(1.0, -2.0, 6.0)),
        ];
        let document =
            serialize(&cameras, ExportMode::Native, &RenderSettings::default()).unwrap();

        let written = write_json(&document, &dir.path().join("matches")).unwrap();
        assert_eq!(written, dir.path().join("matches.json"));

        let parsed = read_json(&written).unwrap();
        assert_eq!(parsed, document);
        assert_eq!(parsed.image_matches.len(), 2);
        assert_eq!(parsed.image_matches[1].image_filename, "side.jpg");
        assert_eq!(parsed.image_matches[0].camera_focal_length, Some(35.0));
        assert_eq!(parsed.image_matches[0].camera_fov, None);
    }

    #[test]
    fn test_json_suffix() {
        assert_eq!(json_path(Path::new("out")), PathBuf::from("out.json"));
        assert_eq!(json_path(Path::new("out.json")), PathBuf::from("out.json"));
        assert_eq!(json_path(Path::new("dir/out.txt")), PathBuf::from("dir/out.txt.json"));
    }

    #[test]
    fn test_field_order_and_indent() {
        let document = serialize(
            &[record("a.png", Vector3::new(0.0, 0.0, 3.0))],
            ExportMode::Converted,
            &RenderSettings::default(),
        )
        .unwrap();
        let json = document.to_json().unwrap();

        assert!(json.starts_with("{\n    \"image_matches\": [\n        {\n"));
        assert!(!json.contains("camera_focal_length"));
        let order = [
            "camera_fov",
            "camera_quaternion",
            "camera_position",
            "camera_near",
            "camera_far",
            "centre_model_point",
            "image_filename",
        ];
        let positions: Vec<usize> = order.iter().map(|k| json.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_converted_values() {
        let cameras = [record("a.png", Vector3::new(0.5, -1.0, 4.0))];
        let native = serialize(&cameras, ExportMode::Native, &RenderSettings::default()).unwrap();
        let converted =
            serialize(&cameras, ExportMode::Converted, &RenderSettings::default()).unwrap();

        let [x, y, z] = native.image_matches[0].camera_position;
        assert_eq!(converted.image_matches[0].camera_position, [x, z, -y]);
        assert_eq!(converted.image_matches[0].centre_model_point, [1.0, 0.0, -2.0]);
        assert_relative_eq!(
            converted.image_matches[0].camera_fov.unwrap(),
            cameras[0].camera.fov_degrees(&RenderSettings::default())
        );
    }

    #[test]
    fn test_missing_intersection_written_as_zeros() {
        let mut camera = record("a.png", Vector3::new(0.0, 0.0, 3.0));
        camera.ground_intersection = None;
        let document = serialize(&[camera], ExportMode::Native, &RenderSettings::default()).unwrap();
        assert_eq!(document.image_matches[0].centre_model_point, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut camera = record("bad.png", Vector3::new(0.0, 0.0, 3.0));
        camera.camera.transform.location.x = f64::NAN;
        let result = serialize(&[camera], ExportMode::Native, &RenderSettings::default());
        assert!(matches!(
            result,
            Err(ExportError::NonFiniteValue {
                field: "camera_position",
                ..
            })
        ));
    }

    #[test]
    fn test_unwritable_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing").join("out");
        let result = write_json(&ExportDocument::default(), &target);
        assert!(matches!(
            result,
            Err(ExportError::ExportTargetUnwritable { .. })
        ));
    }
}
