//! Helpers around the solvers: reprojection statistics, image metadata,
//! CSV correspondence files and reprojection overlays.
//!
//! Nothing here feeds back into a solve. The functions read or write files
//! for the command line front end and report how well a pose fits.

use crate::camera::{CameraModel, Resolution};
use crate::matches::{PointMatch, PointMatchList};
use image::{Rgb, RgbImage};
use nalgebra::{Matrix2xX, Matrix3, Matrix3xX, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("Zero projection points")]
    ZeroProjectionPoints,
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("Row {row}: {message}")]
    InvalidRow { row: usize, message: String },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// Summary of per-point reprojection distances, in pixels.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

/// Per-point reprojection statistics of a posed camera.
///
/// Points that cannot be projected (behind the camera) are left out.
///
/// # Arguments
///
/// * `camera_model` - Camera used for projection.
/// * `rotation`, `translation` - World-to-camera pose.
/// * `points3d` - World points, one per column.
/// * `points2d` - Observed pixels, one per column.
///
/// # Errors
///
/// * [`UtilError::InvalidParams`]: if the column counts differ.
/// * [`UtilError::ZeroProjectionPoints`]: if no point projects.
pub fn compute_reprojection_error<T>(
    camera_model: &T,
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
    points3d: &Matrix3xX<f64>,
    points2d: &Matrix2xX<f64>,
) -> Result<ProjectionError, UtilError>
where
    T: ?Sized + CameraModel,
{
    if points3d.ncols() != points2d.ncols() {
        return Err(UtilError::InvalidParams(
            "3D and 2D point counts must match".to_string(),
        ));
    }

    let mut errors = vec![];
    for (point3d, point2d) in points3d.column_iter().zip(points2d.column_iter()) {
        let point_camera = rotation * point3d + translation;
        if let Ok(projected) = camera_model.project(&point_camera) {
            errors.push((projected - point2d).norm());
        }
    }

    if errors.is_empty() {
        return Err(UtilError::ZeroProjectionPoints);
    }

    let n = errors.len() as f64;
    let mean = errors.iter().sum::<f64>() / n;
    let variance = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let rmse = (errors.iter().map(|x| x.powi(2)).sum::<f64>() / n).sqrt();
    let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

    errors.sort_by(|a, b| a.total_cmp(b));
    let mid = errors.len() / 2;
    let median = if errors.len() % 2 == 0 {
        (errors[mid - 1] + errors[mid]) / 2.0
    } else {
        errors[mid]
    };

    Ok(ProjectionError {
        rmse,
        min,
        max,
        mean,
        stddev: variance.sqrt(),
        median,
    })
}

/// Pixel size of an image file, read from its header.
///
/// Only the header is decoded, so this is cheap even for large images.
///
/// # Errors
///
/// * [`UtilError::Image`]: if the format is unknown or the header is unreadable.
pub fn image_resolution<P: AsRef<Path>>(path: P) -> Result<Resolution, UtilError> {
    let (width, height) = image::image_dimensions(path)?;
    Ok(Resolution::new(width, height))
}

/// One row of a correspondence file. Empty cells are unset slots.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MatchRow {
    u: Option<f64>,
    v: Option<f64>,
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
}

impl MatchRow {
    fn from_match(point_match: &PointMatch) -> Self {
        let mut row = Self::default();
        if let Some(p) = point_match.point_2d {
            (row.u, row.v) = (Some(p.x), Some(p.y));
        }
        if let Some(p) = point_match.point_3d {
            (row.x, row.y, row.z) = (Some(p.x), Some(p.y), Some(p.z));
        }
        row
    }

    fn into_match(self, row: usize) -> Result<PointMatch, UtilError> {
        let invalid = |message: &str| UtilError::InvalidRow {
            row,
            message: message.to_string(),
        };

        let point_2d = match (self.u, self.v) {
            (Some(u), Some(v)) => Some(Vector2::new(u, v)),
            (None, None) => None,
            _ => return Err(invalid("2D point needs both u and v")),
        };
        let point_3d = match (self.x, self.y, self.z) {
            (Some(x), Some(y), Some(z)) => Some(Vector3::new(x, y, z)),
            (None, None, None) => None,
            _ => return Err(invalid("3D point needs x, y and z")),
        };
        Ok(PointMatch { point_2d, point_3d })
    }
}

/// Reads point matches from a CSV file with the header `u,v,x,y,z`.
///
/// `u, v` are normalized marker coordinates with the origin at the bottom
/// left; `x, y, z` are world coordinates. Rows without any point are dropped.
///
/// # Arguments
///
/// * `path` - The CSV file. Cells may be padded with spaces.
///
/// # Errors
///
/// * [`UtilError::Csv`]: if the file cannot be read or a cell is not a number.
/// * [`UtilError::InvalidRow`]: if a row fills only part of a 2D or 3D point.
///   Rows are numbered from 1, not counting the header.
pub fn read_point_matches<P: AsRef<Path>>(path: P) -> Result<PointMatchList, UtilError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let matches = reader
        .deserialize::<MatchRow>()
        .enumerate()
        .map(|(i, row)| row?.into_match(i + 1))
        .collect::<Result<Vec<_>, UtilError>>()?;
    Ok(PointMatchList::from_matches(matches))
}

/// Writes point matches in the layout read by [`read_point_matches`].
///
/// Unset points are written as empty cells, so a file written here reads
/// back to the same list.
///
/// # Arguments
///
/// * `matches` - The list to write, in order.
/// * `path` - Destination file. An existing file is overwritten.
///
/// # Errors
///
/// * [`UtilError::Csv`]: if the file cannot be created or a row cannot be written.
/// * [`UtilError::IOError`]: if the final flush fails.
pub fn write_point_matches<P: AsRef<Path>>(
    matches: &PointMatchList,
    path: P,
) -> Result<(), UtilError> {
    let mut writer = csv::Writer::from_path(path)?;
    for point_match in matches {
        writer.serialize(MatchRow::from_match(point_match))?;
    }
    writer.flush()?;
    Ok(())
}

fn draw_marker(img: &mut RgbImage, center: &Vector2<f64>, color: Rgb<u8>) {
    if !(center.x.is_finite() && center.y.is_finite()) {
        return;
    }
    let center_x = center.x.round() as i64;
    let center_y = center.y.round() as i64;

    let radius = 3;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                let x = center_x + dx;
                let y = center_y + dy;
                if x >= 0 && x < img.width() as i64 && y >= 0 && y < img.height() as i64 {
                    img.put_pixel(x as u32, y as u32, color);
                }
            }
        }
    }
}

/// Draws observed markers in green and their reprojections in magenta on a
/// copy of the reference image.
///
/// # Arguments
///
/// * `reference_image` - The photograph the matches were picked on.
/// * `observed` - Observed pixels, one per column.
/// * `reprojected` - Reprojected pixels, one per column. `NaN` columns are skipped.
pub fn create_reprojection_image(
    reference_image: &RgbImage,
    observed: &Matrix2xX<f64>,
    reprojected: &Matrix2xX<f64>,
) -> RgbImage {
    let mut img = reference_image.clone();
    for point in observed.column_iter() {
        draw_marker(&mut img, &point.into_owned(), Rgb([0, 255, 0]));
    }
    for point in reprojected.column_iter() {
        draw_marker(&mut img, &point.into_owned(), Rgb([255, 0, 255]));
    }
    img
}

/// Loads `image_path`, overlays the reprojection markers and saves the
/// result to `output_path`.
///
/// # Errors
///
/// * [`UtilError::Image`]: if the input cannot be decoded or the output
///   cannot be encoded in the format its extension names.
pub fn save_reprojection_image<P: AsRef<Path>, Q: AsRef<Path>>(
    image_path: P,
    observed: &Matrix2xX<f64>,
    reprojected: &Matrix2xX<f64>,
    output_path: Q,
) -> Result<(), UtilError> {
    let reference = image::open(image_path)?.to_rgb8();
    create_reprojection_image(&reference, observed, reprojected).save(output_path)?;
    Ok(())
}
