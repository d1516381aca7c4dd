//! Pose of a (nearly) planar point set from a plane-to-image homography.
//!
//! The world points are expressed in a 2D frame spanned by the two dominant
//! axes of their covariance, a homography to the normalized image points is
//! estimated with the normalized DLT, and `[r1 r2 t]` is read off its columns.

use super::epnp::{normalized_rmse, LinearPose};
use super::{principal_axes, project_to_so3, GeometryError};
use nalgebra::{DMatrix, Matrix3, SMatrix, Vector2, Vector3};

/// Ratio of the smallest to the largest covariance eigenvalue below which a
/// point set counts as planar.
pub const PLANARITY_THRESHOLD: f64 = 1e-3;

/// Whether the points are flat enough for the homography initializer.
pub fn is_planar(points_world: &[Vector3<f64>]) -> bool {
    let (_, values, _) = principal_axes(points_world);
    values[0] > 0.0 && values[2] <= PLANARITY_THRESHOLD * values[0]
}

/// Solves for the world-to-camera pose of a planar point set.
///
/// # Errors
///
/// * [`GeometryError::TooFewPoints`] with fewer than four correspondences.
/// * [`GeometryError::DegenerateConfiguration`] for coincident or collinear points.
pub fn solve_planar(
    points_world: &[Vector3<f64>],
    points_normalized: &[Vector2<f64>],
) -> Result<LinearPose, GeometryError> {
    let n = points_world.len().min(points_normalized.len());
    if n < 4 {
        return Err(GeometryError::TooFewPoints {
            required: 4,
            actual: n,
        });
    }

    let (centroid, values, axes) = principal_axes(points_world);
    if values[0] <= f64::EPSILON {
        return Err(GeometryError::DegenerateConfiguration("coincident points"));
    }
    if values[1] <= 1e-10 * values[0] {
        return Err(GeometryError::DegenerateConfiguration("collinear points"));
    }

    let e1 = axes.column(0).into_owned();
    let e2 = axes.column(1).into_owned();
    let basis = Matrix3::from_columns(&[e1, e2, e1.cross(&e2)]);

    let plane_points: Vec<Vector2<f64>> = points_world
        .iter()
        .map(|p| {
            let d = p - centroid;
            Vector2::new(e1.dot(&d), e2.dot(&d))
        })
        .collect();

    let h = dlt_homography(&plane_points, &points_normalized[..n])?;

    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    let mut lambda = 2.0 / (h1.norm() + h2.norm());
    if (h3 * lambda).z < 0.0 {
        lambda = -lambda;
    }

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let plane_rotation = project_to_so3(&Matrix3::from_columns(&[r1, r2, r1.cross(&r2)]))?;
    let plane_translation = h3 * lambda;

    let rotation = plane_rotation * basis.transpose();
    let translation = plane_translation - rotation * centroid;
    let error = normalized_rmse(&rotation, &translation, points_world, points_normalized);
    if !error.is_finite() {
        return Err(GeometryError::NonFinite);
    }

    Ok(LinearPose {
        rotation,
        translation,
        error,
    })
}

/// Similarity transform moving the centroid to the origin with a mean
/// distance of `sqrt(2)`.
fn normalization_transform(points: &[Vector2<f64>]) -> Result<Matrix3<f64>, GeometryError> {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_distance = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    if mean_distance <= f64::EPSILON {
        return Err(GeometryError::DegenerateConfiguration("coincident points"));
    }

    let s = std::f64::consts::SQRT_2 / mean_distance;
    Ok(Matrix3::new(
        s,
        0.0,
        -s * centroid.x,
        0.0,
        s,
        -s * centroid.y,
        0.0,
        0.0,
        1.0,
    ))
}

fn apply(t: &Matrix3<f64>, p: &Vector2<f64>) -> Vector2<f64> {
    let q = t * Vector3::new(p.x, p.y, 1.0);
    Vector2::new(q.x / q.z, q.y / q.z)
}

/// Normalized DLT homography mapping `from` onto `to`.
pub(crate) fn dlt_homography(
    from: &[Vector2<f64>],
    to: &[Vector2<f64>],
) -> Result<Matrix3<f64>, GeometryError> {
    let t_from = normalization_transform(from)?;
    let t_to = normalization_transform(to)?;

    let mut a = DMatrix::zeros(2 * from.len(), 9);
    for (i, (p, q)) in from.iter().zip(to).enumerate() {
        let p = apply(&t_from, p);
        let q = apply(&t_to, q);
        let row = [
            [-p.x, -p.y, -1.0, 0.0, 0.0, 0.0, q.x * p.x, q.x * p.y, q.x],
            [0.0, 0.0, 0.0, -p.x, -p.y, -1.0, q.y * p.x, q.y * p.y, q.y],
        ];
        for (r, values) in row.iter().enumerate() {
            for (c, v) in values.iter().enumerate() {
                a[(2 * i + r, c)] = *v;
            }
        }
    }

    // The null vector of A is the eigenvector of A^T A with the smallest
    // eigenvalue; a thin SVD of a wide A would not expose it.
    let ata: SMatrix<f64, 9, 9> = SMatrix::from_fn(|r, c| a.column(r).dot(&a.column(c)));
    let eigen = ata.symmetric_eigen();
    let smallest = eigen.eigenvalues.imin();
    let h = eigen.eigenvectors.column(smallest);

    let normalized = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
    let t_to_inv = t_to
        .try_inverse()
        .ok_or(GeometryError::DegenerateConfiguration("singular normalization"))?;

    let homography = t_to_inv * normalized * t_from;
    if homography.iter().all(|v| v.is_finite()) {
        Ok(homography)
    } else {
        Err(GeometryError::NonFinite)
    }
}
