//! Efficient Perspective-n-Point (Lepetit, Moreno-Noguer and Fua, IJCV 2009).
//!
//! Works on undistorted normalized image coordinates, so the camera matrix is
//! the identity throughout. World points are expressed as weighted sums of
//! four control points; the camera-frame control points live in the null space
//! of a `2n x 12` system and are recovered from up to four null vectors whose
//! weights are fixed by the inter-control-point distances.
//!
//! Planar point sets have a rank deficient covariance and are rejected here;
//! [`crate::geometry::planar`] handles them.

use super::{align_point_sets, principal_axes, GeometryError};
use nalgebra::{DMatrix, DVector, Matrix3, Vector2, Vector3, Vector4};

/// Minimum number of correspondences.
pub const MIN_POINTS: usize = 4;

/// Control point index pairs, in the row order of the `L` matrix and `rho`.
const PAIRS: [(usize, usize); 6] = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];

/// A linear pose estimate with its RMS reprojection error in normalized units.
#[derive(Debug, Clone, Copy)]
pub struct LinearPose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub error: f64,
}

/// Solves for the world-to-camera pose, keeping the beta approximation with
/// the lowest reprojection error.
///
/// # Errors
///
/// * [`GeometryError::TooFewPoints`] with fewer than four correspondences.
/// * [`GeometryError::DegenerateConfiguration`] for coincident, collinear or
///   planar world points.
pub fn solve_epnp(
    points_world: &[Vector3<f64>],
    points_normalized: &[Vector2<f64>],
) -> Result<LinearPose, GeometryError> {
    epnp_candidates(points_world, points_normalized)?
        .into_iter()
        .min_by(|a, b| a.error.total_cmp(&b.error))
        .ok_or(GeometryError::NonFinite)
}

/// One pose per beta approximation that yields a valid solution.
///
/// With four points the three approximations can land in different basins
/// of the reprojection error, so callers that refine afterwards should try
/// every candidate rather than only the one with the lowest linear error.
///
/// # Errors
///
/// Same as [`solve_epnp`]. An empty vector is never returned.
pub fn epnp_candidates(
    points_world: &[Vector3<f64>],
    points_normalized: &[Vector2<f64>],
) -> Result<Vec<LinearPose>, GeometryError> {
    let n = points_world.len().min(points_normalized.len());
    if n < MIN_POINTS {
        return Err(GeometryError::TooFewPoints {
            required: MIN_POINTS,
            actual: n,
        });
    }

    let control_world = select_control_points(points_world)?;
    let alphas = compute_barycentric(points_world, &control_world)?;

    let m = build_m(&alphas, points_normalized);
    let mtm = m.transpose() * &m;
    let eigen = mtm.symmetric_eigen();
    let mut order: Vec<usize> = (0..12).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));

    // Column k holds the null vector of the k-th smallest eigenvalue.
    let null4: Vec<DVector<f64>> = order[..4]
        .iter()
        .map(|&i| eigen.eigenvectors.column(i).into_owned())
        .collect();

    let l = build_l6x10(&null4);
    let rho = rho_control_points(&control_world);

    let mut candidates = Vec::with_capacity(3);
    for approximation in [Approximation::One, Approximation::Two, Approximation::Three] {
        let Ok(betas) = estimate_betas(&l, &rho, approximation) else {
            continue;
        };
        let betas = gauss_newton(&l, &rho, betas);
        if let Ok(candidate) =
            pose_from_betas(&betas, &null4, &alphas, points_world, points_normalized)
        {
            candidates.push(candidate);
        }
    }

    if candidates.is_empty() {
        return Err(GeometryError::NonFinite);
    }
    Ok(candidates)
}

/// RMS distance between observed and projected normalized points.
pub(crate) fn normalized_rmse(
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
    points_world: &[Vector3<f64>],
    points_normalized: &[Vector2<f64>],
) -> f64 {
    let n = points_world.len().min(points_normalized.len());
    if n == 0 {
        return f64::NAN;
    }
    let sum: f64 = points_world
        .iter()
        .zip(points_normalized)
        .map(|(pw, m)| {
            let pc = rotation * pw + translation;
            if pc.z <= f64::EPSILON {
                return f64::INFINITY;
            }
            (Vector2::new(pc.x / pc.z, pc.y / pc.z) - m).norm_squared()
        })
        .sum();
    (sum / n as f64).sqrt()
}

fn select_control_points(points_world: &[Vector3<f64>]) -> Result<[Vector3<f64>; 4], GeometryError> {
    let (centroid, values, axes) = principal_axes(points_world);

    if values[0] <= f64::EPSILON {
        return Err(GeometryError::DegenerateConfiguration("coincident points"));
    }
    if values[1] <= 1e-10 * values[0] {
        return Err(GeometryError::DegenerateConfiguration("collinear points"));
    }
    if values[2] <= 1e-10 * values[0] {
        return Err(GeometryError::DegenerateConfiguration("planar points"));
    }

    let mut control = [centroid; 4];
    for i in 0..3 {
        control[i + 1] = centroid + axes.column(i) * values[i].sqrt();
    }
    Ok(control)
}

fn compute_barycentric(
    points_world: &[Vector3<f64>],
    control: &[Vector3<f64>; 4],
) -> Result<Vec<Vector4<f64>>, GeometryError> {
    let basis = Matrix3::from_columns(&[
        control[1] - control[0],
        control[2] - control[0],
        control[3] - control[0],
    ]);
    let basis_inv = basis
        .try_inverse()
        .ok_or(GeometryError::DegenerateConfiguration("singular control point basis"))?;

    Ok(points_world
        .iter()
        .map(|p| {
            let a = basis_inv * (p - control[0]);
            Vector4::new(1.0 - a.x - a.y - a.z, a.x, a.y, a.z)
        })
        .collect())
}

fn build_m(alphas: &[Vector4<f64>], points_normalized: &[Vector2<f64>]) -> DMatrix<f64> {
    let n = alphas.len().min(points_normalized.len());
    let mut m = DMatrix::zeros(2 * n, 12);
    for (i, (alpha, uv)) in alphas.iter().zip(points_normalized).enumerate() {
        for j in 0..4 {
            m[(2 * i, 3 * j)] = alpha[j];
            m[(2 * i, 3 * j + 2)] = -alpha[j] * uv.x;
            m[(2 * i + 1, 3 * j + 1)] = alpha[j];
            m[(2 * i + 1, 3 * j + 2)] = -alpha[j] * uv.y;
        }
    }
    m
}

fn control_point(v: &DVector<f64>, j: usize) -> Vector3<f64> {
    Vector3::new(v[3 * j], v[3 * j + 1], v[3 * j + 2])
}

/// The `6 x 10` matrix mapping the products of betas to squared distances
/// between camera-frame control points.
fn build_l6x10(null4: &[DVector<f64>]) -> DMatrix<f64> {
    let mut l = DMatrix::zeros(6, 10);
    for (row, &(a, b)) in PAIRS.iter().enumerate() {
        let d: Vec<Vector3<f64>> = null4
            .iter()
            .map(|v| control_point(v, a) - control_point(v, b))
            .collect();

        l[(row, 0)] = d[0].dot(&d[0]);
        l[(row, 1)] = 2.0 * d[0].dot(&d[1]);
        l[(row, 2)] = d[1].dot(&d[1]);
        l[(row, 3)] = 2.0 * d[0].dot(&d[2]);
        l[(row, 4)] = 2.0 * d[1].dot(&d[2]);
        l[(row, 5)] = d[2].dot(&d[2]);
        l[(row, 6)] = 2.0 * d[0].dot(&d[3]);
        l[(row, 7)] = 2.0 * d[1].dot(&d[3]);
        l[(row, 8)] = 2.0 * d[2].dot(&d[3]);
        l[(row, 9)] = d[3].dot(&d[3]);
    }
    l
}

fn rho_control_points(control: &[Vector3<f64>; 4]) -> DVector<f64> {
    DVector::from_iterator(
        6,
        PAIRS
            .iter()
            .map(|&(a, b)| (control[a] - control[b]).norm_squared()),
    )
}

#[derive(Debug, Clone, Copy)]
enum Approximation {
    /// betas 1..4 from `[B11 B12 B13 B14]`
    One,
    /// betas 1..2 from `[B11 B12 B22]`
    Two,
    /// betas 1..3 from `[B11 B12 B22 B13 B23]`
    Three,
}

fn solve_least_squares(a: DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>, GeometryError> {
    let svd = a.svd(true, true);
    svd.solve(b, 1e-12).map_err(|_| GeometryError::SvdFailed)
}

fn estimate_betas(
    l: &DMatrix<f64>,
    rho: &DVector<f64>,
    approximation: Approximation,
) -> Result<Vector4<f64>, GeometryError> {
    let columns: &[usize] = match approximation {
        Approximation::One => &[0, 1, 3, 6],
        Approximation::Two => &[0, 1, 2],
        Approximation::Three => &[0, 1, 2, 3, 4],
    };
    let sub = DMatrix::from_fn(6, columns.len(), |r, c| l[(r, columns[c])]);
    let b = solve_least_squares(sub, rho)?;

    let mut betas = Vector4::zeros();
    match approximation {
        Approximation::One => {
            if b[0] < 0.0 {
                betas[0] = (-b[0]).sqrt();
                betas[1] = -b[1] / betas[0];
                betas[2] = -b[2] / betas[0];
                betas[3] = -b[3] / betas[0];
            } else {
                betas[0] = b[0].sqrt();
                betas[1] = b[1] / betas[0];
                betas[2] = b[2] / betas[0];
                betas[3] = b[3] / betas[0];
            }
        }
        Approximation::Two | Approximation::Three => {
            if b[0] < 0.0 {
                betas[0] = (-b[0]).sqrt();
                betas[1] = if b[2] < 0.0 { (-b[2]).sqrt() } else { 0.0 };
            } else {
                betas[0] = b[0].sqrt();
                betas[1] = if b[2] > 0.0 { b[2].sqrt() } else { 0.0 };
            }
            if b[1] < 0.0 {
                betas[0] = -betas[0];
            }
            if let Approximation::Three = approximation {
                betas[2] = b[3] / betas[0];
            }
        }
    }

    if betas.iter().all(|v| v.is_finite()) {
        Ok(betas)
    } else {
        Err(GeometryError::NonFinite)
    }
}

/// A few Gauss-Newton steps on `L * beta_products = rho`.
fn gauss_newton(l: &DMatrix<f64>, rho: &DVector<f64>, mut betas: Vector4<f64>) -> Vector4<f64> {
    const ITERATIONS: usize = 5;

    for _ in 0..ITERATIONS {
        let (b0, b1, b2, b3) = (betas[0], betas[1], betas[2], betas[3]);
        let mut a = DMatrix::zeros(6, 4);
        let mut residual = DVector::zeros(6);

        for i in 0..6 {
            let r = l.row(i);
            a[(i, 0)] = 2.0 * r[0] * b0 + r[1] * b1 + r[3] * b2 + r[6] * b3;
            a[(i, 1)] = r[1] * b0 + 2.0 * r[2] * b1 + r[4] * b2 + r[7] * b3;
            a[(i, 2)] = r[3] * b0 + r[4] * b1 + 2.0 * r[5] * b2 + r[8] * b3;
            a[(i, 3)] = r[6] * b0 + r[7] * b1 + r[8] * b2 + 2.0 * r[9] * b3;

            residual[i] = rho[i]
                - (r[0] * b0 * b0
                    + r[1] * b0 * b1
                    + r[2] * b1 * b1
                    + r[3] * b0 * b2
                    + r[4] * b1 * b2
                    + r[5] * b2 * b2
                    + r[6] * b0 * b3
                    + r[7] * b1 * b3
                    + r[8] * b2 * b3
                    + r[9] * b3 * b3);
        }

        match solve_least_squares(a, &residual) {
            Ok(step) if step.iter().all(|v| v.is_finite()) => {
                betas += Vector4::new(step[0], step[1], step[2], step[3]);
            }
            _ => break,
        }
    }
    betas
}

fn pose_from_betas(
    betas: &Vector4<f64>,
    null4: &[DVector<f64>],
    alphas: &[Vector4<f64>],
    points_world: &[Vector3<f64>],
    points_normalized: &[Vector2<f64>],
) -> Result<LinearPose, GeometryError> {
    let mut control_camera = [Vector3::zeros(); 4];
    for (k, v) in null4.iter().enumerate() {
        for (j, cc) in control_camera.iter_mut().enumerate() {
            *cc += control_point(v, j) * betas[k];
        }
    }

    let mut points_camera: Vec<Vector3<f64>> = alphas
        .iter()
        .map(|a| {
            control_camera
                .iter()
                .enumerate()
                .fold(Vector3::zeros(), |acc, (j, c)| acc + c * a[j])
        })
        .collect();

    // The null space solution is defined up to sign; points must be in front.
    let depth: f64 = points_camera.iter().map(|p| p.z).sum();
    if depth < 0.0 {
        points_camera.iter_mut().for_each(|p| *p = -*p);
    }

    let (rotation, translation) = align_point_sets(points_world, &points_camera)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn project_all(
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
        points: &[Vector3<f64>],
    ) -> Vec<Vector2<f64>> {
        points
            .iter()
            .map(|p| {
                let pc = rotation * p + translation;
                Vector2::new(pc.x / pc.z, pc.y / pc.z)
            })
            .collect()
    }

    fn sample_world_points() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(-1.0, -1.0, 0.2),
            Vector3::new(1.2, -0.8, -0.3),
            Vector3::new(0.9, 1.1, 0.5),
            Vector3::new(-1.1, 0.7, -0.4),
            Vector3::new(0.1, 0.2, 1.0),
            Vector3::new(0.4, -0.3, -0.9),
            Vector3::new(-0.6, 0.5, 0.7),
            Vector3::new(0.7, 0.0, 0.1),
        ]
    }

    #[test]
    fn test_solve_epnp_exact() {
        let rotation = Rotation3::from_euler_angles(0.1, -0.2, 0.3).into_inner();
        let translation = Vector3::new(0.2, -0.1, 6.0);
        let world = sample_world_points();
        let image = project_all(&rotation, &translation, &world);

        let pose = solve_epnp(&world, &image).unwrap();
        assert_relative_eq!(pose.rotation, rotation, epsilon = 1e-6);
        assert_relative_eq!(pose.translation, translation, epsilon = 1e-5);
        assert!(pose.error < 1e-8);
    }

    #[test]
    fn test_solve_epnp_minimal() {
        let rotation = Rotation3::from_euler_angles(-0.3, 0.25, 0.05).into_inner();
        let translation = Vector3::new(-0.5, 0.3, 8.0);
        let world = sample_world_points()[..4].to_vec();
        let image = project_all(&rotation, &translation, &world);

        let pose = solve_epnp(&world, &image).unwrap();
        assert!(pose.error < 1e-6, "error {}", pose.error);
    }

    #[test]
    fn test_candidates_all_reproject_observations() {
        let rotation = Rotation3::from_euler_angles(0.2, 0.1, -0.4).into_inner();
        let translation = Vector3::new(0.1, 0.4, 7.0);
        let world = sample_world_points();
        let image = project_all(&rotation, &translation, &world);

        let candidates = epnp_candidates(&world, &image).unwrap();
        assert!(!candidates.is_empty() && candidates.len() <= 3);
        let best = solve_epnp(&world, &image).unwrap();
        assert!(candidates.iter().all(|c| c.error >= best.error));
        for candidate in &candidates {
            assert_relative_eq!(candidate.rotation.determinant(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_rejects_degenerate_input() {
        let planar: Vec<_> = sample_world_points()
            .into_iter()
            .map(|p| Vector3::new(p.x, p.y, 0.0))
            .collect();
        let image = vec![Vector2::zeros(); planar.len()];
        assert!(matches!(
            solve_epnp(&planar, &image),
            Err(GeometryError::DegenerateConfiguration("planar points"))
        ));

        let three = sample_world_points()[..3].to_vec();
        assert!(matches!(
            solve_epnp(&three, &image[..3]),
            Err(GeometryError::TooFewPoints {
                required: 4,
                actual: 3
            })
        ));
    }
}
