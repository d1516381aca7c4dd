//! Perspective-three-point in Grunert's formulation.
//!
//! The depths along the three bearing rays satisfy the law of cosines for
//! every pair of points. Eliminating two depth ratios leaves a quartic in the
//! ratio `u = s1 / s0`; every positive real root gives one pose, recovered by
//! aligning the world triangle with the camera-frame triangle.

use super::epnp::{normalized_rmse, LinearPose};
use super::{align_point_sets, GeometryError};
use nalgebra::{DMatrix, Matrix3, Schur, Vector2, Vector3};

/// Real roots of a polynomial given highest degree first.
///
/// Roots come from the eigenvalues of the companion matrix and are polished
/// with a few Newton steps. Leading coefficients that vanish relative to the
/// largest one are dropped.
pub(crate) fn real_roots(coeffs: &[f64]) -> Vec<f64> {
    let scale = coeffs.iter().fold(0.0_f64, |acc, c| acc.max(c.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return Vec::new();
    }
    let Some(lead) = coeffs.iter().position(|c| c.abs() > 1e-12 * scale) else {
        return Vec::new();
    };
    let coeffs = &coeffs[lead..];
    let degree = coeffs.len() - 1;
    match degree {
        0 => return Vec::new(),
        1 => return vec![-coeffs[1] / coeffs[0]],
        _ => {}
    }

    let mut companion = DMatrix::<f64>::zeros(degree, degree);
    for (j, c) in coeffs[1..].iter().enumerate() {
        companion[(0, j)] = -c / coeffs[0];
    }
    for i in 1..degree {
        companion[(i, i - 1)] = 1.0;
    }

    let Some(schur) = Schur::try_new(companion, f64::EPSILON, 1000) else {
        return Vec::new();
    };
    let mut roots: Vec<f64> = schur
        .complex_eigenvalues()
        .iter()
        .filter(|z| z.im.abs() <= 1e-8 * (1.0 + z.re.abs()))
        .map(|z| polish_root(coeffs, z.re))
        .collect();
    roots.sort_by(f64::total_cmp);
    roots.dedup_by(|a, b| (*a - *b).abs() <= 1e-10 * (1.0 + b.abs()));
    roots
}

fn polish_root(coeffs: &[f64], mut x: f64) -> f64 {
    for _ in 0..3 {
        let (value, slope) = coeffs.iter().fold((0.0, 0.0), |(p, dp), c| (p * x + c, dp * x + p));
        if slope.abs() <= f64::EPSILON {
            break;
        }
        let step = value / slope;
        if !step.is_finite() {
            break;
        }
        x -= step;
    }
    x
}

/// Product of two polynomials stored lowest degree first.
fn poly_mul(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, x) in a.iter().enumerate() {
        for (j, y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

fn poly_add_scaled(acc: &mut [f64], p: &[f64], scale: f64) {
    for (a, v) in acc.iter_mut().zip(p) {
        *a += scale * v;
    }
}

fn eval_ascending(p: &[f64], x: f64) -> f64 {
    p.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

/// World-to-camera poses consistent with three correspondences.
///
/// Returns up to four `(rotation, translation)` pairs, one per admissible
/// root. Every point of the returned poses lies in front of the camera.
///
/// # Errors
///
/// [`GeometryError::DegenerateConfiguration`] for coincident or collinear
/// world points.
pub fn solve_p3p(
    points_world: &[Vector3<f64>; 3],
    points_normalized: &[Vector2<f64>; 3],
) -> Result<Vec<(Matrix3<f64>, Vector3<f64>)>, GeometryError> {
    let [p0, p1, p2] = points_world;
    let a2 = (p1 - p2).norm_squared();
    let b2 = (p0 - p2).norm_squared();
    let c2 = (p0 - p1).norm_squared();
    let longest = a2.max(b2).max(c2);
    if c2 <= f64::EPSILON * longest.max(1.0) {
        return Err(GeometryError::DegenerateConfiguration("coincident points"));
    }
    if (p1 - p0).cross(&(p2 - p0)).norm_squared() <= 1e-12 * longest * longest {
        return Err(GeometryError::DegenerateConfiguration("collinear points"));
    }

    let bearings = points_normalized.map(|m| Vector3::new(m.x, m.y, 1.0).normalize());
    let cos_alpha = bearings[1].dot(&bearings[2]);
    let cos_beta = bearings[0].dot(&bearings[2]);
    let cos_gamma = bearings[0].dot(&bearings[1]);

    let d = (b2 - a2) / c2;
    let e = b2 / c2;

    // v = n(u) / den(u), and the b-constraint reads n^2 - 2 cos(beta) n den + f den^2 = 0.
    let n = [1.0 - d, 2.0 * d * cos_gamma, -(1.0 + d)];
    let den = [2.0 * cos_beta, -2.0 * cos_alpha];
    let f = [1.0 - e, 2.0 * e * cos_gamma, -e];

    let den2 = poly_mul(&den, &den);
    let mut quartic = poly_mul(&n, &n);
    poly_add_scaled(&mut quartic, &poly_mul(&n, &den), -2.0 * cos_beta);
    poly_add_scaled(&mut quartic, &poly_mul(&f, &den2), 1.0);

    let descending: Vec<f64> = quartic.iter().rev().copied().collect();

    let mut poses = Vec::new();
    for u in real_roots(&descending) {
        let denominator = eval_ascending(&den, u);
        if u <= 0.0 || denominator.abs() <= 1e-12 {
            continue;
        }
        let v = eval_ascending(&n, u) / denominator;
        let k = 1.0 + u * u - 2.0 * u * cos_gamma;
        if v <= 0.0 || k <= f64::EPSILON {
            continue;
        }

        let s0 = (c2 / k).sqrt();
        let camera = [bearings[0] * s0, bearings[1] * (u * s0), bearings[2] * (v * s0)];
        let Ok((rotation, translation)) = align_point_sets(points_world, &camera) else {
            continue;
        };
        if rotation.iter().chain(translation.iter()).all(|x| x.is_finite()) {
            poses.push((rotation, translation));
        }
    }
    Ok(poses)
}

/// P3P poses from every triple of the correspondences, scored on all points.
///
/// The number of triples grows cubically, so this is meant for small sets.
/// Degenerate triples are skipped.
pub fn p3p_candidates(
    points_world: &[Vector3<f64>],
    points_normalized: &[Vector2<f64>],
) -> Vec<LinearPose> {
    let n = points_world.len().min(points_normalized.len());
    let mut candidates = Vec::new();
    for i in 0..n {
        for j in i + 1..n {
            for k in j + 1..n {
                let world = [points_world[i], points_world[j], points_world[k]];
                let image = [points_normalized[i], points_normalized[j], points_normalized[k]];
                let Ok(poses) = solve_p3p(&world, &image) else {
                    continue;
                };
                candidates.extend(poses.into_iter().map(|(rotation, translation)| LinearPose {
                    rotation,
                    translation,
                    error: normalized_rmse(
                        &rotation,
                        &translation,
                        &points_world[..n],
                        &points_normalized[..n],
                    ),
                }));
            }
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn project(rotation: &Matrix3<f64>, translation: &Vector3<f64>, p: &Vector3<f64>) -> Vector2<f64> {
        let pc = rotation * p + translation;
        Vector2::new(pc.x / pc.z, pc.y / pc.z)
    }

    #[test]
    fn test_real_roots_of_known_polynomial() {
        // (x - 1)(x + 2)(x - 3)(x^2 + 1) has three real roots.
        let roots = real_roots(&[1.0, -2.0, -4.0, 4.0, -5.0, 6.0]);
        assert_eq!(roots.len(), 3);
        assert_relative_eq!(roots[0], -2.0, epsilon = 1e-10);
        assert_relative_eq!(roots[1], 1.0, epsilon = 1e-10);
        assert_relative_eq!(roots[2], 3.0, epsilon = 1e-10);

        // A vanishing leading coefficient falls back to the lower degree.
        let roots = real_roots(&[0.0, 1.0, -3.0, 2.0]);
        assert_eq!(roots.len(), 2);
        assert_relative_eq!(roots[1], 2.0, epsilon = 1e-10);
    }

    #[test]
    fn test_one_solution_matches_ground_truth() {
        let rotation = Rotation3::from_euler_angles(0.4, -0.3, 1.1).into_inner();
        let translation = Vector3::new(0.3, -0.2, 6.0);
        let world = [
            Vector3::new(-1.0, 0.5, 0.3),
            Vector3::new(1.2, -0.4, -0.6),
            Vector3::new(0.2, 1.3, 0.9),
        ];
        let image = world.map(|p| project(&rotation, &translation, &p));

        let poses = solve_p3p(&world, &image).unwrap();
        assert!(!poses.is_empty() && poses.len() <= 4);
        let found = poses.iter().any(|(r, t)| {
            (r - rotation).amax() < 1e-6 && (t - translation).amax() < 1e-6
        });
        assert!(found, "no solution matched the true pose: {poses:?}");
    }

    #[test]
    fn test_candidates_from_four_points_include_exact_fit() {
        let rotation = Rotation3::from_euler_angles(-2.1, 0.9, 2.7).into_inner();
        let translation = Vector3::new(-0.8, 0.5, 9.0);
        let world = vec![
            Vector3::new(-1.5, -0.3, 0.8),
            Vector3::new(1.1, 0.9, -1.2),
            Vector3::new(0.4, -1.4, 0.2),
            Vector3::new(-0.2, 1.2, 1.4),
        ];
        let image: Vec<_> = world.iter().map(|p| project(&rotation, &translation, p)).collect();

        let candidates = p3p_candidates(&world, &image);
        let best = candidates
            .iter()
            .min_by(|a, b| a.error.total_cmp(&b.error))
            .unwrap();
        assert!(best.error < 1e-9, "error {}", best.error);
        assert_relative_eq!(best.rotation, rotation, epsilon = 1e-6);
        assert_relative_eq!(best.translation, translation, epsilon = 1e-6);
    }

    #[test]
    fn test_collinear_triple_is_rejected() {
        let world = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 1.0, 1.0),
            Vector3::new(2.0, 2.0, 2.0),
        ];
        let image = [Vector2::zeros(), Vector2::new(0.1, 0.0), Vector2::new(0.2, 0.0)];
        assert!(matches!(
            solve_p3p(&world, &image),
            Err(GeometryError::DegenerateConfiguration(_))
        ));
    }
}
