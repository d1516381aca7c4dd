//! Ray casting against the reference model.
//!
//! Used to find the "centre model point" of a solved camera: the first point
//! of the model hit by the camera's central viewing ray.

use super::CameraTransform;
use nalgebra::{Matrix4, Point3, Vector3};

/// Triangle mesh of the reference model in object space, placed in the world
/// by `matrix_world`.
#[derive(Debug, Clone, PartialEq)]
pub struct TriangleMesh {
    pub vertices: Vec<Vector3<f64>>,
    pub triangles: Vec<[usize; 3]>,
    pub matrix_world: Matrix4<f64>,
}

impl TriangleMesh {
    pub fn new(vertices: Vec<Vector3<f64>>, triangles: Vec<[usize; 3]>) -> Self {
        Self {
            vertices,
            triangles,
            matrix_world: Matrix4::identity(),
        }
    }

    pub fn with_matrix_world(mut self, matrix_world: Matrix4<f64>) -> Self {
        self.matrix_world = matrix_world;
        self
    }

    /// World position of the object origin.
    pub fn origin(&self) -> Vector3<f64> {
        self.matrix_world.fixed_view::<3, 1>(0, 3).into_owned()
    }

    fn world_vertex(&self, index: usize) -> Option<Vector3<f64>> {
        let v = self.vertices.get(index)?;
        Some(
            self.matrix_world
                .transform_point(&Point3::from(*v))
                .coords,
        )
    }

    /// Nearest intersection of the ray with the mesh, in world space.
    ///
    /// Triangles referencing missing vertices are ignored.
    pub fn ray_cast(&self, origin: &Vector3<f64>, direction: &Vector3<f64>) -> Option<Vector3<f64>> {
        let mut nearest: Option<f64> = None;
        for triangle in &self.triangles {
            let (Some(a), Some(b), Some(c)) = (
                self.world_vertex(triangle[0]),
                self.world_vertex(triangle[1]),
                self.world_vertex(triangle[2]),
            ) else {
                continue;
            };
            if let Some(t) = intersect_triangle(origin, direction, &a, &b, &c) {
                if nearest.map_or(true, |best| t < best) {
                    nearest = Some(t);
                }
            }
        }
        nearest.map(|t| origin + direction * t)
    }

    /// Where the central viewing ray of `camera` meets the model, or the model
    /// origin when it misses.
    pub fn centre_point(&self, camera: &CameraTransform) -> Vector3<f64> {
        self.ray_cast(&camera.location, &camera.view_direction())
            .unwrap_or_else(|| self.origin())
    }
}

/// Moller-Trumbore ray/triangle test. Returns the ray parameter of the hit.
fn intersect_triangle(
    origin: &Vector3<f64>,
    direction: &Vector3<f64>,
    a: &Vector3<f64>,
    b: &Vector3<f64>,
    c: &Vector3<f64>,
) -> Option<f64> {
    const EPS: f64 = 1e-12;

    let edge1 = b - a;
    let edge2 = c - a;
    let p = direction.cross(&edge2);
    let det = edge1.dot(&p);
    if det.abs() < EPS {
        return None;
    }

    let inv_det = 1.0 / det;
    let s = origin - a;
    let u = s.dot(&p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let q = s.cross(&edge1);
    let v = direction.dot(&q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    let t = edge2.dot(&q) * inv_det;
    (t > EPS).then_some(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    /// Unit square in the z = 0 plane, two triangles.
    fn ground_plane() -> TriangleMesh {
        TriangleMesh::new(
            vec![
                Vector3::new(-1.0, -1.0, 0.0),
                Vector3::new(1.0, -1.0, 0.0),
                Vector3::new(1.0, 1.0, 0.0),
                Vector3::new(-1.0, 1.0, 0.0),
            ],
            vec![[0, 1, 2], [0, 2, 3]],
        )
    }

    #[test]
    fn test_ray_hits_plane() {
        let mesh = ground_plane();
        let hit = mesh
            .ray_cast(&Vector3::new(0.25, 0.5, 3.0), &Vector3::new(0.0, 0.0, -1.0))
            .unwrap();
        assert_relative_eq!(hit, Vector3::new(0.25, 0.5, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_ray_misses_and_behind() {
        let mesh = ground_plane();
        assert!(mesh
            .ray_cast(&Vector3::new(5.0, 0.0, 3.0), &Vector3::new(0.0, 0.0, -1.0))
            .is_none());
        assert!(mesh
            .ray_cast(&Vector3::new(0.0, 0.0, 3.0), &Vector3::new(0.0, 0.0, 1.0))
            .is_none());
    }

    #[test]
    fn test_matrix_world_is_applied() {
        let mut matrix = Matrix4::identity();
        matrix[(2, 3)] = -2.0;
        let mesh = ground_plane().with_matrix_world(matrix);

        assert_relative_eq!(mesh.origin(), Vector3::new(0.0, 0.0, -2.0));
        let hit = mesh
            .ray_cast(&Vector3::zeros(), &Vector3::new(0.0, 0.0, -1.0))
            .unwrap();
        assert_relative_eq!(hit, Vector3::new(0.0, 0.0, -2.0), epsilon = 1e-12);
    }

    #[test]
    fn test_centre_point_falls_back_to_origin() {
        let mesh = ground_plane();
        // Host camera at z = 3 looking straight down.
        let looking_down = CameraTransform {
            rotation: Matrix3::identity(),
            location: Vector3::new(0.5, 0.5, 3.0),
        };
        assert_relative_eq!(
            mesh.centre_point(&looking_down),
            Vector3::new(0.5, 0.5, 0.0),
            epsilon = 1e-12
        );

        let looking_up = CameraTransform {
            rotation: Matrix3::from_diagonal(&Vector3::new(1.0, -1.0, -1.0)),
            location: Vector3::new(0.5, 0.5, 3.0),
        };
        assert_eq!(mesh.centre_point(&looking_up), mesh.origin());
    }
}
