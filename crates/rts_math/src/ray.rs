use crate::{Mat4, Vec3};

/// A ray in 3D space. The direction is not required to be normalized;
/// hit distances are expressed in units of the direction length.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self { origin, direction }
    }

    /// Get the point along the ray at parameter t.
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Carry the ray into another space. Distances stay comparable because
    /// the direction is not renormalized.
    pub fn transformed(&self, m: &Mat4) -> Ray {
        Ray::new(m.transform_point3(self.origin), m.transform_vector3(self.direction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ray_at() {
        let ray = Ray::new(Vec3::ZERO, Vec3::X);
        assert_eq!(ray.at(2.0), Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(ray.at(-1.0), Vec3::new(-1.0, 0.0, 0.0));
    }

    #[test]
    fn test_transformed_ray_keeps_parameterisation() {
        let world = Ray::new(Vec3::new(0.0, 0.0, -5.0), Vec3::Z);
        let m = Mat4::from_scale(Vec3::splat(2.0)).inverse();
        let local = world.transformed(&m);
        // The same t lands on corresponding points in both spaces.
        let back = m.inverse().transform_point3(local.at(3.0));
        assert!((back - world.at(3.0)).length() < 1e-5);
    }
}
