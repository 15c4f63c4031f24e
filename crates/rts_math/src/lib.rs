//! Math primitives shared by the scene, acceleration and viewer crates.
//!
//! Re-exports glam and adds the small set of types the ray tracing core
//! needs on the host: intervals, bounding boxes, rays, Euler transform
//! composition and a fly camera.

// Re-export glam for convenience
pub use glam::*;

mod aabb;
mod camera;
mod interval;
mod ray;
mod transform;

pub use aabb::Aabb;
pub use camera::{FlyCamera, MovementKeys};
pub use interval::Interval;
pub use ray::Ray;
pub use transform::{compose_srt, Mat4Ext, RotationOrder};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glam_reexport() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(4.0, 5.0, 6.0);
        assert_eq!(a + b, Vec3::new(5.0, 7.0, 9.0));
    }
}
