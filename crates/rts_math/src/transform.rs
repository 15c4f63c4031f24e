// Transform utilities for Mat4
//
// Euler composition for instance transforms and the row-major 3x4 layout
// consumed by top-level instance descriptors.

use glam::{EulerRot, Mat4, Quat, Vec3, Vec4};
use crate::Aabb;

/// How a `rotation` triple is turned into a rotation matrix.
///
/// `rotation.x` is always pitch (about X), `rotation.y` yaw (about Y) and
/// `rotation.z` roll (about Z), in radians. The order controls which of
/// the three is applied to the geometry first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RotationOrder {
    /// Roll, then pitch, then yaw.
    #[default]
    RollPitchYaw,
    /// Pitch, then yaw, then roll.
    PitchYawRoll,
}

impl RotationOrder {
    pub fn quat(self, rotation: Vec3) -> Quat {
        let (pitch, yaw, roll) = (rotation.x, rotation.y, rotation.z);
        match self {
            RotationOrder::RollPitchYaw => Quat::from_euler(EulerRot::YXZ, yaw, pitch, roll),
            RotationOrder::PitchYawRoll => Quat::from_euler(EulerRot::ZYX, roll, yaw, pitch),
        }
    }
}

/// World matrix applying scale first, then rotation, then translation.
pub fn compose_srt(position: Vec3, rotation: Vec3, scale: Vec3, order: RotationOrder) -> Mat4 {
    Mat4::from_scale_rotation_translation(scale, order.quat(rotation), position)
}

/// Extension trait for Mat4 to provide additional transform utilities
pub trait Mat4Ext {
    /// Transform a vector in 3D space (applies rotation and scale, but NOT translation).
    fn transform_vector3(&self, vector: Vec3) -> Vec3;

    /// Bounds of the 8 transformed corners.
    fn transform_aabb(&self, aabb: &Aabb) -> Aabb;

    /// The top three rows, row-major, as laid out in instance descriptors.
    fn to_rows_3x4(&self) -> [f32; 12];

    fn from_rows_3x4(rows: &[f32; 12]) -> Mat4;
}

impl Mat4Ext for Mat4 {
    fn transform_vector3(&self, vector: Vec3) -> Vec3 {
        let transformed = *self * Vec4::new(vector.x, vector.y, vector.z, 0.0);
        transformed.truncate()
    }

    fn transform_aabb(&self, aabb: &Aabb) -> Aabb {
        if aabb.is_empty() {
            return Aabb::EMPTY;
        }
        let (lo, hi) = (aabb.min(), aabb.max());
        let corners: Vec<Vec3> = (0..8)
            .map(|i| {
                let corner = Vec3::new(
                    if i & 1 == 0 { lo.x } else { hi.x },
                    if i & 2 == 0 { lo.y } else { hi.y },
                    if i & 4 == 0 { lo.z } else { hi.z },
                );
                self.transform_point3(corner)
            })
            .collect();
        Aabb::from_slice(&corners)
    }

    fn to_rows_3x4(&self) -> [f32; 12] {
        let r0 = self.row(0);
        let r1 = self.row(1);
        let r2 = self.row(2);
        [
            r0.x, r0.y, r0.z, r0.w, //
            r1.x, r1.y, r1.z, r1.w, //
            r2.x, r2.y, r2.z, r2.w,
        ]
    }

    fn from_rows_3x4(rows: &[f32; 12]) -> Mat4 {
        Mat4::from_cols(
            Vec4::new(rows[0], rows[4], rows[8], 0.0),
            Vec4::new(rows[1], rows[5], rows[9], 0.0),
            Vec4::new(rows[2], rows[6], rows[10], 0.0),
            Vec4::new(rows[3], rows[7], rows[11], 1.0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn test_transform_vector3_no_translation() {
        let mat = Mat4::from_translation(Vec3::new(10.0, 20.0, 30.0));
        assert_eq!(mat.transform_vector3(Vec3::X), Vec3::X);
    }

    #[test]
    fn test_compose_scales_before_translating() {
        let m = compose_srt(
            Vec3::new(10.0, 0.0, 0.0),
            Vec3::ZERO,
            Vec3::splat(2.0),
            RotationOrder::default(),
        );
        // Scale applies to the local point, translation is not scaled.
        assert_eq!(m.transform_point3(Vec3::X), Vec3::new(12.0, 0.0, 0.0));
    }

    #[test]
    fn test_roll_applies_before_yaw() {
        // roll 90° takes X to Y, yaw 90° then leaves Y alone.
        let m = compose_srt(
            Vec3::ZERO,
            Vec3::new(0.0, FRAC_PI_2, FRAC_PI_2),
            Vec3::ONE,
            RotationOrder::RollPitchYaw,
        );
        let p = m.transform_point3(Vec3::X);
        assert!((p - Vec3::Y).length() < 1e-5, "{p:?}");

        // Pitch-yaw-roll: yaw takes X to -Z and the roll about Z keeps it there.
        let m = compose_srt(
            Vec3::ZERO,
            Vec3::new(0.0, FRAC_PI_2, FRAC_PI_2),
            Vec3::ONE,
            RotationOrder::PitchYawRoll,
        );
        let p = m.transform_point3(Vec3::X);
        assert!((p - Vec3::new(0.0, 0.0, -1.0)).length() < 1e-5, "{p:?}");
    }

    #[test]
    fn test_rows_3x4_round_trip_and_layout() {
        let m = compose_srt(
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::new(0.3, -0.2, 0.9),
            Vec3::new(1.0, 2.0, 0.5),
            RotationOrder::default(),
        );
        let rows = m.to_rows_3x4();
        assert_eq!([rows[3], rows[7], rows[11]], [1.0, 2.0, 3.0]);
        let back = Mat4::from_rows_3x4(&rows);
        assert!(back.abs_diff_eq(m, 1e-6));
    }

    #[test]
    fn test_transform_aabb_translation() {
        let mat = Mat4::from_translation(Vec3::splat(5.0));
        let moved = mat.transform_aabb(&Aabb::from_points(Vec3::ZERO, Vec3::ONE));
        assert!((moved.min() - Vec3::splat(5.0)).length() < 1e-3);
        assert!((moved.max() - Vec3::splat(6.0)).length() < 1e-3);
    }
}
