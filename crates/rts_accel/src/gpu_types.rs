//! Layouts of the data the ray tracing programs read.
//!
//! All types are `#[repr(C)]` and `Pod` so they can be written to device
//! buffers with `bytemuck`.

use bytemuck::{Pod, Zeroable};
use rts_core::{LightDesc, LightKind, MaterialKey};
use rts_math::{FlyCamera, Mat4, Mat4Ext, Vec3};

/// Per-vertex layout of geometry vertex buffers.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub color: [f32; 4],
}

pub const INSTANCE_FLAG_METALLIC: u32 = 1 << 0;
pub const INSTANCE_FLAG_GLASS: u32 = 1 << 1;

/// Per-instance shading data, indexed by instance id.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct InstanceData {
    pub world: [[f32; 4]; 4],
    pub albedo: [f32; 3],
    pub roughness: f32,
    pub emission: f32,
    pub ior: f32,
    pub id: u32,
    pub material_index: u32,
    pub flags: u32,
    pub _pad: [u32; 3],
}

impl InstanceData {
    pub fn new(id: u32, world: Mat4, material: &MaterialKey, material_index: u32, emission: f32) -> Self {
        let mut flags = 0;
        if material.metallic {
            flags |= INSTANCE_FLAG_METALLIC;
        }
        if material.glass {
            flags |= INSTANCE_FLAG_GLASS;
        }
        Self {
            world: world.to_cols_array_2d(),
            albedo: material.albedo,
            roughness: material.roughness,
            emission,
            ior: material.ior,
            id,
            material_index,
            flags,
            _pad: [0; 3],
        }
    }

    pub fn world_matrix(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.world)
    }
}

pub const INSTANCE_MASK_ALL: u32 = 0xFF;
pub const INSTANCE_FLAG_NONE: u32 = 0;
const LOW_24_BITS: u32 = 0x00FF_FFFF;

/// Top-level instance descriptor, 64 bytes.
///
/// The low 24 bits of `id_and_mask` hold the instance id and the high 8
/// bits the visibility mask. `contribution_and_flags` packs the hit group
/// contribution index the same way.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct InstanceDescriptor {
    pub transform: [f32; 12],
    pub id_and_mask: u32,
    pub contribution_and_flags: u32,
    pub blas_address: u64,
}

impl InstanceDescriptor {
    pub fn new(transform: Mat4, instance_id: u32, contribution: u32, blas_address: u64) -> Self {
        Self {
            transform: transform.to_rows_3x4(),
            id_and_mask: (instance_id & LOW_24_BITS) | (INSTANCE_MASK_ALL << 24),
            contribution_and_flags: (contribution & LOW_24_BITS) | (INSTANCE_FLAG_NONE << 24),
            blas_address,
        }
    }

    pub fn instance_id(&self) -> u32 {
        self.id_and_mask & LOW_24_BITS
    }

    pub fn mask(&self) -> u32 {
        self.id_and_mask >> 24
    }

    pub fn contribution(&self) -> u32 {
        self.contribution_and_flags & LOW_24_BITS
    }

    pub fn transform(&self) -> Mat4 {
        Mat4::from_rows_3x4(&self.transform)
    }
}

pub const LIGHT_POINT: u32 = 0;
pub const LIGHT_DIRECTIONAL: u32 = 1;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct LightData {
    pub position: [f32; 3],
    pub kind: u32,
    pub direction: [f32; 3],
    pub intensity: f32,
    pub color: [f32; 3],
    pub _pad: f32,
}

impl From<&LightDesc> for LightData {
    fn from(light: &LightDesc) -> Self {
        Self {
            position: light.position,
            kind: match light.kind {
                LightKind::Point => LIGHT_POINT,
                LightKind::Directional => LIGHT_DIRECTIONAL,
            },
            direction: light.direction,
            intensity: light.intensity,
            color: light.color,
            _pad: 0.0,
        }
    }
}

/// Per-frame constants bound through the view table.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct SceneConstants {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub inv_view: [[f32; 4]; 4],
    pub inv_projection: [[f32; 4]; 4],
    pub frame_index: u32,
    pub sample_count: u32,
    pub max_recursion_depth: u32,
    pub environment_enabled: u32,
    /// RGB already scaled by intensity; alpha unused.
    pub environment_color: [f32; 4],
}

impl SceneConstants {
    pub fn new(camera: &FlyCamera, aspect: f32) -> Self {
        let view = camera.view_matrix();
        let projection = camera.projection_matrix(aspect);
        Self {
            view: view.to_cols_array_2d(),
            projection: projection.to_cols_array_2d(),
            inv_view: view.inverse().to_cols_array_2d(),
            inv_projection: projection.inverse().to_cols_array_2d(),
            frame_index: 0,
            sample_count: 1,
            max_recursion_depth: 1,
            environment_enabled: 0,
            environment_color: [0.0; 4],
        }
    }

    pub fn with_environment(mut self, color: Vec3) -> Self {
        self.environment_enabled = 1;
        self.environment_color = color.extend(1.0).to_array();
        self
    }

    pub fn inv_view(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.inv_view)
    }

    pub fn inv_projection(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.inv_projection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(std::mem::size_of::<Vertex>(), 40);
        assert_eq!(std::mem::size_of::<InstanceData>(), 112);
        assert_eq!(std::mem::size_of::<InstanceDescriptor>(), 64);
        assert_eq!(std::mem::size_of::<LightData>(), 48);
        assert_eq!(std::mem::size_of::<SceneConstants>() % 16, 0);
    }

    #[test]
    fn test_descriptor_packs_id_and_contribution() {
        let desc = InstanceDescriptor::new(Mat4::IDENTITY, 7, 7, 0x4000);
        assert_eq!(desc.instance_id(), 7);
        assert_eq!(desc.contribution(), 7);
        assert_eq!(desc.mask(), 0xFF);
        assert_eq!(desc.transform(), Mat4::IDENTITY);
    }

    #[test]
    fn test_instance_flags() {
        let material = MaterialKey {
            glass: true,
            ..Default::default()
        };
        let data = InstanceData::new(3, Mat4::IDENTITY, &material, 0, 0.0);
        assert_eq!(data.flags, INSTANCE_FLAG_GLASS);
        assert_eq!(data.id, 3);
        assert_eq!(data.world_matrix(), Mat4::IDENTITY);
    }
}
