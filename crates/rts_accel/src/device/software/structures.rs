//! Bottom- and top-level acceleration structures of the software device.
//!
//! Structures are keyed by their result buffer. A bottom-level structure
//! copies the triangles it was built from; a top-level structure copies
//! the instance descriptors and resolves their bottom-level addresses at
//! build time.

use rts_math::{Aabb, Interval, Mat4, Mat4Ext, Ray, Vec3};

use crate::device::{
    BufferId, BuildSizes, DeviceAddress, DeviceError, DeviceResult, TriangleGeometry,
};
use crate::gpu_types::InstanceDescriptor;

use super::bvh::BvhNode;
use super::memory::Memory;

const INSTANCE_DESCRIPTOR_SIZE: u64 = std::mem::size_of::<InstanceDescriptor>() as u64;

pub(crate) fn bottom_level_sizes(geometries: &[TriangleGeometry]) -> BuildSizes {
    let triangles: u64 = geometries.iter().map(|g| g.triangle_count() as u64).sum();
    BuildSizes {
        scratch: 256 + triangles * 32,
        result: 256 + triangles * 64,
    }
}

pub(crate) fn top_level_sizes(instance_count: u32) -> BuildSizes {
    let n = instance_count as u64;
    BuildSizes {
        scratch: 256 + n * 64,
        result: 256 + n * 128,
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Triangle {
    pub vertices: [Vec3; 3],
    pub geometry_index: u32,
    pub primitive_index: u32,
}

pub(crate) struct BottomLevel {
    pub triangles: Vec<Triangle>,
    pub bvh: BvhNode,
    pub bounds: Aabb,
}

pub(crate) struct TopLevelInstance {
    pub descriptor: InstanceDescriptor,
    pub blas: BufferId,
    pub world_to_object: Mat4,
    pub world_bounds: Aabb,
}

pub(crate) struct TopLevel {
    pub instances: Vec<TopLevelInstance>,
    pub bvh: BvhNode,
    pub allow_update: bool,
}

pub(crate) enum Structure {
    Bottom(BottomLevel),
    Top(TopLevel),
}

/// Closest intersection of a ray with the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TraceHit {
    pub t: f32,
    /// Position of the instance in the top-level structure.
    pub instance_index: u32,
    pub instance_id: u32,
    pub contribution: u32,
    pub geometry_index: u32,
    pub primitive_index: u32,
    pub barycentrics: [f32; 2],
    /// Geometric normal in world space, facing the ray origin.
    pub world_normal: Vec3,
}

fn read_positions(memory: &Memory, geometry: &TriangleGeometry) -> DeviceResult<Vec<Vec3>> {
    let stride = geometry.vertex_stride as u64;
    let bytes = memory.read_at(geometry.vertex_buffer, stride * geometry.vertex_count as u64)?;
    Ok(bytes
        .chunks_exact(stride as usize)
        .map(|v| Vec3::from_array(bytemuck::pod_read_unaligned::<[f32; 3]>(&v[..12])))
        .collect())
}

fn read_indices(memory: &Memory, address: DeviceAddress, count: u32) -> DeviceResult<Vec<u32>> {
    let bytes = memory.read_at(address, count as u64 * 4)?;
    Ok(bytes
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned::<u32>)
        .collect())
}

pub(crate) fn build_bottom_level(
    memory: &mut Memory,
    geometries: &[TriangleGeometry],
    scratch: BufferId,
    result: BufferId,
) -> DeviceResult<()> {
    let sizes = bottom_level_sizes(geometries);
    memory.check_size(scratch, sizes.scratch, "bottom-level scratch")?;
    memory.check_size(result, sizes.result, "bottom-level result")?;

    let mut triangles = Vec::new();
    for (geometry_index, geometry) in geometries.iter().enumerate() {
        let positions = read_positions(memory, geometry)?;
        let indices = match geometry.index_buffer {
            Some(address) => read_indices(memory, address, geometry.index_count)?,
            None => (0..positions.len() as u32).collect(),
        };
        for (primitive_index, tri) in indices.chunks_exact(3).enumerate() {
            let fetch = |i: u32| {
                positions
                    .get(i as usize)
                    .copied()
                    .ok_or(DeviceError::OutOfBounds {
                        label: "vertex buffer".into(),
                        offset: i as u64 * geometry.vertex_stride as u64,
                        len: geometry.vertex_stride as u64,
                        size: positions.len() as u64 * geometry.vertex_stride as u64,
                    })
            };
            triangles.push(Triangle {
                vertices: [fetch(tri[0])?, fetch(tri[1])?, fetch(tri[2])?],
                geometry_index: geometry_index as u32,
                primitive_index: primitive_index as u32,
            });
        }
    }

    let bounds: Vec<Aabb> = triangles.iter().map(|t| Aabb::from_slice(&t.vertices)).collect();
    let bvh = BvhNode::build(&bounds);
    let structure = BottomLevel {
        bounds: bvh.bbox(),
        triangles,
        bvh,
    };
    memory.structures.insert(result, Structure::Bottom(structure));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn build_top_level(
    memory: &mut Memory,
    instances: BufferId,
    instance_count: u32,
    scratch: BufferId,
    result: BufferId,
    source: Option<BufferId>,
    allow_update: bool,
) -> DeviceResult<()> {
    let sizes = top_level_sizes(instance_count);
    memory.check_size(scratch, sizes.scratch, "top-level scratch")?;
    memory.check_size(result, sizes.result, "top-level result")?;
    memory.check_size(
        instances,
        instance_count as u64 * INSTANCE_DESCRIPTOR_SIZE,
        "instance descriptor",
    )?;

    let address = memory.buffer(instances)?.address;
    let mut entries = Vec::with_capacity(instance_count as usize);
    for i in 0..instance_count as u64 {
        let descriptor: InstanceDescriptor = memory.read_pod(address + i * INSTANCE_DESCRIPTOR_SIZE)?;
        let (blas, offset) = memory.resolve(descriptor.blas_address)?;
        let blas_bounds = match memory.structures.get(&blas) {
            Some(Structure::Bottom(b)) if offset == 0 => b.bounds,
            _ => return Err(DeviceError::InvalidAddress(descriptor.blas_address)),
        };
        let object_to_world = descriptor.transform();
        entries.push(TopLevelInstance {
            descriptor,
            blas,
            world_to_object: object_to_world.inverse(),
            world_bounds: object_to_world.transform_aabb(&blas_bounds),
        });
    }
    let bounds: Vec<Aabb> = entries.iter().map(|e| e.world_bounds).collect();

    let bvh = match source {
        None => BvhNode::build(&bounds),
        Some(source) => {
            let previous = match memory.structures.get(&source) {
                Some(Structure::Top(top)) => top,
                _ => return Err(DeviceError::InvalidRefit("source is not a top-level structure".into())),
            };
            if !previous.allow_update {
                return Err(DeviceError::InvalidRefit("source was built without allow_update".into()));
            }
            if previous.instances.len() != entries.len() {
                return Err(DeviceError::InvalidRefit(format!(
                    "instance count changed from {} to {}",
                    previous.instances.len(),
                    entries.len()
                )));
            }
            let mut bvh = previous.bvh.clone();
            bvh.refit(&bounds);
            bvh
        }
    };

    memory.structures.insert(
        result,
        Structure::Top(TopLevel {
            instances: entries,
            bvh,
            allow_update,
        }),
    );
    Ok(())
}

/// Möller–Trumbore. Returns distance and barycentrics.
fn intersect_triangle(v: &[Vec3; 3], ray: &Ray, ray_t: Interval) -> Option<(f32, [f32; 2])> {
    let edge1 = v[1] - v[0];
    let edge2 = v[2] - v[0];
    let h = ray.direction.cross(edge2);
    let a = edge1.dot(h);
    if a.abs() < 1e-12 {
        return None;
    }
    let f = 1.0 / a;
    let s = ray.origin - v[0];
    let u = f * s.dot(h);
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(edge1);
    let w = f * ray.direction.dot(q);
    if w < 0.0 || u + w > 1.0 {
        return None;
    }
    let t = f * edge2.dot(q);
    ray_t.surrounds(t).then_some((t, [u, w]))
}

/// Closest hit against the top-level structure at `tlas`.
pub(crate) fn trace(
    memory: &Memory,
    tlas: DeviceAddress,
    ray: &Ray,
    ray_t: Interval,
) -> DeviceResult<Option<TraceHit>> {
    let (tlas_buffer, _) = memory.resolve(tlas)?;
    let top = match memory.structures.get(&tlas_buffer) {
        Some(Structure::Top(top)) => top,
        _ => return Err(DeviceError::InvalidAddress(tlas)),
    };

    let mut bottoms = Vec::with_capacity(top.instances.len());
    for instance in &top.instances {
        match memory.structures.get(&instance.blas) {
            Some(Structure::Bottom(b)) => bottoms.push(b),
            _ => return Err(DeviceError::InvalidAddress(instance.descriptor.blas_address)),
        }
    }

    let hit = top.bvh.closest_hit(ray, ray_t, &mut |i, interval| {
        let instance = &top.instances[i as usize];
        let local = ray.transformed(&instance.world_to_object);
        let blas = bottoms[i as usize];
        blas.bvh
            .closest_hit(&local, interval, &mut |p, tri_t| {
                let tri = &blas.triangles[p as usize];
                intersect_triangle(&tri.vertices, &local, tri_t).map(|(t, bary)| (t, (t, p, bary)))
            })
            .map(|(t, p, barycentrics)| {
                // `local` keeps the world ray's parameterisation, so t is a world distance.
                let tri = &blas.triangles[p as usize];
                let object_normal =
                    (tri.vertices[1] - tri.vertices[0]).cross(tri.vertices[2] - tri.vertices[0]);
                let mut world_normal = instance
                    .world_to_object
                    .transpose()
                    .transform_vector3(object_normal)
                    .normalize_or_zero();
                if world_normal.dot(ray.direction) > 0.0 {
                    world_normal = -world_normal;
                }
                (
                    t,
                    TraceHit {
                        t,
                        instance_index: i,
                        instance_id: instance.descriptor.instance_id(),
                        contribution: instance.descriptor.contribution(),
                        geometry_index: tri.geometry_index,
                        primitive_index: tri.primitive_index,
                        barycentrics,
                        world_normal,
                    },
                )
            })
    });
    Ok(hit)
}
