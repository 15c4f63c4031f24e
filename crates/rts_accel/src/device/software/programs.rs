//! Shader programs of the software device and the ray dispatch that runs
//! them.
//!
//! Dispatch walks the shader record buffer the way hardware does: the
//! ray generation record names the view table, escaping rays run the first
//! miss record, and a hit on instance `i` runs the hit group record at
//! `hit_groups.offset + stride * (contribution(i) + geometry index)`.
//! Each program finds its inputs by looking up its registers in the
//! export's signature and reading the matching 8-byte record parameter.

use rayon::prelude::*;
use rts_math::{Interval, Ray, Vec3, Vec4};

use crate::device::{
    DescriptorHandle, DeviceAddress, DeviceError, DeviceResult, DispatchDesc, ExportKind, ImageId,
    ParamKind, PipelineExport, PipelineId, ResourceView, ShaderIdentifier, ShaderTableRange,
    SHADER_IDENTIFIER_SIZE, SHADER_RECORD_ALIGNMENT, SHADER_TABLE_ALIGNMENT,
};
use crate::gpu_types::{InstanceData, LightData, SceneConstants, Vertex, LIGHT_DIRECTIONAL};

use super::memory::Memory;
use super::structures::{trace, TraceHit};

pub(crate) const RAY_GEN_PROGRAM: &str = "RayGen";
pub(crate) const MISS_PROGRAM: &str = "Miss";

/// Programs compiled into the device's shader library.
pub(crate) const PROGRAM_LIBRARY: &[&str] = &[
    RAY_GEN_PROGRAM,
    MISS_PROGRAM,
    "ClosestHit_Flat",
    "ClosestHit_Normal",
    "ClosestHit_Phong",
    "ClosestHit_MirrorDemo",
];

const IDENTIFIER_MAGIC: &[u8; 4] = b"RTSP";
const T_MIN: f32 = 1e-3;
const T_MAX: f32 = 1e4;

pub(crate) fn encode_identifier(pipeline: PipelineId, export_index: u32) -> ShaderIdentifier {
    let mut bytes = [0u8; SHADER_IDENTIFIER_SIZE as usize];
    bytes[..8].copy_from_slice(&pipeline.0.to_le_bytes());
    bytes[8..12].copy_from_slice(&export_index.to_le_bytes());
    bytes[12..16].copy_from_slice(IDENTIFIER_MAGIC);
    ShaderIdentifier(bytes)
}

/// A decoded shader record: the export it runs and its raw parameters.
struct Record<'a> {
    export: &'a PipelineExport,
    params: Vec<u64>,
}

impl Record<'_> {
    fn param(&self, kind: ParamKind) -> DeviceResult<u64> {
        self.export
            .signature
            .iter()
            .position(|&k| k == kind)
            .map(|i| self.params[i])
            .ok_or_else(|| DeviceError::MissingParameter {
                program: self.program().to_string(),
                param: kind,
            })
    }

    fn program(&self) -> &str {
        match &self.export.kind {
            ExportKind::HitGroup { closest_hit } => closest_hit,
            _ => &self.export.name,
        }
    }
}

/// What a traced ray reports back to its caller.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Payload {
    color: Vec3,
    normal: Vec3,
    roughness: f32,
    depth: f32,
    albedo: Vec3,
}

impl Payload {
    fn background(color: Vec3) -> Self {
        Self {
            color,
            normal: Vec3::ZERO,
            roughness: 0.0,
            depth: 0.0,
            albedo: color,
        }
    }
}

struct Dispatch<'a> {
    memory: &'a Memory,
    records: &'a [u8],
    desc: &'a DispatchDesc,
    constants: SceneConstants,
}

impl<'a> Dispatch<'a> {
    fn record(&self, offset: u64) -> DeviceResult<Record<'a>> {
        let invalid = |reason: &str| DeviceError::InvalidRecord {
            offset,
            reason: reason.to_string(),
        };
        let head = self
            .records
            .get(offset as usize..(offset + SHADER_IDENTIFIER_SIZE) as usize)
            .ok_or_else(|| invalid("identifier past end of buffer"))?;
        if &head[12..16] != IDENTIFIER_MAGIC {
            return Err(invalid("no shader identifier"));
        }
        let pipeline = PipelineId(u64::from_le_bytes(head[..8].try_into().unwrap_or_default()));
        let index = u32::from_le_bytes(head[8..12].try_into().unwrap_or_default());
        let export = self
            .memory
            .pipeline(pipeline)?
            .exports
            .get(index as usize)
            .ok_or_else(|| invalid("identifier names no export"))?;

        let start = (offset + SHADER_IDENTIFIER_SIZE) as usize;
        let end = start + export.signature.len() * 8;
        let params = self
            .records
            .get(start..end)
            .ok_or_else(|| invalid("parameters past end of buffer"))?
            .chunks_exact(8)
            .map(bytemuck::pod_read_unaligned::<u64>)
            .collect();
        Ok(Record { export, params })
    }

    fn view(&self, handle: DescriptorHandle, slot_offset: u32) -> DeviceResult<ResourceView> {
        let (table, base) = self
            .memory
            .resolve_descriptor(handle)
            .ok_or(DeviceError::InvalidAddress(handle.0))?;
        let slot = base + slot_offset;
        table
            .slots
            .get(slot as usize)
            .copied()
            .flatten()
            .ok_or_else(|| DeviceError::ViewMismatch {
                slot,
                reason: "slot is empty or out of range".into(),
            })
    }

    fn trace_ray(&self, tlas: DeviceAddress, ray: &Ray, depth: u32) -> DeviceResult<Payload> {
        let hit = if tlas == 0 {
            None
        } else {
            trace(self.memory, tlas, ray, Interval::new(T_MIN, T_MAX))?
        };
        match hit {
            None => self.run_miss(ray),
            Some(hit) => self.run_hit(ray, &hit, depth),
        }
    }

    fn run_miss(&self, ray: &Ray) -> DeviceResult<Payload> {
        let record = self.record(self.desc.miss.offset)?;
        let environment = DescriptorHandle(record.param(ParamKind::DescriptorTable)?);
        let sampler = DescriptorHandle(record.param(ParamKind::SamplerTable)?);

        if !environment.is_null() {
            if !self.memory.samplers.contains(&sampler) {
                return Err(DeviceError::InvalidAddress(sampler.0));
            }
            return match self.view(environment, 0)? {
                ResourceView::SampledImage(image) => {
                    let texture = &self.memory.image(image)?.texture;
                    Ok(Payload::background(texture.sample_direction(ray.direction)))
                }
                other => Err(DeviceError::ViewMismatch {
                    slot: 0,
                    reason: format!("miss environment view is {other:?}"),
                }),
            };
        }
        let c = &self.constants;
        let color = if c.environment_enabled != 0 {
            Vec4::from_array(c.environment_color).truncate()
        } else {
            Vec3::ZERO
        };
        Ok(Payload::background(color))
    }

    fn run_hit(&self, ray: &Ray, hit: &TraceHit, depth: u32) -> DeviceResult<Payload> {
        let range = self.desc.hit_groups;
        let count = if range.stride == 0 { 0 } else { range.size / range.stride };
        let index = hit.contribution as u64 + hit.geometry_index as u64;
        if index >= count {
            return Err(DeviceError::RecordOutOfRange { index, count });
        }
        let record = self.record(range.offset + range.stride * index)?;
        if !matches!(record.export.kind, ExportKind::HitGroup { .. }) {
            return Err(DeviceError::InvalidRecord {
                offset: range.offset + range.stride * index,
                reason: format!("{} is not a hit group", record.export.name),
            });
        }

        let instance: InstanceData = self.memory.read_pod(
            record.param(ParamKind::ShaderResource(2))?
                + hit.instance_id as u64 * std::mem::size_of::<InstanceData>() as u64,
        )?;
        let albedo = Vec3::from_array(instance.albedo);
        let mut payload = Payload {
            color: albedo,
            normal: hit.world_normal,
            roughness: instance.roughness,
            depth: hit.t,
            albedo,
        };

        match record.program() {
            "ClosestHit_Flat" => {}
            "ClosestHit_Normal" => {
                let normal = self.shading_normal(&record, hit, &instance)?;
                payload.normal = normal;
                payload.color = normal * 0.5 + Vec3::splat(0.5);
            }
            "ClosestHit_Phong" => {
                let light: LightData = self.memory.read_pod(record.param(ParamKind::ConstantBuffer(1))?)?;
                let point = ray.at(hit.t);
                let to_light = if light.kind == LIGHT_DIRECTIONAL {
                    -Vec3::from_array(light.direction)
                } else {
                    Vec3::from_array(light.position) - point
                }
                .normalize_or_zero();
                let diffuse = hit.world_normal.dot(to_light).max(0.0);
                let radiance = Vec3::from_array(light.color) * light.intensity;
                payload.color = albedo * (Vec3::splat(0.1) + radiance * diffuse) + albedo * instance.emission;
            }
            "ClosestHit_MirrorDemo" => {
                if depth + 1 < self.constants.max_recursion_depth {
                    let tlas = record.param(ParamKind::ShaderResource(3))?;
                    let d = ray.direction.normalize_or_zero();
                    let n = hit.world_normal;
                    let reflected = Ray::new(ray.at(hit.t) + n * T_MIN, d - 2.0 * d.dot(n) * n);
                    let bounce = self.trace_ray(tlas, &reflected, depth + 1)?;
                    payload.color = bounce.color * 0.8 + albedo * 0.2;
                }
            }
            other => return Err(DeviceError::UnknownProgram(other.to_string())),
        }
        Ok(payload)
    }

    /// Interpolated vertex normal in world space.
    fn shading_normal(&self, record: &Record, hit: &TraceHit, instance: &InstanceData) -> DeviceResult<Vec3> {
        let vertices = record.param(ParamKind::ShaderResource(0))?;
        let indices = record.param(ParamKind::ShaderResource(1))?;
        let p = hit.primitive_index as u64;
        let corner = |k: u64| -> DeviceResult<u64> {
            if indices == 0 {
                Ok(3 * p + k)
            } else {
                Ok(self.memory.read_pod::<u32>(indices + (3 * p + k) * 4)? as u64)
            }
        };
        let stride = std::mem::size_of::<Vertex>() as u64;
        let mut normal = Vec3::ZERO;
        let [u, v] = hit.barycentrics;
        for (k, weight) in [(0, 1.0 - u - v), (1, u), (2, v)] {
            let vertex: Vertex = self.memory.read_pod(vertices + corner(k)? * stride)?;
            normal += Vec3::from_array(vertex.normal) * weight;
        }
        let world = instance.world_matrix();
        let mut n = world.inverse().transpose().transform_vector3(normal).normalize_or_zero();
        if n.dot(hit.world_normal) < 0.0 {
            n = -n;
        }
        Ok(n)
    }

    fn primary_ray(&self, x: u32, y: u32) -> Ray {
        let dims = rts_math::Vec2::new(self.desc.width as f32, self.desc.height as f32);
        let d = (rts_math::Vec2::new(x as f32, y as f32) + 0.5) / dims * 2.0 - 1.0;
        let inv_view = self.constants.inv_view();
        let origin = inv_view.transform_point3(Vec3::ZERO);
        let target = self.constants.inv_projection() * Vec4::new(d.x, -d.y, 1.0, 1.0);
        let direction = inv_view
            .transform_vector3(target.truncate() / target.w)
            .normalize_or_zero();
        Ray::new(origin, direction)
    }
}

fn check_range(name: &str, range: &ShaderTableRange, buffer_len: u64) -> DeviceResult<()> {
    if range.offset % SHADER_TABLE_ALIGNMENT != 0 {
        return Err(DeviceError::Misaligned(format!(
            "{name} section starts at {} (needs {SHADER_TABLE_ALIGNMENT})",
            range.offset
        )));
    }
    if range.stride % SHADER_RECORD_ALIGNMENT != 0 {
        return Err(DeviceError::Misaligned(format!(
            "{name} stride {} (needs {SHADER_RECORD_ALIGNMENT})",
            range.stride
        )));
    }
    if range.offset + range.size > buffer_len {
        return Err(DeviceError::OutOfBounds {
            label: format!("{name} shader table"),
            offset: range.offset,
            len: range.size,
            size: buffer_len,
        });
    }
    Ok(())
}

/// Run a ray dispatch and return the pixels to store in each output image.
pub(crate) fn dispatch_rays(memory: &Memory, desc: &DispatchDesc) -> DeviceResult<Vec<(ImageId, Vec<[f32; 4]>)>> {
    let records = &memory.buffer(desc.record_buffer)?.data;
    let len = records.len() as u64;
    check_range("ray generation", &desc.ray_generation, len)?;
    check_range("miss", &desc.miss, len)?;
    check_range("hit group", &desc.hit_groups, len)?;

    let mut dispatch = Dispatch {
        memory,
        records,
        desc,
        constants: bytemuck::Zeroable::zeroed(),
    };

    // Ray generation reads the view table: outputs, hierarchy, constants.
    let ray_gen = dispatch.record(desc.ray_generation.offset)?;
    if ray_gen.export.kind != ExportKind::RayGeneration {
        return Err(DeviceError::InvalidRecord {
            offset: desc.ray_generation.offset,
            reason: format!("{} is not a ray generation export", ray_gen.export.name),
        });
    }
    let table = DescriptorHandle(ray_gen.param(ParamKind::DescriptorTable)?);

    let mut outputs = Vec::new();
    let mut slot = 0;
    while let ResourceView::StorageImage(image) = dispatch.view(table, slot)? {
        outputs.push(image);
        slot += 1;
    }
    if outputs.is_empty() {
        return Err(DeviceError::ViewMismatch {
            slot: 0,
            reason: "expected the output image first".into(),
        });
    }
    let tlas = match dispatch.view(table, slot)? {
        ResourceView::AccelerationStructure(address) => address,
        other => {
            return Err(DeviceError::ViewMismatch {
                slot,
                reason: format!("expected the scene hierarchy, found {other:?}"),
            })
        }
    };
    dispatch.constants = match dispatch.view(table, slot + 1)? {
        ResourceView::ConstantBuffer { address, size } if size >= std::mem::size_of::<SceneConstants>() as u64 => {
            memory.read_pod(address)?
        }
        other => {
            return Err(DeviceError::ViewMismatch {
                slot: slot + 1,
                reason: format!("expected the scene constants, found {other:?}"),
            })
        }
    };

    let (width, height) = (desc.width, desc.height);
    let rows: Vec<Vec<Payload>> = (0..height)
        .into_par_iter()
        .map(|y| {
            (0..width)
                .map(|x| dispatch.trace_ray(tlas, &dispatch.primary_ray(x, y), 0))
                .collect::<DeviceResult<Vec<_>>>()
        })
        .collect::<DeviceResult<Vec<_>>>()?;
    let payloads: Vec<Payload> = rows.into_iter().flatten().collect();

    let results = outputs
        .iter()
        .enumerate()
        .map(|(k, &image)| {
            let pixels = payloads
                .iter()
                .map(|p| match k {
                    0 => p.color.extend(1.0).to_array(),
                    1 => p.normal.extend(p.roughness).to_array(),
                    2 => [p.depth, p.depth, p.depth, 1.0],
                    3 => p.albedo.extend(1.0).to_array(),
                    _ => [0.0; 4],
                })
                .collect();
            (image, pixels)
        })
        .collect();
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_encoding() {
        let id = encode_identifier(PipelineId(42), 7);
        assert_eq!(&id.0[..8], &42u64.to_le_bytes());
        assert_eq!(&id.0[8..12], &7u32.to_le_bytes());
        assert_eq!(&id.0[12..16], IDENTIFIER_MAGIC);
        assert!(id.0[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_misaligned_section_is_rejected() {
        let range = ShaderTableRange {
            offset: 40,
            size: 64,
            stride: 64,
        };
        assert!(matches!(check_range("miss", &range, 256), Err(DeviceError::Misaligned(_))));
        let range = ShaderTableRange {
            offset: 64,
            size: 64,
            stride: 48,
        };
        assert!(matches!(check_range("hit", &range, 256), Err(DeviceError::Misaligned(_))));
        let range = ShaderTableRange {
            offset: 192,
            size: 128,
            stride: 64,
        };
        assert!(matches!(check_range("hit", &range, 256), Err(DeviceError::OutOfBounds { .. })));
    }
}
