//! The shader record table.
//!
//! Three sections in fixed order, each starting on a 64-byte boundary:
//! one ray generation record, one miss record, then one hit group record
//! per instance in id order. Every record is a 32-byte program identifier
//! followed by 8-byte parameters, padded to a common 32-byte-aligned
//! stride so the device can index hit groups as
//! `hit_groups.offset + stride * instance`.

use log::{debug, info};

use crate::device::{
    align_up, BufferUsage, DescriptorHandle, DeviceAddress, DispatchDesc, MemoryLocation,
    ParamKind, PipelineId, RayTracingDevice, ShaderTableRange, SHADER_IDENTIFIER_SIZE,
    SHADER_RECORD_ALIGNMENT, SHADER_TABLE_ALIGNMENT,
};
use crate::error::{AccelError, AccelResult};
use crate::growable::GrowableBuffer;
use crate::layout::{HitParam, MissParam, ParamSlots, RayGenParam, MAX_PARAMS};
use crate::pipeline::{hit_group_name, RayTracingPipeline, ShadingMode, MISS_EXPORT, RAY_GEN_EXPORT};

/// The whole table is rounded up to this size.
const TABLE_SIZE_ALIGNMENT: u64 = 256;

/// Offsets and sizes of the three sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderTableLayout {
    pub entry_size: u64,
    pub ray_generation: ShaderTableRange,
    pub miss: ShaderTableRange,
    pub hit_groups: ShaderTableRange,
    pub total_size: u64,
}

impl ShaderTableLayout {
    pub fn new(hit_group_count: u32) -> Self {
        let entry_size = align_up(
            SHADER_IDENTIFIER_SIZE + 8 * MAX_PARAMS as u64,
            SHADER_RECORD_ALIGNMENT,
        );
        let section = |offset: u64, count: u64| ShaderTableRange {
            offset,
            size: entry_size * count,
            stride: entry_size,
        };
        let ray_generation = section(0, 1);
        let miss = section(align_up(ray_generation.size, SHADER_TABLE_ALIGNMENT), 1);
        let hit_groups = section(
            miss.offset + align_up(miss.size, SHADER_TABLE_ALIGNMENT),
            hit_group_count as u64,
        );
        let end = hit_groups.offset + align_up(hit_groups.size, SHADER_TABLE_ALIGNMENT);
        Self {
            entry_size,
            ray_generation,
            miss,
            hit_groups,
            total_size: align_up(end, TABLE_SIZE_ALIGNMENT),
        }
    }

    pub fn hit_group_count(&self) -> u64 {
        self.hit_groups.size / self.entry_size
    }
}

/// Addresses and handles every record set shares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharedBindings {
    pub view_table: DescriptorHandle,
    pub environment: DescriptorHandle,
    pub sampler: DescriptorHandle,
    pub instance_data: DeviceAddress,
    pub lights: DeviceAddress,
    pub hierarchy: DeviceAddress,
}

/// Geometry addresses of one instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceBindings {
    pub vertex_buffer: DeviceAddress,
    /// Zero for non-indexed geometry.
    pub index_buffer: DeviceAddress,
}

#[derive(Debug)]
pub struct ShaderTable {
    buffer: GrowableBuffer,
    layout: ShaderTableLayout,
    hit_groups: Vec<String>,
    bytes: Vec<u8>,
}

impl Default for ShaderTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderTable {
    pub fn new() -> Self {
        Self {
            buffer: GrowableBuffer::new("shader record table", BufferUsage::ShaderTable, MemoryLocation::CpuToGpu),
            layout: ShaderTableLayout::new(0),
            hit_groups: Vec::new(),
            bytes: Vec::new(),
        }
    }

    /// Rewrite every record for `mode` and upload the table.
    pub fn rebuild<D: RayTracingDevice + ?Sized>(
        &mut self,
        device: &D,
        pipeline: &RayTracingPipeline,
        mode: ShadingMode,
        instances: &[InstanceBindings],
        shared: &SharedBindings,
    ) -> AccelResult<()> {
        let pipeline_id = pipeline
            .id()
            .ok_or_else(|| AccelError::InvalidState("record table built before the pipeline".into()))?;
        let layout = ShaderTableLayout::new(instances.len() as u32);
        let mut bytes = vec![0u8; layout.total_size as usize];
        let mut writer = RecordWriter {
            device,
            pipeline,
            pipeline_id,
            bytes: &mut bytes,
        };

        writer.write::<RayGenParam>(RAY_GEN_EXPORT, layout.ray_generation.offset, |_| shared.view_table.0)?;
        writer.write::<MissParam>(MISS_EXPORT, layout.miss.offset, |slot| match slot {
            MissParam::Environment => shared.environment.0,
            MissParam::Sampler => shared.sampler.0,
        })?;

        let mut hit_groups = Vec::with_capacity(instances.len());
        for (id, instance) in instances.iter().enumerate() {
            let name = hit_group_name(mode, id as u32);
            let offset = layout.hit_groups.offset + layout.entry_size * id as u64;
            writer.write::<HitParam>(&name, offset, |slot| match slot {
                HitParam::VertexBuffer => instance.vertex_buffer,
                HitParam::IndexBuffer => instance.index_buffer,
                HitParam::InstanceData => shared.instance_data,
                HitParam::Lights | HitParam::Auxiliary => shared.lights,
                HitParam::SceneHierarchy => shared.hierarchy,
            })?;
            hit_groups.push(name);
        }

        if self.buffer.ensure(device, layout.total_size)? {
            debug!("Allocated shader record table of {} bytes", self.buffer.capacity());
        }
        // Zero the tail so records from a larger table are not left behind.
        let mut upload = bytes.clone();
        upload.resize(self.buffer.capacity() as usize, 0);
        if let Some(buffer) = self.buffer.buffer() {
            device.write_buffer(buffer, 0, &upload)?;
        }

        info!(
            "Built shader record table: mode {}, {} hit groups, {} bytes",
            mode,
            hit_groups.len(),
            layout.total_size
        );
        self.layout = layout;
        self.hit_groups = hit_groups;
        self.bytes = bytes;
        Ok(())
    }

    pub fn layout(&self) -> &ShaderTableLayout {
        &self.layout
    }

    /// Hit group export names in record order.
    pub fn hit_group_names(&self) -> &[String] {
        &self.hit_groups
    }

    /// Host copy of the last table written.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn dispatch_desc(&self, width: u32, height: u32) -> AccelResult<DispatchDesc> {
        let record_buffer = self
            .buffer
            .buffer()
            .ok_or_else(|| AccelError::InvalidState("dispatch before the record table was built".into()))?;
        Ok(DispatchDesc {
            record_buffer,
            ray_generation: self.layout.ray_generation,
            miss: self.layout.miss,
            hit_groups: self.layout.hit_groups,
            width,
            height,
        })
    }

    pub fn release<D: RayTracingDevice + ?Sized>(&mut self, device: &D) {
        self.buffer.release(device);
        self.hit_groups.clear();
        self.bytes.clear();
    }
}

struct RecordWriter<'a, D: ?Sized> {
    device: &'a D,
    pipeline: &'a RayTracingPipeline,
    pipeline_id: PipelineId,
    bytes: &'a mut Vec<u8>,
}

impl<D: RayTracingDevice + ?Sized> RecordWriter<'_, D> {
    /// Write the record for `export` at `offset`, one parameter per slot of `P`.
    fn write<P: ParamSlots>(&mut self, export: &str, offset: u64, value: impl FnMut(P) -> u64) -> AccelResult<()> {
        let written: Vec<ParamKind> = P::signature();
        let declared = &self
            .pipeline
            .desc()
            .export(export)
            .ok_or_else(|| crate::device::DeviceError::UnknownExport(export.to_string()))?
            .signature;
        if *declared != written {
            return Err(AccelError::RecordSignatureMismatch {
                export: export.to_string(),
                declared: declared.clone(),
                written,
            });
        }

        let identifier = self.device.shader_identifier(self.pipeline_id, export)?;
        let start = offset as usize;
        let id_end = start + SHADER_IDENTIFIER_SIZE as usize;
        self.bytes[start..id_end].copy_from_slice(&identifier.0);
        for (i, param) in P::fill(value).into_iter().enumerate() {
            let at = id_end + 8 * i;
            self.bytes[at..at + 8].copy_from_slice(&param.to_le_bytes());
        }
        Ok(())
    }
}
