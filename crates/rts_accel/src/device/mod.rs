//! Device abstraction.
//!
//! `RayTracingDevice` is the seam between the scene manager and whatever
//! executes ray tracing work. It exposes exactly what the manager needs:
//! linear buffers in one flat address space, storage images, shader-visible
//! view tables, pipelines with per-export shader identifiers, and a single
//! command queue signalling a monotonically increasing completion fence.
//!
//! All methods take `&self`; implementations synchronise internally.

pub mod software;

use std::fmt;

use thiserror::Error;

pub use software::SoftwareDevice;

/// Byte address of a location inside a device buffer.
pub type DeviceAddress = u64;

/// Value of the queue's completion fence.
pub type FenceValue = u64;

/// Size of a shader identifier in a shader record.
pub const SHADER_IDENTIFIER_SIZE: u64 = 32;
/// Every shader record starts on this boundary.
pub const SHADER_RECORD_ALIGNMENT: u64 = 32;
/// Every shader table section starts on this boundary.
pub const SHADER_TABLE_ALIGNMENT: u64 = 64;
/// Acceleration structure buffers start on this boundary.
pub const ACCELERATION_STRUCTURE_ALIGNMENT: u64 = 256;
/// Constant buffer views cover multiples of this size.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// Round `value` up to the next multiple of `alignment` (a power of two).
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

handle_type!(
    /// A linear device buffer.
    BufferId
);
handle_type!(
    /// A 2D RGBA32F image.
    ImageId
);
handle_type!(
    /// A shader-visible resource view table.
    ViewTableId
);
handle_type!(
    /// A ray tracing pipeline.
    PipelineId
);

/// Shader-visible descriptor handle. Zero is the null handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DescriptorHandle(pub u64);

impl DescriptorHandle {
    pub const NULL: DescriptorHandle = DescriptorHandle(0);

    pub fn offset(self, slots: u32, increment: u32) -> DescriptorHandle {
        DescriptorHandle(self.0 + slots as u64 * increment as u64)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Opaque program identifier copied into the head of every shader record.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderIdentifier(pub [u8; SHADER_IDENTIFIER_SIZE as usize]);

impl fmt::Debug for ShaderIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShaderIdentifier(")?;
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Where a buffer lives and who writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Device-local, written only by device commands.
    GpuOnly,
    /// Host-writable, read by the device.
    CpuToGpu,
    /// Device-written, read back by the host.
    GpuToCpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex,
    Index,
    Storage,
    Constant,
    InstanceDescriptors,
    AccelerationScratch,
    AccelerationStructure,
    ShaderTable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
}

impl BufferDesc {
    pub fn new(label: impl Into<String>, size: u64, usage: BufferUsage, location: MemoryLocation) -> Self {
        Self {
            label: label.into(),
            size,
            usage,
            location,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
}

/// Memory a build needs, as reported before allocating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub scratch: u64,
    pub result: u64,
}

/// One triangle geometry of a bottom-level build.
///
/// `index_buffer: None` builds a plain triangle list from the vertices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_buffer: DeviceAddress,
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub index_buffer: Option<DeviceAddress>,
    pub index_count: u32,
}

impl TriangleGeometry {
    pub fn triangle_count(&self) -> u32 {
        match self.index_buffer {
            Some(_) => self.index_count / 3,
            None => self.vertex_count / 3,
        }
    }
}

/// Typed view written into a view table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceView {
    /// Read-write image.
    StorageImage(ImageId),
    /// Top-level hierarchy at the given result address. Zero means no scene yet.
    AccelerationStructure(DeviceAddress),
    ConstantBuffer { address: DeviceAddress, size: u64 },
    /// Read-only array of `element_count` elements of `stride` bytes.
    StructuredBuffer { buffer: BufferId, element_count: u32, stride: u32 },
    /// Read-only image sampled by shaders.
    SampledImage(ImageId),
}

/// One parameter of a program's local signature. Each occupies 8 bytes
/// in the shader record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Start handle of a view table range.
    DescriptorTable,
    /// Sampler table handle.
    SamplerTable,
    /// Root shader resource view at register `t{n}`.
    ShaderResource(u32),
    /// Root constant buffer view at register `b{n}`.
    ConstantBuffer(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportKind {
    RayGeneration,
    Miss,
    /// A triangle hit group running the named closest-hit program.
    HitGroup { closest_hit: String },
}

/// A named entry of a pipeline that shader records can point at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineExport {
    pub name: String,
    pub kind: ExportKind,
    /// For ray generation and miss exports, the program of the same name is used.
    pub signature: Vec<ParamKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PipelineDesc {
    pub exports: Vec<PipelineExport>,
    pub max_recursion_depth: u32,
}

impl PipelineDesc {
    pub fn export(&self, name: &str) -> Option<&PipelineExport> {
        self.exports.iter().find(|e| e.name == name)
    }
}

/// A window of the shader record buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderTableRange {
    pub offset: u64,
    pub size: u64,
    pub stride: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchDesc {
    pub record_buffer: BufferId,
    pub ray_generation: ShaderTableRange,
    pub miss: ShaderTableRange,
    pub hit_groups: ShaderTableRange,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BuildBottomLevel {
        geometries: Vec<TriangleGeometry>,
        scratch: BufferId,
        result: BufferId,
    },
    /// Full build, or refit when `source` names the previous result.
    BuildTopLevel {
        instances: BufferId,
        instance_count: u32,
        scratch: BufferId,
        result: BufferId,
        source: Option<BufferId>,
        allow_update: bool,
    },
    DispatchRays(DispatchDesc),
}

/// Commands recorded on the host and executed in order by one submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandList {
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

/// Errors reported by a device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("out of device memory allocating {label} ({size} bytes)")]
    OutOfMemory { label: String, size: u64 },

    #[error("unknown buffer {0:?}")]
    UnknownBuffer(BufferId),

    #[error("unknown image {0:?}")]
    UnknownImage(ImageId),

    #[error("unknown view table {0:?}")]
    UnknownViewTable(ViewTableId),

    #[error("unknown pipeline {0:?}")]
    UnknownPipeline(PipelineId),

    #[error("pipeline has no export named {0}")]
    UnknownExport(String),

    #[error("no shader program named {0} in the library")]
    UnknownProgram(String),

    #[error("address {0:#x} is not backed by a buffer")]
    InvalidAddress(DeviceAddress),

    #[error("access of {len} bytes at offset {offset} overruns {label} ({size} bytes)")]
    OutOfBounds { label: String, offset: u64, len: u64, size: u64 },

    #[error("{what} buffer too small: {provided} < {required} bytes")]
    BufferTooSmall { what: &'static str, provided: u64, required: u64 },

    #[error("invalid refit: {0}")]
    InvalidRefit(String),

    #[error("misaligned shader table: {0}")]
    Misaligned(String),

    #[error("slot {slot} out of range for view table of {count}")]
    SlotOutOfRange { slot: u32, count: u32 },

    #[error("view table slot {slot}: {reason}")]
    ViewMismatch { slot: u32, reason: String },

    #[error("invalid shader record at offset {offset}: {reason}")]
    InvalidRecord { offset: u64, reason: String },

    #[error("program {program} reads {param:?} but its signature does not declare it")]
    MissingParameter { program: String, param: ParamKind },

    #[error("shader record {index} outside table of {count} records")]
    RecordOutOfRange { index: u64, count: u64 },

    #[error("pixel data length {provided} does not match image size {expected}")]
    ImageSizeMismatch { provided: usize, expected: usize },

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("hardware ray tracing is not supported by this device")]
    RayTracingUnsupported,
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Everything the scene manager needs from a ray tracing device.
pub trait RayTracingDevice: Send + Sync {
    fn supports_ray_tracing(&self) -> bool;

    // Buffers
    fn create_buffer(&self, desc: &BufferDesc) -> DeviceResult<BufferId>;
    fn destroy_buffer(&self, buffer: BufferId);
    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()>;
    fn read_buffer(&self, buffer: BufferId) -> DeviceResult<Vec<u8>>;
    fn buffer_address(&self, buffer: BufferId) -> DeviceResult<DeviceAddress>;
    fn buffer_size(&self, buffer: BufferId) -> DeviceResult<u64>;

    // Images and samplers
    fn create_image(&self, desc: &ImageDesc) -> DeviceResult<ImageId>;
    fn write_image(&self, image: ImageId, pixels: &[[f32; 4]]) -> DeviceResult<()>;
    fn read_image(&self, image: ImageId) -> DeviceResult<Vec<[f32; 4]>>;
    fn destroy_image(&self, image: ImageId);
    fn create_sampler(&self) -> DeviceResult<DescriptorHandle>;

    // Prebuild info
    fn bottom_level_sizes(&self, geometries: &[TriangleGeometry]) -> BuildSizes;
    fn top_level_sizes(&self, instance_count: u32) -> BuildSizes;

    // View tables
    fn create_view_table(&self, slot_count: u32) -> DeviceResult<ViewTableId>;
    fn write_view(&self, table: ViewTableId, slot: u32, view: ResourceView) -> DeviceResult<()>;
    fn view_table_start(&self, table: ViewTableId) -> DeviceResult<DescriptorHandle>;
    fn view_table_len(&self, table: ViewTableId) -> DeviceResult<u32>;
    fn view_increment_size(&self) -> u32;
    fn destroy_view_table(&self, table: ViewTableId);

    // Pipelines
    fn create_pipeline(&self, desc: &PipelineDesc) -> DeviceResult<PipelineId>;
    fn shader_identifier(&self, pipeline: PipelineId, export: &str) -> DeviceResult<ShaderIdentifier>;
    fn destroy_pipeline(&self, pipeline: PipelineId);

    // Queue
    fn submit(&self, commands: CommandList) -> DeviceResult<FenceValue>;
    /// Block until the fence reaches `value`. There is no timeout.
    fn wait_for_fence(&self, value: FenceValue) -> DeviceResult<()>;
    fn completed_fence_value(&self) -> FenceValue;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 32), 0);
        assert_eq!(align_up(1, 32), 32);
        assert_eq!(align_up(32, 32), 32);
        assert_eq!(align_up(33, 64), 64);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn test_descriptor_offset() {
        let start = DescriptorHandle(0x1000);
        assert_eq!(start.offset(3, 32), DescriptorHandle(0x1060));
        assert!(DescriptorHandle::NULL.is_null());
    }

    #[test]
    fn test_triangle_count_without_indices() {
        let geometry = TriangleGeometry {
            vertex_buffer: 0x100,
            vertex_count: 9,
            vertex_stride: 40,
            index_buffer: None,
            index_count: 0,
        };
        assert_eq!(geometry.triangle_count(), 3);
    }
}
