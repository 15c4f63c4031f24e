//! CPU implementation of `RayTracingDevice`.
//!
//! Commands run in submission order on a dedicated queue thread fed by a
//! crossbeam channel. Every submission signals the fence when it retires,
//! including when one of its commands fails. A failed command marks the
//! device lost, so later waits and submissions report `DeviceLost` instead
//! of blocking forever.
//!
//! Acceleration structures are real BVHs over the triangles read from
//! device memory, and dispatch runs the built-in programs listed in
//! `PROGRAM_LIBRARY` across image rows with rayon.

mod bvh;
mod memory;
mod programs;
mod structures;

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};
use log::{debug, error};
use parking_lot::{Condvar, Mutex, RwLock};

use super::{
    BufferDesc, BufferId, BuildSizes, Command, CommandList, DescriptorHandle, DeviceAddress,
    DeviceError, DeviceResult, ExportKind, FenceValue, ImageDesc, ImageId, PipelineDesc,
    PipelineId, RayTracingDevice, ResourceView, ShaderIdentifier, TriangleGeometry, ViewTableId,
};
use memory::{Memory, VIEW_INCREMENT};
use programs::{dispatch_rays, encode_identifier, PROGRAM_LIBRARY};

/// Device memory available when no budget is given.
pub const DEFAULT_MEMORY_BUDGET: u64 = 1 << 30;

struct Submission {
    commands: Vec<Command>,
    fence: FenceValue,
}

#[derive(Default)]
struct FenceState {
    completed: FenceValue,
    lost: Option<String>,
}

struct Shared {
    memory: RwLock<Memory>,
    fence: Mutex<FenceState>,
    signal: Condvar,
}

pub struct SoftwareDevice {
    shared: Arc<Shared>,
    /// Last fence value handed out; held while sending so values reach the
    /// queue in order.
    issued: Mutex<FenceValue>,
    sender: Option<Sender<Submission>>,
    worker: Option<JoinHandle<()>>,
    ray_tracing: bool,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::with_memory_budget(DEFAULT_MEMORY_BUDGET)
    }

    /// A device that fails allocations once `budget` bytes are live.
    pub fn with_memory_budget(budget: u64) -> Self {
        let shared = Arc::new(Shared {
            memory: RwLock::new(Memory::new(budget)),
            fence: Mutex::new(FenceState::default()),
            signal: Condvar::new(),
        });
        let (sender, receiver) = unbounded::<Submission>();
        let queue = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("rts-device-queue".into())
            .spawn(move || {
                for submission in receiver {
                    run_submission(&queue, submission);
                }
            })
            .ok();
        if worker.is_none() {
            error!("Failed to start the device queue thread");
            shared.fence.lock().lost = Some("queue thread failed to start".into());
        }
        Self {
            shared,
            issued: Mutex::new(0),
            sender: Some(sender),
            worker,
            ray_tracing: true,
        }
    }

    /// A device reporting no ray tracing support, like an adapter without
    /// the required feature tier.
    pub fn without_ray_tracing() -> Self {
        let mut device = Self::new();
        device.ray_tracing = false;
        device
    }

    /// Bytes currently allocated to live buffers.
    pub fn allocated_bytes(&self) -> u64 {
        self.shared.memory.read().allocated_bytes()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.shared.memory.read().buffers.len()
    }

    fn require_ray_tracing(&self) -> DeviceResult<()> {
        if self.ray_tracing {
            Ok(())
        } else {
            Err(DeviceError::RayTracingUnsupported)
        }
    }
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SoftwareDevice {
    fn drop(&mut self) {
        // Closing the channel ends the queue loop after pending work.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_submission(shared: &Shared, submission: Submission) {
    let mut failure = None;
    {
        let mut memory = shared.memory.write();
        for command in submission.commands {
            if let Err(e) = execute(&mut memory, command) {
                failure = Some(e.to_string());
                break;
            }
        }
    }

    let mut fence = shared.fence.lock();
    if let Some(reason) = failure {
        error!("Submission {} failed: {}", submission.fence, reason);
        fence.lost.get_or_insert(reason);
    } else {
        debug!("Submission {} retired", submission.fence);
    }
    fence.completed = fence.completed.max(submission.fence);
    shared.signal.notify_all();
}

fn execute(memory: &mut Memory, command: Command) -> DeviceResult<()> {
    match command {
        Command::BuildBottomLevel {
            geometries,
            scratch,
            result,
        } => structures::build_bottom_level(memory, &geometries, scratch, result),
        Command::BuildTopLevel {
            instances,
            instance_count,
            scratch,
            result,
            source,
            allow_update,
        } => structures::build_top_level(
            memory,
            instances,
            instance_count,
            scratch,
            result,
            source,
            allow_update,
        ),
        Command::DispatchRays(desc) => {
            let outputs = dispatch_rays(memory, &desc)?;
            for (image, pixels) in outputs {
                let texture = &mut memory.image_mut(image)?.texture;
                let expected = texture.width as usize * texture.height as usize;
                if pixels.len() != expected {
                    return Err(DeviceError::ImageSizeMismatch {
                        provided: pixels.len(),
                        expected,
                    });
                }
                texture.pixels = pixels;
            }
            Ok(())
        }
    }
}

impl RayTracingDevice for SoftwareDevice {
    fn supports_ray_tracing(&self) -> bool {
        self.ray_tracing
    }

    fn create_buffer(&self, desc: &BufferDesc) -> DeviceResult<BufferId> {
        self.shared.memory.write().create_buffer(desc)
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        self.shared.memory.write().destroy_buffer(buffer);
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        self.shared.memory.write().write(buffer, offset, data)
    }

    fn read_buffer(&self, buffer: BufferId) -> DeviceResult<Vec<u8>> {
        Ok(self.shared.memory.read().buffer(buffer)?.data.clone())
    }

    fn buffer_address(&self, buffer: BufferId) -> DeviceResult<DeviceAddress> {
        Ok(self.shared.memory.read().buffer(buffer)?.address)
    }

    fn buffer_size(&self, buffer: BufferId) -> DeviceResult<u64> {
        Ok(self.shared.memory.read().buffer(buffer)?.desc.size)
    }

    fn create_image(&self, desc: &ImageDesc) -> DeviceResult<ImageId> {
        Ok(self.shared.memory.write().create_image(desc))
    }

    fn write_image(&self, image: ImageId, pixels: &[[f32; 4]]) -> DeviceResult<()> {
        let mut memory = self.shared.memory.write();
        let texture = &mut memory.image_mut(image)?.texture;
        let expected = texture.width as usize * texture.height as usize;
        if pixels.len() != expected {
            return Err(DeviceError::ImageSizeMismatch {
                provided: pixels.len(),
                expected,
            });
        }
        texture.pixels.copy_from_slice(pixels);
        Ok(())
    }

    fn read_image(&self, image: ImageId) -> DeviceResult<Vec<[f32; 4]>> {
        Ok(self.shared.memory.read().image(image)?.texture.pixels.clone())
    }

    fn destroy_image(&self, image: ImageId) {
        self.shared.memory.write().images.remove(&image);
    }

    fn create_sampler(&self) -> DeviceResult<DescriptorHandle> {
        Ok(self.shared.memory.write().create_sampler())
    }

    fn bottom_level_sizes(&self, geometries: &[TriangleGeometry]) -> BuildSizes {
        structures::bottom_level_sizes(geometries)
    }

    fn top_level_sizes(&self, instance_count: u32) -> BuildSizes {
        structures::top_level_sizes(instance_count)
    }

    fn create_view_table(&self, slot_count: u32) -> DeviceResult<ViewTableId> {
        Ok(self.shared.memory.write().create_view_table(slot_count))
    }

    fn write_view(&self, table: ViewTableId, slot: u32, view: ResourceView) -> DeviceResult<()> {
        let mut memory = self.shared.memory.write();
        match view {
            ResourceView::StorageImage(image) | ResourceView::SampledImage(image) => {
                memory.image(image)?;
            }
            ResourceView::StructuredBuffer { buffer, .. } => {
                memory.buffer(buffer)?;
            }
            ResourceView::AccelerationStructure(0) => {}
            ResourceView::AccelerationStructure(address) | ResourceView::ConstantBuffer { address, .. } => {
                memory.resolve(address)?;
            }
        }
        memory.write_view(table, slot, view)
    }

    fn view_table_start(&self, table: ViewTableId) -> DeviceResult<DescriptorHandle> {
        Ok(self.shared.memory.read().view_table(table)?.start)
    }

    fn view_table_len(&self, table: ViewTableId) -> DeviceResult<u32> {
        Ok(self.shared.memory.read().view_table(table)?.slots.len() as u32)
    }

    fn view_increment_size(&self) -> u32 {
        VIEW_INCREMENT
    }

    fn destroy_view_table(&self, table: ViewTableId) {
        self.shared.memory.write().view_tables.remove(&table);
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> DeviceResult<PipelineId> {
        self.require_ray_tracing()?;
        for export in &desc.exports {
            let program = match &export.kind {
                ExportKind::RayGeneration | ExportKind::Miss => &export.name,
                ExportKind::HitGroup { closest_hit } => closest_hit,
            };
            if !PROGRAM_LIBRARY.contains(&program.as_str()) {
                return Err(DeviceError::UnknownProgram(program.clone()));
            }
        }
        let id = self.shared.memory.write().insert_pipeline(desc.clone());
        debug!("Created pipeline {:?} with {} exports", id, desc.exports.len());
        Ok(id)
    }

    fn shader_identifier(&self, pipeline: PipelineId, export: &str) -> DeviceResult<ShaderIdentifier> {
        let memory = self.shared.memory.read();
        let index = memory
            .pipeline(pipeline)?
            .exports
            .iter()
            .position(|e| e.name == export)
            .ok_or_else(|| DeviceError::UnknownExport(export.to_string()))?;
        Ok(encode_identifier(pipeline, index as u32))
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        self.shared.memory.write().pipelines.remove(&pipeline);
    }

    fn submit(&self, commands: CommandList) -> DeviceResult<FenceValue> {
        if !commands.is_empty() {
            self.require_ray_tracing()?;
        }
        if let Some(reason) = &self.shared.fence.lock().lost {
            return Err(DeviceError::DeviceLost(reason.clone()));
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| DeviceError::DeviceLost("queue closed".into()))?;

        let mut issued = self.issued.lock();
        let fence = *issued + 1;
        sender
            .send(Submission {
                commands: commands.into_commands(),
                fence,
            })
            .map_err(|_| DeviceError::DeviceLost("queue thread exited".into()))?;
        *issued = fence;
        Ok(fence)
    }

    fn wait_for_fence(&self, value: FenceValue) -> DeviceResult<()> {
        // Values never submitted would never be signalled.
        let target = value.min(*self.issued.lock());
        let mut fence = self.shared.fence.lock();
        while fence.completed < target {
            self.shared.signal.wait(&mut fence);
        }
        match &fence.lost {
            Some(reason) => Err(DeviceError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    fn completed_fence_value(&self) -> FenceValue {
        self.shared.fence.lock().completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BufferUsage, MemoryLocation, ParamKind, PipelineExport};
    use crate::gpu_types::InstanceDescriptor;
    use rts_math::Mat4;

    fn upload(device: &SoftwareDevice, label: &str, usage: BufferUsage, bytes: &[u8]) -> BufferId {
        let desc = BufferDesc::new(label, bytes.len() as u64, usage, MemoryLocation::CpuToGpu);
        let id = device.create_buffer(&desc).unwrap();
        device.write_buffer(id, 0, bytes).unwrap();
        id
    }

    fn scratch(device: &SoftwareDevice, size: u64) -> BufferId {
        let desc = BufferDesc::new(
            "scratch",
            size,
            BufferUsage::AccelerationScratch,
            MemoryLocation::GpuOnly,
        );
        device.create_buffer(&desc).unwrap()
    }

    /// One triangle in the z = 0 plane, built into a BLAS.
    fn triangle_blas(device: &SoftwareDevice) -> BufferId {
        let positions: [[f32; 3]; 3] = [[-1.0, -1.0, 0.0], [1.0, -1.0, 0.0], [0.0, 1.0, 0.0]];
        let vb = upload(device, "vertices", BufferUsage::Vertex, bytemuck::cast_slice(&positions));
        let geometry = TriangleGeometry {
            vertex_buffer: device.buffer_address(vb).unwrap(),
            vertex_count: 3,
            vertex_stride: 12,
            index_buffer: None,
            index_count: 0,
        };
        let sizes = device.bottom_level_sizes(&[geometry]);
        let s = scratch(device, sizes.scratch);
        let result = scratch(device, sizes.result);
        let mut list = CommandList::new();
        list.push(Command::BuildBottomLevel {
            geometries: vec![geometry],
            scratch: s,
            result,
        });
        let fence = device.submit(list).unwrap();
        device.wait_for_fence(fence).unwrap();
        result
    }

    #[test]
    fn test_fence_values_increase() {
        let device = SoftwareDevice::new();
        let a = device.submit(CommandList::new()).unwrap();
        let b = device.submit(CommandList::new()).unwrap();
        assert!(b > a);
        device.wait_for_fence(b).unwrap();
        assert_eq!(device.completed_fence_value(), b);
    }

    #[test]
    fn test_out_of_memory() {
        let device = SoftwareDevice::with_memory_budget(1024);
        let desc = BufferDesc::new("big", 4096, BufferUsage::Storage, MemoryLocation::GpuOnly);
        assert!(matches!(
            device.create_buffer(&desc),
            Err(DeviceError::OutOfMemory { size: 4096, .. })
        ));
    }

    #[test]
    fn test_failed_command_loses_device() {
        let device = SoftwareDevice::new();
        let tiny = scratch(&device, 1);
        let mut list = CommandList::new();
        list.push(Command::BuildBottomLevel {
            geometries: vec![],
            scratch: tiny,
            result: tiny,
        });
        let fence = device.submit(list).unwrap();
        assert!(matches!(device.wait_for_fence(fence), Err(DeviceError::DeviceLost(_))));
        assert!(matches!(
            device.submit(CommandList::new()),
            Err(DeviceError::DeviceLost(_))
        ));
    }

    #[test]
    fn test_refit_requires_allow_update() {
        let device = SoftwareDevice::new();
        let blas = triangle_blas(&device);
        let descriptor = InstanceDescriptor::new(Mat4::IDENTITY, 0, 0, device.buffer_address(blas).unwrap());
        let instances = upload(
            &device,
            "instances",
            BufferUsage::InstanceDescriptors,
            bytemuck::bytes_of(&descriptor),
        );
        let sizes = device.top_level_sizes(1);
        let s = scratch(&device, sizes.scratch);
        let result = scratch(&device, sizes.result);

        let mut list = CommandList::new();
        list.push(Command::BuildTopLevel {
            instances,
            instance_count: 1,
            scratch: s,
            result,
            source: None,
            allow_update: false,
        });
        list.push(Command::BuildTopLevel {
            instances,
            instance_count: 1,
            scratch: s,
            result,
            source: Some(result),
            allow_update: false,
        });
        let fence = device.submit(list).unwrap();
        let err = device.wait_for_fence(fence).unwrap_err();
        assert!(err.to_string().contains("allow_update"));
    }

    #[test]
    fn test_unknown_program_is_rejected() {
        let device = SoftwareDevice::new();
        let desc = PipelineDesc {
            exports: vec![PipelineExport {
                name: "Toon_0".into(),
                kind: ExportKind::HitGroup {
                    closest_hit: "ClosestHit_Toon".into(),
                },
                signature: vec![ParamKind::ShaderResource(0)],
            }],
            max_recursion_depth: 1,
        };
        assert_eq!(
            device.create_pipeline(&desc),
            Err(DeviceError::UnknownProgram("ClosestHit_Toon".into()))
        );
    }

    #[test]
    fn test_identifiers_differ_per_export() {
        let device = SoftwareDevice::new();
        let export = |name: &str, kind| PipelineExport {
            name: name.into(),
            kind,
            signature: vec![],
        };
        let desc = PipelineDesc {
            exports: vec![
                export("RayGen", ExportKind::RayGeneration),
                export("Miss", ExportKind::Miss),
            ],
            max_recursion_depth: 1,
        };
        let pipeline = device.create_pipeline(&desc).unwrap();
        let a = device.shader_identifier(pipeline, "RayGen").unwrap();
        let b = device.shader_identifier(pipeline, "Miss").unwrap();
        assert_ne!(a, b);
        assert_eq!(
            device.shader_identifier(pipeline, "Flat_0"),
            Err(DeviceError::UnknownExport("Flat_0".into()))
        );
    }

    #[test]
    fn test_no_ray_tracing_support() {
        let device = SoftwareDevice::without_ray_tracing();
        assert!(!device.supports_ray_tracing());
        assert_eq!(
            device.create_pipeline(&PipelineDesc::default()),
            Err(DeviceError::RayTracingUnsupported)
        );
    }

    #[test]
    fn test_trace_hits_built_triangle() {
        let device = SoftwareDevice::new();
        let blas = triangle_blas(&device);
        let translate = Mat4::from_translation(rts_math::Vec3::new(0.0, 0.0, -5.0));
        let descriptor = InstanceDescriptor::new(translate, 3, 3, device.buffer_address(blas).unwrap());
        let instances = upload(
            &device,
            "instances",
            BufferUsage::InstanceDescriptors,
            bytemuck::bytes_of(&descriptor),
        );
        let sizes = device.top_level_sizes(1);
        let s = scratch(&device, sizes.scratch);
        let result = scratch(&device, sizes.result);
        let mut list = CommandList::new();
        list.push(Command::BuildTopLevel {
            instances,
            instance_count: 1,
            scratch: s,
            result,
            source: None,
            allow_update: true,
        });
        device.wait_for_fence(device.submit(list).unwrap()).unwrap();

        let memory = device.shared.memory.read();
        let address = device.buffer_address(result).unwrap();
        let ray = rts_math::Ray::new(rts_math::Vec3::ZERO, -rts_math::Vec3::Z);
        let hit = structures::trace(&memory, address, &ray, rts_math::Interval::new(1e-3, 100.0))
            .unwrap()
            .expect("ray should hit the triangle");
        assert!((hit.t - 5.0).abs() < 1e-4);
        assert_eq!(hit.instance_id, 3);
        assert_eq!(hit.contribution, 3);
        assert!((hit.world_normal - rts_math::Vec3::Z).length() < 1e-4);

        let miss = rts_math::Ray::new(rts_math::Vec3::new(5.0, 5.0, 0.0), -rts_math::Vec3::Z);
        assert!(structures::trace(&memory, address, &miss, rts_math::Interval::new(1e-3, 100.0))
            .unwrap()
            .is_none());
    }
}
