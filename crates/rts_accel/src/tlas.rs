//! Top-level structure builds and refits.

use log::{debug, info};
use rts_math::{compose_srt, RotationOrder, Vec3};

use crate::device::{
    BufferUsage, Command, CommandList, DeviceAddress, DeviceResult, MemoryLocation, RayTracingDevice,
};
use crate::error::{AccelError, AccelResult};
use crate::gpu_types::InstanceDescriptor;
use crate::growable::GrowableBuffer;

/// One entry of the top-level structure, given in instance id order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstancePlacement {
    pub blas_address: DeviceAddress,
    pub position: Vec3,
    /// Pitch, yaw, roll in radians.
    pub rotation: Vec3,
    pub scale: Vec3,
}

/// What a call to `TopLevelBuilder::build` recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopLevelBuild {
    /// No instances, nothing recorded.
    Skipped,
    Full,
    Refit,
}

/// Owns the scratch, result and instance descriptor buffers of the scene's
/// top-level structure. All three only ever grow.
#[derive(Debug)]
pub struct TopLevelBuilder {
    rotation_order: RotationOrder,
    scratch: GrowableBuffer,
    result: GrowableBuffer,
    descriptors: GrowableBuffer,
    /// Instance count of the last full build, if its result is current.
    built_count: Option<u32>,
}

impl TopLevelBuilder {
    pub fn new(rotation_order: RotationOrder) -> Self {
        Self {
            rotation_order,
            scratch: GrowableBuffer::new(
                "tlas scratch",
                BufferUsage::AccelerationScratch,
                MemoryLocation::GpuOnly,
            ),
            result: GrowableBuffer::new(
                "tlas result",
                BufferUsage::AccelerationStructure,
                MemoryLocation::GpuOnly,
            ),
            descriptors: GrowableBuffer::new(
                "tlas instances",
                BufferUsage::InstanceDescriptors,
                MemoryLocation::CpuToGpu,
            ),
            built_count: None,
        }
    }

    /// Record a full build, or a refit when `update_only` is set.
    ///
    /// Transforms are recomputed from the placements on every call. Each
    /// instance's id and hit group contribution are its position in
    /// `placements`. An empty list records nothing and leaves no current
    /// result.
    pub fn build<D: RayTracingDevice + ?Sized>(
        &mut self,
        device: &D,
        placements: &[InstancePlacement],
        update_only: bool,
        commands: &mut CommandList,
    ) -> AccelResult<TopLevelBuild> {
        if placements.is_empty() {
            debug!("Skipping top-level build over zero instances");
            self.built_count = None;
            return Ok(TopLevelBuild::Skipped);
        }
        let count = placements.len() as u32;
        if update_only && self.built_count != Some(count) {
            return Err(AccelError::InvalidState(format!(
                "refit of {} instances without a matching full build ({:?})",
                count, self.built_count
            )));
        }

        let descriptors: Vec<InstanceDescriptor> = placements
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let world = compose_srt(p.position, p.rotation, p.scale, self.rotation_order);
                InstanceDescriptor::new(world, i as u32, i as u32, p.blas_address)
            })
            .collect();
        let descriptor_bytes: &[u8] = bytemuck::cast_slice(&descriptors);

        if !update_only {
            let sizes = device.top_level_sizes(count);
            self.scratch.ensure(device, sizes.scratch)?;
            self.result.ensure(device, sizes.result)?;
            self.descriptors.ensure(device, descriptor_bytes.len() as u64)?;
        }
        let (Some(instances), Some(scratch), Some(result)) =
            (self.descriptors.buffer(), self.scratch.buffer(), self.result.buffer())
        else {
            return Err(AccelError::InvalidState("top-level buffers missing".into()));
        };
        device.write_buffer(instances, 0, descriptor_bytes)?;

        commands.push(Command::BuildTopLevel {
            instances,
            instance_count: count,
            scratch,
            result,
            source: update_only.then_some(result),
            allow_update: true,
        });

        if update_only {
            debug!("Recording TLAS refit of {} instances", count);
            Ok(TopLevelBuild::Refit)
        } else {
            info!(
                "Recording TLAS build: {} instances, result {} bytes",
                count,
                self.result.capacity()
            );
            self.built_count = Some(count);
            Ok(TopLevelBuild::Full)
        }
    }

    /// Whether a refit over `instance_count` instances is possible.
    pub fn can_refit(&self, instance_count: u32) -> bool {
        instance_count > 0 && self.built_count == Some(instance_count)
    }

    /// Forget the current result; the next build must be a full one.
    pub fn invalidate(&mut self) {
        self.built_count = None;
    }

    /// Address of the current result, or zero when there is none.
    pub fn result_address<D: RayTracingDevice + ?Sized>(&self, device: &D) -> DeviceResult<DeviceAddress> {
        match self.built_count {
            Some(_) => self.result.address(device),
            None => Ok(0),
        }
    }

    /// Current (scratch, result, descriptor) capacities in bytes.
    pub fn capacities(&self) -> (u64, u64, u64) {
        (self.scratch.capacity(), self.result.capacity(), self.descriptors.capacity())
    }

    pub fn release<D: RayTracingDevice + ?Sized>(&mut self, device: &D) {
        self.scratch.release(device);
        self.result.release(device);
        self.descriptors.release(device);
        self.built_count = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blas::build_bottom_level;
    use crate::device::SoftwareDevice;
    use crate::geometry::GeometryStore;
    use rts_core::Mesh;

    fn blas_address(device: &SoftwareDevice) -> DeviceAddress {
        let mut store = GeometryStore::new();
        let mesh = Mesh::new(vec![Vec3::ZERO, Vec3::X, Vec3::Y], vec![0, 1, 2]);
        let geometry = store.upload(device, &mesh, [1.0; 3]).unwrap();
        let mut commands = CommandList::new();
        let blas = build_bottom_level(device, &[geometry.triangle_geometry()], &mut commands).unwrap();
        device.wait_for_fence(device.submit(commands).unwrap()).unwrap();
        blas.address
    }

    fn placements(address: DeviceAddress, count: usize) -> Vec<InstancePlacement> {
        (0..count)
            .map(|i| InstancePlacement {
                blas_address: address,
                position: Vec3::new(i as f32 * 2.0, 0.0, 0.0),
                rotation: Vec3::ZERO,
                scale: Vec3::ONE,
            })
            .collect()
    }

    #[test]
    fn test_empty_build_is_skipped() {
        let device = SoftwareDevice::new();
        let mut builder = TopLevelBuilder::new(RotationOrder::default());
        let mut commands = CommandList::new();
        assert_eq!(
            builder.build(&device, &[], false, &mut commands).unwrap(),
            TopLevelBuild::Skipped
        );
        assert!(commands.is_empty());
        assert_eq!(builder.result_address(&device).unwrap(), 0);
    }

    #[test]
    fn test_refit_needs_full_build() {
        let device = SoftwareDevice::new();
        let address = blas_address(&device);
        let mut builder = TopLevelBuilder::new(RotationOrder::default());
        let mut commands = CommandList::new();
        let err = builder
            .build(&device, &placements(address, 2), true, &mut commands)
            .unwrap_err();
        assert!(matches!(err, AccelError::InvalidState(_)));

        builder.build(&device, &placements(address, 2), false, &mut commands).unwrap();
        assert!(builder.can_refit(2));
        assert!(!builder.can_refit(3));
        assert_eq!(
            builder.build(&device, &placements(address, 2), true, &mut commands).unwrap(),
            TopLevelBuild::Refit
        );
        match &commands.commands()[1] {
            Command::BuildTopLevel { source, result, .. } => assert_eq!(*source, Some(*result)),
            other => panic!("unexpected command {other:?}"),
        }
        device.wait_for_fence(device.submit(commands).unwrap()).unwrap();
    }

    #[test]
    fn test_buffers_grow_but_never_shrink() {
        let device = SoftwareDevice::new();
        let address = blas_address(&device);
        let mut builder = TopLevelBuilder::new(RotationOrder::default());
        let mut build = |count: usize| {
            let mut commands = CommandList::new();
            builder.build(&device, &placements(address, count), false, &mut commands).unwrap();
            device.wait_for_fence(device.submit(commands).unwrap()).unwrap();
            builder.capacities()
        };

        let small = build(2);
        let large = build(8);
        assert!(large.0 > small.0 && large.1 > small.1 && large.2 > small.2);
        assert_eq!(build(1), large);
    }

    #[test]
    fn test_descriptor_ids_follow_order() {
        let device = SoftwareDevice::new();
        let address = blas_address(&device);
        let mut builder = TopLevelBuilder::new(RotationOrder::default());
        let mut commands = CommandList::new();
        builder.build(&device, &placements(address, 3), false, &mut commands).unwrap();

        let buffer = builder.descriptors.buffer().unwrap();
        let bytes = device.read_buffer(buffer).unwrap();
        for i in 0..3u32 {
            let at = i as usize * std::mem::size_of::<InstanceDescriptor>();
            let descriptor: InstanceDescriptor =
                bytemuck::pod_read_unaligned(&bytes[at..at + std::mem::size_of::<InstanceDescriptor>()]);
            assert_eq!(descriptor.instance_id(), i);
            assert_eq!(descriptor.contribution(), i);
            assert_eq!(descriptor.blas_address, address);
            assert!((descriptor.transform().w_axis.x - i as f32 * 2.0).abs() < 1e-6);
        }
    }
}
