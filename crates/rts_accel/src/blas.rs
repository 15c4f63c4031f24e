//! Bottom-level structure builds.

use log::debug;

use crate::device::{
    BufferDesc, BufferId, BufferUsage, Command, CommandList, DeviceAddress, DeviceResult,
    MemoryLocation, RayTracingDevice, TriangleGeometry,
};

/// A built (or pending) bottom-level structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BottomLevelStructure {
    /// Freed once the build has completed.
    pub scratch: Option<BufferId>,
    pub result: BufferId,
    pub address: DeviceAddress,
}

impl BottomLevelStructure {
    /// Free the scratch buffer. Only valid once the build has retired.
    pub fn release_scratch<D: RayTracingDevice + ?Sized>(&mut self, device: &D) {
        if let Some(scratch) = self.scratch.take() {
            device.destroy_buffer(scratch);
        }
    }

    pub fn release<D: RayTracingDevice + ?Sized>(mut self, device: &D) {
        self.release_scratch(device);
        device.destroy_buffer(self.result);
    }
}

/// Size, allocate and record the build of one instance's structure.
///
/// The build runs when `commands` is submitted. Geometries with a zero
/// index count build as plain triangle lists.
pub fn build_bottom_level<D: RayTracingDevice + ?Sized>(
    device: &D,
    geometries: &[TriangleGeometry],
    commands: &mut CommandList,
) -> DeviceResult<BottomLevelStructure> {
    let geometries: Vec<TriangleGeometry> = geometries
        .iter()
        .map(|g| TriangleGeometry {
            index_buffer: g.index_buffer.filter(|_| g.index_count > 0),
            ..*g
        })
        .collect();
    let sizes = device.bottom_level_sizes(&geometries);

    let scratch = device.create_buffer(&BufferDesc::new(
        "blas scratch",
        sizes.scratch,
        BufferUsage::AccelerationScratch,
        MemoryLocation::GpuOnly,
    ))?;
    let result = match device.create_buffer(&BufferDesc::new(
        "blas result",
        sizes.result,
        BufferUsage::AccelerationStructure,
        MemoryLocation::GpuOnly,
    )) {
        Ok(result) => result,
        Err(e) => {
            device.destroy_buffer(scratch);
            return Err(e);
        }
    };

    let triangles: u32 = geometries.iter().map(TriangleGeometry::triangle_count).sum();
    debug!(
        "Recording BLAS build: {} triangles, scratch {} bytes, result {} bytes",
        triangles, sizes.scratch, sizes.result
    );
    commands.push(Command::BuildBottomLevel {
        geometries,
        scratch,
        result,
    });
    Ok(BottomLevelStructure {
        scratch: Some(scratch),
        result,
        address: device.buffer_address(result)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceError, SoftwareDevice};
    use crate::geometry::GeometryStore;
    use rts_core::Mesh;
    use rts_math::Vec3;

    #[test]
    fn test_build_records_command() {
        let device = SoftwareDevice::new();
        let mut store = GeometryStore::new();
        let mesh = Mesh::new(vec![Vec3::ZERO, Vec3::X, Vec3::Y], vec![0, 1, 2]);
        let geometry = store.upload(&device, &mesh, [1.0; 3]).unwrap();

        let mut commands = CommandList::new();
        let mut blas = build_bottom_level(&device, &[geometry.triangle_geometry()], &mut commands).unwrap();
        assert_eq!(commands.len(), 1);
        assert!(blas.address != 0);

        device.wait_for_fence(device.submit(commands).unwrap()).unwrap();
        blas.release_scratch(&device);
        assert!(blas.scratch.is_none());
    }

    #[test]
    fn test_zero_index_count_builds_triangle_list() {
        let device = SoftwareDevice::new();
        let mut store = GeometryStore::new();
        let mesh = Mesh::new(vec![Vec3::ZERO, Vec3::X, Vec3::Y], vec![]);
        let geometry = store.upload(&device, &mesh, [1.0; 3]).unwrap();
        let mut input = geometry.triangle_geometry();
        // An index buffer with nothing in it is ignored.
        input.index_buffer = Some(geometry.vertex_address);

        let mut commands = CommandList::new();
        build_bottom_level(&device, &[input], &mut commands).unwrap();
        match &commands.commands()[0] {
            Command::BuildBottomLevel { geometries, .. } => assert_eq!(geometries[0].index_buffer, None),
            other => panic!("unexpected command {other:?}"),
        }
        device.wait_for_fence(device.submit(commands).unwrap()).unwrap();
    }

    #[test]
    fn test_allocation_failure_is_reported() {
        let device = SoftwareDevice::with_memory_budget(256);
        let geometry = TriangleGeometry {
            vertex_buffer: 0,
            vertex_count: 300,
            vertex_stride: 40,
            index_buffer: None,
            index_count: 0,
        };
        let mut commands = CommandList::new();
        let err = build_bottom_level(&device, &[geometry], &mut commands).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfMemory { .. }));
        assert!(commands.is_empty());
        assert_eq!(device.allocated_bytes(), 0);
    }
}
