//! Per-instance vertex and index buffers.

use log::debug;
use rts_core::Mesh;

use crate::device::{
    BufferDesc, BufferId, BufferUsage, DeviceAddress, DeviceResult, MemoryLocation,
    RayTracingDevice, TriangleGeometry,
};
use crate::gpu_types::Vertex;

/// Device copies of one instance's mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryBuffers {
    /// Load-order serial, distinct for every geometry uploaded since the
    /// last reset.
    pub serial: u32,
    pub vertex_buffer: BufferId,
    pub vertex_address: DeviceAddress,
    pub vertex_count: u32,
    pub index_buffer: Option<BufferId>,
    pub index_address: DeviceAddress,
    pub index_count: u32,
}

impl GeometryBuffers {
    /// Build input for the bottom-level structure. A zero index count
    /// builds a plain triangle list.
    pub fn triangle_geometry(&self) -> TriangleGeometry {
        let indexed = self.index_buffer.is_some() && self.index_count > 0;
        TriangleGeometry {
            vertex_buffer: self.vertex_address,
            vertex_count: self.vertex_count,
            vertex_stride: std::mem::size_of::<Vertex>() as u32,
            index_buffer: indexed.then_some(self.index_address),
            index_count: if indexed { self.index_count } else { 0 },
        }
    }

    fn release<D: RayTracingDevice + ?Sized>(&self, device: &D) {
        device.destroy_buffer(self.vertex_buffer);
        if let Some(index_buffer) = self.index_buffer {
            device.destroy_buffer(index_buffer);
        }
    }
}

/// Owns the geometry buffers of every instance, indexed by instance id.
#[derive(Debug, Default)]
pub struct GeometryStore {
    entries: Vec<GeometryBuffers>,
    next_serial: u32,
}

impl GeometryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upload `mesh` with a per-vertex colour. The buffers are not yet
    /// part of the store; `push` commits them.
    pub fn upload<D: RayTracingDevice + ?Sized>(
        &mut self,
        device: &D,
        mesh: &Mesh,
        color: [f32; 3],
    ) -> DeviceResult<GeometryBuffers> {
        let vertices: Vec<Vertex> = mesh
            .positions
            .iter()
            .zip(&mesh.normals)
            .map(|(p, n)| Vertex {
                position: p.to_array(),
                normal: n.to_array(),
                color: [color[0], color[1], color[2], 1.0],
            })
            .collect();
        let serial = self.next_serial;

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&vertices);
        let vertex_buffer = device.create_buffer(&BufferDesc::new(
            format!("vertices #{serial}"),
            vertex_bytes.len() as u64,
            BufferUsage::Vertex,
            MemoryLocation::CpuToGpu,
        ))?;
        device.write_buffer(vertex_buffer, 0, vertex_bytes)?;

        let index_buffer = if mesh.is_indexed() {
            let index_bytes: &[u8] = bytemuck::cast_slice(&mesh.indices);
            let buffer = device.create_buffer(&BufferDesc::new(
                format!("indices #{serial}"),
                index_bytes.len() as u64,
                BufferUsage::Index,
                MemoryLocation::CpuToGpu,
            ));
            let buffer = match buffer {
                Ok(buffer) => buffer,
                Err(e) => {
                    device.destroy_buffer(vertex_buffer);
                    return Err(e);
                }
            };
            device.write_buffer(buffer, 0, index_bytes)?;
            Some(buffer)
        } else {
            None
        };

        self.next_serial += 1;
        let geometry = GeometryBuffers {
            serial,
            vertex_buffer,
            vertex_address: device.buffer_address(vertex_buffer)?,
            vertex_count: vertices.len() as u32,
            index_buffer,
            index_address: match index_buffer {
                Some(buffer) => device.buffer_address(buffer)?,
                None => 0,
            },
            index_count: mesh.indices.len() as u32,
        };
        debug!(
            "Uploaded geometry #{}: {} vertices, {} indices",
            serial, geometry.vertex_count, geometry.index_count
        );
        Ok(geometry)
    }

    /// Append committed geometry; it takes the next instance id.
    pub fn push(&mut self, geometry: GeometryBuffers) -> u32 {
        self.entries.push(geometry);
        self.entries.len() as u32 - 1
    }

    /// Free the geometry of instance `id`; later ids shift down by one.
    pub fn remove<D: RayTracingDevice + ?Sized>(&mut self, device: &D, id: usize) -> Option<GeometryBuffers> {
        if id >= self.entries.len() {
            return None;
        }
        let geometry = self.entries.remove(id);
        geometry.release(device);
        Some(geometry)
    }

    /// Free geometry that was uploaded but never pushed.
    pub fn discard<D: RayTracingDevice + ?Sized>(&self, device: &D, geometry: GeometryBuffers) {
        geometry.release(device);
    }

    pub fn get(&self, id: usize) -> Option<&GeometryBuffers> {
        self.entries.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GeometryBuffers> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Free everything and restart serials for a new scene.
    pub fn clear<D: RayTracingDevice + ?Sized>(&mut self, device: &D) {
        for geometry in self.entries.drain(..) {
            geometry.release(device);
        }
        self.next_serial = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SoftwareDevice;
    use rts_math::Vec3;

    fn triangle(indexed: bool) -> Mesh {
        let positions = vec![Vec3::ZERO, Vec3::X, Vec3::Y];
        Mesh::new(positions, if indexed { vec![0, 1, 2] } else { vec![] })
    }

    #[test]
    fn test_upload_writes_vertices() {
        let device = SoftwareDevice::new();
        let mut store = GeometryStore::new();
        let geometry = store.upload(&device, &triangle(true), [0.5, 0.5, 0.5]).unwrap();
        assert_eq!(geometry.vertex_count, 3);
        assert_eq!(geometry.index_count, 3);

        let bytes = device.read_buffer(geometry.vertex_buffer).unwrap();
        let second: Vertex = bytemuck::pod_read_unaligned(&bytes[40..80]);
        assert_eq!(second.position, [1.0, 0.0, 0.0]);
        assert_eq!(second.color, [0.5, 0.5, 0.5, 1.0]);
    }

    #[test]
    fn test_non_indexed_fallback() {
        let device = SoftwareDevice::new();
        let mut store = GeometryStore::new();
        let geometry = store.upload(&device, &triangle(false), [1.0; 3]).unwrap();
        assert!(geometry.index_buffer.is_none());
        let input = geometry.triangle_geometry();
        assert_eq!(input.index_buffer, None);
        assert_eq!(input.triangle_count(), 1);
    }

    #[test]
    fn test_remove_shifts_ids_and_frees() {
        let device = SoftwareDevice::new();
        let mut store = GeometryStore::new();
        for _ in 0..3 {
            let geometry = store.upload(&device, &triangle(true), [1.0; 3]).unwrap();
            store.push(geometry);
        }
        let buffers = device.live_buffer_count();
        let removed = store.remove(&device, 1).unwrap();
        assert_eq!(removed.serial, 1);
        assert_eq!(store.get(1).unwrap().serial, 2);
        assert_eq!(device.live_buffer_count(), buffers - 2);
        assert!(store.remove(&device, 5).is_none());
    }

    #[test]
    fn test_clear_resets_serials() {
        let device = SoftwareDevice::new();
        let mut store = GeometryStore::new();
        let geometry = store.upload(&device, &triangle(true), [1.0; 3]).unwrap();
        store.push(geometry);
        store.clear(&device);
        assert!(store.is_empty());
        assert_eq!(device.live_buffer_count(), 0);
        let geometry = store.upload(&device, &triangle(true), [1.0; 3]).unwrap();
        assert_eq!(geometry.serial, 0);
    }
}
