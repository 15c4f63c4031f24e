//! Resource state of the software device: a flat buffer address space,
//! images, view tables and pipelines.

use std::collections::{BTreeMap, HashMap};

use rts_core::Texture;

use crate::device::{
    align_up, BufferDesc, BufferId, DescriptorHandle, DeviceAddress, DeviceError, DeviceResult,
    ImageDesc, ImageId, PipelineDesc, PipelineId, ResourceView, ViewTableId,
    ACCELERATION_STRUCTURE_ALIGNMENT,
};

use super::structures::Structure;

/// First address handed out; keeps zero free as the null address.
const ADDRESS_BASE: DeviceAddress = 0x1_0000;
/// First descriptor handle handed out.
const DESCRIPTOR_BASE: u64 = 0x10_0000;
pub(crate) const VIEW_INCREMENT: u32 = 32;

pub(crate) struct Buffer {
    pub desc: BufferDesc,
    pub address: DeviceAddress,
    pub data: Vec<u8>,
}

pub(crate) struct Image {
    pub desc: ImageDesc,
    pub texture: Texture,
}

pub(crate) struct ViewTable {
    pub start: DescriptorHandle,
    pub slots: Vec<Option<ResourceView>>,
}

pub(crate) struct Memory {
    next_id: u64,
    next_address: DeviceAddress,
    next_descriptor: u64,
    allocated: u64,
    budget: u64,
    pub buffers: HashMap<BufferId, Buffer>,
    by_address: BTreeMap<DeviceAddress, BufferId>,
    pub structures: HashMap<BufferId, Structure>,
    pub images: HashMap<ImageId, Image>,
    pub view_tables: HashMap<ViewTableId, ViewTable>,
    pub samplers: Vec<DescriptorHandle>,
    pub pipelines: HashMap<PipelineId, PipelineDesc>,
}

impl Memory {
    pub fn new(budget: u64) -> Self {
        Self {
            next_id: 1,
            next_address: ADDRESS_BASE,
            next_descriptor: DESCRIPTOR_BASE,
            allocated: 0,
            budget,
            buffers: HashMap::new(),
            by_address: BTreeMap::new(),
            structures: HashMap::new(),
            images: HashMap::new(),
            view_tables: HashMap::new(),
            samplers: Vec::new(),
            pipelines: HashMap::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated
    }

    // Buffers

    pub fn create_buffer(&mut self, desc: &BufferDesc) -> DeviceResult<BufferId> {
        if self.allocated + desc.size > self.budget {
            return Err(DeviceError::OutOfMemory {
                label: desc.label.clone(),
                size: desc.size,
            });
        }
        let id = BufferId(self.next_id());
        let address = self.next_address;
        // Addresses are never reused.
        self.next_address = align_up(address + desc.size.max(1), ACCELERATION_STRUCTURE_ALIGNMENT);
        self.allocated += desc.size;
        self.by_address.insert(address, id);
        self.buffers.insert(
            id,
            Buffer {
                desc: desc.clone(),
                address,
                data: vec![0; desc.size as usize],
            },
        );
        Ok(id)
    }

    pub fn destroy_buffer(&mut self, id: BufferId) {
        if let Some(buffer) = self.buffers.remove(&id) {
            self.allocated -= buffer.desc.size;
            self.by_address.remove(&buffer.address);
            self.structures.remove(&id);
        }
    }

    pub fn buffer(&self, id: BufferId) -> DeviceResult<&Buffer> {
        self.buffers.get(&id).ok_or(DeviceError::UnknownBuffer(id))
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> DeviceResult<&mut Buffer> {
        self.buffers.get_mut(&id).ok_or(DeviceError::UnknownBuffer(id))
    }

    pub fn write(&mut self, id: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let buffer = self.buffer_mut(id)?;
        let end = offset + data.len() as u64;
        if end > buffer.data.len() as u64 {
            return Err(DeviceError::OutOfBounds {
                label: buffer.desc.label.clone(),
                offset,
                len: data.len() as u64,
                size: buffer.data.len() as u64,
            });
        }
        buffer.data[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    /// Buffer containing `address`, and the offset of `address` inside it.
    pub fn resolve(&self, address: DeviceAddress) -> DeviceResult<(BufferId, u64)> {
        let (&base, &id) = self
            .by_address
            .range(..=address)
            .next_back()
            .ok_or(DeviceError::InvalidAddress(address))?;
        let buffer = self.buffer(id)?;
        let offset = address - base;
        if offset >= buffer.data.len().max(1) as u64 {
            return Err(DeviceError::InvalidAddress(address));
        }
        Ok((id, offset))
    }

    /// `len` bytes starting at a device address.
    pub fn read_at(&self, address: DeviceAddress, len: u64) -> DeviceResult<&[u8]> {
        let (id, offset) = self.resolve(address)?;
        let buffer = self.buffer(id)?;
        let end = offset + len;
        if end > buffer.data.len() as u64 {
            return Err(DeviceError::OutOfBounds {
                label: buffer.desc.label.clone(),
                offset,
                len,
                size: buffer.data.len() as u64,
            });
        }
        Ok(&buffer.data[offset as usize..end as usize])
    }

    /// Read one `Pod` value at a device address.
    pub fn read_pod<T: bytemuck::Pod>(&self, address: DeviceAddress) -> DeviceResult<T> {
        let bytes = self.read_at(address, std::mem::size_of::<T>() as u64)?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Require `buffer` to exist and hold at least `required` bytes.
    pub fn check_size(&self, buffer: BufferId, required: u64, what: &'static str) -> DeviceResult<()> {
        let provided = self.buffer(buffer)?.data.len() as u64;
        if provided < required {
            return Err(DeviceError::BufferTooSmall {
                what,
                provided,
                required,
            });
        }
        Ok(())
    }

    // Images

    pub fn create_image(&mut self, desc: &ImageDesc) -> ImageId {
        let id = ImageId(self.next_id());
        let pixels = vec![[0.0; 4]; desc.width as usize * desc.height as usize];
        self.images.insert(
            id,
            Image {
                desc: desc.clone(),
                texture: Texture::new(desc.width, desc.height, pixels, desc.label.clone()),
            },
        );
        id
    }

    pub fn image(&self, id: ImageId) -> DeviceResult<&Image> {
        self.images.get(&id).ok_or(DeviceError::UnknownImage(id))
    }

    pub fn image_mut(&mut self, id: ImageId) -> DeviceResult<&mut Image> {
        self.images.get_mut(&id).ok_or(DeviceError::UnknownImage(id))
    }

    // View tables

    fn reserve_descriptors(&mut self, count: u32) -> DescriptorHandle {
        let start = DescriptorHandle(self.next_descriptor);
        self.next_descriptor += count.max(1) as u64 * VIEW_INCREMENT as u64;
        start
    }

    pub fn create_view_table(&mut self, slot_count: u32) -> ViewTableId {
        let id = ViewTableId(self.next_id());
        let start = self.reserve_descriptors(slot_count);
        self.view_tables.insert(
            id,
            ViewTable {
                start,
                slots: vec![None; slot_count as usize],
            },
        );
        id
    }

    pub fn view_table(&self, id: ViewTableId) -> DeviceResult<&ViewTable> {
        self.view_tables.get(&id).ok_or(DeviceError::UnknownViewTable(id))
    }

    pub fn write_view(&mut self, id: ViewTableId, slot: u32, view: ResourceView) -> DeviceResult<()> {
        let table = self
            .view_tables
            .get_mut(&id)
            .ok_or(DeviceError::UnknownViewTable(id))?;
        let count = table.slots.len() as u32;
        let entry = table
            .slots
            .get_mut(slot as usize)
            .ok_or(DeviceError::SlotOutOfRange { slot, count })?;
        *entry = Some(view);
        Ok(())
    }

    /// The table and slot a shader-visible handle points at.
    pub fn resolve_descriptor(&self, handle: DescriptorHandle) -> Option<(&ViewTable, u32)> {
        self.view_tables.values().find_map(|table| {
            let end = table.start.0 + table.slots.len() as u64 * VIEW_INCREMENT as u64;
            if handle.0 >= table.start.0 && handle.0 < end {
                Some((table, ((handle.0 - table.start.0) / VIEW_INCREMENT as u64) as u32))
            } else {
                None
            }
        })
    }

    pub fn create_sampler(&mut self) -> DescriptorHandle {
        let handle = self.reserve_descriptors(1);
        self.samplers.push(handle);
        handle
    }

    // Pipelines

    pub fn insert_pipeline(&mut self, desc: PipelineDesc) -> PipelineId {
        let id = PipelineId(self.next_id());
        self.pipelines.insert(id, desc);
        id
    }

    pub fn pipeline(&self, id: PipelineId) -> DeviceResult<&PipelineDesc> {
        self.pipelines.get(&id).ok_or(DeviceError::UnknownPipeline(id))
    }
}
