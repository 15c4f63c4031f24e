//! The shader-visible resource view table.
//!
//! Slot order is shared with the programs:
//!
//! | Slots                      | View                                   |
//! |----------------------------|----------------------------------------|
//! | `0 .. outputs`             | output image, then auxiliary targets   |
//! | `outputs`                  | scene hierarchy                        |
//! | `outputs + 1`              | camera constants                       |
//! | next `instance_count`      | per-instance data, whole buffer each   |
//! | last (optional)            | environment texture                    |

use log::debug;

use crate::device::{
    BufferId, DescriptorHandle, DeviceAddress, DeviceResult, ImageId, RayTracingDevice,
    ResourceView, ViewTableId,
};
use crate::gpu_types::InstanceData;

/// Slots in front of the per-instance views: outputs, hierarchy, camera.
pub fn base_slots(output_count: u32) -> u32 {
    output_count + 2
}

pub fn slot_count_for(output_count: u32, instance_count: u32, has_environment: bool) -> u32 {
    base_slots(output_count) + instance_count + has_environment as u32
}

/// Everything the table points at.
#[derive(Debug, Clone, Copy)]
pub struct ViewTableInputs<'a> {
    pub outputs: &'a [ImageId],
    /// Top-level result address; zero while the scene is empty.
    pub hierarchy: DeviceAddress,
    pub camera: DeviceAddress,
    pub camera_size: u64,
    /// Per-instance data buffer; `None` only when there are no instances.
    pub instance_data: Option<BufferId>,
    pub instance_count: u32,
    pub environment: Option<ImageId>,
}

#[derive(Debug, Default)]
pub struct ResourceViewTable {
    table: Option<ViewTableId>,
    start: DescriptorHandle,
    increment: u32,
    slot_count: u32,
    hierarchy_slot: u32,
    environment_slot: Option<u32>,
}

impl ResourceViewTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Regenerate every slot. Returns the table start and the increment
    /// between slots.
    pub fn rebuild<D: RayTracingDevice + ?Sized>(
        &mut self,
        device: &D,
        inputs: &ViewTableInputs,
    ) -> DeviceResult<(DescriptorHandle, u32)> {
        let output_count = inputs.outputs.len() as u32;
        let instance_count = if inputs.instance_data.is_some() {
            inputs.instance_count
        } else {
            0
        };
        let slot_count = slot_count_for(output_count, instance_count, inputs.environment.is_some());
        let table = device.create_view_table(slot_count)?;

        let mut slot = 0;
        for &image in inputs.outputs {
            device.write_view(table, slot, ResourceView::StorageImage(image))?;
            slot += 1;
        }
        let hierarchy_slot = slot;
        device.write_view(table, slot, ResourceView::AccelerationStructure(inputs.hierarchy))?;
        slot += 1;
        device.write_view(
            table,
            slot,
            ResourceView::ConstantBuffer {
                address: inputs.camera,
                size: inputs.camera_size,
            },
        )?;
        slot += 1;
        if let Some(buffer) = inputs.instance_data {
            for _ in 0..instance_count {
                device.write_view(
                    table,
                    slot,
                    ResourceView::StructuredBuffer {
                        buffer,
                        element_count: instance_count,
                        stride: std::mem::size_of::<InstanceData>() as u32,
                    },
                )?;
                slot += 1;
            }
        }
        let environment_slot = match inputs.environment {
            Some(image) => {
                device.write_view(table, slot, ResourceView::SampledImage(image))?;
                Some(slot)
            }
            None => None,
        };

        if let Some(old) = self.table.replace(table) {
            device.destroy_view_table(old);
        }
        self.start = device.view_table_start(table)?;
        self.increment = device.view_increment_size();
        self.slot_count = slot_count;
        self.hierarchy_slot = hierarchy_slot;
        self.environment_slot = environment_slot;
        debug!("Rebuilt view table: {} slots for {} instances", slot_count, instance_count);
        Ok((self.start, self.increment))
    }

    /// Point the hierarchy slot at a new top-level result.
    pub fn update_hierarchy<D: RayTracingDevice + ?Sized>(&self, device: &D, hierarchy: DeviceAddress) -> DeviceResult<()> {
        if let Some(table) = self.table {
            device.write_view(table, self.hierarchy_slot, ResourceView::AccelerationStructure(hierarchy))?;
        }
        Ok(())
    }

    pub fn start(&self) -> DescriptorHandle {
        self.start
    }

    pub fn increment(&self) -> u32 {
        self.increment
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// Handle of the environment view, or null without one.
    pub fn environment_handle(&self) -> DescriptorHandle {
        match self.environment_slot {
            Some(slot) => self.start.offset(slot, self.increment),
            None => DescriptorHandle::NULL,
        }
    }

    pub fn release<D: RayTracingDevice + ?Sized>(&mut self, device: &D) {
        if let Some(table) = self.table.take() {
            device.destroy_view_table(table);
        }
        self.slot_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BufferDesc, BufferUsage, ImageDesc, MemoryLocation, SoftwareDevice};

    struct Fixture {
        device: SoftwareDevice,
        outputs: Vec<ImageId>,
        camera: BufferId,
        instance_data: BufferId,
        environment: ImageId,
    }

    fn fixture() -> Fixture {
        let device = SoftwareDevice::new();
        let image = |label: &str| {
            device
                .create_image(&ImageDesc {
                    label: label.into(),
                    width: 4,
                    height: 4,
                })
                .unwrap()
        };
        let outputs = vec![image("output"), image("normal"), image("depth"), image("albedo")];
        let environment = image("environment");
        let camera = device
            .create_buffer(&BufferDesc::new("camera", 512, BufferUsage::Constant, MemoryLocation::CpuToGpu))
            .unwrap();
        let instance_data = device
            .create_buffer(&BufferDesc::new(
                "instance data",
                100 * std::mem::size_of::<InstanceData>() as u64,
                BufferUsage::Storage,
                MemoryLocation::CpuToGpu,
            ))
            .unwrap();
        Fixture {
            device,
            outputs,
            camera,
            instance_data,
            environment,
        }
    }

    fn inputs(f: &Fixture, instance_count: u32, environment: bool) -> ViewTableInputs<'_> {
        ViewTableInputs {
            outputs: &f.outputs,
            hierarchy: 0,
            camera: f.device.buffer_address(f.camera).unwrap(),
            camera_size: 512,
            instance_data: Some(f.instance_data),
            instance_count,
            environment: environment.then_some(f.environment),
        }
    }

    #[test]
    fn test_slot_count_tracks_instances() {
        let f = fixture();
        let mut table = ResourceViewTable::new();
        for count in [0, 1, 5, 100] {
            for environment in [false, true] {
                table.rebuild(&f.device, &inputs(&f, count, environment)).unwrap();
                let expected = base_slots(4) + count + environment as u32;
                assert_eq!(table.slot_count(), expected);
                assert_eq!(slot_count_for(4, count, environment), expected);
            }
        }
    }

    #[test]
    fn test_environment_is_last_slot() {
        let f = fixture();
        let mut table = ResourceViewTable::new();
        let (start, increment) = table.rebuild(&f.device, &inputs(&f, 2, true)).unwrap();
        assert_eq!(increment, f.device.view_increment_size());
        // 4 outputs + hierarchy + camera + 2 instances
        assert_eq!(table.environment_handle(), start.offset(8, increment));

        table.rebuild(&f.device, &inputs(&f, 2, false)).unwrap();
        assert!(table.environment_handle().is_null());
    }

    #[test]
    fn test_rebuild_releases_previous_table() {
        let f = fixture();
        let mut table = ResourceViewTable::new();
        let (first, _) = table.rebuild(&f.device, &inputs(&f, 1, false)).unwrap();
        let (second, _) = table.rebuild(&f.device, &inputs(&f, 1, false)).unwrap();
        assert_ne!(first, second);
        table.update_hierarchy(&f.device, 0).unwrap();
    }
}
