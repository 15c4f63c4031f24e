//! Device buffers that grow on demand and never shrink.

use log::debug;

use crate::device::{
    BufferDesc, BufferId, BufferUsage, DeviceAddress, DeviceResult, MemoryLocation, RayTracingDevice,
};

/// A device buffer reallocated only when a request exceeds its capacity.
///
/// Rebuilds that need the same or less space keep the existing
/// allocation, so refits and edits that shrink the scene cause no churn.
#[derive(Debug)]
pub struct GrowableBuffer {
    label: String,
    usage: BufferUsage,
    location: MemoryLocation,
    buffer: Option<BufferId>,
    capacity: u64,
}

impl GrowableBuffer {
    pub fn new(label: impl Into<String>, usage: BufferUsage, location: MemoryLocation) -> Self {
        Self {
            label: label.into(),
            usage,
            location,
            buffer: None,
            capacity: 0,
        }
    }

    /// Make room for `required` bytes. Returns true when a new allocation
    /// was made; the old one (if any) is released and its contents lost.
    pub fn ensure<D: RayTracingDevice + ?Sized>(&mut self, device: &D, required: u64) -> DeviceResult<bool> {
        if self.buffer.is_some() && required <= self.capacity {
            return Ok(false);
        }
        let size = required.max(1);
        let desc = BufferDesc::new(self.label.clone(), size, self.usage, self.location);
        let buffer = device.create_buffer(&desc)?;
        if let Some(old) = self.buffer.replace(buffer) {
            device.destroy_buffer(old);
        }
        debug!("Grew {} from {} to {} bytes", self.label, self.capacity, size);
        self.capacity = size;
        Ok(true)
    }

    /// Bytes currently allocated; zero before the first `ensure`.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer
    }

    /// Device address of the allocation, or zero when there is none.
    pub fn address<D: RayTracingDevice + ?Sized>(&self, device: &D) -> DeviceResult<DeviceAddress> {
        match self.buffer {
            Some(buffer) => device.buffer_address(buffer),
            None => Ok(0),
        }
    }

    pub fn release<D: RayTracingDevice + ?Sized>(&mut self, device: &D) {
        if let Some(buffer) = self.buffer.take() {
            device.destroy_buffer(buffer);
        }
        self.capacity = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SoftwareDevice;

    fn scratch() -> GrowableBuffer {
        GrowableBuffer::new("scratch", BufferUsage::AccelerationScratch, MemoryLocation::GpuOnly)
    }

    #[test]
    fn test_grows_only_when_needed() {
        let device = SoftwareDevice::new();
        let mut buffer = scratch();
        assert_eq!(buffer.capacity(), 0);
        assert_eq!(buffer.address(&device).unwrap(), 0);

        assert!(buffer.ensure(&device, 1024).unwrap());
        let first = buffer.buffer();
        assert!(!buffer.ensure(&device, 512).unwrap());
        assert!(!buffer.ensure(&device, 1024).unwrap());
        assert_eq!(buffer.buffer(), first);
        assert_eq!(buffer.capacity(), 1024);

        assert!(buffer.ensure(&device, 4096).unwrap());
        assert_ne!(buffer.buffer(), first);
        assert_eq!(buffer.capacity(), 4096);
        assert_eq!(device.live_buffer_count(), 1);
    }

    #[test]
    fn test_release() {
        let device = SoftwareDevice::new();
        let mut buffer = scratch();
        buffer.ensure(&device, 64).unwrap();
        buffer.release(&device);
        assert_eq!(buffer.capacity(), 0);
        assert!(buffer.buffer().is_none());
        assert_eq!(device.allocated_bytes(), 0);
    }

    #[test]
    fn test_failed_growth_keeps_old_allocation() {
        let device = SoftwareDevice::with_memory_budget(2048);
        let mut buffer = scratch();
        buffer.ensure(&device, 1024).unwrap();
        let first = buffer.buffer();
        assert!(buffer.ensure(&device, 4096).is_err());
        assert_eq!(buffer.buffer(), first);
        assert_eq!(buffer.capacity(), 1024);
    }
}
