// Buffer utilities for staging, vertex, index, uniform and storage buffers
//
// Every buffer here lives in host-visible memory and stays persistently mapped,
// so host reads and writes are plain memory copies.

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;

use super::VulkanDevice;
use crate::error::{Error, Result};

/// Host-visible GPU buffer
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
}

impl GpuBuffer {
    /// Create a mapped buffer with specified usage
    pub fn new(
        device: &VulkanDevice,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = match device.allocate(name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            device.free(allocation);
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        let mut created = Self { buffer, size, allocation: Some(allocation) };
        // Fresh memory is not guaranteed to be zeroed
        if let Err(e) = created.mapped_mut().map(|slice| slice.fill(0)) {
            created.destroy(device);
            return Err(e);
        }
        log::debug!("Created buffer '{}' ({} bytes)", name, size);
        Ok(created)
    }

    /// Staging buffer used for image upload and readback
    pub fn staging(device: &VulkanDevice, name: &str, size: vk::DeviceSize) -> Result<Self> {
        Self::new(
            device,
            name,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )
    }

    pub fn mapped(&self) -> Result<&[u8]> {
        let len = self.size as usize;
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .map(|slice| &slice[..len])
            .ok_or(Error::OutOfDeviceMemory)
    }

    pub fn mapped_mut(&mut self) -> Result<&mut [u8]> {
        let len = self.size as usize;
        self.allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .map(|slice| &mut slice[..len])
            .ok_or(Error::OutOfDeviceMemory)
    }

    /// Replace the whole content; callers have validated the length
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.mapped_mut()?[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        Ok(self.mapped()?.to_vec())
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe { device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            device.free(allocation);
        }
    }
}
