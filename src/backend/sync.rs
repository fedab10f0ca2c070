// Synchronization primitives
//
// A render is one primary command buffer and one fence: record, submit, block
// on the fence. The pool and fence are reused across renders.

use ash::vk;

use super::VulkanDevice;
use crate::error::{Error, Result};

/// Command buffer and fence for one synchronous submission at a time
pub struct SubmitSync {
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
}

impl SubmitSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_family)
            // TRANSIENT: Command buffers are short-lived
            // RESET: Allow individual buffer reset
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );

        let fence_info = vk::FenceCreateInfo::builder();

        unsafe {
            let command_pool = device.device.create_command_pool(&pool_info, None)?;

            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);

            let command_buffer = match device.device.allocate_command_buffers(&alloc_info) {
                Ok(buffers) => buffers[0],
                Err(e) => {
                    device.device.destroy_command_pool(command_pool, None);
                    return Err(e.into());
                }
            };

            let fence = match device.device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.device.destroy_command_pool(command_pool, None);
                    return Err(e.into());
                }
            };

            Ok(Self { command_pool, command_buffer, fence })
        }
    }

    /// Reset and begin recording
    pub fn begin(&self, device: &VulkanDevice) -> Result<vk::CommandBuffer> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device
                .device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())?;
            device.device.begin_command_buffer(self.command_buffer, &begin_info)?;
        }
        Ok(self.command_buffer)
    }

    /// End recording, submit, and block until the GPU signals the fence
    pub fn submit_and_wait(&self, device: &VulkanDevice, timeout_ns: u64) -> Result<()> {
        let command_buffers = [self.command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        unsafe {
            device.device.end_command_buffer(self.command_buffer)?;
            device.device.reset_fences(&[self.fence])?;
            device
                .device
                .queue_submit(device.queue, &[submit_info.build()], self.fence)?;

            match device.device.wait_for_fences(&[self.fence], true, timeout_ns) {
                Ok(()) => Ok(()),
                Err(vk::Result::TIMEOUT) => {
                    log::error!("Render did not complete within {} ns", timeout_ns);
                    Err(Error::DeviceLost)
                }
                Err(e) => Err(e.into()),
            }
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_fence(self.fence, None);
            device.destroy_command_pool(self.command_pool, None);
        }
    }
}
