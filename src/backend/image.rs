// Device-local images and their views
//
// Color images are created with every usage their format supports out of
// sampled/transfer/attachment/storage so one image can be uploaded, rendered
// into, sampled and read back. They are also format-mutable, so a storage view
// may reinterpret the texels in another format of the same size.

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;

use super::VulkanDevice;
use crate::error::{Error, Result};

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

pub const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    allocation: Option<Allocation>,
}

impl GpuImage {
    /// Create a 2D color image usable for sampling and transfers
    pub fn color(
        device: &VulkanDevice,
        name: &str,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> Result<Self> {
        let features = device.format_features(format);
        if !features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE) {
            return Err(Error::InvalidResourceDescriptor(format!(
                "{:?} cannot be sampled on this device",
                format
            )));
        }

        let mut usage = vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST;
        if features.contains(vk::FormatFeatureFlags::COLOR_ATTACHMENT) {
            usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if features.contains(vk::FormatFeatureFlags::STORAGE_IMAGE) {
            usage |= vk::ImageUsageFlags::STORAGE;
        }

        Self::new(
            device,
            name,
            extent,
            format,
            usage,
            vk::ImageCreateFlags::MUTABLE_FORMAT,
            vk::ImageAspectFlags::COLOR,
        )
    }

    /// Create a depth buffer image, memory, and view
    pub fn depth(device: &VulkanDevice, name: &str, extent: vk::Extent2D) -> Result<Self> {
        Self::new(
            device,
            name,
            extent,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageCreateFlags::empty(),
            vk::ImageAspectFlags::DEPTH,
        )
    }

    fn new(
        device: &VulkanDevice,
        name: &str,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        flags: vk::ImageCreateFlags,
        aspect_mask: vk::ImageAspectFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = match device.allocate(name, requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            device.free(allocation);
            unsafe { device.device.destroy_image(image, None) };
            return Err(e.into());
        }

        let view = match create_view(device, image, format, aspect_mask) {
            Ok(view) => view,
            Err(e) => {
                device.free(allocation);
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        log::debug!("Created image '{}' {}x{} {:?}", name, extent.width, extent.height, format);

        Ok(Self {
            image,
            view,
            extent,
            format,
            usage,
            allocation: Some(allocation),
        })
    }

    pub fn supports(&self, usage: vk::ImageUsageFlags) -> bool {
        self.usage.contains(usage)
    }

    /// Extra color view reinterpreting the image as `format`; the caller
    /// destroys it
    pub fn reinterpret(&self, device: &VulkanDevice, format: vk::Format) -> Result<vk::ImageView> {
        create_view(device, self.image, format, vk::ImageAspectFlags::COLOR)
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_image_view(self.view, None);
            device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            device.free(allocation);
        }
    }
}

fn create_view(
    device: &VulkanDevice,
    image: vk::Image,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            ..COLOR_RANGE
        });
    Ok(unsafe { device.device.create_image_view(&view_info, None) }?)
}

/// Full-image buffer <-> image copy region
pub fn copy_region(extent: vk::Extent2D) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
        image_extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
    }
}

/// Layout transition barrier over the single color subresource
pub fn layout_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier {
    vk::ImageMemoryBarrier::builder()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(COLOR_RANGE)
        .build()
}
