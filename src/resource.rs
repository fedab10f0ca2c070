// Images, buffers and samplers
//
// Images are device-local with a host-visible staging buffer of exactly their
// byte size. Host writes land in staging and are flagged for upload on the next
// render; render output is copied back into the same staging buffer, so staging
// always mirrors what the device holds once a render has completed.
// Buffers are host-visible and persistently mapped, host access is a memcpy.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::backend::{GpuBuffer, GpuImage, VulkanDevice};
use crate::config::RowOrder;
use crate::context::DeviceContext;
use crate::error::{Error, Result};
use crate::format::{flip_rows, PixelFormat, VertexFormat};
use crate::registry::{BufferHandle, ImageHandle, ImageKey, RenderTargetKey, SamplerHandle};

// =============================================================================
// IMAGES
// =============================================================================

pub(crate) struct ImageEntry {
    pub gpu: GpuImage,
    pub staging: GpuBuffer,
    pub format: PixelFormat,
    /// Staging holds bytes the device image has not seen yet
    pub pending_upload: bool,
    pub attachment_of: Option<RenderTargetKey>,
}

impl ImageEntry {
    pub fn new(
        device: &VulkanDevice,
        name: &str,
        extent: vk::Extent2D,
        format: PixelFormat,
    ) -> Result<Self> {
        check_extent(device, extent)?;

        let mut gpu = GpuImage::color(device, name, extent, format.format)?;
        let size = extent.width as u64 * extent.height as u64 * format.bytes_per_pixel() as u64;
        let staging = match GpuBuffer::staging(device, name, size) {
            Ok(staging) => staging,
            Err(e) => {
                gpu.destroy(device);
                return Err(e);
            }
        };

        // Zeroed staging, the first render uploads it so reads and samples agree
        Ok(Self {
            gpu,
            staging,
            format,
            pending_upload: true,
            attachment_of: None,
        })
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.gpu.extent
    }

    pub fn byte_size(&self) -> usize {
        self.staging.size as usize
    }

    fn row_bytes(&self) -> usize {
        self.gpu.extent.width as usize * self.format.bytes_per_pixel() as usize
    }

    pub fn write(&mut self, data: &[u8], rows: RowOrder) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let expected = self.byte_size();
        if data.len() != expected {
            return Err(Error::SizeMismatch { expected, actual: data.len() });
        }

        let row_bytes = self.row_bytes();
        let staging = self.staging.mapped_mut()?;
        staging.copy_from_slice(data);
        if rows == RowOrder::BottomUp {
            flip_rows(staging, row_bytes);
        }
        self.pending_upload = true;
        Ok(())
    }

    pub fn read(&self, rows: RowOrder) -> Result<Vec<u8>> {
        let mut data = self.staging.read()?;
        if rows == RowOrder::BottomUp {
            flip_rows(&mut data, self.row_bytes());
        }
        Ok(data)
    }

    /// Fill every pixel with one encoded value, used for attachment clears
    pub fn fill(&mut self, pixel: &[u8]) -> Result<()> {
        for chunk in self.staging.mapped_mut()?.chunks_exact_mut(pixel.len()) {
            chunk.copy_from_slice(pixel);
        }
        self.pending_upload = true;
        Ok(())
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        self.gpu.destroy(device);
        self.staging.destroy(device);
    }
}

fn check_extent(device: &VulkanDevice, extent: vk::Extent2D) -> Result<()> {
    if extent.width == 0 || extent.height == 0 {
        return Err(Error::InvalidResourceDescriptor(format!(
            "extent {}x{} is empty",
            extent.width, extent.height
        )));
    }
    let max = device.properties.limits.max_image_dimension2_d;
    if extent.width > max || extent.height > max {
        return Err(Error::InvalidResourceDescriptor(format!(
            "extent {}x{} exceeds the device limit of {}",
            extent.width, extent.height, max
        )));
    }
    Ok(())
}

/// Extent, format and size of an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub byte_size: usize,
}

// =============================================================================
// BUFFERS
// =============================================================================

pub(crate) struct BufferEntry {
    pub gpu: GpuBuffer,
    pub format: Option<VertexFormat>,
}

impl BufferEntry {
    pub fn byte_size(&self) -> usize {
        self.gpu.size as usize
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        write_exact(&mut self.gpu, data)
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        self.gpu.destroy(device);
    }
}

/// Host-visible buffer usable as any kind of pipeline input
pub(crate) fn host_buffer(device: &VulkanDevice, name: &str, size: usize) -> Result<GpuBuffer> {
    if size == 0 {
        return Err(Error::InvalidResourceDescriptor(format!("buffer '{}' has zero size", name)));
    }
    GpuBuffer::new(
        device,
        name,
        size as vk::DeviceSize,
        vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::INDEX_BUFFER
            | vk::BufferUsageFlags::UNIFORM_BUFFER
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::CpuToGpu,
    )
}

/// Full replacement write; empty data leaves the buffer untouched
pub(crate) fn write_exact(buffer: &mut GpuBuffer, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    check_size(buffer, data)?;
    buffer.write(data)
}

pub(crate) fn check_size(buffer: &GpuBuffer, data: &[u8]) -> Result<()> {
    let expected = buffer.size as usize;
    if !data.is_empty() && data.len() != expected {
        return Err(Error::SizeMismatch { expected, actual: data.len() });
    }
    Ok(())
}

// =============================================================================
// SAMPLERS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wrap {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SamplerDesc {
    pub filter: Filter,
    pub wrap: Wrap,
}

impl SamplerDesc {
    fn vk_filter(&self) -> vk::Filter {
        match self.filter {
            Filter::Nearest => vk::Filter::NEAREST,
            Filter::Linear => vk::Filter::LINEAR,
        }
    }

    fn address_mode(&self) -> vk::SamplerAddressMode {
        match self.wrap {
            Wrap::Repeat => vk::SamplerAddressMode::REPEAT,
            Wrap::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
            Wrap::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        }
    }
}

pub(crate) struct SamplerEntry {
    pub sampler: vk::Sampler,
    pub image: ImageKey,
    pub desc: SamplerDesc,
}

impl SamplerEntry {
    pub fn destroy(&self, device: &VulkanDevice) {
        unsafe { device.device.destroy_sampler(self.sampler, None) };
    }
}

fn create_vk_sampler(device: &VulkanDevice, desc: &SamplerDesc) -> Result<vk::Sampler> {
    let filter = desc.vk_filter();
    let address_mode = desc.address_mode();
    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(filter)
        .min_filter(filter)
        .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
        .address_mode_u(address_mode)
        .address_mode_v(address_mode)
        .address_mode_w(address_mode)
        .anisotropy_enable(false)
        .compare_enable(false)
        .min_lod(0.0)
        .max_lod(0.0)
        .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
        .unnormalized_coordinates(false);

    let sampler = unsafe { device.device.create_sampler(&sampler_info, None) }?;
    Ok(sampler)
}

// =============================================================================
// HANDLES
// =============================================================================

/// Either kind of host-readable resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceHandle {
    Image(ImageHandle),
    Buffer(BufferHandle),
}

impl From<ImageHandle> for ResourceHandle {
    fn from(handle: ImageHandle) -> Self {
        ResourceHandle::Image(handle)
    }
}

impl From<BufferHandle> for ResourceHandle {
    fn from(handle: BufferHandle) -> Self {
        ResourceHandle::Buffer(handle)
    }
}

// =============================================================================
// CONTEXT OPERATIONS
// =============================================================================

impl DeviceContext {
    /// Create an image of `extent` pixels in the given format tag (e.g. "4b")
    pub fn create_image(&self, extent: (u32, u32), format: &str) -> Result<ImageHandle> {
        let format = PixelFormat::parse(format)?;
        let extent = vk::Extent2D { width: extent.0, height: extent.1 };
        let entry = ImageEntry::new(&self.device, "image", extent, format)?;

        let mut registry = self.registry.lock();
        let key = registry.images.insert(entry);
        log::debug!(
            "Created image {:?} {}x{} '{}'",
            key,
            extent.width,
            extent.height,
            format.tag()
        );
        Ok(registry.handle(key))
    }

    pub fn create_image_with_data(
        &self,
        extent: (u32, u32),
        format: &str,
        data: &[u8],
    ) -> Result<ImageHandle> {
        let image = self.create_image(extent, format)?;
        if let Err(e) = self.write(image, data) {
            self.destroy_image(image)?;
            return Err(e);
        }
        Ok(image)
    }

    /// Create an untyped buffer of `size` bytes
    pub fn create_buffer(&self, size: usize) -> Result<BufferHandle> {
        let gpu = host_buffer(&self.device, "buffer", size)?;
        let mut registry = self.registry.lock();
        let key = registry.buffers.insert(BufferEntry { gpu, format: None });
        log::debug!("Created buffer {:?} ({} bytes)", key, size);
        Ok(registry.handle(key))
    }

    /// Create a buffer holding `count` elements of `format`
    pub fn create_buffer_with_format(&self, count: usize, format: &str) -> Result<BufferHandle> {
        let format = VertexFormat::parse(format)?;
        if format.is_empty() {
            return Err(Error::InvalidResourceDescriptor("buffer format is empty".into()));
        }
        let size = count.checked_mul(format.stride as usize).ok_or_else(|| {
            Error::InvalidResourceDescriptor(format!("{} elements overflow the buffer size", count))
        })?;
        let gpu = host_buffer(&self.device, "buffer", size)?;
        let mut registry = self.registry.lock();
        let key = registry.buffers.insert(BufferEntry { gpu, format: Some(format) });
        log::debug!("Created buffer {:?} ({} elements, {} bytes)", key, count, size);
        Ok(registry.handle(key))
    }

    pub fn create_sampler(&self, image: ImageHandle) -> Result<SamplerHandle> {
        self.create_sampler_with(image, SamplerDesc::default())
    }

    pub fn create_sampler_with(
        &self,
        image: ImageHandle,
        desc: SamplerDesc,
    ) -> Result<SamplerHandle> {
        let mut registry = self.registry.lock();
        let format = registry.image(image)?.format.format;

        if desc.filter == Filter::Linear
            && !self
                .device
                .format_features(format)
                .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
        {
            return Err(Error::InvalidResourceDescriptor(format!(
                "{:?} does not support linear filtering",
                format
            )));
        }

        let sampler = create_vk_sampler(&self.device, &desc)?;
        let key = registry.samplers.insert(SamplerEntry { sampler, image: image.key, desc });
        log::debug!("Created sampler {:?} over image {:?}", key, image.key);
        Ok(registry.handle(key))
    }

    /// Replace the whole content of an image or buffer
    ///
    /// Image bytes are tightly packed rows in the configured row order. The
    /// upload happens on the next render.
    pub fn write(&self, resource: impl Into<ResourceHandle>, data: &[u8]) -> Result<()> {
        let mut registry = self.registry.lock();
        match resource.into() {
            ResourceHandle::Image(h) => registry.image_mut(h)?.write(data, self.row_order),
            ResourceHandle::Buffer(h) => registry.buffer_mut(h)?.write(data),
        }
    }

    /// Current content of an image or buffer
    pub fn read(&self, resource: impl Into<ResourceHandle>) -> Result<Vec<u8>> {
        let registry = self.registry.lock();
        match resource.into() {
            ResourceHandle::Image(h) => registry.image(h)?.read(self.row_order),
            ResourceHandle::Buffer(h) => registry.buffer(h)?.gpu.read(),
        }
    }

    pub fn byte_size(&self, resource: impl Into<ResourceHandle>) -> Result<usize> {
        let registry = self.registry.lock();
        match resource.into() {
            ResourceHandle::Image(h) => Ok(registry.image(h)?.byte_size()),
            ResourceHandle::Buffer(h) => Ok(registry.buffer(h)?.byte_size()),
        }
    }

    pub fn image_info(&self, image: ImageHandle) -> Result<ImageInfo> {
        let registry = self.registry.lock();
        let entry = registry.image(image)?;
        let extent = entry.extent();
        Ok(ImageInfo {
            width: extent.width,
            height: extent.height,
            format: entry.format.tag(),
            byte_size: entry.byte_size(),
        })
    }

    pub fn buffer_size(&self, buffer: BufferHandle) -> Result<usize> {
        Ok(self.registry.lock().buffer(buffer)?.byte_size())
    }

    /// Element stride of a buffer created with a format, `None` for untyped
    pub fn buffer_stride(&self, buffer: BufferHandle) -> Result<Option<u32>> {
        Ok(self.registry.lock().buffer(buffer)?.format.as_ref().map(|f| f.stride))
    }

    pub fn sampler_desc(&self, sampler: SamplerHandle) -> Result<SamplerDesc> {
        Ok(self.registry.lock().sampler(sampler)?.desc)
    }

    pub fn destroy(&self, resource: impl Into<ResourceHandle>) -> Result<()> {
        match resource.into() {
            ResourceHandle::Image(h) => self.destroy_image(h),
            ResourceHandle::Buffer(h) => self.destroy_buffer(h),
        }
    }

    pub fn destroy_image(&self, image: ImageHandle) -> Result<()> {
        let mut registry = self.registry.lock();
        registry.image(image)?;
        if let Some(user) = registry.image_user(image.key) {
            log::debug!("Refusing to destroy image {:?}: {}", image.key, user);
            return Err(Error::ResourceInUse("image"));
        }
        if let Some(mut entry) = registry.images.remove(image.key) {
            entry.destroy(&self.device);
            log::debug!("Destroyed image {:?}", image.key);
        }
        Ok(())
    }

    pub fn destroy_buffer(&self, buffer: BufferHandle) -> Result<()> {
        let mut registry = self.registry.lock();
        registry.buffer(buffer)?;
        if registry.buffer_in_use(buffer.key) {
            return Err(Error::ResourceInUse("buffer"));
        }
        if let Some(mut entry) = registry.buffers.remove(buffer.key) {
            entry.destroy(&self.device);
            log::debug!("Destroyed buffer {:?}", buffer.key);
        }
        Ok(())
    }

    pub fn destroy_sampler(&self, sampler: SamplerHandle) -> Result<()> {
        let mut registry = self.registry.lock();
        registry.sampler(sampler)?;
        if registry.sampler_in_use(sampler.key) {
            return Err(Error::ResourceInUse("sampler"));
        }
        if let Some(entry) = registry.samplers.remove(sampler.key) {
            entry.destroy(&self.device);
            log::debug!("Destroyed sampler {:?}", sampler.key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_defaults_to_linear_repeat() {
        let desc = SamplerDesc::default();
        assert_eq!(desc.vk_filter(), vk::Filter::LINEAR);
        assert_eq!(desc.address_mode(), vk::SamplerAddressMode::REPEAT);
    }

    #[test]
    fn sampler_modes_map_to_vulkan() {
        let desc = SamplerDesc { filter: Filter::Nearest, wrap: Wrap::ClampToEdge };
        assert_eq!(desc.vk_filter(), vk::Filter::NEAREST);
        assert_eq!(desc.address_mode(), vk::SamplerAddressMode::CLAMP_TO_EDGE);
        let mirrored = SamplerDesc { wrap: Wrap::MirroredRepeat, ..desc };
        assert_eq!(mirrored.address_mode(), vk::SamplerAddressMode::MIRRORED_REPEAT);
    }

    #[test]
    fn resource_handles_convert() {
        let image: ImageHandle = crate::registry::Registry::new(3).handle(ImageKey::default());
        assert_eq!(ResourceHandle::from(image), ResourceHandle::Image(image));
    }
}
