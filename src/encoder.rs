// Compute encoders
//
// An encoder runs one compute shader over an image on every render, after all
// render targets have drawn. Its bindings are assigned in a fixed order:
//   uniform buffer, storage buffer, input storage image, output buffer
// with absent buffers skipped, so a shader with only an image and an output
// buffer reads them at slots 0 and 1.
//
// The dispatch may write the image; its staging copy is refreshed afterwards.

use ash::vk;

use crate::backend::image::{copy_region, layout_barrier};
use crate::backend::pipeline::{
    create_compute_pipeline, create_pipeline_layout, DescriptorResource, DescriptorState,
};
use crate::backend::{GpuBuffer, VulkanDevice};
use crate::binding::{check_bindings, merge_declared, BindingDecl, BindingKind};
use crate::context::DeviceContext;
use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::registry::{EncoderHandle, ImageHandle, ImageKey, Registry, ShaderHandle};
use crate::resource::{check_size, host_buffer, write_exact, ImageEntry};
use crate::shader::StageKind;

pub const UNIFORM_BUFFER: &str = "uniform_buffer";
pub const STORAGE_BUFFER: &str = "storage_buffer";

#[derive(Debug, Clone)]
pub struct EncoderDesc {
    image: ImageHandle,
    compute_shader: ShaderHandle,
    format: Option<String>,
    groups: Option<[u32; 3]>,
    uniform_buffer_size: usize,
    storage_buffer_size: usize,
    output_buffer_size: usize,
}

impl EncoderDesc {
    pub fn new(image: ImageHandle, compute_shader: ShaderHandle) -> Self {
        Self {
            image,
            compute_shader,
            format: None,
            groups: None,
            uniform_buffer_size: 0,
            storage_buffer_size: 0,
            output_buffer_size: 0,
        }
    }

    /// View the image through another format tag of the same pixel size
    pub fn format(mut self, format: &str) -> Self {
        self.format = Some(format.to_string());
        self
    }

    /// Workgroup count, defaults to the image extent over the local size
    pub fn groups(mut self, groups: [u32; 3]) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn uniform_buffer_size(mut self, size: usize) -> Self {
        self.uniform_buffer_size = size;
        self
    }

    pub fn storage_buffer_size(mut self, size: usize) -> Self {
        self.storage_buffer_size = size;
        self
    }

    pub fn output_buffer_size(mut self, size: usize) -> Self {
        self.output_buffer_size = size;
        self
    }

    /// Sequential slots for the bindings this encoder provides
    fn layout(&self) -> Vec<BindingDecl> {
        let mut kinds = Vec::with_capacity(4);
        if self.uniform_buffer_size > 0 {
            kinds.push(BindingKind::UniformBuffer);
        }
        if self.storage_buffer_size > 0 {
            kinds.push(BindingKind::StorageBuffer);
        }
        kinds.push(BindingKind::StorageImage);
        if self.output_buffer_size > 0 {
            kinds.push(BindingKind::StorageBuffer);
        }
        kinds
            .into_iter()
            .enumerate()
            .map(|(slot, kind)| BindingDecl { slot: slot as u32, kind, count: 1 })
            .collect()
    }
}

/// Default dispatch size covering `extent` with `local_size` workgroups
fn default_groups(extent: vk::Extent2D, local_size: [u32; 3]) -> [u32; 3] {
    [
        (extent.width / local_size[0]).max(1),
        (extent.height / local_size[1]).max(1),
        1,
    ]
}

pub(crate) struct EncoderEntry {
    pub image: ImageKey,
    /// Reinterpreting view, null when the image's own view is bound
    pub view: vk::ImageView,
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptors: DescriptorState,
    pub uniform_buffer: Option<GpuBuffer>,
    pub storage_buffer: Option<GpuBuffer>,
    pub output_buffer: Option<GpuBuffer>,
    pub groups: [u32; 3],
}

impl EncoderEntry {
    fn build(device: &VulkanDevice, registry: &Registry, desc: &EncoderDesc) -> Result<Self> {
        let shader = registry.shader(desc.compute_shader)?;
        if shader.kind != StageKind::Compute {
            return Err(Error::InvalidResourceDescriptor(format!(
                "encoders need a compute shader, got {:?}",
                shader.kind
            )));
        }

        let image = registry.image(desc.image)?;
        if !image.gpu.supports(vk::ImageUsageFlags::STORAGE) {
            return Err(Error::InvalidResourceDescriptor(format!(
                "format '{}' cannot be used as a storage image on this device",
                image.format.tag()
            )));
        }

        let view_format = match &desc.format {
            Some(tag) => {
                let format = PixelFormat::parse(tag)?;
                if format.bytes_per_pixel() != image.format.bytes_per_pixel() {
                    return Err(Error::InvalidResourceDescriptor(format!(
                        "cannot view '{}' image as '{}'",
                        image.format.tag(),
                        format.tag()
                    )));
                }
                let features = device.format_features(format.format);
                if !features.contains(vk::FormatFeatureFlags::STORAGE_IMAGE) {
                    return Err(Error::InvalidResourceDescriptor(format!(
                        "format '{}' cannot be used as a storage image on this device",
                        format.tag()
                    )));
                }
                Some(format.format).filter(|&f| f != image.gpu.format)
            }
            None => None,
        };

        let groups = desc
            .groups
            .unwrap_or_else(|| default_groups(image.extent(), shader.local_size));
        if groups.contains(&0) {
            return Err(Error::InvalidResourceDescriptor(format!(
                "dispatch size {:?} has a zero dimension",
                groups
            )));
        }

        let provided = desc.layout();
        let declared =
            merge_declared(&[(vk::ShaderStageFlags::COMPUTE, shader.bindings.as_slice())])?;
        check_bindings(&declared, &provided)?;

        let mut entry = Self {
            image: desc.image.key,
            view: vk::ImageView::null(),
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
            descriptors: DescriptorState::default(),
            uniform_buffer: None,
            storage_buffer: None,
            output_buffer: None,
            groups,
        };

        let created = (|| -> Result<()> {
            let optional = |size: usize, name: &str| -> Result<Option<GpuBuffer>> {
                match size {
                    0 => Ok(None),
                    size => host_buffer(device, name, size).map(Some),
                }
            };
            entry.uniform_buffer = optional(desc.uniform_buffer_size, UNIFORM_BUFFER)?;
            entry.storage_buffer = optional(desc.storage_buffer_size, STORAGE_BUFFER)?;
            entry.output_buffer = optional(desc.output_buffer_size, "output_buffer")?;
            if let Some(format) = view_format {
                entry.view = image.gpu.reinterpret(device, format)?;
            }
            let image_view = if entry.view == vk::ImageView::null() {
                image.gpu.view
            } else {
                entry.view
            };

            let mut resources = Vec::with_capacity(provided.len());
            let mut slots = provided.iter().map(|decl| decl.slot);
            let mut next_slot = || slots.next().unwrap_or_default();
            if let Some(buffer) = &entry.uniform_buffer {
                resources.push((
                    next_slot(),
                    DescriptorResource::Buffer(vk::DescriptorType::UNIFORM_BUFFER, buffer.buffer),
                ));
            }
            if let Some(buffer) = &entry.storage_buffer {
                resources.push((
                    next_slot(),
                    DescriptorResource::Buffer(vk::DescriptorType::STORAGE_BUFFER, buffer.buffer),
                ));
            }
            resources.push((
                next_slot(),
                DescriptorResource::Images(
                    vk::DescriptorType::STORAGE_IMAGE,
                    vec![vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view,
                        image_layout: vk::ImageLayout::GENERAL,
                    }],
                ),
            ));
            if let Some(buffer) = &entry.output_buffer {
                resources.push((
                    next_slot(),
                    DescriptorResource::Buffer(vk::DescriptorType::STORAGE_BUFFER, buffer.buffer),
                ));
            }

            let layout_bindings: Vec<_> = declared.iter().map(|b| b.layout_binding()).collect();
            entry.descriptors = DescriptorState::new(device, &layout_bindings)?;
            entry.descriptors.write(device, &resources);
            entry.layout = create_pipeline_layout(device, entry.descriptors.set_layout)?;
            entry.pipeline =
                create_compute_pipeline(device, shader.module, &shader.entry_point, entry.layout)?;
            Ok(())
        })();

        match created {
            Ok(()) => Ok(entry),
            Err(e) => {
                entry.destroy(device);
                Err(e)
            }
        }
    }

    fn buffer(&self, key: &str) -> Result<&GpuBuffer> {
        let found = match key {
            UNIFORM_BUFFER => self.uniform_buffer.as_ref(),
            STORAGE_BUFFER => self.storage_buffer.as_ref(),
            _ => None,
        };
        found.ok_or_else(|| Error::UnknownBinding(key.to_string()))
    }

    fn buffer_mut(&mut self, key: &str) -> Result<&mut GpuBuffer> {
        let found = match key {
            UNIFORM_BUFFER => self.uniform_buffer.as_mut(),
            STORAGE_BUFFER => self.storage_buffer.as_mut(),
            _ => None,
        };
        found.ok_or_else(|| Error::UnknownBinding(key.to_string()))
    }

    pub fn update(&mut self, entries: &[(&str, &[u8])]) -> Result<()> {
        for (key, data) in entries {
            check_size(self.buffer(key)?, data)?;
        }
        for (key, data) in entries {
            write_exact(self.buffer_mut(key)?, data)?;
        }
        Ok(())
    }

    /// Dispatch over `image`, which is in shader-read layout before and after,
    /// then copy it back to its staging buffer
    pub fn record(&self, device: &VulkanDevice, cmd: vk::CommandBuffer, image: &ImageEntry) {
        let handle = image.gpu.image;
        let to_general = layout_barrier(
            handle,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::SHADER_READ,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        );
        let to_transfer = layout_barrier(
            handle,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::TRANSFER_READ,
        );
        let to_read = layout_barrier(
            handle,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::TRANSFER_READ,
            vk::AccessFlags::SHADER_READ,
        );

        unsafe {
            device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_general],
            );
            device
                .device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            device.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.layout,
                0,
                &[self.descriptors.set],
                &[],
            );
            let [x, y, z] = self.groups;
            device.device.cmd_dispatch(cmd, x, y, z);

            device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            device.device.cmd_copy_image_to_buffer(
                cmd,
                handle,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image.staging.buffer,
                &[copy_region(image.extent())],
            );
            device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_read],
            );
        }
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_pipeline(self.pipeline, None);
            device.device.destroy_pipeline_layout(self.layout, None);
            device.device.destroy_image_view(self.view, None);
        }
        self.view = vk::ImageView::null();
        self.descriptors.destroy(&device.device);
        for buffer in [
            self.uniform_buffer.take(),
            self.storage_buffer.take(),
            self.output_buffer.take(),
        ]
        .iter_mut()
        .flatten()
        {
            buffer.destroy(device);
        }
    }
}

impl DeviceContext {
    /// Compute program over an image, dispatched on every render
    pub fn create_encoder(&self, desc: EncoderDesc) -> Result<EncoderHandle> {
        let mut registry = self.registry.lock();
        let entry = EncoderEntry::build(&self.device, &registry, &desc)?;
        let groups = entry.groups;
        let key = registry.encoders.insert(entry);
        registry.encoder_order.push(key);
        log::debug!("Created encoder {:?} dispatching {:?}", key, groups);
        Ok(registry.handle(key))
    }

    /// Replace `uniform_buffer` / `storage_buffer` contents, all or nothing
    pub fn update_encoder<'a>(
        &self,
        encoder: EncoderHandle,
        entries: impl IntoIterator<Item = (&'a str, &'a [u8])>,
    ) -> Result<()> {
        let entries: Vec<(&str, &[u8])> = entries.into_iter().collect();
        let mut registry = self.registry.lock();
        registry.encoder_mut(encoder)?.update(&entries)
    }

    /// Output buffer as written by the last render
    pub fn read_encoder_output(&self, encoder: EncoderHandle) -> Result<Vec<u8>> {
        let registry = self.registry.lock();
        registry
            .encoder(encoder)?
            .output_buffer
            .as_ref()
            .ok_or_else(|| Error::UnknownBinding("output_buffer".to_string()))?
            .read()
    }

    pub fn destroy_encoder(&self, encoder: EncoderHandle) -> Result<()> {
        let mut registry = self.registry.lock();
        registry.encoder(encoder)?;
        registry.remove_encoder(encoder.key, &self.device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ShaderKey;
    use slotmap::Key;

    fn desc() -> EncoderDesc {
        let registry = Registry::new(1);
        EncoderDesc::new(registry.handle(ImageKey::null()), registry.handle(ShaderKey::null()))
    }

    fn kinds(desc: &EncoderDesc) -> Vec<(u32, BindingKind)> {
        desc.layout().iter().map(|d| (d.slot, d.kind)).collect()
    }

    #[test]
    fn image_only_layout() {
        assert_eq!(kinds(&desc()), vec![(0, BindingKind::StorageImage)]);
    }

    #[test]
    fn bindings_are_sequential_and_skip_absent_buffers() {
        let full = desc()
            .uniform_buffer_size(16)
            .storage_buffer_size(64)
            .output_buffer_size(4);
        assert_eq!(
            kinds(&full),
            vec![
                (0, BindingKind::UniformBuffer),
                (1, BindingKind::StorageBuffer),
                (2, BindingKind::StorageImage),
                (3, BindingKind::StorageBuffer),
            ]
        );

        let output_only = desc().output_buffer_size(4);
        assert_eq!(
            kinds(&output_only),
            vec![(0, BindingKind::StorageImage), (1, BindingKind::StorageBuffer)]
        );
    }

    #[test]
    fn default_groups_divide_extent() {
        let extent = vk::Extent2D { width: 64, height: 32 };
        assert_eq!(default_groups(extent, [8, 8, 1]), [8, 4, 1]);
        assert_eq!(default_groups(extent, [1, 1, 1]), [64, 32, 1]);
        // Never a zero dispatch
        assert_eq!(default_groups(vk::Extent2D { width: 2, height: 2 }, [8, 8, 1]), [1, 1, 1]);
    }
}
