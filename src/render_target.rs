// Render targets
//
// A render target owns its color attachments (registered as images so they
// can be read like any other image), an optional depth buffer, the render pass
// and framebuffer, and the ordered list of pipelines drawing into it.

use ash::vk;

use crate::backend::image::DEPTH_FORMAT;
use crate::backend::pipeline::{create_framebuffer, create_render_pass};
use crate::backend::{GpuImage, VulkanDevice};
use crate::context::DeviceContext;
use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::pipeline::{PipelineDesc, PipelineEntry, TargetInfo};
use crate::registry::{
    ImageHandle, ImageKey, PipelineHandle, PipelineKey, RenderTargetHandle, RenderTargetKey,
};
use crate::resource::ImageEntry;

pub const MAX_OUTPUTS: u32 = 8;

/// Shape of a render target
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTargetDesc {
    width: u32,
    height: u32,
    format: Option<String>,
    outputs: u32,
    depth: bool,
    clear_color: Option<[f32; 4]>,
}

impl RenderTargetDesc {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: None,
            outputs: 1,
            depth: false,
            clear_color: None,
        }
    }

    /// Attachment format tag, defaults to the configured one
    pub fn format(mut self, format: &str) -> Self {
        self.format = Some(format.to_string());
        self
    }

    pub fn outputs(mut self, count: u32) -> Self {
        self.outputs = count;
        self
    }

    pub fn depth(mut self, enabled: bool) -> Self {
        self.depth = enabled;
        self
    }

    pub fn clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = Some(color);
        self
    }
}

pub(crate) struct RenderTargetEntry {
    pub extent: vk::Extent2D,
    pub format: PixelFormat,
    pub clear_color: [f32; 4],
    pub outputs: Vec<ImageKey>,
    pub depth: Option<GpuImage>,
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub pipelines: Vec<PipelineKey>,
}

impl RenderTargetEntry {
    fn info(&self, key: RenderTargetKey) -> TargetInfo {
        TargetInfo {
            key,
            extent: self.extent,
            color_count: self.outputs.len() as u32,
            has_depth: self.depth.is_some(),
            render_pass: self.render_pass,
        }
    }

    /// One clear value per attachment, colors first
    pub fn clear_values(&self) -> Vec<vk::ClearValue> {
        let color = vk::ClearValue { color: self.format.clear_value(self.clear_color) };
        let mut values = vec![color; self.outputs.len()];
        if self.depth.is_some() {
            values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            });
        }
        values
    }

    /// Render pass, framebuffer and depth; attachments are registry images
    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_framebuffer(self.framebuffer, None);
            device.device.destroy_render_pass(self.render_pass, None);
        }
        if let Some(mut depth) = self.depth.take() {
            depth.destroy(device);
        }
    }
}

/// Attachments and pass objects before they are registered
struct Attachments {
    images: Vec<ImageEntry>,
    entry: RenderTargetEntry,
}

impl Attachments {
    fn create(
        device: &VulkanDevice,
        extent: vk::Extent2D,
        format: PixelFormat,
        outputs: u32,
        depth: bool,
        clear_color: [f32; 4],
    ) -> Result<Self> {
        let mut built = Self {
            images: Vec::with_capacity(outputs as usize),
            entry: RenderTargetEntry {
                extent,
                format,
                clear_color,
                outputs: Vec::new(),
                depth: None,
                render_pass: vk::RenderPass::null(),
                framebuffer: vk::Framebuffer::null(),
                pipelines: Vec::new(),
            },
        };

        match built.create_objects(device, outputs, depth) {
            Ok(()) => Ok(built),
            Err(e) => {
                for image in built.images.iter_mut() {
                    image.destroy(device);
                }
                built.entry.destroy(device);
                Err(e)
            }
        }
    }

    fn create_objects(&mut self, device: &VulkanDevice, outputs: u32, depth: bool) -> Result<()> {
        let entry = &mut self.entry;
        let clear_pixel = entry.format.encode_pixel(entry.clear_color);

        for i in 0..outputs {
            let name = format!("attachment{}", i);
            let mut image = ImageEntry::new(device, &name, entry.extent, entry.format)?;
            let attachable = image.gpu.supports(vk::ImageUsageFlags::COLOR_ATTACHMENT);
            // Until the first render, reads see the clear color
            let filled = image.fill(&clear_pixel);
            self.images.push(image);
            filled?;
            if !attachable {
                return Err(Error::InvalidResourceDescriptor(format!(
                    "format '{}' cannot be rendered to on this device",
                    entry.format.tag()
                )));
            }
        }

        if depth {
            entry.depth = Some(GpuImage::depth(device, "depth", entry.extent)?);
        }

        entry.render_pass = create_render_pass(
            device,
            entry.format.format,
            outputs,
            depth.then_some(DEPTH_FORMAT),
        )?;

        let mut views: Vec<vk::ImageView> =
            self.images.iter().map(|image| image.gpu.view).collect();
        if let Some(depth) = &entry.depth {
            views.push(depth.view);
        }
        entry.framebuffer = create_framebuffer(device, entry.render_pass, &views, entry.extent)?;
        Ok(())
    }
}

impl DeviceContext {
    /// Target with the configured default format and clear color, one output
    pub fn create_render_target(&self, extent: (u32, u32)) -> Result<RenderTargetHandle> {
        self.create_render_target_with(RenderTargetDesc::new(extent.0, extent.1))
    }

    pub fn create_render_target_with(&self, desc: RenderTargetDesc) -> Result<RenderTargetHandle> {
        if !(1..=MAX_OUTPUTS).contains(&desc.outputs) {
            return Err(Error::InvalidResourceDescriptor(format!(
                "render targets take 1-{} outputs, got {}",
                MAX_OUTPUTS, desc.outputs
            )));
        }
        let format = PixelFormat::parse(
            desc.format.as_deref().unwrap_or(&self.config.render.default_format),
        )?;
        let clear_color = desc.clear_color.unwrap_or(self.config.render.clear_color);
        let extent = vk::Extent2D { width: desc.width, height: desc.height };

        let Attachments { images, entry } = Attachments::create(
            &self.device,
            extent,
            format,
            desc.outputs,
            desc.depth,
            clear_color,
        )?;

        let mut registry = self.registry.lock();
        let key = registry.render_targets.insert(entry);
        let outputs: Vec<ImageKey> = images
            .into_iter()
            .map(|mut image| {
                image.attachment_of = Some(key);
                registry.images.insert(image)
            })
            .collect();
        if let Some(entry) = registry.render_targets.get_mut(key) {
            entry.outputs = outputs;
        }
        registry.target_order.push(key);

        log::debug!(
            "Created render target {:?} {}x{} '{}' x{}{}",
            key,
            extent.width,
            extent.height,
            format.tag(),
            desc.outputs,
            if desc.depth { " + depth" } else { "" }
        );
        Ok(registry.handle(key))
    }

    /// Build a pipeline and append it to the target's draw list
    pub fn pipeline(
        &self,
        target: RenderTargetHandle,
        desc: PipelineDesc,
    ) -> Result<PipelineHandle> {
        let mut registry = self.registry.lock();
        let info = registry.render_target(target)?.info(target.key);
        let entry = PipelineEntry::build(&self.device, &registry, &info, &desc)?;

        let key = registry.pipelines.insert(entry);
        if let Some(target) = registry.render_targets.get_mut(target.key) {
            target.pipelines.push(key);
        }
        log::debug!("Created pipeline {:?} in render target {:?}", key, target.key);
        Ok(registry.handle(key))
    }

    /// Attachment images in order
    pub fn output(&self, target: RenderTargetHandle) -> Result<Vec<ImageHandle>> {
        let registry = self.registry.lock();
        let entry = registry.render_target(target)?;
        Ok(entry.outputs.iter().map(|&key| registry.handle(key)).collect())
    }

    /// Pipelines in draw order
    pub fn pipelines(&self, target: RenderTargetHandle) -> Result<Vec<PipelineHandle>> {
        let registry = self.registry.lock();
        let entry = registry.render_target(target)?;
        Ok(entry.pipelines.iter().map(|&key| registry.handle(key)).collect())
    }

    /// Destroy a target together with its pipelines and attachments
    ///
    /// Refused while a pipeline of another target or an encoder still uses one
    /// of the attachments.
    pub fn destroy_render_target(&self, target: RenderTargetHandle) -> Result<()> {
        let mut registry = self.registry.lock();
        registry.render_target(target)?;
        if let Some(user) = registry.attachment_user(target.key) {
            log::debug!("Refusing to destroy render target {:?}: {}", target.key, user);
            return Err(Error::ResourceInUse("image"));
        }
        registry.remove_render_target(target.key, &self.device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desc_defaults_to_one_output_without_depth() {
        let desc = RenderTargetDesc::new(64, 32);
        assert_eq!(desc.outputs, 1);
        assert!(!desc.depth);
        assert!(desc.format.is_none());
        assert!(desc.clear_color.is_none());
    }

    #[test]
    fn desc_builders() {
        let desc = RenderTargetDesc::new(4, 4)
            .format("4f")
            .outputs(2)
            .depth(true)
            .clear_color([1.0, 0.0, 0.0, 1.0]);
        assert_eq!(desc.format.as_deref(), Some("4f"));
        assert_eq!(desc.outputs, 2);
        assert!(desc.depth);
        assert_eq!(desc.clear_color, Some([1.0, 0.0, 0.0, 1.0]));
    }
}
