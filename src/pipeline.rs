// Pipelines
//
// A pipeline is shader stages + vertex layout + resource bindings baked into
// one Vulkan pipeline state object, plus the host-visible buffers its draw
// reads (vertex, index, uniforms). Everything is validated against the stages'
// declared interface before any Vulkan object is created.
//
// Bindings all live in descriptor set 0 and are written once at creation;
// `update` only rewrites buffer contents.

use ash::vk;

use crate::backend::pipeline::{
    create_graphics_pipeline, create_pipeline_layout, DescriptorResource, DescriptorState,
    GraphicsPipelineInfo,
};
use crate::backend::{GpuBuffer, VulkanDevice};
use crate::binding::{check_bindings, check_vertex_layout, merge_declared, BindingDecl, BindingKind};
use crate::context::DeviceContext;
use crate::error::{Error, Result};
use crate::format::VertexFormat;
use crate::registry::{
    BufferHandle, BufferKey, ImageKey, PipelineHandle, Registry, RenderTargetKey, SamplerHandle,
    SamplerKey, ShaderHandle,
};
use crate::resource::{check_size, host_buffer, write_exact};
use crate::shader::StageKind;

pub const VERTEX_BUFFER: &str = "vertex_buffer";
pub const INDEX_BUFFER: &str = "index_buffer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Topology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
    TriangleFan,
    /// Required by tessellation stages, with the control points per patch
    PatchList(u32),
}

impl Topology {
    fn vk_topology(self) -> vk::PrimitiveTopology {
        match self {
            Topology::PointList => vk::PrimitiveTopology::POINT_LIST,
            Topology::LineList => vk::PrimitiveTopology::LINE_LIST,
            Topology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            Topology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            Topology::TriangleFan => vk::PrimitiveTopology::TRIANGLE_FAN,
            Topology::PatchList(_) => vk::PrimitiveTopology::PATCH_LIST,
        }
    }
}

/// A resource bound at one slot
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ResourceBinding {
    Samplers(Vec<SamplerHandle>),
    Textures(Vec<SamplerHandle>),
    SamplerStates(Vec<SamplerHandle>),
    StorageBuffer(BufferHandle),
    Uniform { name: String, size: usize },
}

impl ResourceBinding {
    fn decl(&self, slot: u32) -> BindingDecl {
        let (kind, count) = match self {
            ResourceBinding::Samplers(s) => (BindingKind::CombinedImageSampler, s.len()),
            ResourceBinding::Textures(s) => (BindingKind::SampledImage, s.len()),
            ResourceBinding::SamplerStates(s) => (BindingKind::Sampler, s.len()),
            ResourceBinding::StorageBuffer(_) => (BindingKind::StorageBuffer, 1),
            ResourceBinding::Uniform { .. } => (BindingKind::UniformBuffer, 1),
        };
        BindingDecl { slot, kind, count: count as u32 }
    }
}

/// Everything needed to construct a pipeline inside a render target
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    vertex_shader: ShaderHandle,
    fragment_shader: ShaderHandle,
    extra_stages: Vec<ShaderHandle>,
    vertex_format: String,
    vertex_count: u32,
    index_count: u32,
    instance_count: u32,
    topology: Topology,
    blend: bool,
    bindings: Vec<(u32, ResourceBinding)>,
}

impl PipelineDesc {
    pub fn new(vertex_shader: ShaderHandle, fragment_shader: ShaderHandle) -> Self {
        Self {
            vertex_shader,
            fragment_shader,
            extra_stages: Vec::new(),
            vertex_format: String::new(),
            vertex_count: 0,
            index_count: 0,
            instance_count: 1,
            topology: Topology::default(),
            blend: false,
            bindings: Vec::new(),
        }
    }

    /// Geometry or tessellation stage
    pub fn stage(mut self, shader: ShaderHandle) -> Self {
        self.extra_stages.push(shader);
        self
    }

    pub fn vertex_format(mut self, format: &str) -> Self {
        self.vertex_format = format.to_string();
        self
    }

    pub fn vertex_count(mut self, count: u32) -> Self {
        self.vertex_count = count;
        self
    }

    /// Draw `count` u32 indices from the index buffer instead of raw vertices
    pub fn index_count(mut self, count: u32) -> Self {
        self.index_count = count;
        self
    }

    pub fn instance_count(mut self, count: u32) -> Self {
        self.instance_count = count;
        self
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn blend(mut self, enabled: bool) -> Self {
        self.blend = enabled;
        self
    }

    /// Combined image samplers at `slot`
    pub fn samplers(mut self, slot: u32, samplers: impl Into<Vec<SamplerHandle>>) -> Self {
        self.bindings.push((slot, ResourceBinding::Samplers(samplers.into())));
        self
    }

    /// Sampled images (without sampler state) taken from the samplers' images
    pub fn textures(mut self, slot: u32, samplers: impl Into<Vec<SamplerHandle>>) -> Self {
        self.bindings.push((slot, ResourceBinding::Textures(samplers.into())));
        self
    }

    /// Standalone sampler objects
    pub fn sampler_states(mut self, slot: u32, samplers: impl Into<Vec<SamplerHandle>>) -> Self {
        self.bindings.push((slot, ResourceBinding::SamplerStates(samplers.into())));
        self
    }

    pub fn storage_buffer(mut self, slot: u32, buffer: BufferHandle) -> Self {
        self.bindings.push((slot, ResourceBinding::StorageBuffer(buffer)));
        self
    }

    /// Pipeline-owned uniform buffer of `size` bytes, filled through `update`
    pub fn uniform_buffer(mut self, slot: u32, name: &str, size: usize) -> Self {
        self.bindings.push((
            slot,
            ResourceBinding::Uniform { name: name.to_string(), size },
        ));
        self
    }
}

pub(crate) struct PipelineEntry {
    pub target: RenderTargetKey,
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptors: DescriptorState,
    pub vertex_buffer: Option<GpuBuffer>,
    pub index_buffer: Option<GpuBuffer>,
    pub uniforms: Vec<(String, GpuBuffer)>,
    pub vertex_count: u32,
    pub index_count: u32,
    pub instance_count: u32,
    pub bound_images: Vec<ImageKey>,
    pub bound_samplers: Vec<SamplerKey>,
    pub bound_buffers: Vec<BufferKey>,
}

/// Target state a pipeline is baked against
pub(crate) struct TargetInfo {
    pub key: RenderTargetKey,
    pub extent: vk::Extent2D,
    pub color_count: u32,
    pub has_depth: bool,
    pub render_pass: vk::RenderPass,
}

impl PipelineEntry {
    fn empty(target: RenderTargetKey) -> Self {
        Self {
            target,
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
            descriptors: DescriptorState::default(),
            vertex_buffer: None,
            index_buffer: None,
            uniforms: Vec::new(),
            vertex_count: 0,
            index_count: 0,
            instance_count: 1,
            bound_images: Vec::new(),
            bound_samplers: Vec::new(),
            bound_buffers: Vec::new(),
        }
    }

    /// Validate `desc` against the registry and create every Vulkan object
    pub fn build(
        device: &VulkanDevice,
        registry: &Registry,
        target: &TargetInfo,
        desc: &PipelineDesc,
    ) -> Result<Self> {
        // ---------------------------------------------------------------------
        // Stages
        // ---------------------------------------------------------------------
        let mut stages = vec![
            (StageKind::Vertex, desc.vertex_shader),
            (StageKind::Fragment, desc.fragment_shader),
        ];
        for &extra in &desc.extra_stages {
            let kind = registry.shader(extra)?.kind;
            stages.push((kind, extra));
        }

        let mut resolved = Vec::with_capacity(stages.len());
        for (i, &(expected, handle)) in stages.iter().enumerate() {
            let shader = registry.shader(handle)?;
            if i < 2 && shader.kind != expected {
                return Err(Error::InvalidResourceDescriptor(format!(
                    "expected a {:?} shader, got {:?}",
                    expected, shader.kind
                )));
            }
            if i >= 2 {
                check_extra_stage(device, shader.kind)?;
            }
            if resolved.iter().any(|(kind, _)| *kind == shader.kind) {
                return Err(Error::InvalidResourceDescriptor(format!(
                    "{:?} stage given twice",
                    shader.kind
                )));
            }
            resolved.push((shader.kind, shader));
        }

        let tess_stages = resolved
            .iter()
            .filter(|(kind, _)| matches!(kind, StageKind::TessControl | StageKind::TessEvaluation))
            .count();
        let patch_control_points = match (tess_stages, desc.topology) {
            (0, Topology::PatchList(_)) => {
                return Err(Error::InvalidResourceDescriptor(
                    "patch topology needs tessellation stages".into(),
                ))
            }
            (0, _) => None,
            (2, Topology::PatchList(points)) if points > 0 => Some(points),
            (2, _) => {
                return Err(Error::InvalidResourceDescriptor(
                    "tessellation stages need a patch topology".into(),
                ))
            }
            _ => {
                return Err(Error::InvalidResourceDescriptor(
                    "tessellation control and evaluation stages come as a pair".into(),
                ))
            }
        };

        // ---------------------------------------------------------------------
        // Vertex layout and draw counts
        // ---------------------------------------------------------------------
        let vertex_format = VertexFormat::parse(&desc.vertex_format)?;
        check_vertex_layout(&vertex_format, &resolved[0].1.vertex_inputs)?;

        if desc.vertex_count == 0 && desc.index_count == 0 {
            return Err(Error::InvalidResourceDescriptor("pipeline draws nothing".into()));
        }
        if !vertex_format.is_empty() && desc.vertex_count == 0 {
            return Err(Error::InvalidResourceDescriptor(
                "a vertex format needs a vertex count to size the vertex buffer".into(),
            ));
        }
        if desc.instance_count == 0 {
            return Err(Error::InvalidResourceDescriptor("instance count is zero".into()));
        }

        // ---------------------------------------------------------------------
        // Bindings
        // ---------------------------------------------------------------------
        let declared_sets: Vec<(vk::ShaderStageFlags, &[BindingDecl])> = resolved
            .iter()
            .map(|(kind, shader)| (kind.flags(), shader.bindings.as_slice()))
            .collect();
        let declared = merge_declared(&declared_sets)?;
        let provided: Vec<BindingDecl> =
            desc.bindings.iter().map(|(slot, binding)| binding.decl(*slot)).collect();
        check_bindings(&declared, &provided)?;

        let mut uniform_names: Vec<&str> = Vec::new();
        for (_, binding) in &desc.bindings {
            if let ResourceBinding::Uniform { name, .. } = binding {
                if name == VERTEX_BUFFER
                    || name == INDEX_BUFFER
                    || uniform_names.contains(&name.as_str())
                {
                    return Err(Error::InvalidResourceDescriptor(format!(
                        "uniform name '{}' is reserved or already used",
                        name
                    )));
                }
                uniform_names.push(name);
            }
        }

        // ---------------------------------------------------------------------
        // Vulkan objects, torn down together if any step fails
        // ---------------------------------------------------------------------
        let mut entry = Self::empty(target.key);
        entry.vertex_count = desc.vertex_count;
        entry.index_count = desc.index_count;
        entry.instance_count = desc.instance_count;

        let stage_modules: Vec<(vk::ShaderStageFlags, vk::ShaderModule, &str)> = resolved
            .iter()
            .map(|(kind, shader)| (kind.flags(), shader.module, shader.entry_point.as_str()))
            .collect();
        let layout_bindings: Vec<_> = declared.iter().map(|b| b.layout_binding()).collect();

        let created = (|| -> Result<()> {
            let resources = entry.resolve_bindings(device, registry, target, &desc.bindings)?;

            if !vertex_format.is_empty() {
                let size = desc.vertex_count as usize * vertex_format.stride as usize;
                entry.vertex_buffer = Some(host_buffer(device, VERTEX_BUFFER, size)?);
            }
            if desc.index_count > 0 {
                let size = desc.index_count as usize * std::mem::size_of::<u32>();
                entry.index_buffer = Some(host_buffer(device, INDEX_BUFFER, size)?);
            }

            entry.descriptors = DescriptorState::new(device, &layout_bindings)?;
            entry.descriptors.write(device, &resources);
            entry.layout = create_pipeline_layout(device, entry.descriptors.set_layout)?;

            entry.pipeline = create_graphics_pipeline(
                device,
                &GraphicsPipelineInfo {
                    stages: &stage_modules,
                    vertex_format: &vertex_format,
                    topology: desc.topology.vk_topology(),
                    patch_control_points,
                    blend: desc.blend,
                    depth_test: target.has_depth,
                    color_attachments: target.color_count,
                    render_pass: target.render_pass,
                    layout: entry.layout,
                    extent: target.extent,
                },
            )?;
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

    /// Descriptor contents per slot, recording every resource the pipeline
    /// now references
    fn resolve_bindings(
        &mut self,
        device: &VulkanDevice,
        registry: &Registry,
        target: &TargetInfo,
        bindings: &[(u32, ResourceBinding)],
    ) -> Result<Vec<(u32, DescriptorResource)>> {
        let mut resources = Vec::with_capacity(bindings.len());

        for (slot, binding) in bindings {
            let resource = match binding {
                ResourceBinding::Samplers(samplers)
                | ResourceBinding::Textures(samplers)
                | ResourceBinding::SamplerStates(samplers) => {
                    let mut infos = Vec::with_capacity(samplers.len());
                    for &handle in samplers {
                        let sampler = registry.sampler(handle)?;
                        let image = registry
                            .images
                            .get(sampler.image)
                            .ok_or(Error::InvalidResource("image"))?;
                        if image.attachment_of == Some(target.key) {
                            return Err(Error::InvalidResourceDescriptor(
                                "a pipeline cannot sample its own render target".into(),
                            ));
                        }
                        self.bound_samplers.push(handle.key);
                        self.bound_images.push(sampler.image);

                        let layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
                        infos.push(match binding {
                            ResourceBinding::Samplers(_) => vk::DescriptorImageInfo {
                                sampler: sampler.sampler,
                                image_view: image.gpu.view,
                                image_layout: layout,
                            },
                            ResourceBinding::Textures(_) => vk::DescriptorImageInfo {
                                sampler: vk::Sampler::null(),
                                image_view: image.gpu.view,
                                image_layout: layout,
                            },
                            _ => vk::DescriptorImageInfo {
                                sampler: sampler.sampler,
                                image_view: vk::ImageView::null(),
                                image_layout: vk::ImageLayout::UNDEFINED,
                            },
                        });
                    }
                    let kind = binding.decl(*slot).kind;
                    DescriptorResource::Images(kind.descriptor_type(), infos)
                }
                ResourceBinding::StorageBuffer(handle) => {
                    let buffer = registry.buffer(*handle)?;
                    self.bound_buffers.push(handle.key);
                    DescriptorResource::Buffer(
                        vk::DescriptorType::STORAGE_BUFFER,
                        buffer.gpu.buffer,
                    )
                }
                ResourceBinding::Uniform { name, size } => {
                    let buffer = host_buffer(device, name, *size)?;
                    let vk_buffer = buffer.buffer;
                    self.uniforms.push((name.clone(), buffer));
                    DescriptorResource::Buffer(vk::DescriptorType::UNIFORM_BUFFER, vk_buffer)
                }
            };
            resources.push((*slot, resource));
        }

        self.bound_images.sort();
        self.bound_images.dedup();
        Ok(resources)
    }

    fn buffer(&self, key: &str) -> Result<&GpuBuffer> {
        let found = match key {
            VERTEX_BUFFER => self.vertex_buffer.as_ref(),
            INDEX_BUFFER => self.index_buffer.as_ref(),
            name => self.uniforms.iter().find(|(n, _)| n == name).map(|(_, b)| b),
        };
        found.ok_or_else(|| Error::UnknownBinding(key.to_string()))
    }

    fn buffer_mut(&mut self, key: &str) -> Result<&mut GpuBuffer> {
        let found = match key {
            VERTEX_BUFFER => self.vertex_buffer.as_mut(),
            INDEX_BUFFER => self.index_buffer.as_mut(),
            name => self.uniforms.iter_mut().find(|(n, _)| n == name).map(|(_, b)| b),
        };
        found.ok_or_else(|| Error::UnknownBinding(key.to_string()))
    }

    /// Replace named buffer contents, all or nothing
    pub fn update(&mut self, entries: &[(&str, &[u8])]) -> Result<()> {
        for (key, data) in entries {
            check_size(self.buffer(key)?, data)?;
        }
        for (key, data) in entries {
            write_exact(self.buffer_mut(key)?, data)?;
        }
        Ok(())
    }

    /// Record this pipeline's single draw into an open render pass
    pub fn record(&self, device: &VulkanDevice, cmd: vk::CommandBuffer) {
        unsafe {
            device
                .device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);

            if !self.descriptors.is_empty() {
                device.device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.layout,
                    0,
                    &[self.descriptors.set],
                    &[],
                );
            }

            if let Some(vertex_buffer) = &self.vertex_buffer {
                device
                    .device
                    .cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer.buffer], &[0]);
            }

            match &self.index_buffer {
                Some(index_buffer) => {
                    device.device.cmd_bind_index_buffer(
                        cmd,
                        index_buffer.buffer,
                        0,
                        vk::IndexType::UINT32,
                    );
                    device
                        .device
                        .cmd_draw_indexed(cmd, self.index_count, self.instance_count, 0, 0, 0);
                }
                None => {
                    device
                        .device
                        .cmd_draw(cmd, self.vertex_count, self.instance_count, 0, 0);
                }
            }
        }
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_pipeline(self.pipeline, None);
            device.device.destroy_pipeline_layout(self.layout, None);
        }
        self.descriptors.destroy(&device.device);
        for buffer in self
            .vertex_buffer
            .iter_mut()
            .chain(self.index_buffer.iter_mut())
            .chain(self.uniforms.iter_mut().map(|(_, b)| b))
        {
            buffer.destroy(device);
        }
        self.vertex_buffer = None;
        self.index_buffer = None;
        self.uniforms.clear();
    }
}

fn check_extra_stage(device: &VulkanDevice, kind: StageKind) -> Result<()> {
    let supported = match kind {
        StageKind::Geometry => device.features.geometry_shader == vk::TRUE,
        StageKind::TessControl | StageKind::TessEvaluation => {
            device.features.tessellation_shader == vk::TRUE
        }
        other => {
            return Err(Error::InvalidResourceDescriptor(format!(
                "{:?} is not an optional graphics stage",
                other
            )))
        }
    };
    if !supported {
        return Err(Error::InvalidResourceDescriptor(format!(
            "{:?} shaders are not supported by this device",
            kind
        )));
    }
    Ok(())
}

impl DeviceContext {
    /// Replace pipeline buffer contents for the next render
    ///
    /// Keys are `vertex_buffer`, `index_buffer` or a uniform buffer name. Every
    /// entry is checked before any is written.
    pub fn update<'a>(
        &self,
        pipeline: PipelineHandle,
        entries: impl IntoIterator<Item = (&'a str, &'a [u8])>,
    ) -> Result<()> {
        let entries: Vec<(&str, &[u8])> = entries.into_iter().collect();
        let mut registry = self.registry.lock();
        registry.pipeline_mut(pipeline)?.update(&entries)
    }

    /// Destroy a pipeline and remove it from its render target
    pub fn destroy_pipeline(&self, pipeline: PipelineHandle) -> Result<()> {
        let mut registry = self.registry.lock();
        registry.pipeline(pipeline)?;
        registry.remove_pipeline(pipeline.key, &self.device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ShaderKey;
    use slotmap::Key;

    fn shader() -> ShaderHandle {
        Registry::new(1).handle(ShaderKey::null())
    }

    #[test]
    fn desc_defaults() {
        let desc = PipelineDesc::new(shader(), shader());
        assert_eq!(desc.instance_count, 1);
        assert_eq!(desc.topology, Topology::TriangleList);
        assert!(!desc.blend);
        assert!(desc.bindings.is_empty());
    }

    #[test]
    fn bindings_describe_their_declarations() {
        let sampler: SamplerHandle = Registry::new(1).handle(SamplerKey::null());
        let desc = PipelineDesc::new(shader(), shader())
            .samplers(1, vec![sampler, sampler])
            .uniform_buffer(0, "transform", 64);
        let decls: Vec<_> = desc.bindings.iter().map(|(slot, b)| b.decl(*slot)).collect();
        assert_eq!(
            decls,
            vec![
                BindingDecl { slot: 1, kind: BindingKind::CombinedImageSampler, count: 2 },
                BindingDecl { slot: 0, kind: BindingKind::UniformBuffer, count: 1 },
            ]
        );
    }

    #[test]
    fn topology_maps_to_vulkan() {
        assert_eq!(Topology::LineStrip.vk_topology(), vk::PrimitiveTopology::LINE_STRIP);
        assert_eq!(Topology::PatchList(3).vk_topology(), vk::PrimitiveTopology::PATCH_LIST);
    }

    #[test]
    fn update_keys_resolve_or_fail() {
        let mut entry = PipelineEntry::empty(RenderTargetKey::null());
        assert!(matches!(entry.buffer(VERTEX_BUFFER), Err(Error::UnknownBinding(_))));
        assert!(matches!(
            entry.update(&[("colour", &[1u8, 2, 3][..])]),
            Err(Error::UnknownBinding(k)) if k == "colour"
        ));
        // Nothing to do is still fine
        entry.update(&[]).unwrap();
    }
}
