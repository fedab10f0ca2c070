// Render pass, framebuffer, descriptor and pipeline state objects
//
// The graphics pipeline defines how vertices are processed and rasterized.
// It includes: vertex input, shaders, rasterization, depth/stencil, blending.
// Viewport and scissor are baked in since a render target never resizes.

use ash::vk;
use std::ffi::CString;

use super::VulkanDevice;
use crate::error::{Error, Result};
use crate::format::VertexFormat;

/// Create a render pass that clears every attachment and leaves colors ready
/// for a transfer read
pub fn create_render_pass(
    device: &VulkanDevice,
    color_format: vk::Format,
    color_count: u32,
    depth_format: Option<vk::Format>,
) -> Result<vk::RenderPass> {
    let mut attachments = Vec::with_capacity(color_count as usize + 1);
    let mut color_refs = Vec::with_capacity(color_count as usize);

    for i in 0..color_count {
        attachments.push(
            vk::AttachmentDescription::builder()
                .format(color_format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .build(),
        );
        color_refs.push(
            vk::AttachmentReference::builder()
                .attachment(i)
                .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .build(),
        );
    }

    // Depth attachment is never read back
    let depth_ref = depth_format.map(|format| {
        attachments.push(
            vk::AttachmentDescription::builder()
                .format(format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .build(),
        );
        vk::AttachmentReference::builder()
            .attachment(color_count)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build()
    });

    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if let Some(depth_ref) = depth_ref.as_ref() {
        subpass = subpass.depth_stencil_attachment(depth_ref);
    }
    let subpasses = [subpass.build()];

    let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;

    let dependencies = [
        // Earlier uploads, samples and readbacks of these images finish first
        vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::TRANSFER
                    | vk::PipelineStageFlags::FRAGMENT_SHADER
                    | vk::PipelineStageFlags::COMPUTE_SHADER
                    | attachment_stages,
            )
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_stage_mask(attachment_stages)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .build(),
        // Attachment writes are visible to the readback copy
        vk::SubpassDependency::builder()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags::TRANSFER)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
            .build(),
    ];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    let render_pass = unsafe { device.device.create_render_pass(&render_pass_info, None) }?;
    Ok(render_pass)
}

pub fn create_framebuffer(
    device: &VulkanDevice,
    render_pass: vk::RenderPass,
    views: &[vk::ImageView],
    extent: vk::Extent2D,
) -> Result<vk::Framebuffer> {
    let framebuffer_info = vk::FramebufferCreateInfo::builder()
        .render_pass(render_pass)
        .attachments(views)
        .width(extent.width)
        .height(extent.height)
        .layers(1);

    let framebuffer = unsafe { device.device.create_framebuffer(&framebuffer_info, None) }?;
    Ok(framebuffer)
}

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// What one descriptor binding points at
pub enum DescriptorResource {
    Images(vk::DescriptorType, Vec<vk::DescriptorImageInfo>),
    Buffer(vk::DescriptorType, vk::Buffer),
}

/// Layout, pool and the single set allocated from it
#[derive(Default)]
pub struct DescriptorState {
    pub set_layout: vk::DescriptorSetLayout,
    pub pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
}

impl DescriptorState {
    pub fn new(device: &VulkanDevice, bindings: &[vk::DescriptorSetLayoutBinding]) -> Result<Self> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        let set_layout = unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }?;

        if bindings.is_empty() {
            return Ok(Self {
                set_layout,
                pool: vk::DescriptorPool::null(),
                set: vk::DescriptorSet::null(),
            });
        }

        let pool_sizes: Vec<vk::DescriptorPoolSize> = bindings
            .iter()
            .map(|b| vk::DescriptorPoolSize {
                ty: b.descriptor_type,
                descriptor_count: b.descriptor_count,
            })
            .collect();
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(1)
            .pool_sizes(&pool_sizes);

        let pool = match unsafe { device.device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(e.into());
            }
        };

        let set_layouts = [set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);

        let set = match unsafe { device.device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(e) => {
                unsafe {
                    device.device.destroy_descriptor_pool(pool, None);
                    device.device.destroy_descriptor_set_layout(set_layout, None);
                }
                return Err(e.into());
            }
        };

        Ok(Self { set_layout, pool, set })
    }

    pub fn is_empty(&self) -> bool {
        self.set == vk::DescriptorSet::null()
    }

    /// Point every binding at its resources; called once after creation
    pub fn write(&self, device: &VulkanDevice, resources: &[(u32, DescriptorResource)]) {
        if self.is_empty() || resources.is_empty() {
            return;
        }

        let buffer_infos: Vec<vk::DescriptorBufferInfo> = resources
            .iter()
            .map(|(_, resource)| match resource {
                DescriptorResource::Buffer(_, buffer) => vk::DescriptorBufferInfo {
                    buffer: *buffer,
                    offset: 0,
                    range: vk::WHOLE_SIZE,
                },
                DescriptorResource::Images(..) => vk::DescriptorBufferInfo::default(),
            })
            .collect();

        let writes: Vec<vk::WriteDescriptorSet> = resources
            .iter()
            .zip(&buffer_infos)
            .map(|((slot, resource), buffer_info)| {
                let write = vk::WriteDescriptorSet::builder()
                    .dst_set(self.set)
                    .dst_binding(*slot)
                    .dst_array_element(0);
                match resource {
                    DescriptorResource::Images(ty, infos) => {
                        write.descriptor_type(*ty).image_info(infos).build()
                    }
                    DescriptorResource::Buffer(ty, _) => write
                        .descriptor_type(*ty)
                        .buffer_info(std::slice::from_ref(buffer_info))
                        .build(),
                }
            })
            .collect();

        unsafe { device.device.update_descriptor_sets(&writes, &[]) };
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            if self.pool != vk::DescriptorPool::null() {
                device.destroy_descriptor_pool(self.pool, None);
            }
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

pub fn create_pipeline_layout(
    device: &VulkanDevice,
    set_layout: vk::DescriptorSetLayout,
) -> Result<vk::PipelineLayout> {
    let set_layouts = [set_layout];
    let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
    let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }?;
    Ok(layout)
}

// =============================================================================
// GRAPHICS PIPELINE
// =============================================================================

/// Everything the pipeline state object bakes in
pub struct GraphicsPipelineInfo<'a> {
    pub stages: &'a [(vk::ShaderStageFlags, vk::ShaderModule, &'a str)],
    pub vertex_format: &'a VertexFormat,
    pub topology: vk::PrimitiveTopology,
    /// Set when tessellation stages are present
    pub patch_control_points: Option<u32>,
    pub blend: bool,
    pub depth_test: bool,
    pub color_attachments: u32,
    pub render_pass: vk::RenderPass,
    pub layout: vk::PipelineLayout,
    pub extent: vk::Extent2D,
}

/// Vertex input description for one interleaved binding
fn vertex_input_info(
    format: &VertexFormat,
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    if format.is_empty() {
        return (vec![], vec![]);
    }

    let binding = vk::VertexInputBindingDescription::builder()
        .binding(0)
        .stride(format.stride)
        .input_rate(vk::VertexInputRate::VERTEX)
        .build();

    let attributes = format
        .attributes
        .iter()
        .map(|attr| {
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(attr.location)
                .format(attr.format)
                .offset(attr.offset)
                .build()
        })
        .collect();

    (vec![binding], attributes)
}

pub fn create_graphics_pipeline(
    device: &VulkanDevice,
    info: &GraphicsPipelineInfo,
) -> Result<vk::Pipeline> {
    // Shader stages
    let entry_points = info
        .stages
        .iter()
        .map(|(_, _, name)| CString::new(*name))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| Error::InvalidResourceDescriptor("entry point contains NUL".into()))?;

    let shader_stages: Vec<_> = info
        .stages
        .iter()
        .zip(&entry_points)
        .map(|((stage, module, _), entry_point)| {
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(*stage)
                .module(*module)
                .name(entry_point)
                .build()
        })
        .collect();

    // Vertex input
    let (bindings, attributes) = vertex_input_info(info.vertex_format);
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    // Input assembly
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(info.topology)
        .primitive_restart_enable(false);

    // Viewport and scissor
    let viewport = vk::Viewport::builder()
        .x(0.0)
        .y(0.0)
        .width(info.extent.width as f32)
        .height(info.extent.height as f32)
        .min_depth(0.0)
        .max_depth(1.0)
        .build();

    let scissor = vk::Rect2D::builder()
        .offset(vk::Offset2D { x: 0, y: 0 })
        .extent(info.extent)
        .build();

    let viewports = &[viewport];
    let scissors = &[scissor];
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewports(viewports)
        .scissors(scissors);

    // Rasterization, no culling so winding never hides a primitive
    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    // Multisampling (disabled)
    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(info.depth_test)
        .depth_write_enable(info.depth_test)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachment = if info.blend {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .build()
    } else {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()
    };

    let color_blend_attachments = vec![color_blend_attachment; info.color_attachments as usize];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let tessellation = vk::PipelineTessellationStateCreateInfo::builder()
        .patch_control_points(info.patch_control_points.unwrap_or(0));

    let mut pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .layout(info.layout)
        .render_pass(info.render_pass)
        .subpass(0);
    if info.patch_control_points.is_some() {
        pipeline_info = pipeline_info.tessellation_state(&tessellation);
    }
    let pipeline_info = pipeline_info.build();

    let pipelines = unsafe {
        device
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, e)| pipeline_error(e))?;

    Ok(pipelines[0])
}

pub fn create_compute_pipeline(
    device: &VulkanDevice,
    module: vk::ShaderModule,
    entry_point: &str,
    layout: vk::PipelineLayout,
) -> Result<vk::Pipeline> {
    let entry_point = CString::new(entry_point)
        .map_err(|_| Error::InvalidResourceDescriptor("entry point contains NUL".into()))?;

    let stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(&entry_point)
        .build();

    let pipeline_info = vk::ComputePipelineCreateInfo::builder()
        .stage(stage)
        .layout(layout)
        .build();

    let pipelines = unsafe {
        device
            .device
            .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, e)| pipeline_error(e))?;

    Ok(pipelines[0])
}

// Shader-related failures during linking are a rejection of the binaries
fn pipeline_error(result: vk::Result) -> Error {
    match result {
        vk::Result::ERROR_INVALID_SHADER_NV => {
            Error::ShaderCompilationRejected("driver rejected pipeline shaders".into())
        }
        other => other.into(),
    }
}
