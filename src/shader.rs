// Shader stages
//
// A stage is a precompiled SPIR-V binary plus the metadata the binary itself
// is opaque about: which bindings it reads, how many components each vertex
// input has, and the compute workgroup size.

use ash::vk;

use crate::backend::shader::create_shader_module;
use crate::backend::VulkanDevice;
use crate::binding::{BindingDecl, BindingKind};
use crate::context::DeviceContext;
use crate::error::{Error, Result};
use crate::registry::ShaderHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Vertex,
    Fragment,
    Geometry,
    TessControl,
    TessEvaluation,
    Compute,
}

impl StageKind {
    pub(crate) fn flags(self) -> vk::ShaderStageFlags {
        match self {
            StageKind::Vertex => vk::ShaderStageFlags::VERTEX,
            StageKind::Fragment => vk::ShaderStageFlags::FRAGMENT,
            StageKind::Geometry => vk::ShaderStageFlags::GEOMETRY,
            StageKind::TessControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            StageKind::TessEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            StageKind::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// Binary and declared interface of one shader stage
#[derive(Debug, Clone)]
pub struct ShaderDesc {
    kind: StageKind,
    code: Vec<u8>,
    entry_point: String,
    bindings: Vec<BindingDecl>,
    vertex_inputs: Vec<u32>,
    local_size: Option<[u32; 3]>,
}

impl ShaderDesc {
    pub fn new(kind: StageKind, code: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            code: code.into(),
            entry_point: "main".to_string(),
            bindings: Vec::new(),
            vertex_inputs: Vec::new(),
            local_size: None,
        }
    }

    pub fn entry_point(mut self, name: &str) -> Self {
        self.entry_point = name.to_string();
        self
    }

    /// Declare a descriptor set 0 binding read by this stage
    pub fn binding(mut self, slot: u32, kind: BindingKind, count: u32) -> Self {
        self.bindings.push(BindingDecl { slot, kind, count });
        self
    }

    /// Component count of every vertex input, in location order
    pub fn vertex_inputs(mut self, components: &[u32]) -> Self {
        self.vertex_inputs = components.to_vec();
        self
    }

    pub fn local_size(mut self, size: [u32; 3]) -> Self {
        self.local_size = Some(size);
        self
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidResourceDescriptor(msg));

        if self.entry_point.is_empty() {
            return invalid("shader entry point is empty".into());
        }
        if !self.vertex_inputs.is_empty() && self.kind != StageKind::Vertex {
            return invalid(format!("{:?} stage cannot declare vertex inputs", self.kind));
        }
        if let Some(components) = self.vertex_inputs.iter().find(|c| !(1..=4).contains(*c)) {
            return invalid(format!("vertex input with {} components", components));
        }
        match self.local_size {
            Some(_) if self.kind != StageKind::Compute => {
                return invalid(format!("{:?} stage cannot declare a local size", self.kind));
            }
            Some(size) if size.contains(&0) => {
                return invalid(format!("local size {:?} has a zero dimension", size));
            }
            _ => {}
        }
        for (i, decl) in self.bindings.iter().enumerate() {
            if decl.count == 0 {
                return invalid(format!("binding {} declares zero resources", decl.slot));
            }
            if self.bindings[..i].iter().any(|other| other.slot == decl.slot) {
                return invalid(format!("binding {} declared twice", decl.slot));
            }
        }
        Ok(())
    }
}

pub(crate) struct ShaderEntry {
    pub module: vk::ShaderModule,
    pub kind: StageKind,
    pub entry_point: String,
    pub bindings: Vec<BindingDecl>,
    pub vertex_inputs: Vec<u32>,
    pub local_size: [u32; 3],
}

impl ShaderEntry {
    pub fn destroy(&self, device: &VulkanDevice) {
        unsafe { device.device.destroy_shader_module(self.module, None) };
    }
}

impl DeviceContext {
    /// Load a precompiled stage
    pub fn create_shader_stage(&self, desc: ShaderDesc) -> Result<ShaderHandle> {
        desc.validate()?;
        let module = create_shader_module(&self.device, &desc.code)?;

        let entry = ShaderEntry {
            module,
            kind: desc.kind,
            entry_point: desc.entry_point,
            bindings: desc.bindings,
            vertex_inputs: desc.vertex_inputs,
            local_size: desc.local_size.unwrap_or([1, 1, 1]),
        };

        let mut registry = self.registry.lock();
        let kind = entry.kind;
        let key = registry.shaders.insert(entry);
        log::debug!("Created {:?} shader {:?} ({} bytes)", kind, key, desc.code.len());
        Ok(registry.handle(key))
    }

    /// Pipelines built from the stage keep working after it is destroyed
    pub fn destroy_shader(&self, shader: ShaderHandle) -> Result<()> {
        let mut registry = self.registry.lock();
        registry.shader(shader)?;
        if let Some(entry) = registry.shaders.remove(shader.key) {
            entry.destroy(&self.device);
            log::debug!("Destroyed shader {:?}", shader.key);
        }
        Ok(())
    }
}
