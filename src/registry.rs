// Registry of every object a DeviceContext owns
//
// Public handles are slotmap keys tagged with the owning context's id. A stale
// key or a key from another context resolves to `Error::InvalidResource`
// instead of touching freed Vulkan objects.

use slotmap::{new_key_type, Key, SlotMap};

use crate::backend::VulkanDevice;
use crate::encoder::EncoderEntry;
use crate::error::{Error, Result};
use crate::pipeline::PipelineEntry;
use crate::render_target::RenderTargetEntry;
use crate::resource::{BufferEntry, ImageEntry, SamplerEntry};
use crate::shader::ShaderEntry;

new_key_type! {
    pub struct ImageKey;
    pub struct BufferKey;
    pub struct SamplerKey;
    pub struct ShaderKey;
    pub struct RenderTargetKey;
    pub struct PipelineKey;
    pub struct EncoderKey;
}

/// Opaque reference to an object owned by a DeviceContext
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle<K: Key> {
    pub(crate) key: K,
    pub(crate) owner: u64,
}

pub type ImageHandle = Handle<ImageKey>;
pub type BufferHandle = Handle<BufferKey>;
pub type SamplerHandle = Handle<SamplerKey>;
pub type ShaderHandle = Handle<ShaderKey>;
pub type RenderTargetHandle = Handle<RenderTargetKey>;
pub type PipelineHandle = Handle<PipelineKey>;
pub type EncoderHandle = Handle<EncoderKey>;

pub(crate) struct Registry {
    pub owner: u64,
    pub images: SlotMap<ImageKey, ImageEntry>,
    pub buffers: SlotMap<BufferKey, BufferEntry>,
    pub samplers: SlotMap<SamplerKey, SamplerEntry>,
    pub shaders: SlotMap<ShaderKey, ShaderEntry>,
    pub render_targets: SlotMap<RenderTargetKey, RenderTargetEntry>,
    pub pipelines: SlotMap<PipelineKey, PipelineEntry>,
    pub encoders: SlotMap<EncoderKey, EncoderEntry>,
    // Creation order, slotmap iteration order reuses freed slots
    pub target_order: Vec<RenderTargetKey>,
    pub encoder_order: Vec<EncoderKey>,
}

macro_rules! accessors {
    ($($field:ident: $key:ty => $entry:ty, $what:literal, $get:ident $(, $get_mut:ident)?;)*) => {
        impl Registry {
            $(
                pub fn $get(&self, handle: Handle<$key>) -> Result<&$entry> {
                    if handle.owner != self.owner {
                        return Err(Error::InvalidResource($what));
                    }
                    self.$field.get(handle.key).ok_or(Error::InvalidResource($what))
                }

                $(
                    pub fn $get_mut(&mut self, handle: Handle<$key>) -> Result<&mut $entry> {
                        if handle.owner != self.owner {
                            return Err(Error::InvalidResource($what));
                        }
                        self.$field.get_mut(handle.key).ok_or(Error::InvalidResource($what))
                    }
                )?
            )*
        }
    };
}

accessors! {
    images: ImageKey => ImageEntry, "image", image, image_mut;
    buffers: BufferKey => BufferEntry, "buffer", buffer, buffer_mut;
    samplers: SamplerKey => SamplerEntry, "sampler", sampler;
    shaders: ShaderKey => ShaderEntry, "shader", shader;
    render_targets: RenderTargetKey => RenderTargetEntry, "render target", render_target;
    pipelines: PipelineKey => PipelineEntry, "pipeline", pipeline, pipeline_mut;
    encoders: EncoderKey => EncoderEntry, "encoder", encoder, encoder_mut;
}

impl Registry {
    pub fn new(owner: u64) -> Self {
        Self {
            owner,
            images: SlotMap::with_key(),
            buffers: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            shaders: SlotMap::with_key(),
            render_targets: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            encoders: SlotMap::with_key(),
            target_order: Vec::new(),
            encoder_order: Vec::new(),
        }
    }

    pub fn handle<K: Key>(&self, key: K) -> Handle<K> {
        Handle { key, owner: self.owner }
    }

    // =========================================================================
    // REFERENCE CHECKS
    // =========================================================================

    /// Why an image cannot be destroyed right now, if it cannot
    pub fn image_user(&self, key: ImageKey) -> Option<&'static str> {
        let entry = self.images.get(key)?;
        if entry.attachment_of.is_some() {
            return Some("render target attachment");
        }
        if self.pipelines.values().any(|p| p.bound_images.contains(&key)) {
            return Some("image bound to a pipeline");
        }
        if self.encoders.values().any(|e| e.image == key) {
            return Some("image used by an encoder");
        }
        None
    }

    /// Why a target's attachments cannot be destroyed with it, if something
    /// outside the target still reads one
    pub fn attachment_user(&self, key: RenderTargetKey) -> Option<&'static str> {
        let entry = self.render_targets.get(key)?;
        for image in &entry.outputs {
            if self
                .pipelines
                .values()
                .any(|p| p.target != key && p.bound_images.contains(image))
            {
                return Some("attachment bound to another target's pipeline");
            }
            if self.encoders.values().any(|e| e.image == *image) {
                return Some("attachment used by an encoder");
            }
        }
        None
    }

    pub fn sampler_in_use(&self, key: SamplerKey) -> bool {
        self.pipelines.values().any(|p| p.bound_samplers.contains(&key))
    }

    pub fn buffer_in_use(&self, key: BufferKey) -> bool {
        self.pipelines.values().any(|p| p.bound_buffers.contains(&key))
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    pub fn remove_pipeline(&mut self, key: PipelineKey, device: &VulkanDevice) {
        if let Some(mut entry) = self.pipelines.remove(key) {
            if let Some(target) = self.render_targets.get_mut(entry.target) {
                target.pipelines.retain(|&p| p != key);
            }
            entry.destroy(device);
            log::debug!("Destroyed pipeline {:?}", key);
        }
    }

    pub fn remove_render_target(&mut self, key: RenderTargetKey, device: &VulkanDevice) {
        let Some(mut entry) = self.render_targets.remove(key) else {
            return;
        };
        self.target_order.retain(|&t| t != key);
        for pipeline in std::mem::take(&mut entry.pipelines) {
            self.remove_pipeline(pipeline, device);
        }
        for image in entry.outputs.drain(..) {
            if let Some(mut image) = self.images.remove(image) {
                image.destroy(device);
            }
        }
        entry.destroy(device);
        log::debug!("Destroyed render target {:?}", key);
    }

    pub fn remove_encoder(&mut self, key: EncoderKey, device: &VulkanDevice) {
        if let Some(mut entry) = self.encoders.remove(key) {
            self.encoder_order.retain(|&e| e != key);
            entry.destroy(device);
            log::debug!("Destroyed encoder {:?}", key);
        }
    }

    /// Destroy every child, dependents before what they depend on
    pub fn destroy_all(&mut self, device: &VulkanDevice) {
        let targets: Vec<_> = self.render_targets.keys().collect();
        for target in targets {
            self.remove_render_target(target, device);
        }
        let pipelines: Vec<_> = self.pipelines.keys().collect();
        for pipeline in pipelines {
            self.remove_pipeline(pipeline, device);
        }
        let encoders: Vec<_> = self.encoders.keys().collect();
        for encoder in encoders {
            self.remove_encoder(encoder, device);
        }
        for (_, sampler) in self.samplers.drain() {
            sampler.destroy(device);
        }
        for (_, mut image) in self.images.drain() {
            image.destroy(device);
        }
        for (_, mut buffer) in self.buffers.drain() {
            buffer.destroy(device);
        }
        for (_, shader) in self.shaders.drain() {
            shader.destroy(device);
        }
    }
}
