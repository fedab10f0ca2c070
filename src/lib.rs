// =============================================================================
// OFFSCREEN RENDERER - synchronous offscreen rendering over Vulkan
// =============================================================================
//
// OBJECT MODEL:
// ┌─────────────────────────────────────────────────────────────────┐
// │  DeviceContext (device, queue, allocator, registry)             │
// │    ├── Images / Buffers / Samplers / Shader stages              │
// │    ├── RenderTarget (owned attachments)                         │
// │    │     └── Pipelines, drawn in append order                   │
// │    └── Encoders (compute over an image)                         │
// └─────────────────────────────────────────────────────────────────┘
//
// RENDER FLOW:
// 1. Host writes land in staging memory
// 2. render() uploads pending data and records every target and encoder
// 3. One submit, block on the fence
// 4. Attachments are copied back, read() returns the pixels
//
// =============================================================================

mod backend;
mod binding;
pub mod config;
mod context;
mod encoder;
mod engine;
pub mod error;
pub mod format;
mod pipeline;
mod registry;
mod render_target;
mod resource;
mod shader;

pub use binding::{BindingDecl, BindingKind};
pub use config::{Config, RowOrder};
pub use context::DeviceContext;
pub use encoder::EncoderDesc;
pub use error::{Error, Result};
pub use format::{PixelFormat, VertexFormat};
pub use pipeline::{PipelineDesc, Topology};
pub use registry::{
    BufferHandle, EncoderHandle, Handle, ImageHandle, PipelineHandle, RenderTargetHandle,
    SamplerHandle, ShaderHandle,
};
pub use render_target::RenderTargetDesc;
pub use resource::{Filter, ImageInfo, ResourceHandle, SamplerDesc, Wrap};
pub use shader::{ShaderDesc, StageKind};

/// Host values as the little-endian bytes `write` and `update` take
pub fn pack<T: bytemuck::Pod>(data: &[T]) -> Vec<u8> {
    bytemuck::cast_slice(data).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_floats_little_endian() {
        let bytes = pack(&[1.0f32, -2.5]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[4..], &(-2.5f32).to_le_bytes());
    }

    #[test]
    fn packs_indices() {
        assert_eq!(pack(&[1u32, 2]), vec![1, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn packs_nothing() {
        assert!(pack::<f32>(&[]).is_empty());
    }
}
