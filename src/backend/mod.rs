// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Everything above this module talks in handles and byte slices, never raw
// Vulkan objects.

pub mod buffer;
pub mod device;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod sync;

pub use buffer::GpuBuffer;
pub use device::VulkanDevice;
pub use image::GpuImage;
pub use sync::SubmitSync;
