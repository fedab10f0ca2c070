// Shader module loading
//
// Vulkan consumes SPIR-V. The binary is opaque here apart from the word
// alignment and magic number checks `ash::util::read_spv` performs.

use ash::vk;
use std::io::Cursor;

use super::VulkanDevice;
use crate::error::{Error, Result};

/// Load SPIR-V shader from bytes and create a shader module
pub fn create_shader_module(device: &VulkanDevice, code: &[u8]) -> Result<vk::ShaderModule> {
    if code.is_empty() {
        return Err(Error::ShaderCompilationRejected("empty shader binary".into()));
    }

    // read_spv copies into u32 words, so unaligned input is fine
    let words = ash::util::read_spv(&mut Cursor::new(code))
        .map_err(|e| Error::ShaderCompilationRejected(e.to_string()))?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe { device.device.create_shader_module(&create_info, None) }.map_err(|e| match e {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            Error::OutOfDeviceMemory
        }
        other => Error::ShaderCompilationRejected(format!("driver rejected module: {}", other)),
    })
}
