// Error taxonomy for the offscreen renderer
//
// Construction-time validation errors surface immediately from the call that
// caused them. Device-level failures (DeviceLost, OutOfDeviceMemory) can only be
// observed at submission/wait time and surface from render().

use ash::vk;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no usable Vulkan device: {0}")]
    DeviceUnavailable(String),

    #[error("invalid resource descriptor: {0}")]
    InvalidResourceDescriptor(String),

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("shader binary rejected: {0}")]
    ShaderCompilationRejected(String),

    #[error("binding mismatch: {0}")]
    BindingMismatch(String),

    #[error("vertex layout mismatch: {0}")]
    VertexLayoutMismatch(String),

    #[error("unknown binding '{0}'")]
    UnknownBinding(String),

    #[error("device lost")]
    DeviceLost,

    #[error("out of device memory")]
    OutOfDeviceMemory,

    #[error("a render is already in flight on this device context")]
    ConcurrentRenderNotPermitted,

    #[error("{0} is still referenced and cannot be destroyed")]
    ResourceInUse(&'static str),

    /// Stale handle, handle owned by another context, or a sampler whose image
    /// has been destroyed.
    #[error("invalid {0} handle")]
    InvalidResource(&'static str),

    #[error("vulkan call failed: {0}")]
    Vulkan(vk::Result),

    /// Allocator failure other than running out of memory
    #[error("device memory allocator failed: {0}")]
    Allocator(String),
}

impl From<vk::Result> for Error {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Error::OutOfDeviceMemory
            }
            other => Error::Vulkan(other),
        }
    }
}

impl From<gpu_allocator::AllocationError> for Error {
    fn from(err: gpu_allocator::AllocationError) -> Self {
        match err {
            gpu_allocator::AllocationError::OutOfMemory => Error::OutOfDeviceMemory,
            other => Error::Allocator(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lost_maps_to_taxonomy() {
        assert!(matches!(Error::from(vk::Result::ERROR_DEVICE_LOST), Error::DeviceLost));
    }

    #[test]
    fn out_of_memory_codes_collapse() {
        assert!(matches!(
            Error::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            Error::OutOfDeviceMemory
        ));
        assert!(matches!(
            Error::from(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            Error::OutOfDeviceMemory
        ));
    }

    #[test]
    fn other_codes_are_kept() {
        match Error::from(vk::Result::ERROR_FORMAT_NOT_SUPPORTED) {
            Error::Vulkan(code) => assert_eq!(code, vk::Result::ERROR_FORMAT_NOT_SUPPORTED),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn allocator_oom_is_out_of_device_memory() {
        let err = Error::from(gpu_allocator::AllocationError::OutOfMemory);
        assert!(matches!(err, Error::OutOfDeviceMemory));
    }

    #[test]
    fn other_allocator_failures_stay_distinct() {
        let err = Error::from(gpu_allocator::AllocationError::NoCompatibleMemoryTypeFound);
        assert!(matches!(err, Error::Allocator(_)));
    }

    #[test]
    fn size_mismatch_message_names_both_sizes() {
        let msg = Error::SizeMismatch { expected: 16, actual: 12 }.to_string();
        assert!(msg.contains("16") && msg.contains("12"));
    }
}
