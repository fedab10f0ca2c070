// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with optional validation layers
// - Physical device selection (prefer discrete GPU)
// - Logical device + graphics/compute queue creation
// - Memory allocator setup and accounting

use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::DeviceConfig;
use crate::error::{Error, Result};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Taken and dropped before the device is destroyed
    allocator: Mutex<Option<Allocator>>,
    allocated_bytes: AtomicU64,

    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Queue handles
    pub queue: vk::Queue,
    pub queue_family: u32,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// Any failure before the logical device exists is reported as
    /// `DeviceUnavailable`.
    pub fn new(config: &DeviceConfig) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", config.app_name);

        // Step 1: Load Vulkan library
        let entry = if config.backend.is_empty() {
            unsafe { Entry::load() }
        } else {
            log::info!("Loading Vulkan library from {}", config.backend);
            unsafe { Entry::load_from(&config.backend) }
        };
        let entry = entry.map_err(|e| {
            Error::DeviceUnavailable(format!("failed to load Vulkan library: {}", e))
        })?;

        // Step 2: Create instance
        let enable_validation = config.validation_layers && Self::validation_available(&entry);
        if config.validation_layers && !enable_validation {
            log::warn!("Validation layers requested but not installed, continuing without");
        }
        let instance = Self::create_instance(&entry, &config.app_name, enable_validation)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(debug_utils) => Some(debug_utils),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        // Step 4: Pick physical device (GPU)
        let picked = Self::pick_physical_device(&instance, config.prefer_discrete_gpu);
        let (physical_device, queue_family) = match picked {
            Ok(picked) => picked,
            Err(e) => {
                unsafe {
                    if let Some((debug_utils, messenger)) = &debug_utils {
                        debug_utils.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        // Step 5: Create logical device
        let created = Self::create_logical_device(&instance, physical_device, queue_family);
        let (device, queue, features) = match created {
            Ok(created) => created,
            Err(e) => {
                unsafe {
                    if let Some((debug_utils, messenger)) = &debug_utils {
                        debug_utils.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        // Step 6: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        // Step 7: Create memory allocator
        let allocator = Allocator::new(&gpu_allocator::vulkan::AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe {
                    device.destroy_device(None);
                    if let Some((debug_utils, messenger)) = &debug_utils {
                        debug_utils.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(Error::DeviceUnavailable(format!("allocator setup failed: {}", e)));
            }
        };

        Ok(Arc::new(Self {
            allocator: Mutex::new(Some(allocator)),
            allocated_bytes: AtomicU64::new(0),
            device,
            physical_device,
            instance,
            _entry: entry,
            queue,
            queue_family,
            debug_utils,
            properties,
            features,
        }))
    }

    fn validation_available(entry: &Entry) -> bool {
        entry
            .enumerate_instance_layer_properties()
            .map(|layers| {
                layers.iter().any(|layer| {
                    let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
                    name == VALIDATION_LAYER
                })
            })
            .unwrap_or(false)
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)
            .map_err(|_| Error::DeviceUnavailable("application name contains NUL".into()))?;
        let engine_name = c"offscreen-renderer";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        // Offscreen only: no surface extensions
        let mut extensions = vec![];
        let mut layer_names = vec![];
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
            layer_names.push(VALIDATION_LAYER.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
            Error::DeviceUnavailable(format!("failed to create Vulkan instance: {}", e))
        })
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .map_err(|e| Error::DeviceUnavailable(format!("debug messenger: {}", e)))?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        prefer_discrete: bool,
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| Error::DeviceUnavailable(format!("cannot enumerate GPUs: {}", e)))?;

        if devices.is_empty() {
            return Err(Error::DeviceUnavailable("no Vulkan-capable GPU found".into()));
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };

            // One queue family has to do graphics, compute and transfer
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            let family = queue_families
                .iter()
                .enumerate()
                .find(|(_, props)| {
                    props
                        .queue_flags
                        .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
                })
                .map(|(i, _)| i as u32);

            if let Some(family) = family {
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU if prefer_discrete => 1000,
                    vk::PhysicalDeviceType::DISCRETE_GPU => 100,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 500,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, family));
                }
            }
        }

        best_device.ok_or_else(|| Error::DeviceUnavailable("no GPU with a graphics queue".into()))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue, vk::PhysicalDeviceFeatures)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        // Optional stages are enabled whenever the GPU has them
        let supported = unsafe { instance.get_physical_device_features(physical_device) };
        let features = vk::PhysicalDeviceFeatures {
            geometry_shader: supported.geometry_shader,
            tessellation_shader: supported.tessellation_shader,
            ..Default::default()
        };
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .map_err(|e| Error::DeviceUnavailable(format!("failed to create device: {}", e)))?;

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok((device, queue, features))
    }

    // =========================================================================
    // MEMORY
    // =========================================================================

    /// Suballocate memory for a buffer or image
    pub fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        let mut allocator = self.allocator.lock();
        let allocator = allocator.as_mut().ok_or(Error::DeviceLost)?;
        let allocation = allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        self.allocated_bytes.fetch_add(allocation.size(), Ordering::Relaxed);
        Ok(allocation)
    }

    pub fn free(&self, allocation: Allocation) {
        let size = allocation.size();
        if let Some(allocator) = self.allocator.lock().as_mut() {
            match allocator.free(allocation) {
                Ok(()) => {
                    self.allocated_bytes.fetch_sub(size, Ordering::Relaxed);
                }
                Err(e) => log::error!("Failed to free allocation: {}", e),
            }
        }
    }

    /// Bytes currently suballocated for this device
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    pub fn format_features(&self, format: vk::Format) -> vk::FormatFeatureFlags {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
        .optimal_tiling_features
    }

    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Allocator owns device memory blocks, release them first
        drop(self.allocator.lock().take());

        // Cleanup in reverse order
        unsafe {
            self.device.destroy_device(None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
