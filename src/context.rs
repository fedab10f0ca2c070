// Device context - root owner of everything on one GPU connection
//
// The context holds the Vulkan device, the command buffer and fence renders
// go through, and the registry of every child object. Dropping it destroys the
// children first, then the submission objects, then the device.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::{SubmitSync, VulkanDevice};
use crate::config::{Config, RowOrder};
use crate::engine::RenderLock;
use crate::error::Result;
use crate::registry::Registry;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

pub struct DeviceContext {
    pub(crate) id: u64,
    pub(crate) config: Config,
    pub(crate) row_order: RowOrder,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) submit: SubmitSync,
    pub(crate) render_lock: RenderLock,
    pub(crate) lost: AtomicBool,
    // Declared last so it drops after everything created from it
    pub(crate) device: Arc<VulkanDevice>,
}

impl DeviceContext {
    /// Connect to the best available GPU with the default configuration
    pub fn create() -> Result<Self> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Self> {
        let device = VulkanDevice::new(&config.device)?;
        let submit = SubmitSync::new(&device)?;
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let row_order = config.get_row_order();

        log::info!("Device context {} ready on {}", id, device.name());

        Ok(Self {
            id,
            config,
            row_order,
            registry: Mutex::new(Registry::new(id)),
            submit,
            render_lock: RenderLock::new(),
            lost: AtomicBool::new(false),
            device,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device_name(&self) -> String {
        self.device.name()
    }

    /// Device memory currently suballocated for this context's objects
    pub fn allocated_bytes(&self) -> u64 {
        self.device.allocated_bytes()
    }

    /// True once a render has reported `DeviceLost`
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying device context {}", self.id);
        if let Err(e) = self.device.wait_idle() {
            log::warn!("wait_idle before teardown failed: {}", e);
        }
        self.registry.get_mut().destroy_all(&self.device);
        self.submit.destroy(&self.device.device);
    }
}
