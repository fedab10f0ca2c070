// Execution engine
//
// render() records everything into the context's single command buffer,
// submits it and blocks on the fence:
//
//   pending uploads      staging -> image, then shader-read layout
//   render targets       creation order, one render pass each, pipelines in
//                        append order, attachments copied back to staging
//   encoders             creation order, one dispatch each, image copied back
//                        to staging
//   host barrier         device writes visible to mapped reads
//
// Every color image sits in SHADER_READ_ONLY_OPTIMAL between renders.

use ash::vk;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::backend::image::{copy_region, layout_barrier};
use crate::backend::VulkanDevice;
use crate::context::DeviceContext;
use crate::error::{Error, Result};
use crate::registry::{ImageKey, Registry};
use crate::render_target::RenderTargetEntry;

// =============================================================================
// RENDER LOCK
// =============================================================================

/// Rejects a second render while one is in flight; never queues
pub(crate) struct RenderLock {
    busy: AtomicBool,
}

pub(crate) struct RenderGuard<'a> {
    lock: &'a RenderLock,
}

impl RenderLock {
    pub fn new() -> Self {
        Self { busy: AtomicBool::new(false) }
    }

    pub fn try_acquire(&self) -> Option<RenderGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RenderGuard { lock: self })
    }
}

impl Drop for RenderGuard<'_> {
    fn drop(&mut self) {
        self.lock.busy.store(false, Ordering::Release);
    }
}

// =============================================================================
// RECORDING
// =============================================================================

#[derive(Debug, Default)]
struct RenderStats {
    uploads: usize,
    targets: usize,
    draws: usize,
    dispatches: usize,
}

impl RenderStats {
    fn is_empty(&self) -> bool {
        self.uploads == 0 && self.targets == 0 && self.dispatches == 0
    }
}

fn record_uploads(
    device: &VulkanDevice,
    cmd: vk::CommandBuffer,
    registry: &Registry,
    pending: &[ImageKey],
) {
    let images: Vec<_> = pending.iter().filter_map(|&key| registry.images.get(key)).collect();

    let to_transfer: Vec<_> = images
        .iter()
        .map(|image| {
            layout_barrier(
                image.gpu.image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
            )
        })
        .collect();
    let to_read: Vec<_> = images
        .iter()
        .map(|image| {
            layout_barrier(
                image.gpu.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
            )
        })
        .collect();

    unsafe {
        device.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &to_transfer,
        );
        for image in &images {
            device.device.cmd_copy_buffer_to_image(
                cmd,
                image.staging.buffer,
                image.gpu.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy_region(image.extent())],
            );
        }
        device.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &to_read,
        );
    }
}

/// Returns the number of draws recorded
fn record_target(
    device: &VulkanDevice,
    cmd: vk::CommandBuffer,
    registry: &Registry,
    target: &RenderTargetEntry,
) -> usize {
    let clear_values = target.clear_values();
    let pass_info = vk::RenderPassBeginInfo::builder()
        .render_pass(target.render_pass)
        .framebuffer(target.framebuffer)
        .render_area(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: target.extent,
        })
        .clear_values(&clear_values);

    let mut draws = 0;
    unsafe {
        device
            .device
            .cmd_begin_render_pass(cmd, &pass_info, vk::SubpassContents::INLINE);
        for pipeline in target.pipelines.iter().filter_map(|&key| registry.pipelines.get(key)) {
            pipeline.record(device, cmd);
            draws += 1;
        }
        device.device.cmd_end_render_pass(cmd);

        // Render pass left the attachments in TRANSFER_SRC_OPTIMAL
        for image in target.outputs.iter().filter_map(|&key| registry.images.get(key)) {
            device.device.cmd_copy_image_to_buffer(
                cmd,
                image.gpu.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image.staging.buffer,
                &[copy_region(image.extent())],
            );
            let to_read = layout_barrier(
                image.gpu.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::TRANSFER_READ,
                vk::AccessFlags::SHADER_READ,
            );
            device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_read],
            );
        }
    }
    draws
}

fn record_host_barrier(device: &VulkanDevice, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE | vk::AccessFlags::SHADER_WRITE)
        .dst_access_mask(vk::AccessFlags::HOST_READ)
        .build();
    unsafe {
        device.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::HOST,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

impl DeviceContext {
    /// Upload pending data, draw every render target, run every encoder, and
    /// block until the device is done
    ///
    /// Fails with `ConcurrentRenderNotPermitted` if another thread is already
    /// rendering on this context. After `DeviceLost` the context refuses to
    /// render again.
    pub fn render(&self) -> Result<()> {
        let _guard = self
            .render_lock
            .try_acquire()
            .ok_or(Error::ConcurrentRenderNotPermitted)?;

        if self.lost.load(Ordering::Acquire) {
            return Err(Error::DeviceLost);
        }

        let start = Instant::now();
        let mut registry = self.registry.lock();
        let result = self.execute(&mut registry);

        match &result {
            Ok(stats) => log::debug!(
                "Render finished in {:?}: {} uploads, {} targets, {} draws, {} dispatches",
                start.elapsed(),
                stats.uploads,
                stats.targets,
                stats.draws,
                stats.dispatches
            ),
            Err(Error::DeviceLost) => {
                log::error!("Device lost during render, context is no longer usable");
                self.lost.store(true, Ordering::Release);
            }
            Err(e) => log::error!("Render failed: {}", e),
        }
        result.map(|_| ())
    }

    fn execute(&self, registry: &mut Registry) -> Result<RenderStats> {
        let device = &*self.device;

        let pending: Vec<ImageKey> = registry
            .images
            .iter()
            .filter(|(_, image)| image.pending_upload)
            .map(|(key, _)| key)
            .collect();
        let targets: Vec<_> = registry
            .target_order
            .iter()
            .filter_map(|&key| registry.render_targets.get(key))
            .filter(|target| !target.pipelines.is_empty())
            .collect();

        let mut stats = RenderStats {
            uploads: pending.len(),
            targets: targets.len(),
            dispatches: registry.encoder_order.len(),
            ..Default::default()
        };
        if stats.is_empty() {
            return Ok(stats);
        }

        let cmd = self.submit.begin(device)?;

        if !pending.is_empty() {
            record_uploads(device, cmd, registry, &pending);
        }
        for target in &targets {
            stats.draws += record_target(device, cmd, registry, target);
        }
        for encoder in registry.encoder_order.iter().filter_map(|&key| registry.encoders.get(key)) {
            if let Some(image) = registry.images.get(encoder.image) {
                encoder.record(device, cmd, image);
            }
        }
        record_host_barrier(device, cmd);

        self.submit
            .submit_and_wait(device, self.config.get_timeout_ns())?;

        for key in pending {
            if let Some(image) = registry.images.get_mut(key) {
                image.pending_upload = false;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_rejected() {
        let lock = RenderLock::new();
        let guard = lock.try_acquire();
        assert!(guard.is_some());
        assert!(lock.try_acquire().is_none());
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = RenderLock::new();
        drop(lock.try_acquire());
        let again = lock.try_acquire();
        assert!(again.is_some());
    }

    #[test]
    fn empty_stats_skip_submission() {
        assert!(RenderStats::default().is_empty());
        let only_dispatch = RenderStats { dispatches: 1, ..Default::default() };
        assert!(!only_dispatch.is_empty());
    }
}
