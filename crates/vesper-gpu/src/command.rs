//! Command pool and command buffer recording.

use crate::device::Device;
use crate::driver::{Driver, ImageBarrier, ImageCopy};
use crate::error::Result;
use crate::registry::{TrackedKey, TrackedObject};
use ash::vk;
use std::sync::Arc;

/// A command buffer handle bound to the driver that records into it.
///
/// Cloning shares the handle; the owning [`CommandPool`] frees it.
#[derive(Clone)]
pub struct CommandBuffer {
    driver: Arc<dyn Driver>,
    handle: vk::CommandBuffer,
}

impl CommandBuffer {
    /// Wrap an existing command buffer.
    pub fn from_raw(driver: Arc<dyn Driver>, handle: vk::CommandBuffer) -> Self {
        Self { driver, handle }
    }

    /// Native handle.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Begin recording.
    pub fn begin(&self, flags: vk::CommandBufferUsageFlags) -> Result<()> {
        self.driver.begin_command_buffer(self.handle, flags)
    }

    /// End recording.
    pub fn end(&self) -> Result<()> {
        self.driver.end_command_buffer(self.handle)
    }

    /// Set a viewport covering `extent` with depth range 0..1.
    pub fn set_viewport(&self, extent: vk::Extent2D) {
        self.driver.cmd_set_viewport(
            self.handle,
            vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        );
    }

    /// Set an explicit viewport.
    pub fn set_viewport_raw(&self, viewport: vk::Viewport) {
        self.driver.cmd_set_viewport(self.handle, viewport);
    }

    /// Set a scissor covering `extent`.
    pub fn set_scissor(&self, extent: vk::Extent2D) {
        self.set_scissor_rect(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        });
    }

    /// Set an explicit scissor rectangle.
    pub fn set_scissor_rect(&self, scissor: vk::Rect2D) {
        self.driver.cmd_set_scissor(self.handle, scissor);
    }

    /// Set the dynamic line width.
    pub fn set_line_width(&self, line_width: f32) {
        self.driver.cmd_set_line_width(self.handle, line_width);
    }

    /// Record layout transitions; barriers that keep the layout are skipped.
    pub fn image_barriers(&self, barriers: &[ImageBarrier]) {
        let transitions: smallvec::SmallVec<[ImageBarrier; 4]> = barriers
            .iter()
            .filter(|barrier| barrier.is_transition())
            .copied()
            .collect();
        if !transitions.is_empty() {
            self.driver.cmd_image_barriers(self.handle, &transitions);
        }
    }

    /// Copy one image into another.
    pub fn copy_image(&self, copy: &ImageCopy) {
        self.driver.cmd_copy_image(self.handle, copy);
    }

    /// Begin a render pass with inline subpass contents.
    pub fn begin_render_pass(
        &self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) {
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        self.driver.cmd_begin_render_pass(
            self.handle,
            render_pass,
            framebuffer,
            render_area,
            clear_values,
        );
    }

    /// Advance to the next subpass.
    pub fn next_subpass(&self) {
        self.driver.cmd_next_subpass(self.handle);
    }

    /// End the current render pass.
    pub fn end_render_pass(&self) {
        self.driver.cmd_end_render_pass(self.handle);
    }

    /// Bind a graphics pipeline.
    pub fn bind_pipeline(&self, pipeline: vk::Pipeline) {
        self.driver.cmd_bind_pipeline(self.handle, pipeline);
    }

    /// Bind descriptor sets starting at `first_set`.
    pub fn bind_descriptor_sets(
        &self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.driver
            .cmd_bind_descriptor_sets(self.handle, layout, first_set, sets);
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CommandBuffer").field(&self.handle).finish()
    }
}

/// Command pool for the device queue.
pub struct CommandPool {
    device: Arc<Device>,
    key: TrackedKey,
    pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a command pool whose buffers can be reset individually.
    pub fn new(device: &Arc<Device>) -> Result<Self> {
        let pool = device
            .driver()
            .create_command_pool(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?;
        let key = device.track(TrackedObject::CommandPool(pool));
        Ok(Self {
            device: device.clone(),
            key,
            pool,
        })
    }

    /// Native handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Allocate a primary command buffer.
    pub fn allocate(&self) -> Result<CommandBuffer> {
        let handle = self.device.driver().allocate_command_buffer(self.pool)?;
        Ok(CommandBuffer::from_raw(self.device.driver().clone(), handle))
    }

    /// Free a command buffer allocated from this pool.
    pub fn free(&self, command_buffer: CommandBuffer) {
        self.device
            .driver()
            .free_command_buffer(self.pool, command_buffer.handle);
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.device.release(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::headless::{headless_device, HeadlessConfig, HeadlessObject, RecordedCommand};
    use ash::vk::Handle;

    #[test]
    fn barrier_list_skips_noop_transitions() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let pool = CommandPool::new(&device).unwrap();
        let cmd = pool.allocate().unwrap();
        let image = vk::Image::from_raw(99);

        cmd.image_barriers(&[
            ImageBarrier::transition(
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ),
            ImageBarrier::transition(
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::GENERAL,
            ),
        ]);

        assert_eq!(
            driver.take_commands(),
            vec![RecordedCommand::Barrier {
                image,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            }]
        );
        pool.free(cmd);
    }

    #[test]
    fn dropping_pool_destroys_it_once() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let before = driver.live_count(HeadlessObject::CommandPool);
        let pool = CommandPool::new(&device).unwrap();
        assert_eq!(driver.live_count(HeadlessObject::CommandPool), before + 1);

        drop(pool);
        assert_eq!(driver.live_count(HeadlessObject::CommandPool), before);
        assert_eq!(device.destroy_tracked_objects(), 0);
    }
}
