//! Presentation: swapchain, per-image render passes and framebuffers, and the
//! optional multisampled colour target resolved into each swapchain image.

use crate::command::CommandBuffer;
use crate::context::Context;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::framebuffer::{Framebuffer, FramebufferFormat};
use crate::image::{ImageFormat, ImageView};
use crate::render_pass::{Attachment, RenderPass, RenderPassOptions, Subpass, SubpassDependency};
use crate::swapchain::{Swapchain, SwapchainOptions};
use ash::vk;
use std::sync::Arc;

/// Presenter configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresenterOptions {
    /// The caller begins, ends and submits command buffers itself.
    pub explicit_mode: bool,
    pub present_mode: vk::PresentModeKHR,
    pub samples: vk::SampleCountFlags,
    pub depth_stencil_format: vk::Format,
    pub clear_color: [f32; 4],
}

impl Default for PresenterOptions {
    fn default() -> Self {
        Self {
            explicit_mode: false,
            present_mode: vk::PresentModeKHR::FIFO,
            samples: vk::SampleCountFlags::TYPE_1,
            depth_stencil_format: vk::Format::D24_UNORM_S8_UINT,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl PresenterOptions {
    pub fn explicit_mode(mut self, explicit: bool) -> Self {
        self.explicit_mode = explicit;
        self
    }

    pub fn present_mode(mut self, mode: vk::PresentModeKHR) -> Self {
        self.present_mode = mode;
        self
    }

    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    pub fn depth_stencil_format(mut self, format: vk::Format) -> Self {
        self.depth_stencil_format = format;
        self
    }

    pub fn clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }
}

/// Halve `samples` until `samples * max(width, height)` fits within
/// `max_dimension`. Never goes below one sample.
pub fn clamp_sample_count(
    samples: vk::SampleCountFlags,
    extent: vk::Extent2D,
    max_dimension: u32,
) -> vk::SampleCountFlags {
    let largest = extent.width.max(extent.height);
    let mut count = samples.as_raw().max(1);
    while count > 1 && count.saturating_mul(largest) > max_dimension {
        count /= 2;
    }
    vk::SampleCountFlags::from_raw(count)
}

/// Drives a window's frame loop: acquire, begin, end, present.
pub struct Presenter {
    device: Arc<Device>,
    surface: vk::SurfaceKHR,
    options: PresenterOptions,
    /// Requested count after clamping to what the device supports.
    supported_samples: vk::SampleCountFlags,
    samples: Option<vk::SampleCountFlags>,
    size: vk::Extent2D,
    image_count: u32,
    // Field order is drop order: framebuffers before the views and passes
    // they reference, everything before the swapchain.
    framebuffers: Vec<Framebuffer>,
    multisample_views: Vec<Arc<ImageView>>,
    render_passes: Vec<RenderPass>,
    swapchain: Option<Swapchain>,
    current_image_index: Option<u32>,
    command_buffer: Option<CommandBuffer>,
}

impl Presenter {
    /// Create a presenter and its first swapchain.
    pub fn new(
        device: &Arc<Device>,
        surface: vk::SurfaceKHR,
        size: vk::Extent2D,
        image_count: u32,
        options: PresenterOptions,
    ) -> Result<Self> {
        let supported_samples = device.capabilities().supported_color_samples(options.samples);
        if supported_samples != options.samples {
            tracing::info!(
                "Requested {:?} samples unsupported, using {supported_samples:?}",
                options.samples
            );
        }

        let mut presenter = Self {
            device: device.clone(),
            surface,
            options,
            supported_samples,
            samples: None,
            size: vk::Extent2D::default(),
            image_count,
            framebuffers: Vec::new(),
            multisample_views: Vec::new(),
            render_passes: Vec::new(),
            swapchain: None,
            current_image_index: None,
            command_buffer: None,
        };
        presenter.resize(size)?;
        Ok(presenter)
    }

    /// Rebuild size-dependent resources for a new window size. Returns false
    /// if the size did not change.
    pub fn resize(&mut self, size: vk::Extent2D) -> Result<bool> {
        if self.swapchain.is_some() && size == self.size {
            return Ok(false);
        }
        self.recreate(size)?;
        Ok(true)
    }

    /// Rebuild the swapchain and everything sized by it, even if `size` is
    /// unchanged. Use after the surface reports it is out of date.
    pub fn recreate(&mut self, size: vk::Extent2D) -> Result<()> {
        if self.command_buffer.is_some() {
            return Err(GpuError::InvalidState("resize while recording".into()));
        }

        self.device.wait_idle()?;

        let max_dimension = self.device.capabilities().max_image_dimension_2d;
        let samples = clamp_sample_count(self.supported_samples, size, max_dimension);
        if samples != self.supported_samples {
            tracing::info!(
                "{:?} samples exceed the {max_dimension} image limit at {}x{}, using {samples:?}",
                self.supported_samples,
                size.width,
                size.height
            );
        }
        let samples_changed = self.samples != Some(samples);
        if samples_changed && self.samples.is_some() {
            tracing::info!("Sample count changed to {samples:?}, invalidating pipelines");
            self.device.pipeline_selector().invalidate();
        }

        self.framebuffers.clear();
        self.multisample_views.clear();
        self.current_image_index = None;

        let old = self.swapchain.take();
        let swapchain = Swapchain::new(
            &self.device,
            self.surface,
            size,
            self.image_count,
            &SwapchainOptions::default()
                .present_mode(self.options.present_mode)
                .depth_stencil_format(self.options.depth_stencil_format)
                .samples(samples),
            old.as_ref().map_or(vk::SwapchainKHR::null(), Swapchain::handle),
        )?;
        drop(old);

        if samples_changed || self.render_passes.len() != swapchain.image_count() as usize {
            self.render_passes.clear();
            for _ in 0..swapchain.image_count() {
                let options = self.render_pass_options(&swapchain, samples);
                self.render_passes.push(RenderPass::new(&self.device, options)?);
            }
        }

        let extent = swapchain.extent();
        let multisample = samples != vk::SampleCountFlags::TYPE_1;
        for i in 0..swapchain.image_count() as usize {
            let color = swapchain.color_views()[i].clone();
            let depth = swapchain.depth_views()[i].clone();
            let format = if multisample {
                let view = ImageView::create(
                    &self.device,
                    extent.width,
                    extent.height,
                    ImageFormat::color_attachment(swapchain.format())
                        .samples(samples)
                        .usage(
                            vk::ImageUsageFlags::COLOR_ATTACHMENT
                                | vk::ImageUsageFlags::SAMPLED
                                | vk::ImageUsageFlags::TRANSFER_SRC,
                        ),
                )?;
                self.multisample_views.push(view.clone());
                FramebufferFormat::new()
                    .attachment(view)
                    .attachment(color)
                    .attachment(depth)
            } else {
                FramebufferFormat::new().attachment(color).attachment(depth)
            };
            self.framebuffers.push(Framebuffer::new(
                &self.device,
                &self.render_passes[i],
                extent,
                &format,
            )?);
        }

        self.swapchain = Some(swapchain);
        self.samples = Some(samples);
        self.size = size;

        self.transition_to_first_use()
    }

    fn render_pass_options(&self, swapchain: &Swapchain, samples: vk::SampleCountFlags) -> RenderPassOptions {
        let clear_color = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.options.clear_color,
            },
        };
        let dependency = SubpassDependency::new(vk::SUBPASS_EXTERNAL, 0)
            .stages(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .access(
                vk::AccessFlags::empty(),
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );
        let format = swapchain.format();
        let depth = swapchain.depth_stencil_format();

        if samples == vk::SampleCountFlags::TYPE_1 {
            RenderPassOptions::new()
                .attachment(Attachment::color(format, samples).clear_value(clear_color))
                .attachment(Attachment::depth_stencil(depth, samples))
                .subpass(Subpass::new().color(0).depth_stencil(1))
                .dependency(dependency)
        } else {
            RenderPassOptions::new()
                .attachment(Attachment::color(format, samples).clear_value(clear_color))
                .attachment(
                    Attachment::color(format, vk::SampleCountFlags::TYPE_1)
                        .load_op(vk::AttachmentLoadOp::DONT_CARE),
                )
                .attachment(Attachment::depth_stencil(depth, samples))
                .subpass(Subpass::new().color_resolve(0, 1).depth_stencil(2))
                .dependency(dependency)
        }
    }

    /// Move every attachment image into its steady-state layout, blocking until done.
    pub fn transition_to_first_use(&self) -> Result<()> {
        let Some(swapchain) = &self.swapchain else {
            return Ok(());
        };
        let images = swapchain
            .images()
            .iter()
            .chain(swapchain.depth_views().iter().map(|v| v.image()))
            .chain(self.multisample_views.iter().map(|v| v.image()));

        let barriers: Vec<_> = images
            .map(|image| image.transition_to(image.steady_layout()))
            .collect();
        self.device.execute_one_shot(|cmd| {
            cmd.image_barriers(&barriers);
            Ok(())
        })
    }

    /// Acquire the next swapchain image and make it current.
    pub fn acquire_next_image(&mut self, fence: vk::Fence, semaphore: vk::Semaphore) -> Result<u32> {
        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("presenter has no swapchain".into()))?;
        let (index, suboptimal) = swapchain.acquire_next_image(u64::MAX, semaphore, fence)?;
        if suboptimal {
            tracing::debug!("Swapchain is suboptimal");
        }
        self.current_image_index = Some(index);
        Ok(index)
    }

    /// Begin rendering into the current image. Outside explicit mode this also
    /// begins `command_buffer`.
    pub fn begin_render(&mut self, ctx: &mut Context, command_buffer: &CommandBuffer) -> Result<()> {
        let index = self.current_image_index.ok_or_else(|| {
            GpuError::InvalidState("begin_render without an acquired image".into())
        })? as usize;
        if self.command_buffer.is_some() {
            return Err(GpuError::InvalidState("presenter is already recording".into()));
        }

        if !self.options.explicit_mode {
            command_buffer.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        }
        self.render_passes[index].begin_render_explicit(ctx, command_buffer, &self.framebuffers[index])?;
        self.command_buffer = Some(command_buffer.clone());
        Ok(())
    }

    /// Finish rendering into the current image, leaving it ready to present.
    /// Outside explicit mode this also ends the command buffer.
    pub fn end_render(&mut self, ctx: &mut Context) -> Result<()> {
        let index = self.current_image_index.ok_or_else(|| {
            GpuError::InvalidState("end_render without an acquired image".into())
        })? as usize;
        let command_buffer = self
            .command_buffer
            .take()
            .ok_or_else(|| GpuError::InvalidState("end_render without begin_render".into()))?;

        self.render_passes[index].end_render_explicit(ctx)?;
        if !self.options.explicit_mode {
            command_buffer.end()?;
        }
        Ok(())
    }

    /// Present the current image. Returns whether the swapchain is suboptimal.
    pub fn present(&mut self, wait_semaphores: &[vk::Semaphore]) -> Result<bool> {
        let index = self
            .current_image_index
            .take()
            .ok_or_else(|| GpuError::InvalidState("present without an acquired image".into()))?;
        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("presenter has no swapchain".into()))?;
        swapchain.present(index, wait_semaphores)
    }

    pub fn current_image_index(&self) -> Option<u32> {
        self.current_image_index
    }

    /// Full-surface render area.
    pub fn render_area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: self
                .swapchain
                .as_ref()
                .map_or(self.size, Swapchain::extent),
        }
    }

    /// Effective sample count.
    pub fn samples(&self) -> vk::SampleCountFlags {
        self.samples.unwrap_or(vk::SampleCountFlags::TYPE_1)
    }

    pub fn image_count(&self) -> u32 {
        self.swapchain.as_ref().map_or(0, Swapchain::image_count)
    }

    /// Render pass for the current image, or the first one when none is acquired.
    pub fn render_pass(&self) -> Option<&RenderPass> {
        let index = self.current_image_index.unwrap_or(0) as usize;
        self.render_passes.get(index)
    }

    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    pub fn options(&self) -> &PresenterOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandPool;
    use crate::device::DeviceConfig;
    use crate::headless::{headless_device, HeadlessConfig, HeadlessDriver, HeadlessObject, RecordedCommand};

    fn size(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn presenter(options: PresenterOptions) -> (Presenter, Arc<Device>, Arc<HeadlessDriver>) {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let presenter =
            Presenter::new(&device, vk::SurfaceKHR::null(), size(800, 600), 2, options).unwrap();
        (presenter, device, driver)
    }

    #[test]
    fn clamp_halves_until_image_fits() {
        let samples = vk::SampleCountFlags::TYPE_8;

        assert_eq!(
            clamp_sample_count(samples, size(800, 600), 16384),
            vk::SampleCountFlags::TYPE_8
        );
        // 8 * 8000 and 4 * 8000 exceed the limit; 2 * 8000 fits.
        assert_eq!(
            clamp_sample_count(samples, size(8000, 6000), 16384),
            vk::SampleCountFlags::TYPE_2
        );
        assert_eq!(
            clamp_sample_count(samples, size(8000, 6000), 8000),
            vk::SampleCountFlags::TYPE_1
        );
        assert_eq!(
            clamp_sample_count(samples, size(20000, 10), 16384),
            vk::SampleCountFlags::TYPE_1
        );
    }

    #[test]
    fn requested_samples_are_clamped_to_device_support() {
        let (device, _driver) = headless_device(
            HeadlessConfig {
                color_sample_counts: vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_4,
                ..HeadlessConfig::default()
            },
            DeviceConfig::default(),
        )
        .unwrap();

        let presenter = Presenter::new(
            &device,
            vk::SurfaceKHR::null(),
            size(640, 480),
            2,
            PresenterOptions::default().samples(vk::SampleCountFlags::TYPE_8),
        )
        .unwrap();

        assert_eq!(presenter.samples(), vk::SampleCountFlags::TYPE_4);
    }

    #[test]
    fn multisampled_presenter_resolves_into_swapchain() {
        let (presenter, _device, _driver) =
            presenter(PresenterOptions::default().samples(vk::SampleCountFlags::TYPE_4));

        assert_eq!(presenter.samples(), vk::SampleCountFlags::TYPE_4);
        let pass = presenter.render_pass().unwrap();
        assert_eq!(pass.attachment_count(), 3);
        assert_eq!(pass.subpass_sample_count(0), Some(vk::SampleCountFlags::TYPE_4));
        assert_eq!(pass.options().references(0).resolve[0].attachment, 1);
        assert_eq!(presenter.framebuffers[0].views().len(), 3);
    }

    #[test]
    fn single_sample_presenter_clears_swapchain_image() {
        let (presenter, _device, _driver) = presenter(PresenterOptions::default());

        let pass = presenter.render_pass().unwrap();
        assert_eq!(pass.attachment_count(), 2);
        assert_eq!(
            pass.options().attachments[0].load_op,
            vk::AttachmentLoadOp::CLEAR
        );
        assert!(presenter.multisample_views.is_empty());
    }

    #[test]
    fn first_use_transitions_images_to_steady_layouts() {
        let (presenter, _device, _driver) =
            presenter(PresenterOptions::default().samples(vk::SampleCountFlags::TYPE_4));
        let swapchain = presenter.swapchain().unwrap();

        assert!(swapchain
            .images()
            .iter()
            .all(|i| i.current_layout() == vk::ImageLayout::PRESENT_SRC_KHR));
        assert!(swapchain.depth_views().iter().all(|v| {
            v.image().current_layout() == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        }));
        assert!(presenter.multisample_views.iter().all(|v| {
            v.image().current_layout() == vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        }));
    }

    #[test]
    fn resize_to_same_size_is_a_no_op() {
        let (mut presenter, _device, driver) = presenter(PresenterOptions::default());
        let swapchains = driver.created_count(HeadlessObject::Swapchain);

        assert!(!presenter.resize(size(800, 600)).unwrap());
        assert_eq!(driver.created_count(HeadlessObject::Swapchain), swapchains);
    }

    #[test]
    fn recreate_rebuilds_at_the_same_size() {
        let (mut presenter, _device, driver) = presenter(PresenterOptions::default());
        let swapchains = driver.created_count(HeadlessObject::Swapchain);

        presenter.recreate(size(800, 600)).unwrap();

        assert_eq!(driver.created_count(HeadlessObject::Swapchain), swapchains + 1);
        assert_eq!(driver.live_count(HeadlessObject::Swapchain), 1);
    }

    #[test]
    fn resize_keeps_render_passes_when_samples_hold() {
        let (mut presenter, _device, driver) =
            presenter(PresenterOptions::default().samples(vk::SampleCountFlags::TYPE_4));
        let passes = driver.created_count(HeadlessObject::RenderPass);

        assert!(presenter.resize(size(1024, 768)).unwrap());

        assert_eq!(driver.created_count(HeadlessObject::RenderPass), passes);
        assert_eq!(driver.live_count(HeadlessObject::Swapchain), 1);
        assert_eq!(presenter.render_area().extent, size(1024, 768));
    }

    #[test]
    fn sample_clamp_on_resize_invalidates_pipelines() {
        let (mut presenter, device, driver) =
            presenter(PresenterOptions::default().samples(vk::SampleCountFlags::TYPE_8));
        assert_eq!(presenter.samples(), vk::SampleCountFlags::TYPE_8);

        {
            let mut selector = device.pipeline_selector();
            selector.set_render_pass(presenter.render_pass().unwrap().handle());
            selector.get_selected_pipeline().unwrap();
        }
        let passes = driver.created_count(HeadlessObject::RenderPass);

        assert!(presenter.resize(size(8000, 6000)).unwrap());

        assert_eq!(presenter.samples(), vk::SampleCountFlags::TYPE_2);
        assert_eq!(device.pipeline_selector().pipeline_count(), 0);
        assert!(driver.created_count(HeadlessObject::RenderPass) > passes);
        assert_eq!(
            driver.live_count(HeadlessObject::RenderPass),
            presenter.image_count() as usize
        );
    }

    #[test]
    fn frame_loop_records_and_presents() {
        let (mut presenter, device, driver) = presenter(PresenterOptions::default());
        let mut ctx = Context::new(device.clone());
        let pool = CommandPool::new(&device).unwrap();
        let cmd = pool.allocate().unwrap();
        driver.take_commands();

        let index = presenter
            .acquire_next_image(vk::Fence::null(), vk::Semaphore::null())
            .unwrap();
        presenter.begin_render(&mut ctx, &cmd).unwrap();
        assert!(ctx.current_render_pass().is_some());
        presenter.end_render(&mut ctx).unwrap();
        device.submit_and_wait(&[cmd.handle()]).unwrap();
        presenter.present(&[]).unwrap();

        let swapchain_image = presenter.swapchain().unwrap().images()[index as usize].handle();
        let commands = driver.take_commands();
        assert_eq!(commands.first(), Some(&RecordedCommand::Begin(cmd.handle())));
        assert!(commands.contains(&RecordedCommand::Barrier {
            image: swapchain_image,
            old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        }));
        assert_eq!(commands.last(), Some(&RecordedCommand::End(cmd.handle())));
        assert_eq!(driver.present_count(), 1);
        assert_eq!(presenter.current_image_index(), None);
    }

    #[test]
    fn begin_without_acquire_is_an_error() {
        let (mut presenter, device, _driver) =
            presenter(PresenterOptions::default().explicit_mode(true));
        let mut ctx = Context::new(device.clone());
        let pool = CommandPool::new(&device).unwrap();
        let cmd = pool.allocate().unwrap();

        assert!(matches!(
            presenter.begin_render(&mut ctx, &cmd),
            Err(GpuError::InvalidState(_))
        ));
        assert!(presenter.present(&[]).is_err());
    }

    #[test]
    fn dropping_presenter_releases_everything() {
        let (presenter, device, driver) =
            presenter(PresenterOptions::default().samples(vk::SampleCountFlags::TYPE_4));

        drop(presenter);

        assert_eq!(driver.live_count(HeadlessObject::Swapchain), 0);
        assert_eq!(driver.live_count(HeadlessObject::Framebuffer), 0);
        assert_eq!(driver.live_count(HeadlessObject::RenderPass), 0);
        assert_eq!(driver.live_count(HeadlessObject::ImageView), 0);
        assert_eq!(device.destroy_tracked_objects(), 0);
    }
}
