//! Vesper demo viewer.
//!
//! Opens a window and runs a presenter frame loop that clears every
//! swapchain image, recreating size-dependent resources on resize.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p vesper-viewer
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::sync::Arc;

use anyhow::Context as _;
use ash::vk;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vesper_gpu::{
    CommandBuffer, CommandPool, Context, Device, DeviceBuilder, FrameSync, GpuError,
    ImageSemaphores, Presenter, PresenterOptions, Submission, Surface,
};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

/// Viewer configuration.
#[derive(Debug, Clone)]
struct AppConfig {
    title: String,
    width: u32,
    height: u32,
    image_count: u32,
    samples: vk::SampleCountFlags,
    present_mode: vk::PresentModeKHR,
    clear_color: [f32; 4],
    validation: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Vesper Viewer".to_string(),
            width: 1280,
            height: 720,
            image_count: 3,
            samples: vk::SampleCountFlags::TYPE_4,
            present_mode: vk::PresentModeKHR::MAILBOX,
            clear_color: [0.05, 0.07, 0.12, 1.0],
            validation: cfg!(debug_assertions),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::default();
    info!("{} starting...", config.title);

    let event_loop = EventLoop::new().context("failed to create event loop")?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = Runner {
        config,
        state: None,
    };
    event_loop.run_app(&mut runner)?;
    Ok(())
}

struct Runner {
    config: AppConfig,
    state: Option<ViewerState>,
}

/// Everything that lives while the window is open. Field order is drop order.
struct ViewerState {
    presenter: Presenter,
    frame_sync: FrameSync,
    render_finished: ImageSemaphores,
    command_buffer: CommandBuffer,
    command_pool: CommandPool,
    ctx: Context,
    device: Arc<Device>,
    surface: Surface,
    window: Arc<Window>,
    frame: u64,
}

impl ApplicationHandler for Runner {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        match ViewerState::new(&self.config, event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Viewer ready");
            }
            Err(e) => {
                error!("Failed to initialize viewer: {e:#}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(state) = self.state.take() {
                    state.shutdown();
                }
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.resize(size) {
                        error!("Resize error: {e}");
                    }
                }
            }
            WindowEvent::RedrawRequested => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.render_frame() {
                        error!("Render error: {e}");
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}

impl ViewerState {
    fn new(config: &AppConfig, event_loop: &ActiveEventLoop) -> anyhow::Result<Self> {
        let attributes = Window::default_attributes()
            .with_title(&config.title)
            .with_inner_size(PhysicalSize::new(config.width, config.height));
        let window = Arc::new(event_loop.create_window(attributes)?);

        let (device, surface) = DeviceBuilder::new()
            .app_name(&config.title)
            .validation(config.validation)
            .build_for_window(window.as_ref())?;

        let size = window.inner_size();
        let presenter = Presenter::new(
            &device,
            surface.handle(),
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
            config.image_count,
            PresenterOptions::default()
                .samples(config.samples)
                .present_mode(config.present_mode)
                .clear_color(config.clear_color),
        )?;
        info!(
            "Presenting {} images at {:?} samples",
            presenter.image_count(),
            presenter.samples()
        );

        let command_pool = CommandPool::new(&device)?;
        let render_finished = ImageSemaphores::new(&device, presenter.image_count())?;
        let command_buffer = command_pool.allocate()?;

        Ok(Self {
            presenter,
            frame_sync: FrameSync::new(&device)?,
            render_finished,
            command_buffer,
            command_pool,
            ctx: Context::new(device.clone()),
            device,
            surface,
            window,
            frame: 0,
        })
    }

    fn extent(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    fn resize(&mut self, size: PhysicalSize<u32>) -> vesper_gpu::Result<()> {
        // Minimized
        if size.width == 0 || size.height == 0 {
            return Ok(());
        }
        if self.presenter.resize(vk::Extent2D {
            width: size.width,
            height: size.height,
        })? {
            self.render_finished.resize(self.presenter.image_count())?;
            info!("Resized to {}x{}", size.width, size.height);
        }
        Ok(())
    }

    fn render_frame(&mut self) -> vesper_gpu::Result<()> {
        let extent = self.extent();
        if extent.width == 0 || extent.height == 0 {
            return Ok(());
        }

        let sync = &self.frame_sync;
        sync.in_flight.wait()?;

        let image_index = match self
            .presenter
            .acquire_next_image(vk::Fence::null(), sync.image_available.handle())
        {
            Ok(index) => index,
            Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)) => {
                return self.recreate(extent);
            }
            Err(e) => return Err(e),
        };
        let render_finished = self
            .render_finished
            .get(image_index)
            .ok_or_else(|| {
                GpuError::InvalidState(format!("no semaphore for image {image_index}"))
            })?
            .handle();
        sync.in_flight.reset()?;

        self.presenter
            .begin_render(&mut self.ctx, &self.command_buffer)?;
        self.presenter.end_render(&mut self.ctx)?;

        let wait_semaphores = [sync.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.command_buffer.handle()];
        let signal_semaphores = [render_finished];
        self.device.submit(
            &Submission {
                wait_semaphores: &wait_semaphores,
                wait_stages: &wait_stages,
                command_buffers: &command_buffers,
                signal_semaphores: &signal_semaphores,
            },
            sync.in_flight.handle(),
        )?;

        match self.presenter.present(&signal_semaphores) {
            Ok(false) => {}
            Ok(true) | Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)) => {
                self.recreate(extent)?;
            }
            Err(e) => return Err(e),
        }

        self.frame += 1;
        Ok(())
    }

    /// Rebuild the swapchain after the surface went out of date.
    fn recreate(&mut self, extent: vk::Extent2D) -> vesper_gpu::Result<()> {
        tracing::debug!("Swapchain out of date at frame {}", self.frame);
        self.presenter.recreate(extent)?;
        self.render_finished.resize(self.presenter.image_count())?;
        Ok(())
    }

    fn shutdown(self) {
        if let Err(e) = self.device.wait_idle() {
            error!("wait_idle failed during shutdown: {e}");
        }
        self.command_pool.free(self.command_buffer);
        info!(
            "Rendered {} frames on queue family {}",
            self.frame,
            self.surface.queue_family()
        );
    }
}
