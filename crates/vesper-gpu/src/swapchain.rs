//! Swapchain management.

use crate::device::Device;
use crate::driver::{SurfaceSupport, SwapchainDesc};
use crate::error::{GpuError, Result};
use crate::image::{Image, ImageFormat, ImageView};
use crate::registry::{TrackedKey, TrackedObject};
use ash::vk;
use std::sync::Arc;

/// Depth-stencil formats tried, in order, when the requested one is unusable.
const DEPTH_STENCIL_FALLBACKS: [vk::Format; 3] = [
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D16_UNORM,
];

/// Swapchain creation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainOptions {
    pub present_mode: vk::PresentModeKHR,
    pub depth_stencil_format: vk::Format,
    /// Sample count of the per-image depth-stencil attachments.
    pub samples: vk::SampleCountFlags,
}

impl Default for SwapchainOptions {
    fn default() -> Self {
        Self {
            present_mode: vk::PresentModeKHR::FIFO,
            depth_stencil_format: vk::Format::D24_UNORM_S8_UINT,
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }
}

impl SwapchainOptions {
    pub fn present_mode(mut self, mode: vk::PresentModeKHR) -> Self {
        self.present_mode = mode;
        self
    }

    pub fn depth_stencil_format(mut self, format: vk::Format) -> Self {
        self.depth_stencil_format = format;
        self
    }

    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }
}

/// Prefer BGRA8 UNORM with sRGB non-linear colour space.
pub fn select_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let preferred = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    match formats {
        [] => preferred,
        [only] if only.format == vk::Format::UNDEFINED => preferred,
        _ => formats
            .iter()
            .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
            .copied()
            .unwrap_or(formats[0]),
    }
}

/// Requested mode if supported, else FIFO (always available).
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    requested: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&requested) {
        requested
    } else {
        tracing::info!("Present mode {requested:?} unsupported, falling back to FIFO");
        vk::PresentModeKHR::FIFO
    }
}

/// Surface extent, or the window size clamped to the surface limits.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: window.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: window.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// Requested image count clamped to the surface limits. A maximum of zero
/// means unbounded.
pub fn clamp_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let count = requested.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Requested depth-stencil format if usable, else the first usable fallback.
fn select_depth_stencil_format(device: &Device, requested: vk::Format) -> Result<vk::Format> {
    let supported = |format: vk::Format| {
        device
            .driver()
            .format_properties(format)
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    };

    if supported(requested) {
        return Ok(requested);
    }
    let fallback = DEPTH_STENCIL_FALLBACKS
        .into_iter()
        .find(|&f| supported(f))
        .ok_or_else(|| GpuError::SwapchainCreation("no usable depth-stencil format".into()))?;
    tracing::info!("Depth-stencil format {requested:?} unsupported, using {fallback:?}");
    Ok(fallback)
}

/// The ring of presentable images plus a depth-stencil attachment per image.
pub struct Swapchain {
    device: Arc<Device>,
    key: TrackedKey,
    swapchain: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    depth_stencil_format: vk::Format,
    images: Vec<Arc<Image>>,
    color_views: Vec<Arc<ImageView>>,
    depth_views: Vec<Arc<ImageView>>,
}

impl Swapchain {
    /// Create a swapchain for `surface`, replacing `old_swapchain` if it is
    /// not null.
    pub fn new(
        device: &Arc<Device>,
        surface: vk::SurfaceKHR,
        window: vk::Extent2D,
        image_count: u32,
        options: &SwapchainOptions,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let driver = device.driver();
        let support: SurfaceSupport = driver.surface_support(surface)?;
        if !support.present_supported {
            return Err(GpuError::NoPresentQueue);
        }

        let surface_format = select_surface_format(&support.formats);
        let present_mode = select_present_mode(&support.present_modes, options.present_mode);
        let extent = calculate_extent(&support.capabilities, window);
        let min_image_count = clamp_image_count(&support.capabilities, image_count);
        let depth_stencil_format = select_depth_stencil_format(device, options.depth_stencil_format)?;

        let (swapchain, raw_images) = driver.create_swapchain(&SwapchainDesc {
            surface,
            min_image_count,
            surface_format,
            extent,
            present_mode,
            pre_transform: support.capabilities.current_transform,
            old_swapchain,
        })?;
        let key = device.track(TrackedObject::Swapchain(swapchain));

        tracing::info!(
            "Created swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            raw_images.len(),
            surface_format.format,
            present_mode
        );

        let mut this = Self {
            device: device.clone(),
            key,
            swapchain,
            surface_format,
            present_mode,
            extent,
            depth_stencil_format,
            images: Vec::with_capacity(raw_images.len()),
            color_views: Vec::with_capacity(raw_images.len()),
            depth_views: Vec::with_capacity(raw_images.len()),
        };

        // A failure below drops `this`, which releases everything made so far.
        let depth_format =
            ImageFormat::depth_stencil_attachment(depth_stencil_format).samples(options.samples);
        for raw in raw_images {
            let image = Image::from_swapchain(device, raw, extent, surface_format.format);
            this.color_views.push(ImageView::new(&image)?);
            this.images.push(image);
            this.depth_views.push(ImageView::create(
                device,
                extent.width,
                extent.height,
                depth_format,
            )?);
        }

        Ok(this)
    }

    /// Native handle.
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn depth_stencil_format(&self) -> vk::Format {
        self.depth_stencil_format
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn images(&self) -> &[Arc<Image>] {
        &self.images
    }

    pub fn color_views(&self) -> &[Arc<ImageView>] {
        &self.color_views
    }

    pub fn depth_views(&self) -> &[Arc<ImageView>] {
        &self.depth_views
    }

    /// Acquire the next presentable image. Returns its index and whether the
    /// swapchain is suboptimal.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn acquire_next_image(
        &self,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<(u32, bool)> {
        self.device
            .driver()
            .acquire_next_image(self.swapchain, timeout_ns, semaphore, fence)
    }

    /// Queue image `image_index` for presentation. Returns whether the
    /// swapchain is suboptimal.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn present(&self, image_index: u32, wait_semaphores: &[vk::Semaphore]) -> Result<bool> {
        self.device
            .driver()
            .queue_present(self.swapchain, image_index, wait_semaphores)
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.color_views.clear();
        self.depth_views.clear();
        self.images.clear();
        self.device.release(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::headless::{headless_device, HeadlessConfig, HeadlessObject};

    fn window() -> vk::Extent2D {
        vk::Extent2D {
            width: 800,
            height: 600,
        }
    }

    #[test]
    fn surface_format_prefers_bgra_unorm() {
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        assert_eq!(select_surface_format(&[srgb, unorm]).format, unorm.format);
        assert_eq!(select_surface_format(&[srgb]).format, srgb.format);
        assert_eq!(
            select_surface_format(&[vk::SurfaceFormatKHR::default()]).format,
            vk::Format::B8G8R8A8_UNORM
        );
    }

    #[test]
    fn unsupported_present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];

        assert_eq!(
            select_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            select_present_mode(&available, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_and_image_count_respect_surface_limits() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            ..Default::default()
        };

        let extent = calculate_extent(
            &capabilities,
            vk::Extent2D {
                width: 4000,
                height: 300,
            },
        );
        assert_eq!((extent.width, extent.height), (1024, 300));
        assert_eq!(clamp_image_count(&capabilities, 1), 2);
        assert_eq!(clamp_image_count(&capabilities, 8), 3);

        let unbounded = vk::SurfaceCapabilitiesKHR {
            max_image_count: 0,
            ..capabilities
        };
        assert_eq!(clamp_image_count(&unbounded, 8), 8);
    }

    #[test]
    fn swapchain_wraps_images_with_present_layout() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();

        let swapchain = Swapchain::new(
            &device,
            vk::SurfaceKHR::null(),
            window(),
            3,
            &SwapchainOptions::default(),
            vk::SwapchainKHR::null(),
        )
        .unwrap();

        assert_eq!(swapchain.image_count(), 3);
        assert_eq!(swapchain.extent(), window());
        assert!(swapchain
            .images()
            .iter()
            .all(|i| i.steady_layout() == vk::ImageLayout::PRESENT_SRC_KHR));
        assert_eq!(swapchain.depth_views().len(), 3);
        assert_eq!(driver.live_count(HeadlessObject::ImageView), 6);

        drop(swapchain);
        assert_eq!(driver.live_count(HeadlessObject::Swapchain), 0);
        assert_eq!(driver.live_count(HeadlessObject::ImageView), 0);
        assert_eq!(driver.live_count(HeadlessObject::Image), 0);
    }

    #[test]
    fn unusable_depth_format_falls_back() {
        let (device, _driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();

        let swapchain = Swapchain::new(
            &device,
            vk::SurfaceKHR::null(),
            window(),
            2,
            &SwapchainOptions::default().depth_stencil_format(vk::Format::D32_SFLOAT_S8_UINT),
            vk::SwapchainKHR::null(),
        )
        .unwrap();

        assert_eq!(
            swapchain.depth_stencil_format(),
            vk::Format::D24_UNORM_S8_UINT
        );
    }

    #[test]
    fn missing_present_support_is_an_error() {
        let (device, _driver) = headless_device(
            HeadlessConfig {
                present_supported: false,
                ..HeadlessConfig::default()
            },
            DeviceConfig::default(),
        )
        .unwrap();

        let result = Swapchain::new(
            &device,
            vk::SurfaceKHR::null(),
            window(),
            2,
            &SwapchainOptions::default(),
            vk::SwapchainKHR::null(),
        );
        assert!(matches!(result, Err(GpuError::NoPresentQueue)));
    }

    #[test]
    fn acquire_cycles_and_reports_out_of_date() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let swapchain = Swapchain::new(
            &device,
            vk::SurfaceKHR::null(),
            window(),
            2,
            &SwapchainOptions::default(),
            vk::SwapchainKHR::null(),
        )
        .unwrap();

        let none = (vk::Semaphore::null(), vk::Fence::null());
        assert_eq!(swapchain.acquire_next_image(u64::MAX, none.0, none.1).unwrap().0, 0);
        assert_eq!(swapchain.acquire_next_image(u64::MAX, none.0, none.1).unwrap().0, 1);
        assert!(!swapchain.present(1, &[]).unwrap());

        driver.set_out_of_date(true);
        assert!(matches!(
            swapchain.acquire_next_image(u64::MAX, none.0, none.1),
            Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR))
        ));
    }
}
