//! Images and image views.

use crate::allocator::Allocation;
use crate::device::Device;
use crate::driver::{ImageBarrier, ImageCopy, ImageDesc, ImageViewDesc};
use crate::error::{GpuError, Result};
use crate::registry::{TrackedKey, TrackedObject};
use ash::vk;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Aspect flags implied by a format.
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Whether a format has a depth or stencil aspect.
pub fn is_depth_stencil_format(format: vk::Format) -> bool {
    !aspect_mask(format).contains(vk::ImageAspectFlags::COLOR)
}

/// Creation options for an [`Image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageFormat {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub memory_properties: vk::MemoryPropertyFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
    /// Give the image its own memory block, freed when the image is.
    pub transient: bool,
    /// Layout the image is returned to between uses.
    pub layout: vk::ImageLayout,
}

impl Default for ImageFormat {
    fn default() -> Self {
        Self {
            format: vk::Format::R8G8B8A8_UNORM,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            memory_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            mip_levels: 1,
            array_layers: 1,
            transient: false,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }
}

impl ImageFormat {
    /// Format suitable for a colour attachment.
    pub fn color_attachment(format: vk::Format) -> Self {
        Self {
            format,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ..Self::default()
        }
    }

    /// Format suitable for a depth-stencil attachment.
    pub fn depth_stencil_attachment(format: vk::Format) -> Self {
        Self {
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..Self::default()
        }
    }

    pub fn format(mut self, format: vk::Format) -> Self {
        self.format = format;
        self
    }

    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    pub fn tiling(mut self, tiling: vk::ImageTiling) -> Self {
        self.tiling = tiling;
        self
    }

    pub fn usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    pub fn memory_properties(mut self, properties: vk::MemoryPropertyFlags) -> Self {
        self.memory_properties = properties;
        self
    }

    pub fn mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn array_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    pub fn transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    pub fn layout(mut self, layout: vk::ImageLayout) -> Self {
        self.layout = layout;
        self
    }
}

/// A 2D image, either owned with allocator memory or borrowed from a swapchain.
pub struct Image {
    device: Arc<Device>,
    key: Option<TrackedKey>,
    image: vk::Image,
    extent: vk::Extent2D,
    format: ImageFormat,
    aspect_mask: vk::ImageAspectFlags,
    allocation: Option<Allocation>,
    current_layout: AtomicI32,
}

impl Image {
    /// Create an image and bind memory from the device allocator.
    pub fn new(device: &Arc<Device>, extent: vk::Extent2D, format: ImageFormat) -> Result<Arc<Self>> {
        let driver = device.driver();
        let image = driver.create_image(&ImageDesc {
            extent,
            format: format.format,
            samples: format.samples,
            tiling: format.tiling,
            usage: format.usage,
            mip_levels: format.mip_levels,
            array_layers: format.array_layers,
        })?;

        let allocation = match device
            .allocator()
            .allocate_image(image, format.transient, format.memory_properties)
            .and_then(|allocation| {
                driver.bind_image_memory(image, allocation.memory, allocation.offset)?;
                Ok(allocation)
            }) {
            Ok(allocation) => allocation,
            Err(e) => {
                driver.destroy_image(image);
                if format.transient {
                    device.allocator().free_transient_image(image);
                }
                return Err(e);
            }
        };

        let key = device.track(TrackedObject::Image {
            image,
            transient: format.transient,
        });

        Ok(Arc::new(Self {
            device: device.clone(),
            key: Some(key),
            image,
            extent,
            aspect_mask: aspect_mask(format.format),
            format,
            allocation: Some(allocation),
            current_layout: AtomicI32::new(vk::ImageLayout::UNDEFINED.as_raw()),
        }))
    }

    /// Wrap a swapchain image. The swapchain keeps ownership.
    pub fn from_swapchain(
        device: &Arc<Device>,
        image: vk::Image,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> Arc<Self> {
        Arc::new(Self {
            device: device.clone(),
            key: None,
            image,
            extent,
            aspect_mask: vk::ImageAspectFlags::COLOR,
            format: ImageFormat {
                format,
                usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
                layout: vk::ImageLayout::PRESENT_SRC_KHR,
                ..ImageFormat::default()
            },
            allocation: None,
            current_layout: AtomicI32::new(vk::ImageLayout::UNDEFINED.as_raw()),
        })
    }

    /// Native handle.
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    /// Options the image was created with.
    pub fn image_format(&self) -> &ImageFormat {
        &self.format
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.format.samples
    }

    pub fn aspect_mask(&self) -> vk::ImageAspectFlags {
        self.aspect_mask
    }

    /// Memory backing the image, if the image owns any.
    pub fn allocation(&self) -> Option<&Allocation> {
        self.allocation.as_ref()
    }

    /// Layout the image was last transitioned to.
    pub fn current_layout(&self) -> vk::ImageLayout {
        vk::ImageLayout::from_raw(self.current_layout.load(Ordering::Acquire))
    }

    /// Record that the image is now in `layout`.
    pub fn set_current_layout(&self, layout: vk::ImageLayout) {
        self.current_layout.store(layout.as_raw(), Ordering::Release);
    }

    /// Declared steady-state layout.
    pub fn steady_layout(&self) -> vk::ImageLayout {
        self.format.layout
    }

    /// Barrier from the tracked layout to `new_layout`; updates the tracked layout.
    pub fn transition_to(&self, new_layout: vk::ImageLayout) -> ImageBarrier {
        let old_layout = vk::ImageLayout::from_raw(
            self.current_layout
                .swap(new_layout.as_raw(), Ordering::AcqRel),
        );
        ImageBarrier::transition(self.image, self.aspect_mask, old_layout, new_layout)
    }

    /// Copy the full contents of `src` into this image, blocking until done.
    ///
    /// Both images end up in their steady-state layouts.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn copy_from(&self, src: &Self) -> Result<()> {
        if src.extent != self.extent {
            return Err(GpuError::InvalidState(format!(
                "copy between images of different size: {}x{} into {}x{}",
                src.extent.width, src.extent.height, self.extent.width, self.extent.height
            )));
        }

        self.device.execute_one_shot(|cmd| {
            cmd.image_barriers(&[
                src.transition_to(vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
                self.transition_to(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            ]);
            cmd.copy_image(&ImageCopy {
                src: src.image,
                src_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst: self.image,
                dst_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                aspect_mask: self.aspect_mask,
                extent: self.extent,
            });
            cmd.image_barriers(&[
                src.transition_to(src.steady_layout()),
                self.transition_to(self.steady_layout()),
            ]);
            Ok(())
        })
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            self.device.release(key);
        }
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("image", &self.image)
            .field("extent", &self.extent)
            .field("format", &self.format.format)
            .field("samples", &self.format.samples)
            .finish_non_exhaustive()
    }
}

/// A view covering every mip level and layer of an image.
pub struct ImageView {
    device: Arc<Device>,
    key: TrackedKey,
    view: vk::ImageView,
    image: Arc<Image>,
}

impl ImageView {
    /// Create a view of `image`.
    pub fn new(image: &Arc<Image>) -> Result<Arc<Self>> {
        let device = &image.device;
        let view = device.driver().create_image_view(&ImageViewDesc {
            image: image.image,
            format: image.format.format,
            aspect_mask: image.aspect_mask,
            mip_levels: image.format.mip_levels,
            array_layers: image.format.array_layers,
        })?;
        let key = device.track(TrackedObject::ImageView(view));
        Ok(Arc::new(Self {
            device: device.clone(),
            key,
            view,
            image: image.clone(),
        }))
    }

    /// Allocate a `width` x `height` image and create a view of it.
    pub fn create(
        device: &Arc<Device>,
        width: u32,
        height: u32,
        format: ImageFormat,
    ) -> Result<Arc<Self>> {
        let image = Image::new(device, vk::Extent2D { width, height }, format)?;
        Self::new(&image)
    }

    /// Native handle.
    pub fn handle(&self) -> vk::ImageView {
        self.view
    }

    /// The viewed image.
    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        self.device.release(self.key);
    }
}

impl std::fmt::Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageView")
            .field("view", &self.view)
            .field("image", &self.image)
            .finish()
    }
}
