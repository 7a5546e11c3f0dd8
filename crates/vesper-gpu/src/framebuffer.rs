//! Framebuffers.

use crate::device::Device;
use crate::error::Result;
use crate::image::{Image, ImageFormat, ImageView};
use crate::registry::{TrackedKey, TrackedObject};
use crate::render_pass::RenderPass;
use ash::vk;
use std::sync::Arc;

/// Source of one framebuffer attachment.
#[derive(Debug, Clone)]
pub enum FramebufferAttachment {
    /// An existing view.
    View(Arc<ImageView>),
    /// An image to allocate at the framebuffer's size.
    Allocate(ImageFormat),
}

/// Attachments of a framebuffer, in render-pass attachment order.
#[derive(Debug, Clone, Default)]
pub struct FramebufferFormat {
    pub attachments: Vec<FramebufferAttachment>,
}

impl FramebufferFormat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing view.
    pub fn attachment(mut self, view: Arc<ImageView>) -> Self {
        self.attachments.push(FramebufferAttachment::View(view));
        self
    }

    /// Allocate an attachment image with `format`.
    pub fn allocate(mut self, format: ImageFormat) -> Self {
        self.attachments.push(FramebufferAttachment::Allocate(format));
        self
    }
}

/// A framebuffer and the views it renders into.
pub struct Framebuffer {
    device: Arc<Device>,
    key: TrackedKey,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    views: Vec<Arc<ImageView>>,
}

impl Framebuffer {
    /// Create a framebuffer compatible with `render_pass`.
    pub fn new(
        device: &Arc<Device>,
        render_pass: &RenderPass,
        extent: vk::Extent2D,
        format: &FramebufferFormat,
    ) -> Result<Self> {
        let views = format
            .attachments
            .iter()
            .map(|attachment| match attachment {
                FramebufferAttachment::View(view) => Ok(view.clone()),
                FramebufferAttachment::Allocate(format) => {
                    ImageView::create(device, extent.width, extent.height, *format)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let handles: Vec<vk::ImageView> = views.iter().map(|v| v.handle()).collect();
        let framebuffer = device
            .driver()
            .create_framebuffer(render_pass.handle(), &handles, extent)?;
        let key = device.track(TrackedObject::Framebuffer(framebuffer));

        Ok(Self {
            device: device.clone(),
            key,
            framebuffer,
            extent,
            views,
        })
    }

    /// Native handle.
    pub fn handle(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn views(&self) -> &[Arc<ImageView>] {
        &self.views
    }

    /// Images behind each attachment, in attachment order.
    pub fn attachment_images(&self) -> Vec<Arc<Image>> {
        self.views.iter().map(|v| v.image().clone()).collect()
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.device.release(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::headless::{headless_device, HeadlessConfig, HeadlessObject};
    use crate::render_pass::RenderPassOptions;

    #[test]
    fn allocated_attachments_match_framebuffer_size() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let pass = RenderPass::new(
            &device,
            RenderPassOptions::color_depth(
                vk::Format::R8G8B8A8_UNORM,
                vk::Format::D32_SFLOAT,
                vk::SampleCountFlags::TYPE_1,
            ),
        )
        .unwrap();
        let extent = vk::Extent2D {
            width: 128,
            height: 64,
        };

        let framebuffer = Framebuffer::new(
            &device,
            &pass,
            extent,
            &FramebufferFormat::new()
                .allocate(ImageFormat::color_attachment(vk::Format::R8G8B8A8_UNORM))
                .allocate(ImageFormat::depth_stencil_attachment(vk::Format::D32_SFLOAT)),
        )
        .unwrap();

        assert_eq!(framebuffer.views().len(), 2);
        assert!(framebuffer
            .attachment_images()
            .iter()
            .all(|image| image.extent() == extent));
        assert_eq!(driver.live_count(HeadlessObject::Image), 2);

        drop(framebuffer);
        assert_eq!(driver.live_count(HeadlessObject::Framebuffer), 0);
        assert_eq!(driver.live_count(HeadlessObject::Image), 0);
    }

    #[test]
    fn existing_views_are_shared() {
        let (device, _driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let pass = RenderPass::new(
            &device,
            RenderPassOptions::color(vk::Format::R8G8B8A8_UNORM, vk::SampleCountFlags::TYPE_1),
        )
        .unwrap();
        let view = ImageView::create(
            &device,
            16,
            16,
            ImageFormat::color_attachment(vk::Format::R8G8B8A8_UNORM),
        )
        .unwrap();

        let framebuffer = Framebuffer::new(
            &device,
            &pass,
            vk::Extent2D {
                width: 16,
                height: 16,
            },
            &FramebufferFormat::new().attachment(view.clone()),
        )
        .unwrap();

        assert!(Arc::ptr_eq(&framebuffer.views()[0], &view));
    }
}
