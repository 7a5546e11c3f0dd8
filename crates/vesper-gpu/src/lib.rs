//! Vulkan rendering layer for the Vesper toolkit.
//!
//! This crate provides:
//! - Device ownership with a registry of every native object it creates
//! - Block-based device memory allocation
//! - Content-keyed caches for pipelines and their layouts
//! - Render passes with a begin / next-subpass / end recording state machine
//! - Swapchain presentation with optional multisampling
//!
//! All native calls go through the [`Driver`] trait. Enable the `headless`
//! feature for an in-memory driver that needs no GPU.

pub mod allocator;
pub mod ash_driver;
pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod driver;
pub mod error;
pub mod framebuffer;
#[cfg(any(test, feature = "headless"))]
pub mod headless;
pub mod image;
pub mod instance;
pub mod memo;
pub mod pipeline;
pub mod presenter;
pub mod registry;
pub mod render_pass;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use allocator::{Allocation, Allocator, AllocatorConfig, BlockReport};
pub use ash_driver::AshDriver;
pub use buffer::{Buffer, BufferFormat};
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::{CommandBuffer, CommandPool};
pub use context::{BlendFunction, Context, DepthBias, DrawState, StateStack, Viewport};
pub use descriptors::{
    DescriptorBinding, DescriptorBindings, DescriptorPool, DescriptorSet,
    DescriptorSetLayoutSelector, PipelineLayoutSelector, PushConstantRange,
};
pub use device::{Device, DeviceBuilder, DeviceConfig};
pub use driver::{DescriptorResource, DescriptorWrite, Driver, ImageBarrier, Submission};
pub use error::{GpuError, Result};
pub use framebuffer::{Framebuffer, FramebufferAttachment, FramebufferFormat};
pub use image::{Image, ImageFormat, ImageView};
pub use pipeline::{
    ColorBlendAttachment, FixedFunctionState, GraphicsPipelineState, PipelineSelector,
    ShaderStage, VertexAttribute, VertexBinding,
};
pub use presenter::{clamp_sample_count, Presenter, PresenterOptions};
pub use registry::{ObjectKind, TrackedKey, TrackedObject};
pub use render_pass::{
    Attachment, RenderPass, RenderPassInfo, RenderPassOptions, Subpass, SubpassDependency,
};
pub use surface::Surface;
pub use swapchain::{Swapchain, SwapchainOptions};
pub use sync::{Fence, FrameSync, ImageSemaphores, Semaphore};
