//! Render passes and their recording state machine.
//!
//! A [`RenderPass`] has a fixed attachment and subpass topology. Each use goes
//! `begin_render` -> `next_subpass`* -> `end_render`. Begin moves every
//! framebuffer attachment into the layout the pass expects; end moves each
//! one back to its image's steady-state layout.

use crate::command::CommandBuffer;
use crate::context::{Context, Viewport};
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::framebuffer::Framebuffer;
use crate::image::{is_depth_stencil_format, Image};
use crate::registry::{TrackedKey, TrackedObject};
use ash::vk;
use std::sync::Arc;

/// Layout an attachment of `format` is rendered in.
pub fn attachment_optimal_layout(format: vk::Format) -> vk::ImageLayout {
    if is_depth_stencil_format(format) {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    }
}

/// One attachment of a render pass.
#[derive(Clone, Copy)]
pub struct Attachment {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
    pub clear_value: vk::ClearValue,
}

// `vk::ClearValue` is a union and has no `Debug`.
impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("format", &self.format)
            .field("samples", &self.samples)
            .field("load_op", &self.load_op)
            .field("store_op", &self.store_op)
            .field("stencil_load_op", &self.stencil_load_op)
            .field("stencil_store_op", &self.stencil_store_op)
            .field("initial_layout", &self.initial_layout)
            .field("final_layout", &self.final_layout)
            .finish_non_exhaustive()
    }
}

impl Attachment {
    /// Single-sampled attachment that clears on load and stores.
    pub fn new(format: vk::Format) -> Self {
        let clear_value = if is_depth_stencil_format(format) {
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            }
        } else {
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            }
        };
        Self {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::CLEAR,
            stencil_store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: attachment_optimal_layout(format),
            clear_value,
        }
    }

    pub fn color(format: vk::Format, samples: vk::SampleCountFlags) -> Self {
        Self::new(format).samples(samples)
    }

    pub fn depth_stencil(format: vk::Format, samples: vk::SampleCountFlags) -> Self {
        Self::new(format).samples(samples)
    }

    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    pub fn load_op(mut self, op: vk::AttachmentLoadOp) -> Self {
        self.load_op = op;
        self
    }

    pub fn store_op(mut self, op: vk::AttachmentStoreOp) -> Self {
        self.store_op = op;
        self
    }

    pub fn stencil_load_op(mut self, op: vk::AttachmentLoadOp) -> Self {
        self.stencil_load_op = op;
        self
    }

    pub fn stencil_store_op(mut self, op: vk::AttachmentStoreOp) -> Self {
        self.stencil_store_op = op;
        self
    }

    pub fn initial_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.initial_layout = layout;
        self
    }

    pub fn final_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.final_layout = layout;
        self
    }

    pub fn clear_value(mut self, value: vk::ClearValue) -> Self {
        self.clear_value = value;
        self
    }

    /// Layout used by subpass references to this attachment.
    pub fn reference_layout(&self) -> vk::ImageLayout {
        match self.final_layout {
            vk::ImageLayout::UNDEFINED | vk::ImageLayout::PRESENT_SRC_KHR => {
                attachment_optimal_layout(self.format)
            }
            layout => layout,
        }
    }

    /// Layout the image must be in when the pass begins.
    fn begin_layout(&self) -> vk::ImageLayout {
        if self.initial_layout == vk::ImageLayout::UNDEFINED {
            attachment_optimal_layout(self.format)
        } else {
            self.initial_layout
        }
    }

    pub fn to_vk(&self) -> vk::AttachmentDescription {
        vk::AttachmentDescription {
            flags: vk::AttachmentDescriptionFlags::empty(),
            format: self.format,
            samples: self.samples,
            load_op: self.load_op,
            store_op: self.store_op,
            stencil_load_op: self.stencil_load_op,
            stencil_store_op: self.stencil_store_op,
            initial_layout: self.initial_layout,
            final_layout: self.final_layout,
        }
    }
}

/// Attachments used by one subpass, as indices into the pass's attachment list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subpass {
    pub color_attachments: Vec<u32>,
    /// One slot per colour attachment.
    pub resolve_attachments: Vec<Option<u32>>,
    pub depth_stencil_attachment: Option<u32>,
}

impl Subpass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a colour attachment.
    pub fn color(mut self, attachment: u32) -> Self {
        self.color_attachments.push(attachment);
        self.resolve_attachments.push(None);
        self
    }

    /// Add a multisampled colour attachment resolved into `resolve`.
    pub fn color_resolve(mut self, attachment: u32, resolve: u32) -> Self {
        self.color_attachments.push(attachment);
        self.resolve_attachments.push(Some(resolve));
        self
    }

    pub fn depth_stencil(mut self, attachment: u32) -> Self {
        self.depth_stencil_attachment = Some(attachment);
        self
    }
}

/// Native attachment references of one subpass.
#[derive(Debug, Clone, Default)]
pub struct SubpassReferences {
    pub color: Vec<vk::AttachmentReference>,
    /// Empty when no colour attachment resolves.
    pub resolve: Vec<vk::AttachmentReference>,
    pub depth_stencil: Option<vk::AttachmentReference>,
}

/// Execution and memory dependency between two subpasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubpassDependency {
    pub src_subpass: u32,
    pub dst_subpass: u32,
    pub src_stage_mask: vk::PipelineStageFlags,
    pub dst_stage_mask: vk::PipelineStageFlags,
    pub src_access_mask: vk::AccessFlags,
    pub dst_access_mask: vk::AccessFlags,
    pub dependency_flags: vk::DependencyFlags,
}

impl SubpassDependency {
    pub fn new(src_subpass: u32, dst_subpass: u32) -> Self {
        Self {
            src_subpass,
            dst_subpass,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        }
    }

    pub fn stages(mut self, src: vk::PipelineStageFlags, dst: vk::PipelineStageFlags) -> Self {
        self.src_stage_mask = src;
        self.dst_stage_mask = dst;
        self
    }

    pub fn access(mut self, src: vk::AccessFlags, dst: vk::AccessFlags) -> Self {
        self.src_access_mask = src;
        self.dst_access_mask = dst;
        self
    }

    pub fn to_vk(&self) -> vk::SubpassDependency {
        vk::SubpassDependency {
            src_subpass: self.src_subpass,
            dst_subpass: self.dst_subpass,
            src_stage_mask: self.src_stage_mask,
            dst_stage_mask: self.dst_stage_mask,
            src_access_mask: self.src_access_mask,
            dst_access_mask: self.dst_access_mask,
            dependency_flags: self.dependency_flags,
        }
    }
}

/// Full description of a render pass.
#[derive(Debug, Clone, Default)]
pub struct RenderPassOptions {
    pub attachments: Vec<Attachment>,
    pub subpasses: Vec<Subpass>,
    pub dependencies: Vec<SubpassDependency>,
}

impl RenderPassOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// One colour attachment and one subpass writing it.
    pub fn color(format: vk::Format, samples: vk::SampleCountFlags) -> Self {
        Self::new()
            .attachment(Attachment::color(format, samples))
            .subpass(Subpass::new().color(0))
    }

    /// One colour and one depth-stencil attachment in a single subpass.
    pub fn color_depth(
        color: vk::Format,
        depth: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> Self {
        Self::new()
            .attachment(Attachment::color(color, samples))
            .attachment(Attachment::depth_stencil(depth, samples))
            .subpass(Subpass::new().color(0).depth_stencil(1))
    }

    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn subpass(mut self, subpass: Subpass) -> Self {
        self.subpasses.push(subpass);
        self
    }

    pub fn dependency(mut self, dependency: SubpassDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Check that the topology is well formed.
    pub fn validate(&self) -> Result<()> {
        if self.attachments.is_empty() {
            return Err(GpuError::InvalidState(
                "render pass needs at least one attachment".into(),
            ));
        }
        if self.subpasses.is_empty() {
            return Err(GpuError::InvalidState(
                "render pass needs at least one subpass".into(),
            ));
        }

        let count = self.attachments.len() as u32;
        for (i, subpass) in self.subpasses.iter().enumerate() {
            if subpass.resolve_attachments.len() != subpass.color_attachments.len() {
                return Err(GpuError::InvalidState(format!(
                    "subpass {i}: {} resolve slots for {} colour attachments",
                    subpass.resolve_attachments.len(),
                    subpass.color_attachments.len()
                )));
            }
            let indices = subpass
                .color_attachments
                .iter()
                .copied()
                .chain(subpass.resolve_attachments.iter().flatten().copied())
                .chain(subpass.depth_stencil_attachment);
            for index in indices {
                if index >= count {
                    return Err(GpuError::InvalidState(format!(
                        "subpass {i} references attachment {index} of {count}"
                    )));
                }
            }
        }

        let subpasses = self.subpasses.len() as u32;
        for dependency in &self.dependencies {
            for index in [dependency.src_subpass, dependency.dst_subpass] {
                if index != vk::SUBPASS_EXTERNAL && index >= subpasses {
                    return Err(GpuError::InvalidState(format!(
                        "dependency references subpass {index} of {subpasses}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Attachment references for subpass `index`.
    pub fn references(&self, index: usize) -> SubpassReferences {
        let Some(subpass) = self.subpasses.get(index) else {
            return SubpassReferences::default();
        };
        let reference = |attachment: u32| vk::AttachmentReference {
            attachment,
            layout: self.attachments[attachment as usize].reference_layout(),
        };

        let color = subpass.color_attachments.iter().map(|&a| reference(a)).collect();
        let resolve = if subpass.resolve_attachments.iter().all(Option::is_none) {
            Vec::new()
        } else {
            subpass
                .resolve_attachments
                .iter()
                .map(|slot| match slot {
                    Some(attachment) => vk::AttachmentReference {
                        attachment: *attachment,
                        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    },
                    None => vk::AttachmentReference {
                        attachment: vk::ATTACHMENT_UNUSED,
                        layout: vk::ImageLayout::UNDEFINED,
                    },
                })
                .collect()
        };

        SubpassReferences {
            color,
            resolve,
            depth_stencil: subpass.depth_stencil_attachment.map(reference),
        }
    }

    /// Sample count of subpass `index`.
    ///
    /// Uses the first colour attachment, or the depth-stencil attachment when
    /// there is no colour attachment or the colour attachment is single sampled.
    pub fn subpass_sample_count(&self, index: usize) -> Option<vk::SampleCountFlags> {
        let subpass = self.subpasses.get(index)?;
        let samples_of = |attachment: u32| {
            self.attachments
                .get(attachment as usize)
                .map(|a| a.samples)
        };

        let color = subpass.color_attachments.first().and_then(|&a| samples_of(a));
        let depth = subpass.depth_stencil_attachment.and_then(samples_of);
        match (color, depth) {
            (Some(color), Some(depth)) if color == vk::SampleCountFlags::TYPE_1 => Some(depth),
            (Some(color), _) => Some(color),
            (None, Some(depth)) => Some(depth),
            (None, None) => Some(vk::SampleCountFlags::TYPE_1),
        }
    }
}

/// What the rendering context needs to know about a render pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPassInfo {
    pub handle: vk::RenderPass,
    pub subpass_color_attachment_counts: Vec<u32>,
    pub subpass_sample_counts: Vec<vk::SampleCountFlags>,
}

impl RenderPassInfo {
    /// Colour attachments of subpass `index`; 0 when out of range.
    pub fn color_attachment_count(&self, index: u32) -> u32 {
        self.subpass_color_attachment_counts
            .get(index as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Sample count of subpass `index`; one sample when out of range.
    pub fn sample_count(&self, index: u32) -> vk::SampleCountFlags {
        self.subpass_sample_counts
            .get(index as usize)
            .copied()
            .unwrap_or(vk::SampleCountFlags::TYPE_1)
    }

    /// Number of subpasses.
    pub fn subpass_count(&self) -> u32 {
        self.subpass_sample_counts.len() as u32
    }
}

struct Recording {
    command_buffer: CommandBuffer,
    attachments: Vec<Arc<Image>>,
    subpass: u32,
    explicit: bool,
}

/// A render pass with its cached clear values and recording state.
pub struct RenderPass {
    device: Arc<Device>,
    key: TrackedKey,
    info: Arc<RenderPassInfo>,
    options: RenderPassOptions,
    clear_values: Vec<vk::ClearValue>,
    recording: Option<Recording>,
}

impl RenderPass {
    /// Validate `options` and create the native render pass.
    pub fn new(device: &Arc<Device>, options: RenderPassOptions) -> Result<Self> {
        options.validate()?;

        let render_pass = device.driver().create_render_pass(&options)?;
        let key = device.track(TrackedObject::RenderPass(render_pass));

        let subpass_count = options.subpasses.len();
        let info = RenderPassInfo {
            handle: render_pass,
            subpass_color_attachment_counts: options
                .subpasses
                .iter()
                .map(|s| s.color_attachments.len() as u32)
                .collect(),
            subpass_sample_counts: (0..subpass_count)
                .map(|i| {
                    options
                        .subpass_sample_count(i)
                        .unwrap_or(vk::SampleCountFlags::TYPE_1)
                })
                .collect(),
        };
        let clear_values = options.attachments.iter().map(|a| a.clear_value).collect();

        tracing::debug!(
            "Created render pass {render_pass:?}: {} attachments, {subpass_count} subpasses",
            options.attachments.len()
        );

        Ok(Self {
            device: device.clone(),
            key,
            info: Arc::new(info),
            options,
            clear_values,
            recording: None,
        })
    }

    /// Native handle.
    pub fn handle(&self) -> vk::RenderPass {
        self.info.handle
    }

    pub fn info(&self) -> &Arc<RenderPassInfo> {
        &self.info
    }

    pub fn options(&self) -> &RenderPassOptions {
        &self.options
    }

    pub fn attachment_count(&self) -> usize {
        self.options.attachments.len()
    }

    pub fn subpass_count(&self) -> u32 {
        self.info.subpass_count()
    }

    /// Sample count computed for subpass `index` at construction.
    pub fn subpass_sample_count(&self, index: u32) -> Option<vk::SampleCountFlags> {
        self.info.subpass_sample_counts.get(index as usize).copied()
    }

    /// Colour attachments of subpass `index`; 0 when out of range.
    pub fn subpass_color_attachment_count(&self, index: u32) -> u32 {
        self.info.color_attachment_count(index)
    }

    /// Replace the clear value used for attachment `index`.
    pub fn set_attachment_clear_value(&mut self, index: usize, value: vk::ClearValue) -> Result<()> {
        let count = self.clear_values.len();
        let slot = self.clear_values.get_mut(index).ok_or_else(|| {
            GpuError::InvalidState(format!("attachment {index} out of range ({count})"))
        })?;
        *slot = value;
        Ok(())
    }

    /// Whether the pass is between begin and end.
    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Index of the subpass being recorded.
    pub fn current_subpass(&self) -> Option<u32> {
        self.recording.as_ref().map(|r| r.subpass)
    }

    /// Begin `command_buffer`, then begin the pass. [`RenderPass::end_render`]
    /// submits the work and waits for it.
    pub fn begin_render(
        &mut self,
        ctx: &mut Context,
        command_buffer: &CommandBuffer,
        framebuffer: &Framebuffer,
    ) -> Result<()> {
        self.begin(ctx, command_buffer, framebuffer, false)
    }

    /// Begin the pass in a command buffer the caller is already recording.
    pub fn begin_render_explicit(
        &mut self,
        ctx: &mut Context,
        command_buffer: &CommandBuffer,
        framebuffer: &Framebuffer,
    ) -> Result<()> {
        self.begin(ctx, command_buffer, framebuffer, true)
    }

    /// End the pass, submit the command buffer and block until it completes.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn end_render(&mut self, ctx: &mut Context) -> Result<()> {
        let command_buffer = self.end(ctx, false)?;
        command_buffer.end()?;
        self.device.submit_and_wait(&[command_buffer.handle()])
    }

    /// End the pass; the caller ends and submits the command buffer.
    pub fn end_render_explicit(&mut self, ctx: &mut Context) -> Result<()> {
        self.end(ctx, true).map(|_| ())
    }

    /// Advance to the next subpass.
    pub fn next_subpass(&mut self, ctx: &mut Context) -> Result<()> {
        let subpass_count = self.info.subpass_count();
        let recording = self
            .recording
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("next_subpass outside a render pass".into()))?;
        if recording.subpass + 1 >= subpass_count {
            return Err(GpuError::InvalidState(format!(
                "render pass has no subpass after {}",
                recording.subpass
            )));
        }

        recording.subpass += 1;
        recording.command_buffer.next_subpass();
        ctx.set_subpass(recording.subpass);
        Ok(())
    }

    fn begin(
        &mut self,
        ctx: &mut Context,
        command_buffer: &CommandBuffer,
        framebuffer: &Framebuffer,
        explicit: bool,
    ) -> Result<()> {
        if self.recording.is_some() {
            return Err(GpuError::InvalidState(
                "render pass is already recording".into(),
            ));
        }
        let images = framebuffer.attachment_images();
        if images.len() != self.options.attachments.len() {
            return Err(GpuError::InvalidState(format!(
                "framebuffer has {} attachments, render pass expects {}",
                images.len(),
                self.options.attachments.len()
            )));
        }

        if !explicit {
            command_buffer.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        }

        let barriers: smallvec::SmallVec<[_; 4]> = images
            .iter()
            .zip(&self.options.attachments)
            .map(|(image, attachment)| image.transition_to(attachment.begin_layout()))
            .collect();
        command_buffer.image_barriers(&barriers);

        let extent = framebuffer.extent();
        command_buffer.begin_render_pass(
            self.info.handle,
            framebuffer.handle(),
            extent,
            &self.clear_values,
        );

        let viewport = Viewport::from_extent(extent);
        let scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        command_buffer.set_viewport_raw(viewport.to_vk());
        command_buffer.set_scissor_rect(scissor);

        ctx.push_render_pass(self.info.clone());
        ctx.push_subpass(0);
        ctx.push_command_buffer(command_buffer.clone());
        ctx.viewport.push(viewport);
        ctx.scissor.push(scissor);

        self.recording = Some(Recording {
            command_buffer: command_buffer.clone(),
            attachments: images,
            subpass: 0,
            explicit,
        });
        Ok(())
    }

    fn end(&mut self, ctx: &mut Context, explicit: bool) -> Result<CommandBuffer> {
        let recording = match self.recording.take() {
            None => {
                return Err(GpuError::InvalidState(
                    "end_render without begin_render".into(),
                ))
            }
            Some(recording) if recording.explicit != explicit => {
                self.recording = Some(recording);
                return Err(GpuError::InvalidState(
                    "render pass begun and ended in different modes".into(),
                ));
            }
            Some(recording) => recording,
        };

        let command_buffer = recording.command_buffer;
        command_buffer.end_render_pass();

        let barriers: smallvec::SmallVec<[_; 4]> = recording
            .attachments
            .iter()
            .zip(&self.options.attachments)
            .map(|(image, attachment)| {
                if attachment.final_layout != vk::ImageLayout::UNDEFINED {
                    image.set_current_layout(attachment.final_layout);
                }
                image.transition_to(image.steady_layout())
            })
            .collect();
        command_buffer.image_barriers(&barriers);

        ctx.scissor.pop();
        ctx.viewport.pop();
        ctx.pop_command_buffer();
        ctx.pop_subpass();
        ctx.pop_render_pass();

        Ok(command_buffer)
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.device.release(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandPool;
    use crate::device::DeviceConfig;
    use crate::framebuffer::FramebufferFormat;
    use crate::headless::{headless_device, HeadlessConfig, HeadlessObject, RecordedCommand};
    use crate::image::ImageFormat;

    const COLOR: vk::Format = vk::Format::R8G8B8A8_UNORM;
    const DEPTH: vk::Format = vk::Format::D24_UNORM_S8_UINT;

    fn extent() -> vk::Extent2D {
        vk::Extent2D {
            width: 320,
            height: 240,
        }
    }

    fn offscreen_format() -> FramebufferFormat {
        FramebufferFormat::new()
            .allocate(ImageFormat::color_attachment(COLOR))
            .allocate(ImageFormat::depth_stencil_attachment(DEPTH))
    }

    #[test]
    fn color_depth_pass_has_one_color_attachment() {
        let (device, _driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();

        let pass = RenderPass::new(
            &device,
            RenderPassOptions::color_depth(COLOR, DEPTH, vk::SampleCountFlags::TYPE_1),
        )
        .unwrap();

        assert_eq!(pass.subpass_color_attachment_count(0), 1);
        assert_eq!(pass.subpass_color_attachment_count(5), 0);
    }

    #[test]
    fn sample_count_comes_from_first_color_or_depth() {
        let options = RenderPassOptions::new()
            .attachment(Attachment::color(COLOR, vk::SampleCountFlags::TYPE_4))
            .attachment(Attachment::depth_stencil(DEPTH, vk::SampleCountFlags::TYPE_2))
            .subpass(Subpass::new().color(0).depth_stencil(1))
            .subpass(Subpass::new().depth_stencil(1));

        assert_eq!(
            options.subpass_sample_count(0),
            Some(vk::SampleCountFlags::TYPE_4)
        );
        assert_eq!(
            options.subpass_sample_count(1),
            Some(vk::SampleCountFlags::TYPE_2)
        );
        assert_eq!(options.subpass_sample_count(2), None);
    }

    #[test]
    fn references_use_attachment_layouts() {
        let options = RenderPassOptions::new()
            .attachment(Attachment::color(COLOR, vk::SampleCountFlags::TYPE_4))
            .attachment(
                Attachment::color(COLOR, vk::SampleCountFlags::TYPE_1)
                    .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
            )
            .attachment(Attachment::depth_stencil(DEPTH, vk::SampleCountFlags::TYPE_4))
            .subpass(Subpass::new().color_resolve(0, 1).depth_stencil(2));

        let refs = options.references(0);

        assert_eq!(refs.color[0].layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(refs.resolve.len(), 1);
        assert_eq!(refs.resolve[0].attachment, 1);
        assert_eq!(
            refs.depth_stencil.map(|r| r.layout),
            Some(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        );

        let plain = RenderPassOptions::color(COLOR, vk::SampleCountFlags::TYPE_1);
        assert!(plain.references(0).resolve.is_empty());
    }

    #[test]
    fn invalid_topologies_are_rejected() {
        assert!(RenderPassOptions::new().validate().is_err());
        assert!(RenderPassOptions::new()
            .attachment(Attachment::new(COLOR))
            .validate()
            .is_err());
        assert!(RenderPassOptions::new()
            .attachment(Attachment::new(COLOR))
            .subpass(Subpass::new().color(3))
            .validate()
            .is_err());

        let mut mismatched = Subpass::new().color(0);
        mismatched.resolve_attachments.clear();
        assert!(RenderPassOptions::new()
            .attachment(Attachment::new(COLOR))
            .subpass(mismatched)
            .validate()
            .is_err());

        assert!(RenderPassOptions::color(COLOR, vk::SampleCountFlags::TYPE_1)
            .dependency(SubpassDependency::new(vk::SUBPASS_EXTERNAL, 0))
            .validate()
            .is_ok());
    }

    #[test]
    fn explicit_recording_transitions_attachments() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let mut ctx = Context::new(device.clone());
        let pool = CommandPool::new(&device).unwrap();
        let cmd = pool.allocate().unwrap();

        let mut pass = RenderPass::new(
            &device,
            RenderPassOptions::color_depth(COLOR, DEPTH, vk::SampleCountFlags::TYPE_1),
        )
        .unwrap();
        let framebuffer = Framebuffer::new(&device, &pass, extent(), &offscreen_format()).unwrap();
        let color = framebuffer.attachment_images()[0].clone();

        pass.begin_render_explicit(&mut ctx, &cmd, &framebuffer).unwrap();
        assert!(pass.is_recording());
        assert_eq!(ctx.current_render_pass().map(|i| i.handle), Some(pass.handle()));
        assert_eq!(color.current_layout(), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        pass.end_render_explicit(&mut ctx).unwrap();
        assert!(!pass.is_recording());
        assert!(ctx.current_render_pass().is_none());
        assert!(ctx.current_command_buffer().is_none());

        let commands = driver.take_commands();
        assert!(matches!(
            commands.iter().find(|c| matches!(c, RecordedCommand::BeginRenderPass { .. })),
            Some(RecordedCommand::BeginRenderPass {
                width: 320,
                height: 240,
                clear_value_count: 2,
                ..
            })
        ));
        assert_eq!(commands.last(), Some(&RecordedCommand::EndRenderPass));
        assert_eq!(driver.submission_count(), 0);
    }

    #[test]
    fn implicit_recording_submits_and_waits() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let mut ctx = Context::new(device.clone());
        let pool = CommandPool::new(&device).unwrap();
        let cmd = pool.allocate().unwrap();
        let mut pass = RenderPass::new(
            &device,
            RenderPassOptions::color(COLOR, vk::SampleCountFlags::TYPE_1),
        )
        .unwrap();
        let framebuffer = Framebuffer::new(
            &device,
            &pass,
            extent(),
            &FramebufferFormat::new().allocate(ImageFormat::color_attachment(COLOR)),
        )
        .unwrap();

        pass.begin_render(&mut ctx, &cmd, &framebuffer).unwrap();
        pass.end_render(&mut ctx).unwrap();

        let commands = driver.take_commands();
        assert_eq!(commands.first(), Some(&RecordedCommand::Begin(cmd.handle())));
        assert_eq!(commands.last(), Some(&RecordedCommand::End(cmd.handle())));
        assert_eq!(driver.submission_count(), 1);
        assert_eq!(driver.fence_wait_count(), 1);
    }

    #[test]
    fn state_machine_misuse_is_an_error() {
        let (device, _driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let mut ctx = Context::new(device.clone());
        let pool = CommandPool::new(&device).unwrap();
        let cmd = pool.allocate().unwrap();
        let mut pass = RenderPass::new(
            &device,
            RenderPassOptions::color_depth(COLOR, DEPTH, vk::SampleCountFlags::TYPE_1),
        )
        .unwrap();
        let framebuffer = Framebuffer::new(&device, &pass, extent(), &offscreen_format()).unwrap();

        assert!(matches!(
            pass.end_render_explicit(&mut ctx),
            Err(GpuError::InvalidState(_))
        ));
        assert!(pass.next_subpass(&mut ctx).is_err());

        pass.begin_render_explicit(&mut ctx, &cmd, &framebuffer).unwrap();
        assert!(pass.begin_render_explicit(&mut ctx, &cmd, &framebuffer).is_err());
        // Single subpass: there is nothing to advance to.
        assert!(pass.next_subpass(&mut ctx).is_err());
        assert!(pass.end_render(&mut ctx).is_err());
        pass.end_render_explicit(&mut ctx).unwrap();
    }

    #[test]
    fn next_subpass_updates_context() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let mut ctx = Context::new(device.clone());
        let pool = CommandPool::new(&device).unwrap();
        let cmd = pool.allocate().unwrap();
        let options = RenderPassOptions::new()
            .attachment(Attachment::color(COLOR, vk::SampleCountFlags::TYPE_1))
            .attachment(Attachment::color(COLOR, vk::SampleCountFlags::TYPE_1))
            .subpass(Subpass::new().color(0))
            .subpass(Subpass::new().color(0).color(1))
            .dependency(SubpassDependency::new(0, 1));
        let mut pass = RenderPass::new(&device, options).unwrap();
        let framebuffer = Framebuffer::new(
            &device,
            &pass,
            extent(),
            &FramebufferFormat::new()
                .allocate(ImageFormat::color_attachment(COLOR))
                .allocate(ImageFormat::color_attachment(COLOR)),
        )
        .unwrap();

        pass.begin_render_explicit(&mut ctx, &cmd, &framebuffer).unwrap();
        assert_eq!(ctx.color_blend_attachments().len(), 1);

        pass.next_subpass(&mut ctx).unwrap();
        assert_eq!(pass.current_subpass(), Some(1));
        assert_eq!(ctx.current_subpass(), 1);
        assert_eq!(ctx.color_blend_attachments().len(), 2);
        pass.end_render_explicit(&mut ctx).unwrap();

        assert!(driver.take_commands().contains(&RecordedCommand::NextSubpass));
    }

    #[test]
    fn clear_value_index_is_checked() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let mut pass = RenderPass::new(
            &device,
            RenderPassOptions::color(COLOR, vk::SampleCountFlags::TYPE_1),
        )
        .unwrap();

        assert!(pass
            .set_attachment_clear_value(0, vk::ClearValue::default())
            .is_ok());
        assert!(pass
            .set_attachment_clear_value(1, vk::ClearValue::default())
            .is_err());

        drop(pass);
        assert_eq!(driver.live_count(HeadlessObject::RenderPass), 0);
    }
}
