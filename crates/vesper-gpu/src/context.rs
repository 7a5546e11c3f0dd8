//! Per-thread rendering context.
//!
//! A [`Context`] carries the current render pass, subpass and command buffer
//! plus stacks of ambient fixed-function state. It is passed explicitly to
//! every call that records; nothing is looked up implicitly. A context is not
//! shared between threads.

use crate::command::CommandBuffer;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::pipeline::{ColorBlendAttachment, ShaderStage, VertexAttribute, VertexBinding};
use crate::render_pass::RenderPassInfo;
use ash::vk;
use std::sync::Arc;

/// A stack of values with a fallback when empty.
#[derive(Debug, Clone)]
pub struct StateStack<T> {
    stack: Vec<T>,
    default: T,
}

impl<T: Clone + PartialEq> StateStack<T> {
    pub fn new(default: T) -> Self {
        Self {
            stack: Vec::new(),
            default,
        }
    }

    /// Push a value. Returns whether the current value changed.
    pub fn push(&mut self, value: T) -> bool {
        let changed = *self.get() != value;
        self.stack.push(value);
        changed
    }

    /// Pop the top value.
    pub fn pop(&mut self) -> Option<T> {
        self.stack.pop()
    }

    /// Replace the top value, or push if the stack is empty.
    pub fn set(&mut self, value: T) {
        match self.stack.last_mut() {
            Some(top) => *top = value,
            None => self.stack.push(value),
        }
    }

    /// Current value.
    pub fn get(&self) -> &T {
        self.stack.last().unwrap_or(&self.default)
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

/// A viewport rectangle with depth range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Viewport covering `extent` with depth range 0..1.
    pub fn from_extent(extent: vk::Extent2D) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    pub fn to_vk(&self) -> vk::Viewport {
        vk::Viewport {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            min_depth: self.min_depth,
            max_depth: self.max_depth,
        }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::from_extent(vk::Extent2D::default())
    }
}

/// Depth-bias parameters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DepthBias {
    pub enable: bool,
    pub slope_factor: f32,
    pub constant_factor: f32,
    pub clamp: f32,
}

/// Blend factors with separate colour and alpha terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendFunction {
    pub src_color: vk::BlendFactor,
    pub dst_color: vk::BlendFactor,
    pub src_alpha: vk::BlendFactor,
    pub dst_alpha: vk::BlendFactor,
}

impl BlendFunction {
    /// Same factors for colour and alpha.
    pub fn new(src: vk::BlendFactor, dst: vk::BlendFactor) -> Self {
        Self {
            src_color: src,
            dst_color: dst,
            src_alpha: src,
            dst_alpha: dst,
        }
    }

    /// Premultiplied-style alpha blending.
    pub fn alpha() -> Self {
        Self::new(vk::BlendFactor::SRC_ALPHA, vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
    }
}

impl Default for BlendFunction {
    fn default() -> Self {
        Self::new(vk::BlendFactor::ZERO, vk::BlendFactor::ZERO)
    }
}

/// Per-draw inputs to pipeline selection.
#[derive(Debug, Clone, Copy)]
pub struct DrawState<'a> {
    pub topology: vk::PrimitiveTopology,
    pub vertex_bindings: &'a [VertexBinding],
    pub vertex_attributes: &'a [VertexAttribute],
    pub shader_stages: &'a [ShaderStage],
    pub pipeline_layout: vk::PipelineLayout,
}

/// Rendering context for one thread.
pub struct Context {
    device: Arc<Device>,
    render_passes: Vec<Arc<RenderPassInfo>>,
    subpasses: Vec<u32>,
    command_buffers: Vec<CommandBuffer>,

    pub cull_mode: StateStack<vk::CullModeFlags>,
    pub front_face: StateStack<vk::FrontFace>,
    pub depth_bias: StateStack<DepthBias>,
    pub depth_test: StateStack<bool>,
    pub depth_write: StateStack<bool>,
    pub blend: StateStack<bool>,
    pub blend_function: StateStack<BlendFunction>,
    pub viewport: StateStack<Viewport>,
    pub scissor: StateStack<vk::Rect2D>,
    pub line_width: StateStack<f32>,
}

impl Context {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            render_passes: Vec::new(),
            subpasses: Vec::new(),
            command_buffers: Vec::new(),
            cull_mode: StateStack::new(vk::CullModeFlags::NONE),
            front_face: StateStack::new(vk::FrontFace::COUNTER_CLOCKWISE),
            depth_bias: StateStack::new(DepthBias::default()),
            depth_test: StateStack::new(true),
            depth_write: StateStack::new(true),
            blend: StateStack::new(false),
            blend_function: StateStack::new(BlendFunction::default()),
            viewport: StateStack::new(Viewport::default()),
            scissor: StateStack::new(vk::Rect2D::default()),
            line_width: StateStack::new(1.0),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn push_render_pass(&mut self, render_pass: Arc<RenderPassInfo>) {
        self.render_passes.push(render_pass);
    }

    pub fn pop_render_pass(&mut self) -> Option<Arc<RenderPassInfo>> {
        self.render_passes.pop()
    }

    pub fn current_render_pass(&self) -> Option<&Arc<RenderPassInfo>> {
        self.render_passes.last()
    }

    pub fn push_subpass(&mut self, subpass: u32) {
        self.subpasses.push(subpass);
    }

    pub fn pop_subpass(&mut self) -> Option<u32> {
        self.subpasses.pop()
    }

    /// Replace the current subpass index.
    pub fn set_subpass(&mut self, subpass: u32) {
        match self.subpasses.last_mut() {
            Some(top) => *top = subpass,
            None => self.subpasses.push(subpass),
        }
    }

    /// Current subpass index; 0 outside a render pass.
    pub fn current_subpass(&self) -> u32 {
        self.subpasses.last().copied().unwrap_or(0)
    }

    pub fn push_command_buffer(&mut self, command_buffer: CommandBuffer) {
        self.command_buffers.push(command_buffer);
    }

    pub fn pop_command_buffer(&mut self) -> Option<CommandBuffer> {
        self.command_buffers.pop()
    }

    pub fn current_command_buffer(&self) -> Option<&CommandBuffer> {
        self.command_buffers.last()
    }

    /// Blend state for each colour attachment of the current subpass.
    pub fn color_blend_attachments(&self) -> Vec<ColorBlendAttachment> {
        let count = self
            .current_render_pass()
            .map_or(1, |info| info.color_attachment_count(self.current_subpass()));
        let function = *self.blend_function.get();
        let attachment = ColorBlendAttachment {
            blend_enable: *self.blend.get(),
            src_color_blend_factor: function.src_color,
            dst_color_blend_factor: function.dst_color,
            src_alpha_blend_factor: function.src_alpha,
            dst_alpha_blend_factor: function.dst_alpha,
            ..ColorBlendAttachment::default()
        };
        vec![attachment; count as usize]
    }

    /// Select the pipeline for `draw` under the current state. When a command
    /// buffer is current the pipeline is bound and the dynamic viewport and
    /// scissor are set.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn select_pipeline(&self, draw: &DrawState<'_>) -> Result<vk::Pipeline> {
        let info = self.current_render_pass().ok_or_else(|| {
            GpuError::InvalidState("pipeline selection outside a render pass".into())
        })?;
        let subpass = self.current_subpass();
        let bias = *self.depth_bias.get();

        let pipeline = {
            let mut selector = self.device.pipeline_selector();
            selector.set_render_pass(info.handle);
            selector.set_subpass(subpass);
            selector.set_pipeline_layout(draw.pipeline_layout);
            selector.set_vertex_input_binding_descriptions(draw.vertex_bindings);
            selector.set_vertex_input_attribute_descriptions(draw.vertex_attributes);
            selector.set_topology(draw.topology);
            selector.set_cull_mode(*self.cull_mode.get());
            selector.set_front_face(*self.front_face.get());
            selector.set_depth_bias(
                bias.enable,
                bias.slope_factor,
                bias.constant_factor,
                bias.clamp,
            );
            selector.set_line_width(*self.line_width.get());
            selector.set_rasterization_samples(info.sample_count(subpass));
            selector.set_depth_test(*self.depth_test.get());
            selector.set_depth_write(*self.depth_write.get());
            selector.set_color_blend_attachments(&self.color_blend_attachments());
            selector.set_shader_stages(draw.shader_stages);
            selector.get_selected_pipeline()?
        };

        if let Some(command_buffer) = self.current_command_buffer() {
            command_buffer.bind_pipeline(pipeline);
            command_buffer.set_viewport_raw(self.viewport.get().to_vk());
            command_buffer.set_scissor_rect(*self.scissor.get());
        }
        Ok(pipeline)
    }
}
