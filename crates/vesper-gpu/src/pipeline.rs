//! Graphics pipeline state and the content-addressed pipeline cache.
//!
//! [`PipelineSelector`] holds the desired pipeline state as a set of
//! independently hashed fields. Setters only touch a field when its value
//! actually changes, so re-asserting the same state every frame costs one
//! comparison. [`PipelineSelector::get_selected_pipeline`] combines the field
//! hashes into a [`CompositeHash`] and returns a cached pipeline whose full
//! state equals the current one, creating it on a miss.

use crate::driver::Driver;
use crate::error::Result;
use crate::memo::{CompositeHash, Memoized};
use ash::vk;
use hashbrown::HashMap;
use std::ffi::{CStr, CString};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Implements `PartialEq`, `Eq` and `Hash` through a `key()` method, so
/// structs holding floats compare and hash by bit pattern.
macro_rules! impl_eq_hash_by_key {
    ($ty:ty) => {
        impl PartialEq for $ty {
            fn eq(&self, other: &Self) -> bool {
                self.key() == other.key()
            }
        }

        impl Eq for $ty {}

        impl Hash for $ty {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.key().hash(state);
            }
        }
    };
}

/// Render pass, subpass and layout a pipeline is built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PipelineParameters {
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub layout: vk::PipelineLayout,
}

/// A vertex buffer binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
}

impl VertexBinding {
    /// Per-vertex binding.
    pub const fn per_vertex(binding: u32, stride: u32) -> Self {
        Self {
            binding,
            stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Per-instance binding.
    pub const fn per_instance(binding: u32, stride: u32) -> Self {
        Self {
            binding,
            stride,
            input_rate: vk::VertexInputRate::INSTANCE,
        }
    }

    pub fn to_vk(&self) -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: self.binding,
            stride: self.stride,
            input_rate: self.input_rate,
        }
    }
}

/// A vertex attribute read from a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

impl VertexAttribute {
    pub const fn new(location: u32, binding: u32, format: vk::Format, offset: u32) -> Self {
        Self {
            location,
            binding,
            format,
            offset,
        }
    }

    pub fn to_vk(&self) -> vk::VertexInputAttributeDescription {
        vk::VertexInputAttributeDescription {
            location: self.location,
            binding: self.binding,
            format: self.format,
            offset: self.offset,
        }
    }
}

/// Blend configuration of one colour attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorBlendAttachment {
    pub blend_enable: bool,
    pub src_color_blend_factor: vk::BlendFactor,
    pub dst_color_blend_factor: vk::BlendFactor,
    pub color_blend_op: vk::BlendOp,
    pub src_alpha_blend_factor: vk::BlendFactor,
    pub dst_alpha_blend_factor: vk::BlendFactor,
    pub alpha_blend_op: vk::BlendOp,
    pub color_write_mask: vk::ColorComponentFlags,
}

impl Default for ColorBlendAttachment {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color_blend_factor: vk::BlendFactor::ZERO,
            dst_color_blend_factor: vk::BlendFactor::ZERO,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ZERO,
            dst_alpha_blend_factor: vk::BlendFactor::ZERO,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }
    }
}

impl ColorBlendAttachment {
    /// Standard alpha blending.
    pub fn alpha_blend() -> Self {
        Self {
            blend_enable: true,
            src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            ..Self::default()
        }
    }

    pub fn to_vk(&self) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState {
            blend_enable: self.blend_enable.into(),
            src_color_blend_factor: self.src_color_blend_factor,
            dst_color_blend_factor: self.dst_color_blend_factor,
            color_blend_op: self.color_blend_op,
            src_alpha_blend_factor: self.src_alpha_blend_factor,
            dst_alpha_blend_factor: self.dst_alpha_blend_factor,
            alpha_blend_op: self.alpha_blend_op,
            color_write_mask: self.color_write_mask,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputAssemblyState {
    pub topology: vk::PrimitiveTopology,
    pub primitive_restart_enable: bool,
}

impl Default for InputAssemblyState {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart_enable: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RasterizationState {
    pub depth_clamp_enable: bool,
    pub rasterizer_discard_enable: bool,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_bias_enable: bool,
    pub depth_bias_constant_factor: f32,
    pub depth_bias_clamp: f32,
    pub depth_bias_slope_factor: f32,
    pub line_width: f32,
}

impl RasterizationState {
    #[allow(clippy::type_complexity)]
    fn key(&self) -> ((bool, bool, vk::PolygonMode, vk::CullModeFlags, vk::FrontFace, bool), [u32; 4]) {
        (
            (
                self.depth_clamp_enable,
                self.rasterizer_discard_enable,
                self.polygon_mode,
                self.cull_mode,
                self.front_face,
                self.depth_bias_enable,
            ),
            [
                self.depth_bias_constant_factor.to_bits(),
                self.depth_bias_clamp.to_bits(),
                self.depth_bias_slope_factor.to_bits(),
                self.line_width.to_bits(),
            ],
        )
    }
}

impl_eq_hash_by_key!(RasterizationState);

impl Default for RasterizationState {
    fn default() -> Self {
        Self {
            depth_clamp_enable: false,
            rasterizer_discard_enable: false,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_bias_enable: false,
            depth_bias_constant_factor: 0.0,
            depth_bias_clamp: 0.0,
            depth_bias_slope_factor: 0.0,
            line_width: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MultisampleState {
    pub rasterization_samples: vk::SampleCountFlags,
    pub sample_shading_enable: bool,
    pub min_sample_shading: f32,
    pub alpha_to_coverage_enable: bool,
    pub alpha_to_one_enable: bool,
}

impl MultisampleState {
    fn key(&self) -> (vk::SampleCountFlags, bool, u32, bool, bool) {
        (
            self.rasterization_samples,
            self.sample_shading_enable,
            self.min_sample_shading.to_bits(),
            self.alpha_to_coverage_enable,
            self.alpha_to_one_enable,
        )
    }
}

impl_eq_hash_by_key!(MultisampleState);

impl Default for MultisampleState {
    fn default() -> Self {
        Self {
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            sample_shading_enable: false,
            min_sample_shading: 0.0,
            alpha_to_coverage_enable: false,
            alpha_to_one_enable: false,
        }
    }
}

/// Stencil operations of one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilFace {
    pub fail_op: vk::StencilOp,
    pub pass_op: vk::StencilOp,
    pub depth_fail_op: vk::StencilOp,
    pub compare_op: vk::CompareOp,
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
}

impl Default for StencilFace {
    fn default() -> Self {
        Self {
            fail_op: vk::StencilOp::KEEP,
            pass_op: vk::StencilOp::KEEP,
            depth_fail_op: vk::StencilOp::KEEP,
            compare_op: vk::CompareOp::ALWAYS,
            compare_mask: 0,
            write_mask: 0,
            reference: 0,
        }
    }
}

impl StencilFace {
    pub fn to_vk(&self) -> vk::StencilOpState {
        vk::StencilOpState {
            fail_op: self.fail_op,
            pass_op: self.pass_op,
            depth_fail_op: self.depth_fail_op,
            compare_op: self.compare_op,
            compare_mask: self.compare_mask,
            write_mask: self.write_mask,
            reference: self.reference,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DepthStencilState {
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: vk::CompareOp,
    pub depth_bounds_test_enable: bool,
    pub stencil_test_enable: bool,
    pub front: StencilFace,
    pub back: StencilFace,
    pub min_depth_bounds: f32,
    pub max_depth_bounds: f32,
}

impl DepthStencilState {
    #[allow(clippy::type_complexity)]
    fn key(&self) -> ((bool, bool, vk::CompareOp, bool, bool), StencilFace, StencilFace, [u32; 2]) {
        (
            (
                self.depth_test_enable,
                self.depth_write_enable,
                self.depth_compare_op,
                self.depth_bounds_test_enable,
                self.stencil_test_enable,
            ),
            self.front,
            self.back,
            [self.min_depth_bounds.to_bits(), self.max_depth_bounds.to_bits()],
        )
    }
}

impl_eq_hash_by_key!(DepthStencilState);

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test_enable: true,
            depth_write_enable: true,
            depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
            depth_bounds_test_enable: false,
            stencil_test_enable: false,
            front: StencilFace::default(),
            back: StencilFace::default(),
            min_depth_bounds: 0.0,
            max_depth_bounds: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColorBlendState {
    pub logic_op_enable: bool,
    pub logic_op: vk::LogicOp,
    pub blend_constants: [f32; 4],
}

impl ColorBlendState {
    fn key(&self) -> (bool, vk::LogicOp, [u32; 4]) {
        (
            self.logic_op_enable,
            self.logic_op,
            self.blend_constants.map(f32::to_bits),
        )
    }
}

impl_eq_hash_by_key!(ColorBlendState);

impl Default for ColorBlendState {
    fn default() -> Self {
        Self {
            logic_op_enable: false,
            logic_op: vk::LogicOp::CLEAR,
            blend_constants: [1.0; 4],
        }
    }
}

/// All fixed-function state of a graphics pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FixedFunctionState {
    pub input_assembly: InputAssemblyState,
    pub rasterization: RasterizationState,
    pub multisample: MultisampleState,
    pub depth_stencil: DepthStencilState,
    pub color_blend: ColorBlendState,
}

/// A compiled shader module bound to a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry_point: CString,
}

impl ShaderStage {
    pub fn new(stage: vk::ShaderStageFlags, module: vk::ShaderModule, entry_point: &CStr) -> Self {
        Self {
            stage,
            module,
            entry_point: entry_point.to_owned(),
        }
    }

    /// Stage with the conventional `main` entry point.
    pub fn main(stage: vk::ShaderStageFlags, module: vk::ShaderModule) -> Self {
        Self::new(stage, module, c"main")
    }
}

/// Complete description of a graphics pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineState {
    pub parameters: PipelineParameters,
    pub vertex_bindings: Vec<VertexBinding>,
    pub vertex_attributes: Vec<VertexAttribute>,
    pub fixed: FixedFunctionState,
    pub shader_stages: Vec<ShaderStage>,
    pub dynamic_states: Vec<vk::DynamicState>,
    pub color_blend_attachments: Vec<ColorBlendAttachment>,
}

impl Default for GraphicsPipelineState {
    fn default() -> Self {
        Self {
            parameters: PipelineParameters::default(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            fixed: FixedFunctionState::default(),
            shader_stages: Vec::new(),
            dynamic_states: vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
            color_blend_attachments: vec![ColorBlendAttachment::default()],
        }
    }
}

struct CachedPipeline {
    state: GraphicsPipelineState,
    pipeline: vk::Pipeline,
}

/// Builds graphics pipelines on demand and caches them by content.
pub struct PipelineSelector {
    driver: Arc<dyn Driver>,
    parameters: Memoized<PipelineParameters>,
    vertex_bindings: Memoized<Vec<VertexBinding>>,
    vertex_attributes: Memoized<Vec<VertexAttribute>>,
    fixed: Memoized<FixedFunctionState>,
    shader_stages: Memoized<Vec<ShaderStage>>,
    dynamic_states: Memoized<Vec<vk::DynamicState>>,
    color_blend_attachments: Memoized<Vec<ColorBlendAttachment>>,
    pipelines: HashMap<CompositeHash, Vec<CachedPipeline>>,
    pipeline_count: usize,
}

impl PipelineSelector {
    /// Create a selector holding the default state.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        let defaults = GraphicsPipelineState::default();
        Self {
            driver,
            parameters: Memoized::new(defaults.parameters),
            vertex_bindings: Memoized::new(defaults.vertex_bindings),
            vertex_attributes: Memoized::new(defaults.vertex_attributes),
            fixed: Memoized::new(defaults.fixed),
            shader_stages: Memoized::new(defaults.shader_stages),
            dynamic_states: Memoized::new(defaults.dynamic_states),
            color_blend_attachments: Memoized::new(defaults.color_blend_attachments),
            pipelines: HashMap::new(),
            pipeline_count: 0,
        }
    }

    pub fn set_render_pass(&mut self, render_pass: vk::RenderPass) {
        self.update_parameters(|p| p.render_pass = render_pass);
    }

    pub fn set_subpass(&mut self, subpass: u32) {
        self.update_parameters(|p| p.subpass = subpass);
    }

    pub fn set_pipeline_layout(&mut self, layout: vk::PipelineLayout) {
        self.update_parameters(|p| p.layout = layout);
    }

    pub fn set_vertex_input_binding_descriptions(&mut self, bindings: &[VertexBinding]) {
        if self.vertex_bindings.get().as_slice() != bindings {
            self.vertex_bindings.set(bindings.to_vec());
        }
    }

    pub fn set_vertex_input_attribute_descriptions(&mut self, attributes: &[VertexAttribute]) {
        if self.vertex_attributes.get().as_slice() != attributes {
            self.vertex_attributes.set(attributes.to_vec());
        }
    }

    pub fn set_topology(&mut self, topology: vk::PrimitiveTopology) {
        self.update_fixed(|f| f.input_assembly.topology = topology);
    }

    pub fn set_polygon_mode(&mut self, mode: vk::PolygonMode) {
        self.update_fixed(|f| f.rasterization.polygon_mode = mode);
    }

    pub fn set_cull_mode(&mut self, mode: vk::CullModeFlags) {
        self.update_fixed(|f| f.rasterization.cull_mode = mode);
    }

    pub fn set_front_face(&mut self, front_face: vk::FrontFace) {
        self.update_fixed(|f| f.rasterization.front_face = front_face);
    }

    /// Set all depth-bias parameters at once.
    pub fn set_depth_bias(&mut self, enable: bool, slope_factor: f32, constant_factor: f32, clamp: f32) {
        self.update_fixed(|f| {
            let r = &mut f.rasterization;
            r.depth_bias_enable = enable;
            r.depth_bias_slope_factor = slope_factor;
            r.depth_bias_constant_factor = constant_factor;
            r.depth_bias_clamp = clamp;
        });
    }

    pub fn set_line_width(&mut self, line_width: f32) {
        self.update_fixed(|f| f.rasterization.line_width = line_width);
    }

    pub fn set_rasterization_samples(&mut self, samples: vk::SampleCountFlags) {
        self.update_fixed(|f| f.multisample.rasterization_samples = samples);
    }

    pub fn set_depth_test(&mut self, enable: bool) {
        self.update_fixed(|f| f.depth_stencil.depth_test_enable = enable);
    }

    pub fn set_depth_write(&mut self, enable: bool) {
        self.update_fixed(|f| f.depth_stencil.depth_write_enable = enable);
    }

    pub fn set_depth_compare_op(&mut self, op: vk::CompareOp) {
        self.update_fixed(|f| f.depth_stencil.depth_compare_op = op);
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        self.update_fixed(|f| f.color_blend.blend_constants = constants);
    }

    /// Replace the whole fixed-function state.
    pub fn set_fixed_function_state(&mut self, state: FixedFunctionState) {
        self.fixed.update(state);
    }

    pub fn set_color_blend_attachments(&mut self, attachments: &[ColorBlendAttachment]) {
        if self.color_blend_attachments.get().as_slice() != attachments {
            self.color_blend_attachments.set(attachments.to_vec());
        }
    }

    pub fn set_shader_stages(&mut self, stages: &[ShaderStage]) {
        if self.shader_stages.get().as_slice() != stages {
            self.shader_stages.set(stages.to_vec());
        }
    }

    pub fn set_dynamic_states(&mut self, states: &[vk::DynamicState]) {
        if self.dynamic_states.get().as_slice() != states {
            self.dynamic_states.set(states.to_vec());
        }
    }

    /// Current fixed-function state.
    pub fn fixed_function_state(&self) -> &FixedFunctionState {
        self.fixed.get()
    }

    /// Current render pass, subpass and layout.
    pub fn parameters(&self) -> &PipelineParameters {
        self.parameters.get()
    }

    /// Composite key of the current state. Only dirty fields are rehashed.
    pub fn composite_hash(&mut self) -> CompositeHash {
        CompositeHash([
            self.parameters.hash(),
            self.vertex_bindings.hash(),
            self.vertex_attributes.hash(),
            self.fixed.hash(),
            self.shader_stages.hash(),
            self.dynamic_states.hash(),
            self.color_blend_attachments.hash(),
            0,
        ])
    }

    /// Pipeline for the current state, created if no equal state was seen before.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn get_selected_pipeline(&mut self) -> Result<vk::Pipeline> {
        let key = self.composite_hash();

        if let Some(bucket) = self.pipelines.get(&key) {
            if let Some(cached) = bucket.iter().find(|c| self.matches(&c.state)) {
                tracing::trace!("Pipeline cache hit: {:?}", cached.pipeline);
                return Ok(cached.pipeline);
            }
        }

        let state = self.snapshot();
        let pipeline = self.driver.create_graphics_pipeline(&state)?;
        self.pipelines
            .entry(key)
            .or_default()
            .push(CachedPipeline { state, pipeline });
        self.pipeline_count += 1;

        tracing::info!(
            "Created pipeline: {} pipelines now exist",
            self.pipeline_count
        );
        Ok(pipeline)
    }

    /// Number of cached pipelines.
    pub fn pipeline_count(&self) -> usize {
        self.pipeline_count
    }

    /// Destroy every cached pipeline. The current state is kept.
    pub fn invalidate(&mut self) {
        if self.pipeline_count > 0 {
            tracing::debug!("Invalidating {} cached pipelines", self.pipeline_count);
        }
        for (_, bucket) in self.pipelines.drain() {
            for cached in bucket {
                self.driver.destroy_pipeline(cached.pipeline);
            }
        }
        self.pipeline_count = 0;
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> GraphicsPipelineState {
        GraphicsPipelineState {
            parameters: *self.parameters.get(),
            vertex_bindings: self.vertex_bindings.get().clone(),
            vertex_attributes: self.vertex_attributes.get().clone(),
            fixed: *self.fixed.get(),
            shader_stages: self.shader_stages.get().clone(),
            dynamic_states: self.dynamic_states.get().clone(),
            color_blend_attachments: self.color_blend_attachments.get().clone(),
        }
    }

    fn matches(&self, state: &GraphicsPipelineState) -> bool {
        *self.parameters.get() == state.parameters
            && *self.fixed.get() == state.fixed
            && *self.vertex_bindings.get() == state.vertex_bindings
            && *self.vertex_attributes.get() == state.vertex_attributes
            && *self.shader_stages.get() == state.shader_stages
            && *self.dynamic_states.get() == state.dynamic_states
            && *self.color_blend_attachments.get() == state.color_blend_attachments
    }

    fn update_parameters(&mut self, f: impl FnOnce(&mut PipelineParameters)) {
        let mut next = *self.parameters.get();
        f(&mut next);
        self.parameters.update(next);
    }

    fn update_fixed(&mut self, f: impl FnOnce(&mut FixedFunctionState)) {
        let mut next = *self.fixed.get();
        f(&mut next);
        self.fixed.update(next);
    }
}

impl Drop for PipelineSelector {
    fn drop(&mut self) {
        self.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessConfig, HeadlessDriver, HeadlessObject};
    use ash::vk::Handle;

    fn selector() -> (PipelineSelector, Arc<HeadlessDriver>) {
        let driver = Arc::new(HeadlessDriver::new(HeadlessConfig::default()));
        let mut selector = PipelineSelector::new(driver.clone());
        selector.set_render_pass(vk::RenderPass::from_raw(1000));
        selector.set_pipeline_layout(vk::PipelineLayout::from_raw(2000));
        (selector, driver)
    }

    #[test]
    fn unchanged_state_reuses_pipeline() {
        let (mut selector, driver) = selector();

        let first = selector.get_selected_pipeline().unwrap();
        let second = selector.get_selected_pipeline().unwrap();

        assert_eq!(first, second);
        assert_eq!(selector.pipeline_count(), 1);
        assert_eq!(driver.created_count(HeadlessObject::Pipeline), 1);
    }

    #[test]
    fn changing_a_field_creates_and_reverting_hits() {
        let (mut selector, driver) = selector();

        let original = selector.get_selected_pipeline().unwrap();
        let original_hash = selector.composite_hash();

        selector.set_cull_mode(vk::CullModeFlags::BACK);
        assert_ne!(selector.composite_hash(), original_hash);
        let culled = selector.get_selected_pipeline().unwrap();
        assert_ne!(culled, original);

        selector.set_cull_mode(vk::CullModeFlags::NONE);
        assert_eq!(selector.composite_hash(), original_hash);
        assert_eq!(selector.get_selected_pipeline().unwrap(), original);

        assert_eq!(driver.created_count(HeadlessObject::Pipeline), 2);
    }

    #[test]
    fn reasserting_same_value_keeps_hash_clean() {
        let (mut selector, _driver) = selector();
        selector.composite_hash();

        selector.set_topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        selector.set_dynamic_states(&[vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR]);
        selector.set_color_blend_attachments(&[ColorBlendAttachment::default()]);

        assert!(!selector.fixed.is_dirty());
        assert!(!selector.dynamic_states.is_dirty());
        assert!(!selector.color_blend_attachments.is_dirty());
    }

    #[test]
    fn depth_bias_compares_every_parameter() {
        let (mut selector, _driver) = selector();
        selector.set_depth_bias(true, 1.0, 2.0, 0.0);
        let before = selector.composite_hash();

        selector.set_depth_bias(true, 1.0, 2.0, 0.5);
        assert_ne!(selector.composite_hash(), before);
        assert_eq!(
            selector.fixed_function_state().rasterization.depth_bias_clamp,
            0.5
        );
    }

    #[test]
    fn invalidate_forces_new_pipeline() {
        let (mut selector, driver) = selector();

        let first = selector.get_selected_pipeline().unwrap();
        selector.invalidate();
        assert_eq!(selector.pipeline_count(), 0);
        assert_eq!(driver.live_count(HeadlessObject::Pipeline), 0);

        let second = selector.get_selected_pipeline().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn pipeline_is_built_from_current_state() {
        let (mut selector, driver) = selector();
        let stages = [
            ShaderStage::main(vk::ShaderStageFlags::VERTEX, vk::ShaderModule::from_raw(1)),
            ShaderStage::main(vk::ShaderStageFlags::FRAGMENT, vk::ShaderModule::from_raw(2)),
        ];
        selector.set_shader_stages(&stages);
        selector.set_vertex_input_binding_descriptions(&[VertexBinding::per_vertex(0, 24)]);
        selector.set_vertex_input_attribute_descriptions(&[
            VertexAttribute::new(0, 0, vk::Format::R32G32B32_SFLOAT, 0),
            VertexAttribute::new(1, 0, vk::Format::R32G32B32_SFLOAT, 12),
        ]);
        selector.set_rasterization_samples(vk::SampleCountFlags::TYPE_4);
        selector.set_subpass(1);

        let pipeline = selector.get_selected_pipeline().unwrap();
        let state = driver.pipeline_state(pipeline).unwrap();

        assert_eq!(state, selector.snapshot());
        assert_eq!(state.parameters.subpass, 1);
        assert_eq!(state.shader_stages[0].entry_point.as_c_str(), c"main");
        assert_eq!(
            state.fixed.multisample.rasterization_samples,
            vk::SampleCountFlags::TYPE_4
        );
    }

    #[test]
    fn defaults_match_documented_state() {
        let state = GraphicsPipelineState::default();

        assert_eq!(
            state.dynamic_states,
            vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR]
        );
        assert_eq!(state.color_blend_attachments.len(), 1);
        assert!(!state.color_blend_attachments[0].blend_enable);
        assert_eq!(
            state.fixed.input_assembly.topology,
            vk::PrimitiveTopology::TRIANGLE_LIST
        );
        assert_eq!(state.fixed.rasterization.cull_mode, vk::CullModeFlags::NONE);
        assert!(state.fixed.depth_stencil.depth_test_enable);
        assert_eq!(
            state.fixed.depth_stencil.depth_compare_op,
            vk::CompareOp::LESS_OR_EQUAL
        );
        approx::assert_relative_eq!(state.fixed.rasterization.line_width, 1.0);
    }

    #[test]
    fn float_fields_compare_by_bits() {
        let mut a = FixedFunctionState::default();
        let b = a;
        assert_eq!(a, b);

        a.rasterization.line_width = 2.0;
        assert_ne!(a, b);
    }
}
