//! In-memory driver for running without a GPU.
//!
//! [`HeadlessDriver`] hands out unique fake handles, keeps count of live
//! native objects and memory allocations, and records every command so tests
//! can inspect what would have reached the GPU. Queue work "completes"
//! immediately.

use crate::capabilities::{GpuCapabilities, GpuVendor};
use crate::descriptors::{DescriptorBinding, PushConstantRange};
use crate::device::{Device, DeviceConfig};
use crate::driver::{
    BufferDesc, DescriptorWrite, Driver, ImageBarrier, ImageCopy, ImageDesc, ImageViewDesc, Submission,
    SurfaceSupport, SwapchainDesc,
};
use crate::error::{GpuError, Result};
use crate::pipeline::GraphicsPipelineState;
use crate::render_pass::RenderPassOptions;
use ash::vk::{self, Handle};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Kinds of native objects the headless driver tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeadlessObject {
    Buffer,
    Image,
    ImageView,
    RenderPass,
    Framebuffer,
    DescriptorSetLayout,
    DescriptorPool,
    DescriptorSet,
    PipelineLayout,
    Pipeline,
    CommandPool,
    CommandBuffer,
    Fence,
    Semaphore,
    Swapchain,
}

/// A command recorded into any command buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    Begin(vk::CommandBuffer),
    End(vk::CommandBuffer),
    SetViewport { width: f32, height: f32 },
    SetScissor { width: u32, height: u32 },
    SetLineWidth(f32),
    Barrier {
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
    CopyImage { src: vk::Image, dst: vk::Image },
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        width: u32,
        height: u32,
        clear_value_count: usize,
    },
    NextSubpass,
    EndRenderPass,
    BindPipeline(vk::Pipeline),
    BindDescriptorSets {
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
}

/// Behaviour of the simulated device.
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// Property flags of each memory type, in index order.
    pub memory_types: Vec<vk::MemoryPropertyFlags>,
    pub buffer_alignment: vk::DeviceSize,
    pub image_alignment: vk::DeviceSize,
    pub max_image_dimension_2d: u32,
    pub color_sample_counts: vk::SampleCountFlags,
    pub depth_sample_counts: vk::SampleCountFlags,
    /// Formats reported as usable depth-stencil attachments.
    pub depth_formats: Vec<vk::Format>,
    pub present_supported: bool,
    pub surface_formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    pub min_image_count: u32,
    pub max_image_count: u32,
    /// Fixed surface extent; `None` lets the swapchain pick the window size.
    pub surface_extent: Option<vk::Extent2D>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        let all_samples = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_2
            | vk::SampleCountFlags::TYPE_4
            | vk::SampleCountFlags::TYPE_8;
        Self {
            memory_types: vec![
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ],
            buffer_alignment: 16,
            image_alignment: 1024,
            max_image_dimension_2d: 16384,
            color_sample_counts: all_samples,
            depth_sample_counts: all_samples,
            depth_formats: vec![vk::Format::D24_UNORM_S8_UINT, vk::Format::D32_SFLOAT],
            present_supported: true,
            surface_formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            min_image_count: 2,
            max_image_count: 8,
            surface_extent: None,
        }
    }
}

struct MemoryRecord {
    size: vk::DeviceSize,
    bytes: Option<Vec<u8>>,
}

struct DescriptorPoolRecord {
    max_sets: u32,
    sets: Vec<vk::DescriptorSet>,
}

struct SwapchainRecord {
    images: Vec<vk::Image>,
    next: u32,
}

#[derive(Default)]
struct HeadlessState {
    next_handle: u64,
    live: HashMap<u64, HeadlessObject>,
    created: HashMap<HeadlessObject, usize>,
    memory: BTreeMap<u64, MemoryRecord>,
    buffers: HashMap<u64, vk::DeviceSize>,
    images: HashMap<u64, ImageDesc>,
    pipelines: HashMap<u64, GraphicsPipelineState>,
    descriptor_pools: HashMap<u64, DescriptorPoolRecord>,
    descriptor_writes: Vec<DescriptorWrite>,
    swapchains: HashMap<u64, SwapchainRecord>,
    commands: Vec<RecordedCommand>,
    submissions: usize,
    fence_waits: usize,
    presents: usize,
    out_of_date: bool,
    device_lost: bool,
}

impl HeadlessState {
    fn create<T: Handle>(&mut self, kind: HeadlessObject) -> T {
        self.next_handle += 1;
        self.live.insert(self.next_handle, kind);
        *self.created.entry(kind).or_insert(0) += 1;
        T::from_raw(self.next_handle)
    }

    fn destroy<T: Handle>(&mut self, handle: T) {
        let raw = handle.as_raw();
        if raw != 0 {
            self.live.remove(&raw);
        }
    }
}

/// A [`Driver`] that simulates a device in memory.
pub struct HeadlessDriver {
    config: HeadlessConfig,
    state: Mutex<HeadlessState>,
}

impl HeadlessDriver {
    /// Create a headless driver.
    pub fn new(config: HeadlessConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HeadlessState::default()),
        }
    }

    /// Capabilities matching the configuration.
    pub fn capabilities(&self) -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Other(0),
            device_name: "Headless".to_string(),
            api_version: vk::API_VERSION_1_3,
            max_image_dimension_2d: self.config.max_image_dimension_2d,
            framebuffer_color_sample_counts: self.config.color_sample_counts,
            framebuffer_depth_sample_counts: self.config.depth_sample_counts,
            memory_types: self
                .config
                .memory_types
                .iter()
                .map(|&property_flags| vk::MemoryType {
                    property_flags,
                    heap_index: 0,
                })
                .collect(),
            memory_heaps: vec![vk::MemoryHeap {
                size: 1 << 30,
                flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
            }],
        }
    }

    /// Number of live native memory allocations.
    pub fn memory_allocation_count(&self) -> usize {
        self.state.lock().memory.len()
    }

    /// Sizes of the live native memory allocations, in creation order.
    pub fn memory_sizes(&self) -> Vec<vk::DeviceSize> {
        self.state.lock().memory.values().map(|m| m.size).collect()
    }

    /// Bytes written through a mapping of `memory`.
    pub fn memory_contents(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        len: usize,
    ) -> Vec<u8> {
        let state = self.state.lock();
        state
            .memory
            .get(&memory.as_raw())
            .and_then(|record| record.bytes.as_ref())
            .map(|bytes| bytes[offset as usize..offset as usize + len].to_vec())
            .unwrap_or_default()
    }

    /// Live objects of one kind.
    pub fn live_count(&self, kind: HeadlessObject) -> usize {
        self.state.lock().live.values().filter(|&&k| k == kind).count()
    }

    /// Objects of one kind created over the driver's lifetime.
    pub fn created_count(&self, kind: HeadlessObject) -> usize {
        self.state.lock().created.get(&kind).copied().unwrap_or(0)
    }

    /// State a pipeline was created from.
    pub fn pipeline_state(&self, pipeline: vk::Pipeline) -> Option<GraphicsPipelineState> {
        self.state.lock().pipelines.get(&pipeline.as_raw()).cloned()
    }

    /// Descriptor sets currently allocated from `pool`.
    pub fn descriptor_set_count(&self, pool: vk::DescriptorPool) -> usize {
        self.state
            .lock()
            .descriptor_pools
            .get(&pool.as_raw())
            .map_or(0, |record| record.sets.len())
    }

    /// Drain the descriptor writes applied so far.
    pub fn take_descriptor_writes(&self) -> Vec<DescriptorWrite> {
        std::mem::take(&mut self.state.lock().descriptor_writes)
    }

    /// Drain the recorded commands.
    pub fn take_commands(&self) -> Vec<RecordedCommand> {
        std::mem::take(&mut self.state.lock().commands)
    }

    /// Number of queue submissions.
    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions
    }

    /// Number of fence waits.
    pub fn fence_wait_count(&self) -> usize {
        self.state.lock().fence_waits
    }

    /// Number of presents.
    pub fn present_count(&self) -> usize {
        self.state.lock().presents
    }

    /// Make acquire and present report an out-of-date surface.
    pub fn set_out_of_date(&self, out_of_date: bool) {
        self.state.lock().out_of_date = out_of_date;
    }

    /// Make device wait-idle report a lost device.
    pub fn set_device_lost(&self, device_lost: bool) {
        self.state.lock().device_lost = device_lost;
    }

    fn record(&self, command: RecordedCommand) {
        self.state.lock().commands.push(command);
    }
}

impl Driver for HeadlessDriver {
    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory> {
        if memory_type_index as usize >= self.config.memory_types.len() {
            return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let mut state = self.state.lock();
        state.next_handle += 1;
        let raw = state.next_handle;
        state.memory.insert(raw, MemoryRecord { size, bytes: None });
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        self.state.lock().memory.remove(&memory.as_raw());
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<*mut u8> {
        let mut state = self.state.lock();
        let record = state
            .memory
            .get_mut(&memory.as_raw())
            .ok_or(GpuError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        if offset + size > record.size {
            return Err(GpuError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        let total = record.size as usize;
        let bytes = record.bytes.get_or_insert_with(|| vec![0; total]);
        Ok(bytes[offset as usize..].as_mut_ptr())
    }

    fn unmap_memory(&self, _memory: vk::DeviceMemory) {}

    fn create_buffer(&self, desc: &BufferDesc) -> Result<vk::Buffer> {
        let mut state = self.state.lock();
        let buffer: vk::Buffer = state.create(HeadlessObject::Buffer);
        state.buffers.insert(buffer.as_raw(), desc.size);
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer.as_raw());
        state.destroy(buffer);
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self
            .state
            .lock()
            .buffers
            .get(&buffer.as_raw())
            .copied()
            .unwrap_or(0);
        vk::MemoryRequirements {
            size,
            alignment: self.config.buffer_alignment,
            memory_type_bits: (1 << self.config.memory_types.len()) - 1,
        }
    }

    fn bind_buffer_memory(
        &self,
        _buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
    ) -> Result<()> {
        if self.state.lock().memory.contains_key(&memory.as_raw()) {
            Ok(())
        } else {
            Err(GpuError::Vulkan(vk::Result::ERROR_UNKNOWN))
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<vk::Image> {
        let max = self.config.max_image_dimension_2d;
        if desc.extent.width > max || desc.extent.height > max {
            return Err(GpuError::Vulkan(vk::Result::ERROR_FORMAT_NOT_SUPPORTED));
        }
        let mut state = self.state.lock();
        let image: vk::Image = state.create(HeadlessObject::Image);
        state.images.insert(image.as_raw(), *desc);
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.lock();
        state.images.remove(&image.as_raw());
        state.destroy(image);
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let size = self
            .state
            .lock()
            .images
            .get(&image.as_raw())
            .map_or(0, |desc| {
                u64::from(desc.extent.width)
                    * u64::from(desc.extent.height)
                    * 4
                    * u64::from(desc.samples.as_raw().max(1))
                    * u64::from(desc.array_layers)
            });
        vk::MemoryRequirements {
            size,
            alignment: self.config.image_alignment,
            memory_type_bits: (1 << self.config.memory_types.len()) - 1,
        }
    }

    fn bind_image_memory(
        &self,
        _image: vk::Image,
        memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
    ) -> Result<()> {
        if self.state.lock().memory.contains_key(&memory.as_raw()) {
            Ok(())
        } else {
            Err(GpuError::Vulkan(vk::Result::ERROR_UNKNOWN))
        }
    }

    fn create_image_view(&self, _desc: &ImageViewDesc) -> Result<vk::ImageView> {
        Ok(self.state.lock().create(HeadlessObject::ImageView))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().destroy(view);
    }

    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        let optimal_tiling_features = if self.config.depth_formats.contains(&format) {
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
        } else if crate::image::aspect_mask(format) == vk::ImageAspectFlags::COLOR {
            vk::FormatFeatureFlags::COLOR_ATTACHMENT | vk::FormatFeatureFlags::SAMPLED_IMAGE
        } else {
            vk::FormatFeatureFlags::empty()
        };
        vk::FormatProperties {
            optimal_tiling_features,
            ..Default::default()
        }
    }

    fn create_render_pass(&self, _options: &RenderPassOptions) -> Result<vk::RenderPass> {
        Ok(self.state.lock().create(HeadlessObject::RenderPass))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state.lock().destroy(render_pass);
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        Ok(self.state.lock().create(HeadlessObject::Framebuffer))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state.lock().destroy(framebuffer);
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        Ok(self.state.lock().create(HeadlessObject::DescriptorSetLayout))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state.lock().destroy(layout);
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let mut state = self.state.lock();
        let pool: vk::DescriptorPool = state.create(HeadlessObject::DescriptorPool);
        state.descriptor_pools.insert(
            pool.as_raw(),
            DescriptorPoolRecord {
                max_sets,
                sets: Vec::new(),
            },
        );
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        if let Some(record) = state.descriptor_pools.remove(&pool.as_raw()) {
            for set in record.sets {
                state.destroy(set);
            }
        }
        state.destroy(pool);
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        let mut state = self.state.lock();
        let sets = state
            .descriptor_pools
            .get_mut(&pool.as_raw())
            .map(|record| std::mem::take(&mut record.sets))
            .ok_or_else(|| GpuError::ResourceNotFound("descriptor pool".to_string()))?;
        for set in sets {
            state.destroy(set);
        }
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let mut state = self.state.lock();
        let full = match state.descriptor_pools.get(&pool.as_raw()) {
            Some(record) => record.sets.len() as u32 >= record.max_sets,
            None => return Err(GpuError::ResourceNotFound("descriptor pool".to_string())),
        };
        if full {
            return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        let set: vk::DescriptorSet = state.create(HeadlessObject::DescriptorSet);
        if let Some(record) = state.descriptor_pools.get_mut(&pool.as_raw()) {
            record.sets.push(set);
        }
        Ok(set)
    }

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) {
        let mut state = self.state.lock();
        if let Some(record) = state.descriptor_pools.get_mut(&pool.as_raw()) {
            record.sets.retain(|&s| s != set);
        }
        state.destroy(set);
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        self.state.lock().descriptor_writes.extend_from_slice(writes);
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constant_ranges: &[PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        Ok(self.state.lock().create(HeadlessObject::PipelineLayout))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state.lock().destroy(layout);
    }

    fn create_graphics_pipeline(&self, state: &GraphicsPipelineState) -> Result<vk::Pipeline> {
        let mut inner = self.state.lock();
        let pipeline: vk::Pipeline = inner.create(HeadlessObject::Pipeline);
        inner.pipelines.insert(pipeline.as_raw(), state.clone());
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        let mut state = self.state.lock();
        state.pipelines.remove(&pipeline.as_raw());
        state.destroy(pipeline);
    }

    fn create_command_pool(&self, _flags: vk::CommandPoolCreateFlags) -> Result<vk::CommandPool> {
        Ok(self.state.lock().create(HeadlessObject::CommandPool))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.state.lock().destroy(pool);
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        Ok(self.state.lock().create(HeadlessObject::CommandBuffer))
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        self.state.lock().destroy(command_buffer);
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        self.record(RecordedCommand::Begin(command_buffer));
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        self.record(RecordedCommand::End(command_buffer));
        Ok(())
    }

    fn cmd_set_viewport(&self, _command_buffer: vk::CommandBuffer, viewport: vk::Viewport) {
        self.record(RecordedCommand::SetViewport {
            width: viewport.width,
            height: viewport.height,
        });
    }

    fn cmd_set_scissor(&self, _command_buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        self.record(RecordedCommand::SetScissor {
            width: scissor.extent.width,
            height: scissor.extent.height,
        });
    }

    fn cmd_set_line_width(&self, _command_buffer: vk::CommandBuffer, line_width: f32) {
        self.record(RecordedCommand::SetLineWidth(line_width));
    }

    fn cmd_image_barriers(&self, _command_buffer: vk::CommandBuffer, barriers: &[ImageBarrier]) {
        let mut state = self.state.lock();
        for barrier in barriers {
            state.commands.push(RecordedCommand::Barrier {
                image: barrier.image,
                old_layout: barrier.old_layout,
                new_layout: barrier.new_layout,
            });
        }
    }

    fn cmd_copy_image(&self, _command_buffer: vk::CommandBuffer, copy: &ImageCopy) {
        self.record(RecordedCommand::CopyImage {
            src: copy.src,
            dst: copy.dst,
        });
    }

    fn cmd_begin_render_pass(
        &self,
        _command_buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) {
        self.record(RecordedCommand::BeginRenderPass {
            render_pass,
            framebuffer,
            width: render_area.extent.width,
            height: render_area.extent.height,
            clear_value_count: clear_values.len(),
        });
    }

    fn cmd_next_subpass(&self, _command_buffer: vk::CommandBuffer) {
        self.record(RecordedCommand::NextSubpass);
    }

    fn cmd_end_render_pass(&self, _command_buffer: vk::CommandBuffer) {
        self.record(RecordedCommand::EndRenderPass);
    }

    fn cmd_bind_pipeline(&self, _command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.record(RecordedCommand::BindPipeline(pipeline));
    }

    fn cmd_bind_descriptor_sets(
        &self,
        _command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.record(RecordedCommand::BindDescriptorSets {
            layout,
            first_set,
            sets: sets.to_vec(),
        });
    }

    fn create_fence(&self, _signaled: bool) -> Result<vk::Fence> {
        Ok(self.state.lock().create(HeadlessObject::Fence))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().destroy(fence);
    }

    fn wait_for_fence(&self, _fence: vk::Fence, _timeout_ns: u64) -> Result<()> {
        self.state.lock().fence_waits += 1;
        Ok(())
    }

    fn reset_fence(&self, _fence: vk::Fence) -> Result<()> {
        Ok(())
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        Ok(self.state.lock().create(HeadlessObject::Semaphore))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().destroy(semaphore);
    }

    fn queue_submit(&self, _submission: &Submission<'_>, _fence: vk::Fence) -> Result<()> {
        self.state.lock().submissions += 1;
        Ok(())
    }

    fn queue_wait_idle(&self) -> Result<()> {
        Ok(())
    }

    fn device_wait_idle(&self) -> Result<()> {
        if self.state.lock().device_lost {
            return Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        }
        Ok(())
    }

    fn surface_support(&self, _surface: vk::SurfaceKHR) -> Result<SurfaceSupport> {
        let (current_extent, min_extent, max_extent) = match self.config.surface_extent {
            Some(extent) => (extent, extent, extent),
            None => (
                vk::Extent2D {
                    width: u32::MAX,
                    height: u32::MAX,
                },
                vk::Extent2D {
                    width: 1,
                    height: 1,
                },
                vk::Extent2D {
                    width: self.config.max_image_dimension_2d,
                    height: self.config.max_image_dimension_2d,
                },
            ),
        };
        Ok(SurfaceSupport {
            present_supported: self.config.present_supported,
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: self.config.min_image_count,
                max_image_count: self.config.max_image_count,
                current_extent,
                min_image_extent: min_extent,
                max_image_extent: max_extent,
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..Default::default()
            },
            formats: self.config.surface_formats.clone(),
            present_modes: self.config.present_modes.clone(),
        })
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<(vk::SwapchainKHR, Vec<vk::Image>)> {
        let mut state = self.state.lock();
        let swapchain: vk::SwapchainKHR = state.create(HeadlessObject::Swapchain);
        // Presentation engine images are not tracked as live images.
        let images: Vec<vk::Image> = (0..desc.min_image_count)
            .map(|_| {
                state.next_handle += 1;
                vk::Image::from_raw(state.next_handle)
            })
            .collect();
        state.swapchains.insert(
            swapchain.as_raw(),
            SwapchainRecord {
                images: images.clone(),
                next: 0,
            },
        );
        Ok((swapchain, images))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        state.swapchains.remove(&swapchain.as_raw());
        state.destroy(swapchain);
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        _semaphore: vk::Semaphore,
        _fence: vk::Fence,
    ) -> Result<(u32, bool)> {
        let mut state = self.state.lock();
        if state.out_of_date {
            return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR));
        }
        let record = state
            .swapchains
            .get_mut(&swapchain.as_raw())
            .ok_or(GpuError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))?;
        let index = record.next;
        record.next = (record.next + 1) % record.images.len() as u32;
        Ok((index, false))
    }

    fn queue_present(
        &self,
        _swapchain: vk::SwapchainKHR,
        _image_index: u32,
        _wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let mut state = self.state.lock();
        if state.out_of_date {
            return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR));
        }
        state.presents += 1;
        Ok(false)
    }
}

/// Create a [`Device`] backed by a new [`HeadlessDriver`].
pub fn headless_device(
    config: HeadlessConfig,
    device_config: DeviceConfig,
) -> Result<(Arc<Device>, Arc<HeadlessDriver>)> {
    let driver = Arc::new(HeadlessDriver::new(config));
    let capabilities = driver.capabilities();
    let device = Device::new(driver.clone(), capabilities, device_config)?;
    Ok((device, driver))
}
