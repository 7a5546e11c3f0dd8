//! [`Driver`] implementation over the real Vulkan API.

use crate::capabilities::GpuCapabilities;
use crate::descriptors::{DescriptorBinding, PushConstantRange};
use crate::driver::{
    BufferDesc, DescriptorResource, DescriptorWrite, Driver, ImageBarrier, ImageCopy, ImageDesc, ImageViewDesc, Submission,
    SurfaceSupport, SwapchainDesc,
};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, find_graphics_queue_family, select_physical_device};
use crate::pipeline::GraphicsPipelineState;
use crate::render_pass::{RenderPassOptions, SubpassReferences};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::c_char;

/// Owns the Vulkan instance, logical device and graphics queue, plus the
/// window surface when created for one.
pub struct AshDriver {
    // Entry must be kept alive for the lifetime of the instance
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue_family: u32,
    queue: vk::Queue,
    surface_loader: Option<ash::khr::surface::Instance>,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    surface: vk::SurfaceKHR,
}

impl AshDriver {
    /// Create an instance and a device without presentation support.
    pub fn new(app_name: &str, enable_validation: bool) -> Result<Self> {
        Self::create(app_name, enable_validation, None)
    }

    /// Create an instance, a surface for `window` and a device whose queue
    /// can present to that surface.
    pub fn for_window<W>(app_name: &str, enable_validation: bool, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window.display_handle().map_err(|e| {
            GpuError::SurfaceCreation(format!("Failed to get display handle: {e}"))
        })?;
        let window = window.window_handle().map_err(|e| {
            GpuError::SurfaceCreation(format!("Failed to get window handle: {e}"))
        })?;
        Self::create(
            app_name,
            enable_validation,
            Some((display.as_raw(), window.as_raw())),
        )
    }

    fn create(
        app_name: &str,
        enable_validation: bool,
        handles: Option<(RawDisplayHandle, RawWindowHandle)>,
    ) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let extensions: Vec<*const c_char> = match handles {
            Some((display, _)) => ash_window::enumerate_required_extensions(display)?.to_vec(),
            None => Vec::new(),
        };
        let instance =
            unsafe { create_instance(&entry, app_name, enable_validation, &extensions) }?;

        let (surface_loader, surface) = match handles {
            Some((display, window)) => {
                let surface = unsafe {
                    ash_window::create_surface(&entry, &instance, display, window, None)
                }
                .map_err(|e| GpuError::SurfaceCreation(e.to_string()));
                let surface = match surface {
                    Ok(surface) => surface,
                    Err(e) => {
                        unsafe { instance.destroy_instance(None) };
                        return Err(e);
                    }
                };
                (
                    Some(ash::khr::surface::Instance::new(&entry, &instance)),
                    surface,
                )
            }
            None => (None, vk::SurfaceKHR::null()),
        };

        let can_present = |physical_device: vk::PhysicalDevice, family: u32| match &surface_loader
        {
            Some(loader) => unsafe {
                loader
                    .get_physical_device_surface_support(physical_device, family, surface)
                    .unwrap_or(false)
            },
            None => true,
        };

        let selected = unsafe {
            select_physical_device(&instance, |physical_device| {
                find_graphics_queue_family(&instance, physical_device, |family| {
                    can_present(physical_device, family)
                })
                .is_some()
            })
        }
        .and_then(|physical_device| {
            let family = unsafe {
                find_graphics_queue_family(&instance, physical_device, |family| {
                    can_present(physical_device, family)
                })
            }
            .ok_or(GpuError::NoPresentQueue)?;
            let device = unsafe {
                create_device(&instance, physical_device, family, surface_loader.is_some())
            }?;
            Ok((physical_device, family, device))
        });

        let (physical_device, queue_family, device) = match selected {
            Ok(selected) => selected,
            Err(e) => {
                unsafe {
                    if let Some(loader) = &surface_loader {
                        loader.destroy_surface(surface, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let swapchain_loader = surface_loader
            .is_some()
            .then(|| ash::khr::swapchain::Device::new(&instance, &device));

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            queue_family,
            queue,
            surface_loader,
            swapchain_loader,
            surface,
        })
    }

    /// Query the selected device's capabilities.
    pub fn capabilities(&self) -> GpuCapabilities {
        unsafe { GpuCapabilities::query(&self.instance, self.physical_device) }
    }

    /// Window surface created with the driver; null for a windowless driver.
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Queue family of the graphics queue.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    fn swapchain_loader(&self) -> Result<&ash::khr::swapchain::Device> {
        self.swapchain_loader
            .as_ref()
            .ok_or_else(|| GpuError::ExtensionNotSupported("VK_KHR_swapchain".into()))
    }
}

impl Drop for AshDriver {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            if let Some(loader) = &self.surface_loader {
                loader.destroy_surface(self.surface, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Create the logical device with one graphics queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    presentable: bool,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extension_names: Vec<*const c_char> = if presentable {
        vec![ash::khr::swapchain::NAME.as_ptr()]
    } else {
        Vec::new()
    };

    // Enable the optional features pipelines may ask for when present.
    let supported = instance.get_physical_device_features(physical_device);
    let features = vk::PhysicalDeviceFeatures::default()
        .fill_mode_non_solid(supported.fill_mode_non_solid == vk::TRUE)
        .wide_lines(supported.wide_lines == vk::TRUE)
        .sample_rate_shading(supported.sample_rate_shading == vk::TRUE)
        .depth_bias_clamp(supported.depth_bias_clamp == vk::TRUE)
        .depth_clamp(supported.depth_clamp == vk::TRUE);

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    Ok(instance.create_device(physical_device, &device_create_info, None)?)
}

fn subpass_description(references: &SubpassReferences) -> vk::SubpassDescription<'_> {
    let mut description = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&references.color);
    if !references.resolve.is_empty() {
        description = description.resolve_attachments(&references.resolve);
    }
    if let Some(depth_stencil) = &references.depth_stencil {
        description = description.depth_stencil_attachment(depth_stencil);
    }
    description
}

impl Driver for AshDriver {
    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        Ok(unsafe { self.device.allocate_memory(&info, None) }?)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) };
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<*mut u8> {
        let ptr = unsafe {
            self.device
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
        }?;
        Ok(ptr.cast())
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) };
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<vk::Buffer> {
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        Ok(unsafe { self.device.create_buffer(&info, None) }?)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<()> {
        Ok(unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }?)
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<vk::Image> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.samples)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        Ok(unsafe { self.device.create_image(&info, None) }?)
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<()> {
        Ok(unsafe { self.device.bind_image_memory(image, memory, offset) }?)
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> Result<vk::ImageView> {
        let view_type = if desc.array_layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let info = vk::ImageViewCreateInfo::default()
            .image(desc.image)
            .view_type(view_type)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect_mask,
                base_mip_level: 0,
                level_count: desc.mip_levels,
                base_array_layer: 0,
                layer_count: desc.array_layers,
            });
        Ok(unsafe { self.device.create_image_view(&info, None) }?)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    fn create_render_pass(&self, options: &RenderPassOptions) -> Result<vk::RenderPass> {
        let attachments: Vec<_> = options.attachments.iter().map(|a| a.to_vk()).collect();
        let references: Vec<_> = (0..options.subpasses.len())
            .map(|i| options.references(i))
            .collect();
        let subpasses: Vec<_> = references.iter().map(subpass_description).collect();
        let dependencies: Vec<_> = options.dependencies.iter().map(|d| d.to_vk()).collect();

        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        Ok(unsafe { self.device.create_render_pass(&info, None) }?)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        Ok(unsafe { self.device.create_framebuffer(&info, None) }?)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let bindings: Vec<_> = bindings.iter().map(DescriptorBinding::to_vk).collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        Ok(unsafe { self.device.create_descriptor_set_layout(&info, None) }?)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        Ok(unsafe { self.device.create_descriptor_pool(&info, None) }?)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }?;
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }?;
        sets.into_iter()
            .next()
            .ok_or_else(|| GpuError::AllocationFailed("descriptor set".to_string()))
    }

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) {
        if set == vk::DescriptorSet::null() {
            return;
        }
        if let Err(e) = unsafe { self.device.free_descriptor_sets(pool, &[set]) } {
            tracing::warn!("Failed to free descriptor set: {e}");
        }
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let buffer_infos: smallvec::SmallVec<[vk::DescriptorBufferInfo; 8]> = writes
            .iter()
            .map(|write| match write.resource {
                DescriptorResource::Buffer {
                    buffer,
                    offset,
                    range,
                } => vk::DescriptorBufferInfo {
                    buffer,
                    offset,
                    range,
                },
                DescriptorResource::Image { .. } => vk::DescriptorBufferInfo::default(),
            })
            .collect();
        let image_infos: smallvec::SmallVec<[vk::DescriptorImageInfo; 8]> = writes
            .iter()
            .map(|write| match write.resource {
                DescriptorResource::Image {
                    view,
                    layout,
                    sampler,
                } => vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: layout,
                },
                DescriptorResource::Buffer { .. } => vk::DescriptorImageInfo::default(),
            })
            .collect();

        let native: smallvec::SmallVec<[vk::WriteDescriptorSet<'_>; 8]> = writes
            .iter()
            .enumerate()
            .map(|(i, write)| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(write.set)
                    .dst_binding(write.binding)
                    .descriptor_type(write.descriptor_type);
                match write.resource {
                    DescriptorResource::Buffer { .. } => {
                        base.buffer_info(std::slice::from_ref(&buffer_infos[i]))
                    }
                    DescriptorResource::Image { .. } => {
                        base.image_info(std::slice::from_ref(&image_infos[i]))
                    }
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&native, &[]) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        let ranges: Vec<_> = push_constant_ranges
            .iter()
            .map(PushConstantRange::to_vk)
            .collect();
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(&ranges);
        Ok(unsafe { self.device.create_pipeline_layout(&info, None) }?)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_graphics_pipeline(&self, state: &GraphicsPipelineState) -> Result<vk::Pipeline> {
        let fixed = &state.fixed;

        let stages: Vec<_> = state
            .shader_stages
            .iter()
            .map(|s| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(s.stage)
                    .module(s.module)
                    .name(s.entry_point.as_c_str())
            })
            .collect();

        let bindings: Vec<_> = state.vertex_bindings.iter().map(|b| b.to_vk()).collect();
        let attributes: Vec<_> = state.vertex_attributes.iter().map(|a| a.to_vk()).collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(fixed.input_assembly.topology)
            .primitive_restart_enable(fixed.input_assembly.primitive_restart_enable);

        // Viewport and scissor are always dynamic.
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let raster = &fixed.rasterization;
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(raster.depth_clamp_enable)
            .rasterizer_discard_enable(raster.rasterizer_discard_enable)
            .polygon_mode(raster.polygon_mode)
            .cull_mode(raster.cull_mode)
            .front_face(raster.front_face)
            .depth_bias_enable(raster.depth_bias_enable)
            .depth_bias_constant_factor(raster.depth_bias_constant_factor)
            .depth_bias_clamp(raster.depth_bias_clamp)
            .depth_bias_slope_factor(raster.depth_bias_slope_factor)
            .line_width(raster.line_width);

        let ms = &fixed.multisample;
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(ms.rasterization_samples)
            .sample_shading_enable(ms.sample_shading_enable)
            .min_sample_shading(ms.min_sample_shading)
            .alpha_to_coverage_enable(ms.alpha_to_coverage_enable)
            .alpha_to_one_enable(ms.alpha_to_one_enable);

        let ds = &fixed.depth_stencil;
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(ds.depth_test_enable)
            .depth_write_enable(ds.depth_write_enable)
            .depth_compare_op(ds.depth_compare_op)
            .depth_bounds_test_enable(ds.depth_bounds_test_enable)
            .stencil_test_enable(ds.stencil_test_enable)
            .front(ds.front.to_vk())
            .back(ds.back.to_vk())
            .min_depth_bounds(ds.min_depth_bounds)
            .max_depth_bounds(ds.max_depth_bounds);

        let blend_attachments: Vec<_> = state
            .color_blend_attachments
            .iter()
            .map(|a| a.to_vk())
            .collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(fixed.color_blend.logic_op_enable)
            .logic_op(fixed.color_blend.logic_op)
            .attachments(&blend_attachments)
            .blend_constants(fixed.color_blend.blend_constants);

        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&state.dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(state.parameters.layout)
            .render_pass(state.parameters.render_pass)
            .subpass(state.parameters.subpass);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| GpuError::PipelineCreation(e.to_string()))?;

        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::PipelineCreation("driver returned no pipeline".into()))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn create_command_pool(&self, flags: vk::CommandPoolCreateFlags) -> Result<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_family)
            .flags(flags | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        Ok(unsafe { self.device.create_command_pool(&info, None) }?)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        unsafe { self.device.allocate_command_buffers(&info) }?
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::Other("driver returned no command buffer".into()))
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) };
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let info = vk::CommandBufferBeginInfo::default().flags(flags);
        Ok(unsafe { self.device.begin_command_buffer(command_buffer, &info) }?)
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        Ok(unsafe { self.device.end_command_buffer(command_buffer) }?)
    }

    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(command_buffer, 0, &[viewport]) };
    }

    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(command_buffer, 0, &[scissor]) };
    }

    fn cmd_set_line_width(&self, command_buffer: vk::CommandBuffer, line_width: f32) {
        unsafe { self.device.cmd_set_line_width(command_buffer, line_width) };
    }

    fn cmd_image_barriers(&self, command_buffer: vk::CommandBuffer, barriers: &[ImageBarrier]) {
        let barriers: smallvec::SmallVec<[vk::ImageMemoryBarrier2; 4]> = barriers
            .iter()
            .map(|b| {
                vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(b.src_stage)
                    .src_access_mask(b.src_access)
                    .dst_stage_mask(b.dst_stage)
                    .dst_access_mask(b.dst_access)
                    .old_layout(b.old_layout)
                    .new_layout(b.new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(b.image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: b.aspect_mask,
                        base_mip_level: 0,
                        level_count: vk::REMAINING_MIP_LEVELS,
                        base_array_layer: 0,
                        layer_count: vk::REMAINING_ARRAY_LAYERS,
                    })
            })
            .collect();
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        unsafe { self.device.cmd_pipeline_barrier2(command_buffer, &dependency) };
    }

    fn cmd_copy_image(&self, command_buffer: vk::CommandBuffer, copy: &ImageCopy) {
        let layers = vk::ImageSubresourceLayers {
            aspect_mask: copy.aspect_mask,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let region = vk::ImageCopy {
            src_subresource: layers,
            src_offset: vk::Offset3D::default(),
            dst_subresource: layers,
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: copy.extent.width,
                height: copy.extent.height,
                depth: 1,
            },
        };
        unsafe {
            self.device.cmd_copy_image(
                command_buffer,
                copy.src,
                copy.src_layout,
                copy.dst,
                copy.dst_layout,
                &[region],
            );
        }
    }

    fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) {
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(clear_values);
        unsafe {
            self.device
                .cmd_begin_render_pass(command_buffer, &info, vk::SubpassContents::INLINE);
        }
    }

    fn cmd_next_subpass(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device
                .cmd_next_subpass(command_buffer, vk::SubpassContents::INLINE);
        }
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(command_buffer) };
    }

    fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, pipeline);
        }
    }

    fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                first_set,
                sets,
                &[],
            );
        }
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&info, None) }?)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        Ok(unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }?)
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        Ok(unsafe { self.device.reset_fences(&[fence]) }?)
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.create_semaphore(&info, None) }?)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn queue_submit(&self, submission: &Submission<'_>, fence: vk::Fence) -> Result<()> {
        let info = vk::SubmitInfo::default()
            .wait_semaphores(submission.wait_semaphores)
            .wait_dst_stage_mask(submission.wait_stages)
            .command_buffers(submission.command_buffers)
            .signal_semaphores(submission.signal_semaphores);
        Ok(unsafe { self.device.queue_submit(self.queue, &[info], fence) }?)
    }

    fn queue_wait_idle(&self) -> Result<()> {
        Ok(unsafe { self.device.queue_wait_idle(self.queue) }?)
    }

    fn device_wait_idle(&self) -> Result<()> {
        Ok(unsafe { self.device.device_wait_idle() }?)
    }

    fn surface_support(&self, surface: vk::SurfaceKHR) -> Result<SurfaceSupport> {
        let loader = self
            .surface_loader
            .as_ref()
            .ok_or_else(|| GpuError::ExtensionNotSupported("VK_KHR_surface".into()))?;
        unsafe {
            Ok(SurfaceSupport {
                present_supported: loader.get_physical_device_surface_support(
                    self.physical_device,
                    self.queue_family,
                    surface,
                )?,
                capabilities: loader
                    .get_physical_device_surface_capabilities(self.physical_device, surface)?,
                formats: loader.get_physical_device_surface_formats(self.physical_device, surface)?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(self.physical_device, surface)?,
            })
        }
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<(vk::SwapchainKHR, Vec<vk::Image>)> {
        let loader = self.swapchain_loader()?;
        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(desc.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.surface_format.format)
            .image_color_space(desc.surface_format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(desc.old_swapchain);

        let swapchain = unsafe { loader.create_swapchain(&info, None) }
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;
        match unsafe { loader.get_swapchain_images(swapchain) } {
            Ok(images) => Ok((swapchain, images)),
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                Err(e.into())
            }
        }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Some(loader) = &self.swapchain_loader {
            unsafe { loader.destroy_swapchain(swapchain, None) };
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<(u32, bool)> {
        let loader = self.swapchain_loader()?;
        Ok(unsafe { loader.acquire_next_image(swapchain, timeout_ns, semaphore, fence) }?)
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let loader = self.swapchain_loader()?;
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        Ok(unsafe { loader.queue_present(self.queue, &info) }?)
    }
}
