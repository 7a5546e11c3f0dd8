//! Device ownership: driver, allocator, caches and the tracked-object registry.

use crate::allocator::{Allocator, AllocatorConfig};
use crate::ash_driver::AshDriver;
use crate::capabilities::GpuCapabilities;
use crate::command::CommandBuffer;
use crate::descriptors::{DescriptorSetLayoutSelector, PipelineLayoutSelector};
use crate::driver::{Driver, Submission};
use crate::error::Result;
use crate::pipeline::PipelineSelector;
use crate::registry::{ObjectKind, ResourceRegistry, TrackedKey, TrackedObject};
use crate::surface::Surface;
use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

/// Device configuration knobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    pub allocator: AllocatorConfig,
}

impl DeviceConfig {
    /// Set the allocator's buffer block size.
    pub fn buffer_block_size(mut self, size: vk::DeviceSize) -> Self {
        self.allocator.buffer_block_size = size;
        self
    }

    /// Set the allocator's image block size.
    pub fn image_block_size(mut self, size: vk::DeviceSize) -> Self {
        self.allocator.image_block_size = size;
        self
    }
}

/// A logical device with its allocator, caches and object registry.
pub struct Device {
    driver: Arc<dyn Driver>,
    capabilities: GpuCapabilities,
    allocator: Allocator,
    registry: Mutex<ResourceRegistry>,
    pipeline_selector: Mutex<PipelineSelector>,
    descriptor_set_layouts: DescriptorSetLayoutSelector,
    pipeline_layouts: PipelineLayoutSelector,
    one_shot_pool: Mutex<vk::CommandPool>,
}

impl Device {
    /// Create a device over an existing driver.
    pub fn new(
        driver: Arc<dyn Driver>,
        capabilities: GpuCapabilities,
        config: DeviceConfig,
    ) -> Result<Arc<Self>> {
        let one_shot_pool = driver.create_command_pool(vk::CommandPoolCreateFlags::TRANSIENT)?;

        tracing::info!("Device ready: {}", capabilities.summary());

        Ok(Arc::new(Self {
            allocator: Allocator::new(driver.clone(), capabilities.clone(), config.allocator),
            pipeline_selector: Mutex::new(PipelineSelector::new(driver.clone())),
            descriptor_set_layouts: DescriptorSetLayoutSelector::new(driver.clone()),
            pipeline_layouts: PipelineLayoutSelector::new(driver.clone()),
            registry: Mutex::new(ResourceRegistry::new()),
            one_shot_pool: Mutex::new(one_shot_pool),
            capabilities,
            driver,
        }))
    }

    /// The native driver.
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// The device memory allocator.
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Lock the shared pipeline selector.
    pub fn pipeline_selector(&self) -> MutexGuard<'_, PipelineSelector> {
        self.pipeline_selector.lock()
    }

    /// Descriptor-set-layout cache.
    pub fn descriptor_set_layouts(&self) -> &DescriptorSetLayoutSelector {
        &self.descriptor_set_layouts
    }

    /// Pipeline-layout cache.
    pub fn pipeline_layouts(&self) -> &PipelineLayoutSelector {
        &self.pipeline_layouts
    }

    /// Register a native object for destruction through [`Device::release`].
    pub fn track(&self, object: TrackedObject) -> TrackedKey {
        self.registry.lock().insert(object)
    }

    /// Destroy a tracked object. Returns false if the key is no longer live.
    pub fn release(&self, key: TrackedKey) -> bool {
        let object = self.registry.lock().remove(key);
        match object {
            Some(object) => {
                tracing::debug!("Destroying {object:?}");
                object.destroy(&*self.driver, &self.allocator);
                true
            }
            None => false,
        }
    }

    /// Whether a key still refers to a live object.
    pub fn is_tracked(&self, key: TrackedKey) -> bool {
        self.registry.lock().contains(key)
    }

    /// Number of live tracked objects of one kind.
    pub fn tracked_count(&self, kind: ObjectKind) -> usize {
        self.registry.lock().count(kind)
    }

    /// Destroy every object still registered. Returns how many there were.
    pub fn destroy_tracked_objects(&self) -> usize {
        let objects = self.registry.lock().drain_for_teardown();
        for object in objects.iter().copied() {
            tracing::warn!("Destroying leaked {object:?}");
            object.destroy(&*self.driver, &self.allocator);
        }
        objects.len()
    }

    /// Submit work to the device queue without waiting.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(&self, submission: &Submission<'_>, fence: vk::Fence) -> Result<()> {
        self.driver.queue_submit(submission, fence)
    }

    /// Submit command buffers and block until they finish. There is no timeout.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit_and_wait(&self, command_buffers: &[vk::CommandBuffer]) -> Result<()> {
        let fence = self.driver.create_fence(false)?;
        let submission = Submission {
            command_buffers,
            ..Submission::default()
        };
        let result = self
            .submit(&submission, fence)
            .and_then(|()| self.driver.wait_for_fence(fence, u64::MAX));
        self.driver.destroy_fence(fence);
        result
    }

    /// Record into a one-time command buffer, submit it and wait for it.
    pub fn execute_one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&CommandBuffer) -> Result<()>,
    {
        let pool = self.one_shot_pool.lock();
        let handle = self.driver.allocate_command_buffer(*pool)?;
        let cmd = CommandBuffer::from_raw(self.driver.clone(), handle);

        let result = cmd
            .begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .and_then(|()| record(&cmd))
            .and_then(|()| cmd.end())
            .and_then(|()| self.submit_and_wait(&[handle]));

        self.driver.free_command_buffer(*pool, handle);
        result
    }

    /// Wait for device to be idle.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_idle(&self) -> Result<()> {
        self.driver.device_wait_idle()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.driver.device_wait_idle() {
            tracing::warn!("device_wait_idle failed during teardown: {e}");
        }

        let leaked = self.destroy_tracked_objects();
        if leaked > 0 {
            tracing::warn!("{leaked} objects were still alive at device teardown");
        }

        self.pipeline_selector.get_mut().invalidate();
        self.pipeline_layouts.destroy();
        self.descriptor_set_layouts.destroy();
        self.allocator.destroy();
        self.driver.destroy_command_pool(*self.one_shot_pool.get_mut());
    }
}

/// Builder for a [`Device`] on a real GPU.
pub struct DeviceBuilder {
    app_name: String,
    enable_validation: bool,
    config: DeviceConfig,
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        Self {
            app_name: "Vesper".to_string(),
            enable_validation: cfg!(debug_assertions),
            config: DeviceConfig::default(),
        }
    }
}

impl DeviceBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Set the device configuration.
    pub fn config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    /// Build a device without presentation support.
    pub fn build(self) -> Result<Arc<Device>> {
        let driver = AshDriver::new(&self.app_name, self.enable_validation)?;
        let capabilities = driver.capabilities();
        Device::new(Arc::new(driver), capabilities, self.config)
    }

    /// Build a device whose queue can present to `window`, plus its surface.
    pub fn build_for_window<W>(self, window: &W) -> Result<(Arc<Device>, Surface)>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let driver = Arc::new(AshDriver::for_window(
            &self.app_name,
            self.enable_validation,
            window,
        )?);
        let surface = Surface::from_driver(&driver)?;
        let capabilities = driver.capabilities();
        let device = Device::new(driver, capabilities, self.config)?;
        Ok((device, surface))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{headless_device, HeadlessConfig, HeadlessObject};

    #[test]
    fn submit_and_wait_uses_a_fence() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();

        device.submit_and_wait(&[]).unwrap();

        assert_eq!(driver.submission_count(), 1);
        assert_eq!(driver.fence_wait_count(), 1);
        assert_eq!(driver.live_count(HeadlessObject::Fence), 0);
    }

    #[test]
    fn one_shot_frees_its_command_buffer() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();

        device.execute_one_shot(|_cmd| Ok(())).unwrap();

        assert_eq!(driver.live_count(HeadlessObject::CommandBuffer), 0);
        assert_eq!(driver.submission_count(), 1);
    }

    #[test]
    fn one_shot_error_skips_submission() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();

        let result = device.execute_one_shot(|_cmd| {
            Err(crate::GpuError::InvalidState("recording failed".into()))
        });

        assert!(result.is_err());
        assert_eq!(driver.submission_count(), 0);
        assert_eq!(driver.live_count(HeadlessObject::CommandBuffer), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();

        let fence = driver.create_fence(false).unwrap();
        let key = device.track(TrackedObject::Fence(fence));

        assert!(device.release(key));
        assert!(!device.release(key));
        assert_eq!(driver.live_count(HeadlessObject::Fence), 0);
    }

    #[test]
    fn dropping_device_frees_everything() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let fence = driver.create_fence(false).unwrap();
        device.track(TrackedObject::Fence(fence));

        drop(device);

        assert_eq!(driver.live_count(HeadlessObject::Fence), 0);
        assert_eq!(driver.live_count(HeadlessObject::CommandPool), 0);
        assert_eq!(driver.memory_allocation_count(), 0);
    }

    #[test]
    fn teardown_continues_when_wait_idle_fails() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let fence = driver.create_fence(false).unwrap();
        device.track(TrackedObject::Fence(fence));
        driver.set_device_lost(true);

        drop(device);

        assert_eq!(driver.live_count(HeadlessObject::Fence), 0);
        assert_eq!(driver.live_count(HeadlessObject::CommandPool), 0);
    }
}
