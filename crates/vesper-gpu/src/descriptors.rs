//! Descriptor-set layouts, pipeline layouts, descriptor pools and sets.
//!
//! Layouts are cached by their full description: two requests share a native
//! object only if their binding lists (and push-constant ranges) are equal.

use crate::buffer::Buffer;
use crate::device::Device;
use crate::driver::{DescriptorResource, DescriptorWrite, Driver};
use crate::error::{GpuError, Result};
use crate::image::ImageView;
use crate::registry::{TrackedKey, TrackedObject};
use ash::vk;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One binding slot of a descriptor-set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

impl DescriptorBinding {
    /// Native binding description.
    pub fn to_vk(&self) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(self.binding)
            .descriptor_type(self.descriptor_type)
            .descriptor_count(self.count)
            .stage_flags(self.stage_flags)
    }
}

/// A push-constant range of a pipeline layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushConstantRange {
    pub stage_flags: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

impl PushConstantRange {
    /// Native range description.
    pub fn to_vk(&self) -> vk::PushConstantRange {
        vk::PushConstantRange {
            stage_flags: self.stage_flags,
            offset: self.offset,
            size: self.size,
        }
    }
}

/// Builder for a binding list.
#[derive(Debug, Clone, Default)]
pub struct DescriptorBindings {
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorBindings {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(DescriptorBinding {
            binding,
            descriptor_type,
            count,
            stage_flags,
        });
        self
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    /// Add a sampled image binding.
    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            stage_flags,
        )
    }

    /// Finish the list.
    pub fn build(self) -> Vec<DescriptorBinding> {
        self.bindings
    }
}

/// Cache of descriptor-set layouts keyed by binding list.
pub struct DescriptorSetLayoutSelector {
    driver: Arc<dyn Driver>,
    layouts: RwLock<HashMap<Vec<DescriptorBinding>, vk::DescriptorSetLayout>>,
}

impl DescriptorSetLayoutSelector {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            layouts: RwLock::new(HashMap::new()),
        }
    }

    /// Layout for `bindings`, created on first request. An empty list maps to
    /// the null handle.
    pub fn get_selected_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        if bindings.is_empty() {
            return Ok(vk::DescriptorSetLayout::null());
        }

        if let Some(&layout) = self.layouts.read().get(bindings) {
            return Ok(layout);
        }

        let mut layouts = self.layouts.write();
        // Another thread may have created it between the two locks.
        if let Some(&layout) = layouts.get(bindings) {
            return Ok(layout);
        }

        let layout = self.driver.create_descriptor_set_layout(bindings)?;
        layouts.insert(bindings.to_vec(), layout);
        tracing::debug!(
            "Created descriptor set layout: {} layouts now exist",
            layouts.len()
        );
        Ok(layout)
    }

    /// Number of cached layouts.
    pub fn len(&self) -> usize {
        self.layouts.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.layouts.read().is_empty()
    }

    /// Destroy every cached layout.
    pub fn destroy(&self) {
        for (_, layout) in self.layouts.write().drain() {
            self.driver.destroy_descriptor_set_layout(layout);
        }
    }
}

impl Drop for DescriptorSetLayoutSelector {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineLayoutKey {
    set_layouts: Vec<vk::DescriptorSetLayout>,
    push_constant_ranges: Vec<PushConstantRange>,
}

/// Cache of pipeline layouts keyed by set layouts and push-constant ranges.
pub struct PipelineLayoutSelector {
    driver: Arc<dyn Driver>,
    layouts: RwLock<HashMap<PipelineLayoutKey, vk::PipelineLayout>>,
}

impl PipelineLayoutSelector {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            layouts: RwLock::new(HashMap::new()),
        }
    }

    /// Layout for the given set layouts and push-constant ranges, created on
    /// first request.
    pub fn get_selected_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        let key = PipelineLayoutKey {
            set_layouts: set_layouts.to_vec(),
            push_constant_ranges: push_constant_ranges.to_vec(),
        };

        if let Some(&layout) = self.layouts.read().get(&key) {
            return Ok(layout);
        }

        let mut layouts = self.layouts.write();
        if let Some(&layout) = layouts.get(&key) {
            return Ok(layout);
        }

        let layout = self
            .driver
            .create_pipeline_layout(set_layouts, push_constant_ranges)?;
        layouts.insert(key, layout);
        tracing::debug!(
            "Created pipeline layout: {} layouts now exist",
            layouts.len()
        );
        Ok(layout)
    }

    /// Number of cached layouts.
    pub fn len(&self) -> usize {
        self.layouts.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.layouts.read().is_empty()
    }

    /// Destroy every cached layout.
    pub fn destroy(&self) {
        for (_, layout) in self.layouts.write().drain() {
            self.driver.destroy_pipeline_layout(layout);
        }
    }
}

impl Drop for PipelineLayoutSelector {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Descriptor pool sized for a binding list.
pub struct DescriptorPool {
    device: Arc<Device>,
    key: TrackedKey,
    pool: vk::DescriptorPool,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    live_sets: AtomicUsize,
}

impl DescriptorPool {
    /// Create a pool able to hold `max_sets` sets of the given layout.
    pub fn for_bindings(
        device: &Arc<Device>,
        bindings: &[DescriptorBinding],
        max_sets: u32,
    ) -> Result<Self> {
        let pool_sizes = pool_sizes(bindings, max_sets);
        let pool = device
            .driver()
            .create_descriptor_pool(max_sets, &pool_sizes)?;
        let key = device.track(TrackedObject::DescriptorPool(pool));
        Ok(Self {
            device: device.clone(),
            key,
            pool,
            pool_sizes,
            live_sets: AtomicUsize::new(0),
        })
    }

    /// Allocate one set with `layout`.
    pub fn allocate(self: &Arc<Self>, layout: vk::DescriptorSetLayout) -> Result<DescriptorSet> {
        DescriptorSet::new(self, layout)
    }

    /// Return every set to the pool. Fails while any [`DescriptorSet`]
    /// allocated from it is still alive.
    pub fn reset(&self) -> Result<()> {
        let live = self.live_sets.load(Ordering::Acquire);
        if live > 0 {
            return Err(GpuError::InvalidState(format!(
                "cannot reset descriptor pool with {live} live sets"
            )));
        }
        self.device.driver().reset_descriptor_pool(self.pool)
    }

    /// Sets allocated from this pool that are still alive.
    pub fn live_sets(&self) -> usize {
        self.live_sets.load(Ordering::Acquire)
    }

    /// Native handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Descriptor counts per type.
    pub fn pool_sizes(&self) -> &[vk::DescriptorPoolSize] {
        &self.pool_sizes
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.device.release(self.key);
    }
}

/// A descriptor set allocated from a [`DescriptorPool`].
///
/// The set keeps its pool alive and is returned to it on drop.
pub struct DescriptorSet {
    pool: Arc<DescriptorPool>,
    key: TrackedKey,
    set: vk::DescriptorSet,
    layout: vk::DescriptorSetLayout,
}

impl DescriptorSet {
    /// Allocate a set with `layout` from `pool`.
    pub fn new(pool: &Arc<DescriptorPool>, layout: vk::DescriptorSetLayout) -> Result<Self> {
        if layout == vk::DescriptorSetLayout::null() {
            return Err(GpuError::InvalidState(
                "descriptor set needs a non-empty layout".to_string(),
            ));
        }
        let device = &pool.device;
        let set = device.driver().allocate_descriptor_set(pool.pool, layout)?;
        let key = device.track(TrackedObject::DescriptorSet {
            pool: pool.pool,
            set,
        });
        pool.live_sets.fetch_add(1, Ordering::AcqRel);
        Ok(Self {
            pool: pool.clone(),
            key,
            set,
            layout,
        })
    }

    /// Allocate a set whose layout is selected from `bindings`.
    pub fn for_bindings(pool: &Arc<DescriptorPool>, bindings: &[DescriptorBinding]) -> Result<Self> {
        let layout = pool
            .device
            .descriptor_set_layouts()
            .get_selected_layout(bindings)?;
        Self::new(pool, layout)
    }

    /// Native handle.
    pub fn handle(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Layout the set was allocated with.
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Write one resource into `binding`.
    pub fn write(
        &self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        resource: DescriptorResource,
    ) {
        self.update(&[(binding, descriptor_type, resource)]);
    }

    /// Apply several writes in one native call.
    pub fn update(&self, writes: &[(u32, vk::DescriptorType, DescriptorResource)]) {
        let writes: Vec<DescriptorWrite> = writes
            .iter()
            .map(|&(binding, descriptor_type, resource)| DescriptorWrite {
                set: self.set,
                binding,
                descriptor_type,
                resource,
            })
            .collect();
        self.pool.device.driver().update_descriptor_sets(&writes);
    }

    /// Point `binding` at the whole of a uniform buffer.
    pub fn write_uniform_buffer(&self, binding: u32, buffer: &Buffer) {
        self.write(
            binding,
            vk::DescriptorType::UNIFORM_BUFFER,
            whole_buffer(buffer),
        );
    }

    /// Point `binding` at the whole of a storage buffer.
    pub fn write_storage_buffer(&self, binding: u32, buffer: &Buffer) {
        self.write(
            binding,
            vk::DescriptorType::STORAGE_BUFFER,
            whole_buffer(buffer),
        );
    }

    /// Combined image sampler read in SHADER_READ_ONLY_OPTIMAL.
    pub fn write_sampled_image(&self, binding: u32, view: &ImageView, sampler: vk::Sampler) {
        self.write(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorResource::Image {
                view: view.handle(),
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                sampler,
            },
        );
    }

    pub fn write_storage_image(&self, binding: u32, view: &ImageView, layout: vk::ImageLayout) {
        self.write(
            binding,
            vk::DescriptorType::STORAGE_IMAGE,
            DescriptorResource::Image {
                view: view.handle(),
                layout,
                sampler: vk::Sampler::null(),
            },
        );
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        self.pool.device.release(self.key);
        self.pool.live_sets.fetch_sub(1, Ordering::AcqRel);
    }
}

fn whole_buffer(buffer: &Buffer) -> DescriptorResource {
    DescriptorResource::Buffer {
        buffer: buffer.handle(),
        offset: 0,
        range: buffer.size(),
    }
}

/// Total descriptors per type for `max_sets` copies of `bindings`.
fn pool_sizes(bindings: &[DescriptorBinding], max_sets: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut counts: BTreeMap<i32, u32> = BTreeMap::new();
    for binding in bindings {
        *counts.entry(binding.descriptor_type.as_raw()).or_insert(0) += binding.count;
    }
    counts
        .into_iter()
        .map(|(ty, count)| vk::DescriptorPoolSize {
            ty: vk::DescriptorType::from_raw(ty),
            descriptor_count: count * max_sets,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandPool;
    use crate::device::DeviceConfig;
    use crate::headless::{
        headless_device, HeadlessConfig, HeadlessDriver, HeadlessObject, RecordedCommand,
    };
    use crate::image::ImageFormat;
    use crate::registry::ObjectKind;
    use ash::vk::Handle;

    fn bindings() -> Vec<DescriptorBinding> {
        DescriptorBindings::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .sampled_image(1, vk::ShaderStageFlags::FRAGMENT)
            .build()
    }

    #[test]
    fn equal_bindings_share_a_layout() {
        let driver = Arc::new(HeadlessDriver::new(HeadlessConfig::default()));
        let selector = DescriptorSetLayoutSelector::new(driver.clone());

        let first = selector.get_selected_layout(&bindings()).unwrap();
        let second = selector.get_selected_layout(&bindings()).unwrap();

        assert_eq!(first, second);
        assert_eq!(selector.len(), 1);
        assert_eq!(driver.created_count(HeadlessObject::DescriptorSetLayout), 1);
    }

    #[test]
    fn differing_bindings_get_distinct_layouts() {
        let driver = Arc::new(HeadlessDriver::new(HeadlessConfig::default()));
        let selector = DescriptorSetLayoutSelector::new(driver.clone());

        let mut changed = bindings();
        changed[1].stage_flags = vk::ShaderStageFlags::ALL_GRAPHICS;

        let first = selector.get_selected_layout(&bindings()).unwrap();
        let second = selector.get_selected_layout(&changed).unwrap();

        assert_ne!(first, second);
        assert_eq!(selector.len(), 2);
    }

    #[test]
    fn empty_bindings_map_to_null_layout() {
        let driver = Arc::new(HeadlessDriver::new(HeadlessConfig::default()));
        let selector = DescriptorSetLayoutSelector::new(driver.clone());

        assert_eq!(
            selector.get_selected_layout(&[]).unwrap(),
            vk::DescriptorSetLayout::null()
        );
        assert!(selector.is_empty());
    }

    #[test]
    fn pipeline_layouts_key_on_push_constants_too() {
        let driver = Arc::new(HeadlessDriver::new(HeadlessConfig::default()));
        let selector = PipelineLayoutSelector::new(driver.clone());
        let set = vk::DescriptorSetLayout::from_raw(7);
        let range = PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: 64,
        };

        let plain = selector.get_selected_layout(&[set], &[]).unwrap();
        let pushed = selector.get_selected_layout(&[set], &[range]).unwrap();
        let again = selector.get_selected_layout(&[set], &[range]).unwrap();

        assert_ne!(plain, pushed);
        assert_eq!(pushed, again);
        assert_eq!(driver.created_count(HeadlessObject::PipelineLayout), 2);
    }

    #[test]
    fn dropping_selector_destroys_layouts() {
        let driver = Arc::new(HeadlessDriver::new(HeadlessConfig::default()));
        let selector = DescriptorSetLayoutSelector::new(driver.clone());
        selector.get_selected_layout(&bindings()).unwrap();

        drop(selector);
        assert_eq!(driver.live_count(HeadlessObject::DescriptorSetLayout), 0);
    }

    #[test]
    fn pool_counts_descriptors_per_type() {
        let mut list = bindings();
        list.push(DescriptorBinding {
            binding: 2,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            count: 2,
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
        });

        let sizes = pool_sizes(&list, 4);

        assert_eq!(sizes.len(), 2);
        let uniform = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER)
            .unwrap();
        assert_eq!(uniform.descriptor_count, 12);
        let sampler = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .unwrap();
        assert_eq!(sampler.descriptor_count, 4);
    }

    #[test]
    fn pool_is_tracked_by_the_device() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();

        let pool = DescriptorPool::for_bindings(&device, &bindings(), 1).unwrap();
        assert_eq!(driver.live_count(HeadlessObject::DescriptorPool), 1);
        assert_eq!(pool.pool_sizes().len(), 2);

        drop(pool);
        assert_eq!(driver.live_count(HeadlessObject::DescriptorPool), 0);
    }

    #[test]
    fn set_is_allocated_from_selected_layout_and_freed_on_drop() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let pool = Arc::new(DescriptorPool::for_bindings(&device, &bindings(), 2).unwrap());

        let set = DescriptorSet::for_bindings(&pool, &bindings()).unwrap();
        assert_eq!(
            set.layout(),
            device
                .descriptor_set_layouts()
                .get_selected_layout(&bindings())
                .unwrap()
        );
        assert_eq!(driver.descriptor_set_count(pool.handle()), 1);
        assert_eq!(device.tracked_count(ObjectKind::DescriptorSet), 1);
        assert_eq!(pool.live_sets(), 1);

        drop(set);
        assert_eq!(driver.descriptor_set_count(pool.handle()), 0);
        assert_eq!(driver.live_count(HeadlessObject::DescriptorSet), 0);
        assert_eq!(device.tracked_count(ObjectKind::DescriptorSet), 0);
        assert_eq!(pool.live_sets(), 0);
    }

    #[test]
    fn set_writes_reach_the_driver() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let pool = Arc::new(DescriptorPool::for_bindings(&device, &bindings(), 1).unwrap());
        let set = pool
            .allocate(
                device
                    .descriptor_set_layouts()
                    .get_selected_layout(&bindings())
                    .unwrap(),
            )
            .unwrap();
        let uniform = Buffer::uniform(&device, 256).unwrap();
        let view = ImageView::create(
            &device,
            16,
            16,
            ImageFormat::color_attachment(vk::Format::R8G8B8A8_UNORM)
                .usage(vk::ImageUsageFlags::SAMPLED),
        )
        .unwrap();
        let sampler = vk::Sampler::from_raw(99);

        set.write_uniform_buffer(0, &uniform);
        set.write_sampled_image(1, &view, sampler);

        let writes = driver.take_descriptor_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(
            writes[0],
            DescriptorWrite {
                set: set.handle(),
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                resource: DescriptorResource::Buffer {
                    buffer: uniform.handle(),
                    offset: 0,
                    range: 256,
                },
            }
        );
        assert_eq!(
            writes[1].resource,
            DescriptorResource::Image {
                view: view.handle(),
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                sampler,
            }
        );
    }

    #[test]
    fn pool_refuses_sets_beyond_capacity() {
        let (device, _driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let pool = Arc::new(DescriptorPool::for_bindings(&device, &bindings(), 1).unwrap());

        let _first = DescriptorSet::for_bindings(&pool, &bindings()).unwrap();
        assert!(matches!(
            DescriptorSet::for_bindings(&pool, &bindings()),
            Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
        ));
        assert_eq!(pool.live_sets(), 1);
    }

    #[test]
    fn empty_layout_cannot_back_a_set() {
        let (device, _driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let pool = Arc::new(DescriptorPool::for_bindings(&device, &bindings(), 1).unwrap());

        assert!(matches!(
            DescriptorSet::for_bindings(&pool, &[]),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn reset_waits_for_live_sets() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let pool = Arc::new(DescriptorPool::for_bindings(&device, &bindings(), 1).unwrap());
        let set = DescriptorSet::for_bindings(&pool, &bindings()).unwrap();

        assert!(matches!(pool.reset(), Err(GpuError::InvalidState(_))));

        drop(set);
        pool.reset().unwrap();
        assert_eq!(driver.descriptor_set_count(pool.handle()), 0);
        // Capacity is available again.
        let _again = DescriptorSet::for_bindings(&pool, &bindings()).unwrap();
    }

    #[test]
    fn forced_teardown_frees_sets_before_the_pool() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let pool = Arc::new(DescriptorPool::for_bindings(&device, &bindings(), 1).unwrap());
        let set = DescriptorSet::for_bindings(&pool, &bindings()).unwrap();

        assert_eq!(device.destroy_tracked_objects(), 2);
        assert_eq!(driver.live_count(HeadlessObject::DescriptorSet), 0);
        assert_eq!(driver.live_count(HeadlessObject::DescriptorPool), 0);

        // Dropping the wrappers afterwards destroys nothing twice.
        drop(set);
        drop(pool);
        assert_eq!(driver.created_count(HeadlessObject::DescriptorSet), 1);
    }

    #[test]
    fn sets_bind_through_the_command_buffer() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let pool = Arc::new(DescriptorPool::for_bindings(&device, &bindings(), 1).unwrap());
        let set = DescriptorSet::for_bindings(&pool, &bindings()).unwrap();
        let layout = device
            .pipeline_layouts()
            .get_selected_layout(&[set.layout()], &[])
            .unwrap();
        let command_pool = CommandPool::new(&device).unwrap();
        let cmd = command_pool.allocate().unwrap();

        cmd.bind_descriptor_sets(layout, 0, &[set.handle()]);

        assert!(driver
            .take_commands()
            .contains(&RecordedCommand::BindDescriptorSets {
                layout,
                first_set: 0,
                sets: vec![set.handle()],
            }));
    }
}
