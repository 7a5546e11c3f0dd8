//! Registry of live native objects.
//!
//! Every wrapper that owns a native object registers it here and keeps the
//! returned [`TrackedKey`]. Keys are generation counted, so releasing a key
//! twice, or releasing it after a forced teardown, finds nothing and destroys
//! nothing.

use crate::allocator::Allocator;
use crate::driver::Driver;
use ash::vk;
use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Handle to a registered native object.
    pub struct TrackedKey;
}

/// Kinds of tracked objects, in teardown order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    CommandPool,
    Framebuffer,
    DescriptorSet,
    DescriptorPool,
    ImageView,
    Swapchain,
    RenderPass,
    Image,
    Buffer,
    Fence,
    Semaphore,
}

/// A native object owned through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedObject {
    Swapchain(vk::SwapchainKHR),
    CommandPool(vk::CommandPool),
    Framebuffer(vk::Framebuffer),
    /// A set is returned to the pool it came from.
    DescriptorSet {
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    },
    DescriptorPool(vk::DescriptorPool),
    ImageView(vk::ImageView),
    RenderPass(vk::RenderPass),
    /// A transient image owns its memory block, which is freed with it.
    Image { image: vk::Image, transient: bool },
    Buffer { buffer: vk::Buffer, transient: bool },
    Fence(vk::Fence),
    Semaphore(vk::Semaphore),
}

impl TrackedObject {
    /// Kind of this object.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Swapchain(_) => ObjectKind::Swapchain,
            Self::CommandPool(_) => ObjectKind::CommandPool,
            Self::Framebuffer(_) => ObjectKind::Framebuffer,
            Self::DescriptorSet { .. } => ObjectKind::DescriptorSet,
            Self::DescriptorPool(_) => ObjectKind::DescriptorPool,
            Self::ImageView(_) => ObjectKind::ImageView,
            Self::RenderPass(_) => ObjectKind::RenderPass,
            Self::Image { .. } => ObjectKind::Image,
            Self::Buffer { .. } => ObjectKind::Buffer,
            Self::Fence(_) => ObjectKind::Fence,
            Self::Semaphore(_) => ObjectKind::Semaphore,
        }
    }

    /// Destroy the native object.
    pub(crate) fn destroy(self, driver: &dyn Driver, allocator: &Allocator) {
        match self {
            Self::Swapchain(swapchain) => driver.destroy_swapchain(swapchain),
            Self::CommandPool(pool) => driver.destroy_command_pool(pool),
            Self::Framebuffer(framebuffer) => driver.destroy_framebuffer(framebuffer),
            Self::DescriptorSet { pool, set } => driver.free_descriptor_set(pool, set),
            Self::DescriptorPool(pool) => driver.destroy_descriptor_pool(pool),
            Self::ImageView(view) => driver.destroy_image_view(view),
            Self::RenderPass(render_pass) => driver.destroy_render_pass(render_pass),
            Self::Image { image, transient } => {
                driver.destroy_image(image);
                if transient {
                    allocator.free_transient_image(image);
                }
            }
            Self::Buffer { buffer, transient } => {
                driver.destroy_buffer(buffer);
                if transient {
                    allocator.free_transient_buffer(buffer);
                }
            }
            Self::Fence(fence) => driver.destroy_fence(fence),
            Self::Semaphore(semaphore) => driver.destroy_semaphore(semaphore),
        }
    }
}

/// Slot-map backed registry of tracked objects.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    objects: SlotMap<TrackedKey, TrackedObject>,
}

impl ResourceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object.
    pub fn insert(&mut self, object: TrackedObject) -> TrackedKey {
        self.objects.insert(object)
    }

    /// Remove an object, returning it if the key was still live.
    pub fn remove(&mut self, key: TrackedKey) -> Option<TrackedObject> {
        self.objects.remove(key)
    }

    /// Whether the key refers to a live object.
    pub fn contains(&self, key: TrackedKey) -> bool {
        self.objects.contains_key(key)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether no objects are registered.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Number of live objects of one kind.
    pub fn count(&self, kind: ObjectKind) -> usize {
        self.objects.values().filter(|o| o.kind() == kind).count()
    }

    /// Remove every object, ordered so dependents come before what they use.
    pub fn drain_for_teardown(&mut self) -> Vec<TrackedObject> {
        let mut objects: Vec<TrackedObject> = self.objects.drain().map(|(_, o)| o).collect();
        objects.sort_by_key(TrackedObject::kind);
        objects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn released_key_cannot_be_released_again() {
        let mut registry = ResourceRegistry::new();
        let key = registry.insert(TrackedObject::Fence(vk::Fence::from_raw(1)));

        assert!(registry.contains(key));
        assert!(registry.remove(key).is_some());
        assert!(registry.remove(key).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_key_does_not_hit_reused_slot() {
        let mut registry = ResourceRegistry::new();
        let old = registry.insert(TrackedObject::Fence(vk::Fence::from_raw(1)));
        registry.remove(old);
        let new = registry.insert(TrackedObject::Fence(vk::Fence::from_raw(2)));

        assert_ne!(old, new);
        assert!(registry.remove(old).is_none());
        assert!(registry.contains(new));
    }

    #[test]
    fn teardown_orders_dependents_first() {
        let mut registry = ResourceRegistry::new();
        registry.insert(TrackedObject::Image {
            image: vk::Image::from_raw(1),
            transient: false,
        });
        registry.insert(TrackedObject::RenderPass(vk::RenderPass::from_raw(2)));
        registry.insert(TrackedObject::ImageView(vk::ImageView::from_raw(3)));
        registry.insert(TrackedObject::Framebuffer(vk::Framebuffer::from_raw(4)));

        let kinds: Vec<ObjectKind> = registry
            .drain_for_teardown()
            .iter()
            .map(TrackedObject::kind)
            .collect();

        assert_eq!(
            kinds,
            vec![
                ObjectKind::Framebuffer,
                ObjectKind::ImageView,
                ObjectKind::RenderPass,
                ObjectKind::Image,
            ]
        );
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn descriptor_sets_are_freed_before_their_pool() {
        let mut registry = ResourceRegistry::new();
        let pool = vk::DescriptorPool::from_raw(1);
        registry.insert(TrackedObject::DescriptorPool(pool));
        registry.insert(TrackedObject::DescriptorSet {
            pool,
            set: vk::DescriptorSet::from_raw(2),
        });

        let kinds: Vec<ObjectKind> = registry
            .drain_for_teardown()
            .iter()
            .map(TrackedObject::kind)
            .collect();

        assert_eq!(
            kinds,
            vec![ObjectKind::DescriptorSet, ObjectKind::DescriptorPool]
        );
    }
}
