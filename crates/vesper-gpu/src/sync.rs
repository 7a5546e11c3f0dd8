//! Synchronization primitives.

use crate::device::Device;
use crate::error::Result;
use crate::registry::{TrackedKey, TrackedObject};
use ash::vk;
use std::sync::Arc;

/// A tracked fence.
pub struct Fence {
    device: Arc<Device>,
    key: TrackedKey,
    fence: vk::Fence,
}

impl Fence {
    /// Create a fence, optionally already signaled.
    pub fn new(device: &Arc<Device>, signaled: bool) -> Result<Self> {
        let fence = device.driver().create_fence(signaled)?;
        let key = device.track(TrackedObject::Fence(fence));
        Ok(Self {
            device: device.clone(),
            key,
            fence,
        })
    }

    /// Native handle.
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Block until the fence is signaled. There is no timeout.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&self) -> Result<()> {
        self.device.driver().wait_for_fence(self.fence, u64::MAX)
    }

    /// Reset to the unsignaled state.
    pub fn reset(&self) -> Result<()> {
        self.device.driver().reset_fence(self.fence)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.release(self.key);
    }
}

/// A tracked binary semaphore.
pub struct Semaphore {
    device: Arc<Device>,
    key: TrackedKey,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a semaphore.
    pub fn new(device: &Arc<Device>) -> Result<Self> {
        let semaphore = device.driver().create_semaphore()?;
        let key = device.track(TrackedObject::Semaphore(semaphore));
        Ok(Self {
            device: device.clone(),
            key,
            semaphore,
        })
    }

    /// Native handle.
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.release(self.key);
    }
}

/// Per-frame synchronization for a presenter loop.
pub struct FrameSync {
    /// Signaled when the swapchain image is available
    pub image_available: Semaphore,
    /// Signaled when rendering is complete
    pub render_finished: Semaphore,
    /// Signaled when the frame's submission has finished
    pub in_flight: Fence,
}

impl FrameSync {
    /// Create frame sync objects; the fence starts signaled.
    pub fn new(device: &Arc<Device>) -> Result<Self> {
        Ok(Self {
            image_available: Semaphore::new(device)?,
            render_finished: Semaphore::new(device)?,
            in_flight: Fence::new(device, true)?,
        })
    }

    /// Wait for the previous use of this frame, then reset the fence.
    pub fn wait_and_reset(&self) -> Result<()> {
        self.in_flight.wait()?;
        self.in_flight.reset()
    }
}

/// One render-finished semaphore per swapchain image.
///
/// Present may still wait on an image's semaphore after its frame fence has
/// signaled, so the semaphore is reused only when the same image comes back.
pub struct ImageSemaphores {
    device: Arc<Device>,
    semaphores: Vec<Semaphore>,
}

impl ImageSemaphores {
    /// Create `image_count` semaphores.
    pub fn new(device: &Arc<Device>, image_count: u32) -> Result<Self> {
        let mut semaphores = Self {
            device: device.clone(),
            semaphores: Vec::new(),
        };
        semaphores.resize(image_count)?;
        Ok(semaphores)
    }

    /// Grow or shrink to `image_count` semaphores. Returns whether the count
    /// changed. The device must be idle when shrinking.
    pub fn resize(&mut self, image_count: u32) -> Result<bool> {
        let count = image_count as usize;
        if count == self.semaphores.len() {
            return Ok(false);
        }
        self.semaphores.truncate(count);
        while self.semaphores.len() < count {
            self.semaphores.push(Semaphore::new(&self.device)?);
        }
        Ok(true)
    }

    /// Semaphore for a swapchain image.
    pub fn get(&self, image_index: u32) -> Option<&Semaphore> {
        self.semaphores.get(image_index as usize)
    }

    pub fn len(&self) -> usize {
        self.semaphores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.semaphores.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::headless::{headless_device, HeadlessConfig, HeadlessObject};
    use crate::registry::ObjectKind;

    #[test]
    fn frame_sync_objects_are_tracked() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();

        let sync = FrameSync::new(&device).unwrap();
        assert_eq!(device.tracked_count(ObjectKind::Semaphore), 2);
        assert_eq!(device.tracked_count(ObjectKind::Fence), 1);

        sync.wait_and_reset().unwrap();
        assert_eq!(driver.fence_wait_count(), 1);

        drop(sync);
        assert_eq!(driver.live_count(HeadlessObject::Semaphore), 0);
        assert_eq!(driver.live_count(HeadlessObject::Fence), 0);
    }

    #[test]
    fn forced_teardown_then_drop_destroys_once() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();

        let fence = Fence::new(&device, false).unwrap();
        assert_eq!(device.destroy_tracked_objects(), 1);
        assert_eq!(driver.live_count(HeadlessObject::Fence), 0);

        // The key is stale now; dropping must not destroy anything again.
        drop(fence);
        assert_eq!(device.tracked_count(ObjectKind::Fence), 0);
    }

    #[test]
    fn each_image_gets_its_own_semaphore() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();

        let mut semaphores = ImageSemaphores::new(&device, 3).unwrap();
        assert_eq!(semaphores.len(), 3);
        let first = semaphores.get(0).unwrap().handle();
        let last = semaphores.get(2).unwrap().handle();
        assert_ne!(first, last);
        assert!(semaphores.get(3).is_none());

        assert!(!semaphores.resize(3).unwrap());
        assert!(semaphores.resize(2).unwrap());
        assert_eq!(driver.live_count(HeadlessObject::Semaphore), 2);
        assert_eq!(semaphores.get(0).unwrap().handle(), first);

        drop(semaphores);
        assert_eq!(driver.live_count(HeadlessObject::Semaphore), 0);
    }
}
