//! Window surface handle.

use crate::ash_driver::AshDriver;
use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;

/// The window surface a device was built for.
///
/// The surface itself belongs to the driver and is destroyed with it, after
/// every swapchain created on it is gone. Holding a `Surface` keeps the
/// driver alive.
#[derive(Clone)]
pub struct Surface {
    driver: Arc<AshDriver>,
    surface: vk::SurfaceKHR,
}

impl Surface {
    /// Surface of a driver created for a window.
    pub fn from_driver(driver: &Arc<AshDriver>) -> Result<Self> {
        let surface = driver.surface();
        if surface == vk::SurfaceKHR::null() {
            return Err(GpuError::SurfaceCreation(
                "driver was created without a window".into(),
            ));
        }
        Ok(Self {
            driver: driver.clone(),
            surface,
        })
    }

    /// Native handle.
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Queue family that presents to this surface.
    pub fn queue_family(&self) -> u32 {
        self.driver.queue_family()
    }
}
