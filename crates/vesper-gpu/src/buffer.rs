//! Buffers backed by allocator memory.

use crate::allocator::Allocation;
use crate::device::Device;
use crate::driver::BufferDesc;
use crate::error::{GpuError, Result};
use crate::registry::{TrackedKey, TrackedObject};
use ash::vk;
use std::sync::Arc;

/// Creation options for a [`Buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFormat {
    pub usage: vk::BufferUsageFlags,
    pub memory_properties: vk::MemoryPropertyFlags,
    /// Give the buffer its own memory block, freed when the buffer is.
    pub transient: bool,
}

impl Default for BufferFormat {
    fn default() -> Self {
        Self {
            usage: vk::BufferUsageFlags::empty(),
            memory_properties: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            transient: false,
        }
    }
}

impl BufferFormat {
    pub fn usage(mut self, usage: vk::BufferUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    pub fn memory_properties(mut self, properties: vk::MemoryPropertyFlags) -> Self {
        self.memory_properties = properties;
        self
    }

    pub fn transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }
}

/// A buffer with memory bound from the device allocator.
pub struct Buffer {
    device: Arc<Device>,
    key: TrackedKey,
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    format: BufferFormat,
    allocation: Allocation,
}

impl Buffer {
    /// Create a buffer of `size` bytes.
    pub fn new(device: &Arc<Device>, size: vk::DeviceSize, format: BufferFormat) -> Result<Self> {
        let driver = device.driver();
        let buffer = driver.create_buffer(&BufferDesc {
            size,
            usage: format.usage,
        })?;

        let allocation = match device
            .allocator()
            .allocate_buffer(buffer, format.transient, format.memory_properties)
            .and_then(|allocation| {
                driver.bind_buffer_memory(buffer, allocation.memory, allocation.offset)?;
                Ok(allocation)
            }) {
            Ok(allocation) => allocation,
            Err(e) => {
                driver.destroy_buffer(buffer);
                if format.transient {
                    device.allocator().free_transient_buffer(buffer);
                }
                return Err(e);
            }
        };

        let key = device.track(TrackedObject::Buffer {
            buffer,
            transient: format.transient,
        });

        Ok(Self {
            device: device.clone(),
            key,
            buffer,
            size,
            format,
            allocation,
        })
    }

    /// Host-visible vertex buffer.
    pub fn vertex(device: &Arc<Device>, size: vk::DeviceSize) -> Result<Self> {
        Self::new(
            device,
            size,
            BufferFormat::default().usage(vk::BufferUsageFlags::VERTEX_BUFFER),
        )
    }

    /// Host-visible index buffer.
    pub fn index(device: &Arc<Device>, size: vk::DeviceSize) -> Result<Self> {
        Self::new(
            device,
            size,
            BufferFormat::default().usage(vk::BufferUsageFlags::INDEX_BUFFER),
        )
    }

    /// Host-visible uniform buffer.
    pub fn uniform(device: &Arc<Device>, size: vk::DeviceSize) -> Result<Self> {
        Self::new(
            device,
            size,
            BufferFormat::default().usage(vk::BufferUsageFlags::UNIFORM_BUFFER),
        )
    }

    /// Transient host-visible transfer source.
    pub fn staging(device: &Arc<Device>, size: vk::DeviceSize) -> Result<Self> {
        Self::new(
            device,
            size,
            BufferFormat::default()
                .usage(vk::BufferUsageFlags::TRANSFER_SRC)
                .transient(true),
        )
    }

    /// Native handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Requested size in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn format(&self) -> &BufferFormat {
        &self.format
    }

    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    /// Copy `data` into the buffer at `offset`. The memory must be host visible.
    pub fn write_bytes(&self, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        if !self
            .allocation
            .properties
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            return Err(GpuError::InvalidState(
                "buffer memory is not host visible".into(),
            ));
        }
        let len = data.len() as vk::DeviceSize;
        if offset + len > self.size {
            return Err(GpuError::InvalidState(format!(
                "write of {len} bytes at {offset} overflows buffer of {} bytes",
                self.size
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        let driver = self.device.driver();
        let ptr = driver.map_memory(self.allocation.memory, self.allocation.offset + offset, len)?;
        // SAFETY: the mapping covers `len` bytes starting at `ptr`, and `data`
        // cannot alias device memory.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }
        driver.unmap_memory(self.allocation.memory);
        Ok(())
    }

    /// Copy a slice of plain values into the buffer at `offset`.
    pub fn write_slice<T: bytemuck::Pod>(&self, offset: vk::DeviceSize, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.device.release(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::headless::{headless_device, HeadlessConfig, HeadlessObject};

    const MIB: vk::DeviceSize = 1024 * 1024;

    #[test]
    fn buffers_sub_allocate_from_one_block() {
        let (device, driver) = headless_device(
            HeadlessConfig::default(),
            DeviceConfig::default().buffer_block_size(4 * MIB),
        )
        .unwrap();

        let buffers: Vec<Buffer> = (0..3)
            .map(|_| Buffer::vertex(&device, MIB).unwrap())
            .collect();

        assert_eq!(driver.memory_allocation_count(), 1);
        assert!(driver.memory_sizes()[0] >= 4 * MIB);
        for pair in buffers.windows(2) {
            assert!(pair[0].allocation().end() <= pair[1].allocation().offset);
        }
    }

    #[test]
    fn write_reaches_mapped_memory() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let buffer = Buffer::uniform(&device, 64).unwrap();

        buffer.write_slice(16, &[1.0f32, 2.0]).unwrap();

        let allocation = buffer.allocation();
        let bytes = driver.memory_contents(allocation.memory, allocation.offset + 16, 8);
        assert_eq!(bytes, bytemuck::cast_slice::<f32, u8>(&[1.0, 2.0]));
    }

    #[test]
    fn write_past_end_is_rejected() {
        let (device, _driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let buffer = Buffer::uniform(&device, 8).unwrap();

        assert!(matches!(
            buffer.write_bytes(4, &[0; 8]),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn device_local_buffer_cannot_be_written() {
        let (device, _driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();
        let buffer = Buffer::new(
            &device,
            64,
            BufferFormat::default()
                .usage(vk::BufferUsageFlags::STORAGE_BUFFER)
                .memory_properties(vk::MemoryPropertyFlags::DEVICE_LOCAL),
        )
        .unwrap();

        assert!(buffer.write_bytes(0, &[1, 2, 3]).is_err());
    }

    #[test]
    fn staging_buffer_owns_its_block() {
        let (device, driver) =
            headless_device(HeadlessConfig::default(), DeviceConfig::default()).unwrap();

        let staging = Buffer::staging(&device, 256).unwrap();
        assert_eq!(device.allocator().buffer_report().transient_blocks, 1);
        assert_eq!(driver.memory_sizes(), vec![256]);

        drop(staging);
        assert_eq!(driver.memory_allocation_count(), 0);
        assert_eq!(driver.live_count(HeadlessObject::Buffer), 0);
    }
}
