//! Block allocator for device memory.
//!
//! Buffers and images are sub-allocated from large memory blocks instead of
//! receiving a native allocation each. Sub-ranges are never reclaimed
//! individually; only transient allocations, which get a block of their own,
//! can be released before the allocator is destroyed.

use crate::capabilities::GpuCapabilities;
use crate::driver::Driver;
use crate::error::{GpuError, Result};
use ash::vk;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// Block sizes used by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Size of each buffer memory block.
    pub buffer_block_size: vk::DeviceSize,
    /// Size of each image memory block.
    pub image_block_size: vk::DeviceSize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            buffer_block_size: 16 * 1024 * 1024,
            image_block_size: 64 * 1024 * 1024,
        }
    }
}

impl AllocatorConfig {
    /// Set the buffer block size.
    pub fn buffer_block_size(mut self, size: vk::DeviceSize) -> Self {
        self.buffer_block_size = size;
        self
    }

    /// Set the image block size.
    pub fn image_block_size(mut self, size: vk::DeviceSize) -> Self {
        self.image_block_size = size;
        self
    }
}

/// A sub-range of a memory block handed out to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub memory_type_index: u32,
    /// Properties actually obtained, after any fallback.
    pub properties: vk::MemoryPropertyFlags,
    pub transient: bool,
}

impl Allocation {
    /// End of the allocated range (exclusive).
    pub fn end(&self) -> vk::DeviceSize {
        self.offset + self.size
    }
}

struct MemoryBlock {
    memory_type_index: u32,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    offset: vk::DeviceSize,
    allocation_count: u32,
}

impl MemoryBlock {
    fn has_available(&self, size: vk::DeviceSize, alignment: vk::DeviceSize) -> bool {
        let aligned = self.offset.next_multiple_of(alignment);
        aligned <= self.size && self.size - aligned >= size
    }

    fn sub_allocate(&mut self, size: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
        let aligned = self.offset.next_multiple_of(alignment);
        self.offset = aligned + size;
        self.allocation_count += 1;
        debug_assert!(self.offset <= self.size);
        aligned
    }

    fn usage(&self) -> BlockUsage {
        BlockUsage {
            memory_type_index: self.memory_type_index,
            size: self.size,
            used: self.offset,
            allocation_count: self.allocation_count,
        }
    }
}

struct MemoryRequest {
    size: vk::DeviceSize,
    alignment: vk::DeviceSize,
    memory_type_index: u32,
    transient: bool,
}

/// Block list for one resource class.
struct BlockList<K> {
    kind: &'static str,
    block_size: vk::DeviceSize,
    blocks: Vec<MemoryBlock>,
    transients: HashMap<K, MemoryBlock>,
}

impl<K: Hash + Eq + Copy + fmt::Debug> BlockList<K> {
    fn new(kind: &'static str, block_size: vk::DeviceSize) -> Self {
        Self {
            kind,
            block_size,
            blocks: Vec::new(),
            transients: HashMap::new(),
        }
    }

    fn create_block(
        &self,
        driver: &dyn Driver,
        memory_type_index: u32,
        size: vk::DeviceSize,
    ) -> Result<MemoryBlock> {
        let memory = driver
            .allocate_memory(size, memory_type_index)
            .map_err(|e| {
                GpuError::AllocationFailed(format!(
                    "{} block of {size} bytes (memory type {memory_type_index}): {e}",
                    self.kind
                ))
            })?;

        Ok(MemoryBlock {
            memory_type_index,
            memory,
            size,
            offset: 0,
            allocation_count: 0,
        })
    }

    fn allocate(
        &mut self,
        driver: &dyn Driver,
        object: K,
        request: &MemoryRequest,
    ) -> Result<(vk::DeviceMemory, vk::DeviceSize)> {
        let alignment = request.alignment.max(1);

        if request.transient {
            let mut block = self.create_block(driver, request.memory_type_index, request.size)?;
            let offset = block.sub_allocate(request.size, alignment);
            let memory = block.memory;
            tracing::debug!(
                "Transient {} block for {object:?}: {} bytes",
                self.kind,
                request.size
            );
            if let Some(previous) = self.transients.insert(object, block) {
                driver.free_memory(previous.memory);
            }
            return Ok((memory, offset));
        }

        let index = if request.size >= self.block_size {
            None
        } else {
            self.blocks.iter().position(|block| {
                block.memory_type_index == request.memory_type_index
                    && block.has_available(request.size, alignment)
            })
        };

        let index = match index {
            Some(index) => index,
            None => {
                let size = self.block_size.max(request.size);
                let block = self.create_block(driver, request.memory_type_index, size)?;
                self.blocks.push(block);
                tracing::info!(
                    "Allocated {} memory block: {size} bytes, memory type {} ({} blocks)",
                    self.kind,
                    request.memory_type_index,
                    self.blocks.len()
                );
                self.blocks.len() - 1
            }
        };

        let block = &mut self.blocks[index];
        let offset = block.sub_allocate(request.size, alignment);
        Ok((block.memory, offset))
    }

    fn free_transient(&mut self, driver: &dyn Driver, object: K) -> bool {
        match self.transients.remove(&object) {
            Some(block) => {
                driver.free_memory(block.memory);
                true
            }
            None => false,
        }
    }

    fn report(&self) -> BlockReport {
        BlockReport {
            kind: self.kind,
            block_size: self.block_size,
            blocks: self.blocks.iter().map(MemoryBlock::usage).collect(),
            transient_blocks: self.transients.len(),
        }
    }

    fn destroy(&mut self, driver: &dyn Driver) {
        for block in self.blocks.drain(..) {
            driver.free_memory(block.memory);
        }
        for (_, block) in self.transients.drain() {
            driver.free_memory(block.memory);
        }
    }
}

/// Usage of one memory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockUsage {
    pub memory_type_index: u32,
    pub size: vk::DeviceSize,
    pub used: vk::DeviceSize,
    pub allocation_count: u32,
}

impl BlockUsage {
    /// Used fraction of the block in percent.
    pub fn percent_used(&self) -> f64 {
        if self.size == 0 {
            0.0
        } else {
            self.used as f64 / self.size as f64 * 100.0
        }
    }
}

/// Snapshot of one block list.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockReport {
    pub kind: &'static str,
    pub block_size: vk::DeviceSize,
    pub blocks: Vec<BlockUsage>,
    pub transient_blocks: usize,
}

impl BlockReport {
    /// Number of native allocations backing this list.
    pub fn native_allocations(&self) -> usize {
        self.blocks.len() + self.transient_blocks
    }
}

impl fmt::Display for BlockReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} blocks ({} bytes each), {} transient",
            self.kind, self.block_size, self.transient_blocks
        )?;
        for (i, block) in self.blocks.iter().enumerate() {
            writeln!(
                f,
                "  [{i}] type {}: {} allocations, {:.1}% used",
                block.memory_type_index,
                block.allocation_count,
                block.percent_used()
            )?;
        }
        Ok(())
    }
}

/// Device memory allocator with separate block lists for buffers and images.
pub struct Allocator {
    driver: Arc<dyn Driver>,
    capabilities: GpuCapabilities,
    buffers: Mutex<BlockList<vk::Buffer>>,
    images: Mutex<BlockList<vk::Image>>,
}

impl Allocator {
    /// Create an allocator.
    pub fn new(
        driver: Arc<dyn Driver>,
        capabilities: GpuCapabilities,
        config: AllocatorConfig,
    ) -> Self {
        tracing::info!(
            "Allocator block sizes: buffers {} bytes, images {} bytes",
            config.buffer_block_size,
            config.image_block_size
        );
        Self {
            driver,
            capabilities,
            buffers: Mutex::new(BlockList::new("buffer", config.buffer_block_size)),
            images: Mutex::new(BlockList::new("image", config.image_block_size)),
        }
    }

    /// Pick a memory type, replacing a device-local request with host-visible
    /// memory when no allowed type is device local.
    fn resolve_memory_type(
        &self,
        requirements: &vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<(u32, vk::MemoryPropertyFlags)> {
        let type_bits = requirements.memory_type_bits;
        let mut properties = properties;

        if properties.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            && !self
                .capabilities
                .is_memory_property_supported(type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
        {
            tracing::info!("Device-local memory unavailable for type bits {type_bits:#x}, using host-visible memory");
            properties = (properties & !vk::MemoryPropertyFlags::DEVICE_LOCAL)
                | vk::MemoryPropertyFlags::HOST_VISIBLE;
        }

        let index = self
            .capabilities
            .find_memory_type(type_bits, properties)
            .ok_or(GpuError::NoCompatibleMemoryType {
                type_bits,
                properties,
            })?;

        Ok((index, properties))
    }

    /// Allocate and return memory suitable for `buffer`. The caller binds it.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn allocate_buffer(
        &self,
        buffer: vk::Buffer,
        transient: bool,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Allocation> {
        let requirements = self.driver.buffer_memory_requirements(buffer);
        let (memory_type_index, properties) = self.resolve_memory_type(&requirements, properties)?;
        let request = MemoryRequest {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_index,
            transient,
        };

        let (memory, offset) = self.buffers.lock().allocate(&*self.driver, buffer, &request)?;

        Ok(Allocation {
            memory,
            offset,
            size: requirements.size,
            memory_type_index,
            properties,
            transient,
        })
    }

    /// Allocate and return memory suitable for `image`. The caller binds it.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn allocate_image(
        &self,
        image: vk::Image,
        transient: bool,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Allocation> {
        let requirements = self.driver.image_memory_requirements(image);
        let (memory_type_index, properties) = self.resolve_memory_type(&requirements, properties)?;
        let request = MemoryRequest {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_index,
            transient,
        };

        let (memory, offset) = self.images.lock().allocate(&*self.driver, image, &request)?;

        Ok(Allocation {
            memory,
            offset,
            size: requirements.size,
            memory_type_index,
            properties,
            transient,
        })
    }

    /// Release the transient block owned by `buffer`. Returns false if there is none.
    pub fn free_transient_buffer(&self, buffer: vk::Buffer) -> bool {
        self.buffers.lock().free_transient(&*self.driver, buffer)
    }

    /// Release the transient block owned by `image`. Returns false if there is none.
    pub fn free_transient_image(&self, image: vk::Image) -> bool {
        self.images.lock().free_transient(&*self.driver, image)
    }

    /// Current buffer block usage.
    pub fn buffer_report(&self) -> BlockReport {
        self.buffers.lock().report()
    }

    /// Current image block usage.
    pub fn image_report(&self) -> BlockReport {
        self.images.lock().report()
    }

    /// Free every block. Resources still bound to them must already be destroyed.
    pub fn destroy(&self) {
        self.buffers.lock().destroy(&*self.driver);
        self.images.lock().destroy(&*self.driver);
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        self.destroy();
    }
}
