//! GPU capability detection.

use ash::vk;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities and limits.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Largest width or height of a 2D image
    pub max_image_dimension_2d: u32,
    /// Sample counts usable for colour framebuffer attachments
    pub framebuffer_color_sample_counts: vk::SampleCountFlags,
    /// Sample counts usable for depth framebuffer attachments
    pub framebuffer_depth_sample_counts: vk::SampleCountFlags,
    /// Memory types in driver order
    pub memory_types: Vec<vk::MemoryType>,
    /// Memory heaps in driver order
    pub memory_heaps: Vec<vk::MemoryHeap>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            api_version: properties.api_version,
            max_image_dimension_2d: properties.limits.max_image_dimension2_d,
            framebuffer_color_sample_counts: properties.limits.framebuffer_color_sample_counts,
            framebuffer_depth_sample_counts: properties.limits.framebuffer_depth_sample_counts,
            memory_types: memory_properties.memory_types
                [..memory_properties.memory_type_count as usize]
                .to_vec(),
            memory_heaps: memory_properties.memory_heaps
                [..memory_properties.memory_heap_count as usize]
                .to_vec(),
        }
    }

    /// Index of the first memory type allowed by `type_bits` whose flags
    /// contain every bit of `properties`.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        self.memory_types
            .iter()
            .enumerate()
            .find(|(i, ty)| {
                (type_bits & (1 << i)) != 0 && ty.property_flags.contains(properties)
            })
            .map(|(i, _)| i as u32)
    }

    /// Whether any memory type allowed by `type_bits` supports `properties`.
    pub fn is_memory_property_supported(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> bool {
        self.find_memory_type(type_bits, properties).is_some()
    }

    /// Highest sample count not above `requested` that colour attachments support.
    ///
    /// Drivers that report no counts at all only support a single sample.
    pub fn supported_color_samples(&self, requested: vk::SampleCountFlags) -> vk::SampleCountFlags {
        let mut samples = requested.as_raw().max(1);
        while samples > 1
            && !self
                .framebuffer_color_sample_counts
                .contains(vk::SampleCountFlags::from_raw(samples))
        {
            samples >>= 1;
        }
        vk::SampleCountFlags::from_raw(samples)
    }

    /// Device-local memory in MB.
    pub fn device_local_memory_mb(&self) -> u64 {
        self.memory_heaps
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum()
    }

    /// Get a summary string for logging.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{}, {}MB VRAM, max 2D image {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb(),
            self.max_image_dimension_2d,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(types: &[vk::MemoryPropertyFlags]) -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Other(0),
            device_name: "test".into(),
            api_version: vk::API_VERSION_1_3,
            max_image_dimension_2d: 16384,
            framebuffer_color_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_2
                | vk::SampleCountFlags::TYPE_4,
            framebuffer_depth_sample_counts: vk::SampleCountFlags::TYPE_1,
            memory_types: types
                .iter()
                .map(|&property_flags| vk::MemoryType {
                    property_flags,
                    heap_index: 0,
                })
                .collect(),
            memory_heaps: vec![vk::MemoryHeap {
                size: 256 * 1024 * 1024,
                flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
            }],
        }
    }

    #[test]
    fn vendor_from_pci_id() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn find_memory_type_respects_type_bits_and_flags() {
        let caps = caps(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);

        assert_eq!(
            caps.find_memory_type(0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
        assert_eq!(
            caps.find_memory_type(0b110, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(2)
        );
        assert_eq!(
            caps.find_memory_type(0b001, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
        assert!(!caps.is_memory_property_supported(0b011, vk::MemoryPropertyFlags::LAZILY_ALLOCATED));
    }

    #[test]
    fn unsupported_sample_count_steps_down() {
        let caps = caps(&[]);
        assert_eq!(
            caps.supported_color_samples(vk::SampleCountFlags::TYPE_8),
            vk::SampleCountFlags::TYPE_4
        );
        assert_eq!(
            caps.supported_color_samples(vk::SampleCountFlags::TYPE_2),
            vk::SampleCountFlags::TYPE_2
        );
    }

    #[test]
    fn empty_sample_counts_mean_single_sample() {
        let mut caps = caps(&[]);
        caps.framebuffer_color_sample_counts = vk::SampleCountFlags::empty();
        assert_eq!(
            caps.supported_color_samples(vk::SampleCountFlags::TYPE_8),
            vk::SampleCountFlags::TYPE_1
        );
    }
}
