//! GPU memory allocator integration
//!
//! Thin wrapper around the VMA allocator. Residency decisions are driven by
//! the engine-level [`ResourceUsage`] class, translated here into VMA usage
//! and host-access flags.

use ash::vk;
use std::sync::Arc;
use vk_mem::Alloc;

use crate::render::types::ResourceUsage;
use crate::render::vulkan::context::{VulkanError, VulkanResult};

/// VMA usage plus host-access flags for one residency class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidencyPlan {
    /// VMA memory usage hint
    pub usage: vk_mem::MemoryUsage,
    /// Host-access and persistent-map flags
    pub flags: vk_mem::AllocationCreateFlags,
}

/// Translate a residency class into its VMA allocation plan.
pub fn residency_plan(resource_usage: ResourceUsage) -> ResidencyPlan {
    match resource_usage {
        ResourceUsage::Default | ResourceUsage::Immutable => ResidencyPlan {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            flags: vk_mem::AllocationCreateFlags::empty(),
        },
        ResourceUsage::Dynamic => ResidencyPlan {
            usage: vk_mem::MemoryUsage::Auto,
            flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE
                | vk_mem::AllocationCreateFlags::MAPPED,
        },
        ResourceUsage::Staging => ResidencyPlan {
            usage: vk_mem::MemoryUsage::AutoPreferHost,
            flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE
                | vk_mem::AllocationCreateFlags::MAPPED,
        },
    }
}

/// Shared handle to the device memory allocator.
///
/// Cloned into every resource so buffers and images can free their
/// allocation in `Drop` without holding a device reference.
#[derive(Clone)]
pub struct MemoryAllocator {
    allocator: Arc<vk_mem::Allocator>,
}

impl MemoryAllocator {
    /// Create the allocator for a logical device.
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> VulkanResult<Self> {
        let create_info = vk_mem::AllocatorCreateInfo::new(instance, device, physical_device);
        let allocator = vk_mem::Allocator::new(create_info)
            .map_err(|e| VulkanError::AllocationFailed(format!("allocator creation: {:?}", e)))?;
        Ok(Self {
            allocator: Arc::new(allocator),
        })
    }

    /// Create a buffer with memory from the residency class.
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        resource_usage: ResourceUsage,
    ) -> VulkanResult<(vk::Buffer, vk_mem::Allocation)> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let plan = residency_plan(resource_usage);
        let alloc_info = vk_mem::AllocationCreateInfo {
            usage: plan.usage,
            flags: plan.flags,
            ..Default::default()
        };

        unsafe {
            self.allocator
                .create_buffer(&buffer_info, &alloc_info)
                .map_err(VulkanError::Api)
        }
    }

    /// Create an image with GPU-resident memory.
    pub fn create_image(
        &self,
        image_info: &vk::ImageCreateInfo,
    ) -> VulkanResult<(vk::Image, vk_mem::Allocation)> {
        let alloc_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };

        unsafe {
            self.allocator
                .create_image(image_info, &alloc_info)
                .map_err(VulkanError::Api)
        }
    }

    /// Destroy a buffer and free its allocation.
    pub fn destroy_buffer(&self, buffer: vk::Buffer, allocation: &mut vk_mem::Allocation) {
        unsafe {
            self.allocator.destroy_buffer(buffer, allocation);
        }
    }

    /// Destroy an image and free its allocation.
    pub fn destroy_image(&self, image: vk::Image, allocation: &mut vk_mem::Allocation) {
        unsafe {
            self.allocator.destroy_image(image, allocation);
        }
    }

    /// Map an allocation, returning the host pointer.
    pub fn map_memory(&self, allocation: &mut vk_mem::Allocation) -> VulkanResult<*mut u8> {
        unsafe { self.allocator.map_memory(allocation).map_err(VulkanError::Api) }
    }

    /// Unmap a previously mapped allocation.
    pub fn unmap_memory(&self, allocation: &mut vk_mem::Allocation) {
        unsafe {
            self.allocator.unmap_memory(allocation);
        }
    }

    /// Flush a mapped range so writes become device-visible.
    pub fn flush_allocation(
        &self,
        allocation: &vk_mem::Allocation,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VulkanResult<()> {
        self.allocator
            .flush_allocation(allocation, offset as usize, size as usize)
            .map_err(VulkanError::Api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_resident_classes_have_no_host_access() {
        for class in [ResourceUsage::Default, ResourceUsage::Immutable] {
            let plan = residency_plan(class);
            assert!(plan.flags.is_empty());
        }
    }

    #[test]
    fn cpu_visible_classes_are_persistently_mapped() {
        for class in [ResourceUsage::Dynamic, ResourceUsage::Staging] {
            let plan = residency_plan(class);
            assert!(plan.flags.contains(vk_mem::AllocationCreateFlags::MAPPED));
            assert!(plan
                .flags
                .contains(vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE));
        }
    }
}
