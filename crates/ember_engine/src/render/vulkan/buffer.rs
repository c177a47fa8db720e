//! Buffer resources and the pinned staging buffer
//!
//! All buffer memory comes from the VMA allocator. GPU-resident buffers are
//! filled through the pinned staging buffer owned by the device; CPU-visible
//! buffers are written directly through their persistent mapping.

use ash::vk;

use crate::render::types::{BufferDescriptor, BufferUsage, ResourceUsage};
use crate::render::vulkan::allocator::MemoryAllocator;
use crate::render::vulkan::context::{VulkanError, VulkanResult};

/// Capacity of the pinned staging buffer used by the upload path
pub const STAGING_BUFFER_SIZE: vk::DeviceSize = 128 * 1024 * 1024;

/// Round `value` up to a multiple of `alignment` (a power of two).
pub fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Translate engine buffer usage into Vulkan usage flags.
///
/// GPU-resident classes additionally get TRANSFER_DST so the staging upload
/// path can write them; the Staging class gets TRANSFER_SRC.
pub fn translate_buffer_usage(
    usage: BufferUsage,
    resource_usage: ResourceUsage,
) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    match resource_usage {
        ResourceUsage::Default | ResourceUsage::Immutable => {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        ResourceUsage::Staging => {
            flags |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        ResourceUsage::Dynamic => {}
    }
    flags
}

/// One chunk of a staged upload: source offset and byte count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadChunk {
    /// Offset into the source data
    pub src_offset: u64,
    /// Bytes to copy in this chunk
    pub size: u64,
}

/// Iterator splitting an upload into chunks no larger than the staging
/// buffer capacity.
pub struct UploadChunks {
    remaining: u64,
    offset: u64,
    capacity: u64,
}

impl UploadChunks {
    /// Split `total_size` bytes into chunks of at most `capacity` bytes.
    pub fn new(total_size: u64, capacity: u64) -> Self {
        debug_assert!(capacity > 0);
        Self {
            remaining: total_size,
            offset: 0,
            capacity,
        }
    }
}

impl Iterator for UploadChunks {
    type Item = UploadChunk;

    fn next(&mut self) -> Option<UploadChunk> {
        if self.remaining == 0 {
            return None;
        }
        let size = self.remaining.min(self.capacity);
        let chunk = UploadChunk {
            src_offset: self.offset,
            size,
        };
        self.offset += size;
        self.remaining -= size;
        Some(chunk)
    }
}

/// Buffer resource backed by a VMA allocation
pub struct Buffer {
    allocator: MemoryAllocator,
    buffer: vk::Buffer,
    allocation: vk_mem::Allocation,
    size: vk::DeviceSize,
    stride: u32,
    resource_usage: ResourceUsage,
}

impl Buffer {
    /// Create a buffer from its descriptor.
    pub fn new(allocator: &MemoryAllocator, descriptor: &BufferDescriptor) -> VulkanResult<Self> {
        if descriptor.size == 0 {
            return Err(VulkanError::InvalidOperation {
                reason: "buffer size must be nonzero".to_string(),
            });
        }

        let usage = translate_buffer_usage(descriptor.usage, descriptor.resource_usage);
        let (buffer, allocation) =
            allocator.create_buffer(descriptor.size, usage, descriptor.resource_usage)?;

        Ok(Self {
            allocator: allocator.clone(),
            buffer,
            allocation,
            size: descriptor.size,
            stride: descriptor.stride,
            resource_usage: descriptor.resource_usage,
        })
    }

    /// Write host data directly through the buffer's mapping.
    ///
    /// Only valid for CPU-visible residency classes; GPU-resident buffers
    /// must go through the device's staged upload path.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> VulkanResult<()> {
        if !matches!(
            self.resource_usage,
            ResourceUsage::Dynamic | ResourceUsage::Staging
        ) {
            return Err(VulkanError::InvalidOperation {
                reason: "direct write to a GPU-resident buffer".to_string(),
            });
        }
        if offset + data.len() as u64 > self.size {
            return Err(VulkanError::InvalidOperation {
                reason: "write exceeds buffer size".to_string(),
            });
        }

        let mapped = self.allocator.map_memory(&mut self.allocation)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.add(offset as usize), data.len());
        }
        self.allocator
            .flush_allocation(&self.allocation, offset, data.len() as vk::DeviceSize)?;
        self.allocator.unmap_memory(&mut self.allocation);
        Ok(())
    }

    /// Get the buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Total size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Element stride in bytes
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Residency class fixed at creation
    pub fn resource_usage(&self) -> ResourceUsage {
        self.resource_usage
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let allocator = self.allocator.clone();
        allocator.destroy_buffer(self.buffer, &mut self.allocation);
    }
}

/// Pinned, persistently mapped staging buffer for the upload path
pub struct StagingBuffer {
    allocator: MemoryAllocator,
    buffer: vk::Buffer,
    allocation: vk_mem::Allocation,
    capacity: vk::DeviceSize,
    mapped: *mut u8,
    non_coherent_atom_size: vk::DeviceSize,
}

impl StagingBuffer {
    /// Allocate and map the staging buffer once; it stays mapped for the
    /// device's lifetime.
    pub fn new(
        allocator: &MemoryAllocator,
        capacity: vk::DeviceSize,
        non_coherent_atom_size: vk::DeviceSize,
    ) -> VulkanResult<Self> {
        let (buffer, mut allocation) = allocator.create_buffer(
            capacity,
            vk::BufferUsageFlags::TRANSFER_SRC,
            ResourceUsage::Staging,
        )?;

        let mapped = match allocator.map_memory(&mut allocation) {
            Ok(mapped) => mapped,
            Err(e) => {
                allocator.destroy_buffer(buffer, &mut allocation);
                return Err(e);
            }
        };

        Ok(Self {
            allocator: allocator.clone(),
            buffer,
            allocation,
            capacity,
            mapped,
            non_coherent_atom_size,
        })
    }

    /// Copy one chunk into the staging memory and flush it.
    ///
    /// The flushed range is rounded up to the device's non-coherent atom
    /// size, clamped to the buffer capacity.
    pub fn write_chunk(&mut self, data: &[u8]) -> VulkanResult<()> {
        if data.len() as vk::DeviceSize > self.capacity {
            return Err(VulkanError::InvalidOperation {
                reason: "chunk exceeds staging capacity".to_string(),
            });
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.mapped, data.len());
        }

        let flush_size =
            align_up(data.len() as vk::DeviceSize, self.non_coherent_atom_size).min(self.capacity);
        self.allocator
            .flush_allocation(&self.allocation, 0, flush_size)
    }

    /// Get the staging buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Staging capacity in bytes
    pub fn capacity(&self) -> vk::DeviceSize {
        self.capacity
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        let allocator = self.allocator.clone();
        allocator.unmap_memory(&mut self.allocation);
        allocator.destroy_buffer(self.buffer, &mut self.allocation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_smaller_than_capacity_is_one_chunk() {
        let chunks: Vec<_> = UploadChunks::new(100, 1024).collect();
        assert_eq!(chunks, vec![UploadChunk { src_offset: 0, size: 100 }]);
    }

    #[test]
    fn upload_equal_to_capacity_is_one_chunk() {
        let chunks: Vec<_> = UploadChunks::new(1024, 1024).collect();
        assert_eq!(chunks, vec![UploadChunk { src_offset: 0, size: 1024 }]);
    }

    #[test]
    fn upload_larger_than_capacity_chunks_in_order() {
        let chunks: Vec<_> = UploadChunks::new(2500, 1024).collect();
        assert_eq!(
            chunks,
            vec![
                UploadChunk { src_offset: 0, size: 1024 },
                UploadChunk { src_offset: 1024, size: 1024 },
                UploadChunk { src_offset: 2048, size: 452 },
            ]
        );
        let total: u64 = chunks.iter().map(|c| c.size).sum();
        assert_eq!(total, 2500);
    }

    #[test]
    fn empty_upload_yields_no_chunks() {
        assert_eq!(UploadChunks::new(0, 1024).count(), 0);
    }

    #[test]
    fn align_up_rounds_to_atom_size() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
    }

    #[test]
    fn chunking_covers_cast_vertex_data_exactly() {
        let vertices: [[f32; 5]; 3] = [
            [0.0, -0.5, 1.0, 0.0, 0.0],
            [0.5, 0.5, 0.0, 1.0, 0.0],
            [-0.5, 0.5, 0.0, 0.0, 1.0],
        ];
        let bytes: &[u8] = bytemuck::cast_slice(&vertices);
        let chunks: Vec<_> = UploadChunks::new(bytes.len() as u64, 16).collect();
        let total: u64 = chunks.iter().map(|c| c.size).sum();
        assert_eq!(total, bytes.len() as u64);
        assert_eq!(chunks.first().map(|c| c.src_offset), Some(0));
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].src_offset + pair[0].size, pair[1].src_offset);
        }
    }

    #[test]
    fn gpu_resident_buffers_accept_staged_uploads() {
        let flags = translate_buffer_usage(BufferUsage::VERTEX, ResourceUsage::Default);
        assert!(flags.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_DST));

        let staging = translate_buffer_usage(BufferUsage::empty(), ResourceUsage::Staging);
        assert!(staging.contains(vk::BufferUsageFlags::TRANSFER_SRC));
    }
}
