//! Pipeline-layout and descriptor-set caches
//!
//! Pipeline layouts are derived once per distinct reflected resource layout
//! (the bit-mask description of a shader's binding interface). Descriptor
//! sets are recycled through per-layout allocators that grow pool by pool.

use ash::{vk, Device};
use std::collections::HashMap;

use crate::render::types::{DescriptorSetLayoutInfo, ResourceLayout, MAX_BINDINGS_PER_SET};
use crate::render::vulkan::context::{VulkanError, VulkanResult};

/// Descriptor sets allocated per pool before a new pool is created
pub const SETS_PER_POOL: u32 = 16;

/// Expand a set's binding masks into descriptor-set layout bindings.
pub fn layout_bindings(info: &DescriptorSetLayoutInfo) -> Vec<vk::DescriptorSetLayoutBinding> {
    let stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
    let mut bindings = Vec::new();
    for binding in 0..MAX_BINDINGS_PER_SET as u32 {
        if info.uniform_buffer_mask & (1 << binding) != 0 {
            bindings.push(
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(stages)
                    .build(),
            );
        }
        if info.sampled_image_mask & (1 << binding) != 0 {
            bindings.push(
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .descriptor_count(1)
                    .stage_flags(stages)
                    .build(),
            );
        }
    }
    bindings
}

/// Pool sizes covering `SETS_PER_POOL` sets of one layout.
pub fn descriptor_pool_sizes(info: &DescriptorSetLayoutInfo) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes = Vec::new();
    let uniform_count = info.uniform_buffer_mask.count_ones();
    if uniform_count > 0 {
        sizes.push(vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: uniform_count * SETS_PER_POOL,
        });
    }
    let image_count = info.sampled_image_mask.count_ones();
    if image_count > 0 {
        sizes.push(vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: image_count * SETS_PER_POOL,
        });
    }
    sizes
}

/// Ring of descriptor sets keyed by binding-content hash.
///
/// A request for a previously seen hash reuses that set and promotes it to
/// most recently used. A miss recycles the least recently used set once the
/// ring is at capacity, otherwise reports that a fresh set must be
/// allocated. Pure bookkeeping, no API objects.
pub struct SetRing<T> {
    capacity: usize,
    // Most recently used at the back.
    order: Vec<u64>,
    sets: HashMap<u64, T>,
}

impl<T: Copy> SetRing<T> {
    /// Create a ring holding at most `capacity` sets.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: Vec::new(),
            sets: HashMap::new(),
        }
    }

    /// Look up a set by binding-content hash, promoting it on hit.
    pub fn request(&mut self, hash: u64) -> Option<T> {
        let set = *self.sets.get(&hash)?;
        if let Some(pos) = self.order.iter().position(|&h| h == hash) {
            self.order.remove(pos);
            self.order.push(hash);
        }
        Some(set)
    }

    /// Insert a set for a hash. When at capacity, the least recently used
    /// entry is evicted and its set returned for reuse.
    pub fn insert(&mut self, hash: u64, set: T) -> Option<T> {
        let evicted = if self.sets.len() >= self.capacity && !self.order.is_empty() {
            let oldest = self.order.remove(0);
            self.sets.remove(&oldest)
        } else {
            None
        };
        self.sets.insert(hash, set);
        self.order.push(hash);
        evicted
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Whether the ring is empty
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

/// Per-set-layout descriptor set allocator
pub struct DescriptorSetAllocator {
    device: Device,
    set_layout: vk::DescriptorSetLayout,
    info: DescriptorSetLayoutInfo,
    pools: Vec<vk::DescriptorPool>,
    allocated_in_current_pool: u32,
    free_sets: Vec<vk::DescriptorSet>,
    ring: SetRing<vk::DescriptorSet>,
}

impl DescriptorSetAllocator {
    /// Create an allocator for one set layout.
    pub fn new(
        device: Device,
        set_layout: vk::DescriptorSetLayout,
        info: DescriptorSetLayoutInfo,
    ) -> Self {
        Self {
            device,
            set_layout,
            info,
            pools: Vec::new(),
            allocated_in_current_pool: 0,
            free_sets: Vec::new(),
            ring: SetRing::new(SETS_PER_POOL as usize * 4),
        }
    }

    /// Binding masks of the set layout this allocator serves
    pub fn layout_info(&self) -> &DescriptorSetLayoutInfo {
        &self.info
    }

    /// Find or allocate a descriptor set for a binding-content hash.
    ///
    /// Returns the set and whether it was found (already written with these
    /// bindings). A freshly allocated or recycled set must be updated by the
    /// caller before use.
    pub fn request_set(&mut self, hash: u64) -> VulkanResult<(vk::DescriptorSet, bool)> {
        if let Some(set) = self.ring.request(hash) {
            return Ok((set, true));
        }

        // Recycled sets are rewritten by the caller before use.
        let set = match self.free_sets.pop() {
            Some(set) => set,
            None => match self.allocate_set()? {
                Some(set) => set,
                None => {
                    self.grow_pool()?;
                    self.allocate_set()?.ok_or_else(|| {
                        VulkanError::AllocationFailed("descriptor pool exhausted".to_string())
                    })?
                }
            },
        };
        if let Some(evicted) = self.ring.insert(hash, set) {
            self.free_sets.push(evicted);
        }
        Ok((set, false))
    }

    fn allocate_set(&mut self) -> VulkanResult<Option<vk::DescriptorSet>> {
        let Some(&pool) = self.pools.last() else {
            return Ok(None);
        };
        if self.allocated_in_current_pool >= SETS_PER_POOL {
            return Ok(None);
        }

        let layouts = [self.set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe {
            self.device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(VulkanError::Api)?
        };
        self.allocated_in_current_pool += 1;
        Ok(sets.first().copied())
    }

    fn grow_pool(&mut self) -> VulkanResult<()> {
        let sizes = descriptor_pool_sizes(&self.info);
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(SETS_PER_POOL)
            .pool_sizes(&sizes);
        let pool = unsafe {
            self.device
                .create_descriptor_pool(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        log::debug!("[Vulkan] Created descriptor pool #{}", self.pools.len() + 1);
        self.pools.push(pool);
        self.allocated_in_current_pool = 0;
        Ok(())
    }
}

impl Drop for DescriptorSetAllocator {
    fn drop(&mut self) {
        unsafe {
            for pool in self.pools.drain(..) {
                self.device.destroy_descriptor_pool(pool, None);
            }
        }
    }
}

/// Pipeline layout plus the per-set layouts and allocators behind it
pub struct PipelineLayoutEntry {
    /// The pipeline layout handle
    pub pipeline_layout: vk::PipelineLayout,
    /// Active set index → set layout
    pub set_layouts: Vec<(u32, vk::DescriptorSetLayout)>,
    /// Active set index → descriptor allocator
    pub set_allocators: Vec<(u32, DescriptorSetAllocator)>,
}

/// Cache of pipeline layouts keyed by reflected resource layout
pub struct PipelineLayoutCache {
    device: Device,
    layouts: HashMap<ResourceLayout, PipelineLayoutEntry>,
}

impl PipelineLayoutCache {
    /// Create an empty cache for a device.
    pub fn new(device: Device) -> Self {
        Self {
            device,
            layouts: HashMap::new(),
        }
    }

    /// Look up or create the pipeline layout for a resource layout.
    pub fn request_pipeline_layout(
        &mut self,
        layout: &ResourceLayout,
    ) -> VulkanResult<&mut PipelineLayoutEntry> {
        if !self.layouts.contains_key(layout) {
            let entry = self.create_entry(layout)?;
            self.layouts.insert(*layout, entry);
        }
        self.layouts
            .get_mut(layout)
            .ok_or(VulkanError::ResourceNotFound)
    }

    fn create_entry(&self, layout: &ResourceLayout) -> VulkanResult<PipelineLayoutEntry> {
        let mut set_layouts = Vec::new();
        let mut set_allocators = Vec::new();
        for (set_index, info) in layout.sets.iter().enumerate() {
            if info.is_empty() {
                continue;
            }
            let bindings = layout_bindings(info);
            let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
            let set_layout = unsafe {
                self.device
                    .create_descriptor_set_layout(&create_info, None)
                    .map_err(VulkanError::Api)?
            };
            set_layouts.push((set_index as u32, set_layout));
            set_allocators.push((
                set_index as u32,
                DescriptorSetAllocator::new(self.device.clone(), set_layout, *info),
            ));
        }

        let raw_layouts: Vec<vk::DescriptorSetLayout> =
            set_layouts.iter().map(|&(_, layout)| layout).collect();
        let create_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&raw_layouts);
        let pipeline_layout = unsafe {
            self.device
                .create_pipeline_layout(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        log::debug!(
            "[Vulkan] Created pipeline layout ({} descriptor sets)",
            set_layouts.len()
        );

        Ok(PipelineLayoutEntry {
            pipeline_layout,
            set_layouts,
            set_allocators,
        })
    }
}

impl Drop for PipelineLayoutCache {
    fn drop(&mut self) {
        unsafe {
            for (_, entry) in self.layouts.drain() {
                // Allocators (and their pools) drop first.
                drop(entry.set_allocators);
                for (_, set_layout) in entry.set_layouts {
                    self.device.destroy_descriptor_set_layout(set_layout, None);
                }
                self.device.destroy_pipeline_layout(entry.pipeline_layout, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_follow_mask_bits() {
        let info = DescriptorSetLayoutInfo {
            uniform_buffer_mask: 0b101,
            sampled_image_mask: 0b010,
        };
        let bindings = layout_bindings(&info);
        assert_eq!(bindings.len(), 3);
        assert_eq!(bindings[0].binding, 0);
        assert_eq!(bindings[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(bindings[1].binding, 1);
        assert_eq!(bindings[1].descriptor_type, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(bindings[2].binding, 2);
        assert_eq!(bindings[2].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
    }

    #[test]
    fn pool_sizes_cover_a_full_pool() {
        let info = DescriptorSetLayoutInfo {
            uniform_buffer_mask: 0b11,
            sampled_image_mask: 0b1,
        };
        let sizes = descriptor_pool_sizes(&info);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].descriptor_count, 2 * SETS_PER_POOL);
        assert_eq!(sizes[1].descriptor_count, SETS_PER_POOL);
    }

    #[test]
    fn ring_reuses_sets_by_content_hash() {
        let mut ring: SetRing<u32> = SetRing::new(4);
        assert!(ring.request(7).is_none());
        ring.insert(7, 100);
        assert_eq!(ring.request(7), Some(100));
    }

    #[test]
    fn sustained_churn_recycles_evicted_sets() {
        // Same shape as request_set's miss path: consult the free list
        // before allocating, park evicted sets on it. Distinct-handle count
        // must stay bounded by the ring capacity regardless of churn.
        let mut ring: SetRing<u32> = SetRing::new(2);
        let mut free: Vec<u32> = Vec::new();
        let mut allocated = 0u32;
        for hash in 0..100u64 {
            if ring.request(hash).is_some() {
                continue;
            }
            let set = free.pop().unwrap_or_else(|| {
                allocated += 1;
                allocated
            });
            if let Some(evicted) = ring.insert(hash, set) {
                free.push(evicted);
            }
        }
        assert_eq!(allocated, 3);
    }

    #[test]
    fn ring_evicts_least_recently_used_at_capacity() {
        let mut ring: SetRing<u32> = SetRing::new(2);
        ring.insert(1, 10);
        ring.insert(2, 20);
        // Touch 1 so 2 becomes the eviction candidate.
        assert_eq!(ring.request(1), Some(10));
        let evicted = ring.insert(3, 30);
        assert_eq!(evicted, Some(20));
        assert_eq!(ring.request(1), Some(10));
        assert!(ring.request(2).is_none());
        assert_eq!(ring.len(), 2);
    }
}
