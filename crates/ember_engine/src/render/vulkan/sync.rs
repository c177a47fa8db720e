//! Fence and semaphore pools
//!
//! Free-list pools guarded by a mutex so a background feeder thread can
//! acquire and release without racing the recording thread. The pool tracks
//! every handle it ever created; releasing a foreign handle or releasing the
//! same handle twice is rejected.

use ash::{vk, Device};
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Mutex;

use crate::render::vulkan::context::{VulkanError, VulkanResult};

struct PoolInner<T> {
    free: Vec<T>,
    owned: HashSet<T>,
}

/// Mutex-guarded free-list pool of reusable handles
pub struct HandlePool<T: Copy + Eq + Hash> {
    inner: Mutex<PoolInner<T>>,
}

impl<T: Copy + Eq + Hash> HandlePool<T> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                owned: HashSet::new(),
            }),
        }
    }

    /// Take a free handle, or create one via `create` when the free list is
    /// empty. Created handles become pool-owned.
    pub fn acquire(&self, create: impl FnOnce() -> VulkanResult<T>) -> VulkanResult<T> {
        let mut inner = self.inner.lock().map_err(|_| VulkanError::InvalidOperation {
            reason: "sync pool mutex poisoned".to_string(),
        })?;
        if let Some(handle) = inner.free.pop() {
            return Ok(handle);
        }
        let handle = create()?;
        inner.owned.insert(handle);
        Ok(handle)
    }

    /// Return a handle to the free list.
    ///
    /// Rejects handles the pool never created and handles that are already
    /// free (double release).
    pub fn release(&self, handle: T) -> VulkanResult<()> {
        let mut inner = self.inner.lock().map_err(|_| VulkanError::InvalidOperation {
            reason: "sync pool mutex poisoned".to_string(),
        })?;
        if !inner.owned.contains(&handle) {
            return Err(VulkanError::InvalidOperation {
                reason: "released handle was not acquired from this pool".to_string(),
            });
        }
        if inner.free.contains(&handle) {
            return Err(VulkanError::InvalidOperation {
                reason: "handle released twice".to_string(),
            });
        }
        inner.free.push(handle);
        Ok(())
    }

    /// Handles ever created by this pool
    pub fn live_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.owned.len()).unwrap_or(0)
    }

    /// Handles currently on the free list
    pub fn free_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.free.len()).unwrap_or(0)
    }

    /// Drain every owned handle for destruction.
    pub fn drain(&self) -> Vec<T> {
        match self.inner.lock() {
            Ok(mut inner) => {
                inner.free.clear();
                inner.owned.drain().collect()
            }
            Err(_) => Vec::new(),
        }
    }
}

impl<T: Copy + Eq + Hash> Default for HandlePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool of reusable fences
pub struct FencePool {
    device: Device,
    pool: HandlePool<vk::Fence>,
}

impl FencePool {
    /// Create an empty fence pool for a device.
    pub fn new(device: Device) -> Self {
        Self {
            device,
            pool: HandlePool::new(),
        }
    }

    /// Acquire an unsignaled fence for one submission cycle.
    pub fn acquire(&self) -> VulkanResult<vk::Fence> {
        let device = &self.device;
        self.pool.acquire(|| {
            let create_info = vk::FenceCreateInfo::builder();
            unsafe {
                device
                    .create_fence(&create_info, None)
                    .map_err(VulkanError::Api)
            }
        })
    }

    /// Reset a waited fence and return it to the pool.
    pub fn release(&self, fence: vk::Fence) -> VulkanResult<()> {
        unsafe {
            self.device
                .reset_fences(&[fence])
                .map_err(VulkanError::Api)?;
        }
        self.pool.release(fence)
    }

    /// Fences ever created by this pool
    pub fn live_count(&self) -> usize {
        self.pool.live_count()
    }
}

impl Drop for FencePool {
    fn drop(&mut self) {
        unsafe {
            for fence in self.pool.drain() {
                self.device.destroy_fence(fence, None);
            }
        }
    }
}

/// Pool of reusable binary semaphores
pub struct SemaphorePool {
    device: Device,
    pool: HandlePool<vk::Semaphore>,
}

impl SemaphorePool {
    /// Create an empty semaphore pool for a device.
    pub fn new(device: Device) -> Self {
        Self {
            device,
            pool: HandlePool::new(),
        }
    }

    /// Acquire a semaphore for one submission/present cycle.
    pub fn acquire(&self) -> VulkanResult<vk::Semaphore> {
        let device = &self.device;
        self.pool.acquire(|| {
            let create_info = vk::SemaphoreCreateInfo::builder();
            unsafe {
                device
                    .create_semaphore(&create_info, None)
                    .map_err(VulkanError::Api)
            }
        })
    }

    /// Return a semaphore whose wait has completed.
    pub fn release(&self, semaphore: vk::Semaphore) -> VulkanResult<()> {
        self.pool.release(semaphore)
    }

    /// Semaphores ever created by this pool
    pub fn live_count(&self) -> usize {
        self.pool.live_count()
    }
}

impl Drop for SemaphorePool {
    fn drop(&mut self) {
        unsafe {
            for semaphore in self.pool.drain() {
                self.device.destroy_semaphore(semaphore, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn counting_pool() -> (HandlePool<u32>, Cell<u32>) {
        (HandlePool::new(), Cell::new(0))
    }

    fn next(counter: &Cell<u32>) -> VulkanResult<u32> {
        let handle = counter.get();
        counter.set(handle + 1);
        Ok(handle)
    }

    #[test]
    fn sequential_cycles_reuse_one_handle() {
        let (pool, counter) = counting_pool();
        for _ in 0..100 {
            let handle = pool.acquire(|| next(&counter)).unwrap();
            pool.release(handle).unwrap();
        }
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    fn live_count_tracks_high_water_mark() {
        let (pool, counter) = counting_pool();
        // Three concurrently held handles, then repeated single cycles.
        let held: Vec<u32> = (0..3)
            .map(|_| pool.acquire(|| next(&counter)).unwrap())
            .collect();
        for handle in held {
            pool.release(handle).unwrap();
        }
        for _ in 0..50 {
            let handle = pool.acquire(|| next(&counter)).unwrap();
            pool.release(handle).unwrap();
        }
        assert_eq!(pool.live_count(), 3);
    }

    #[test]
    fn foreign_release_is_rejected() {
        let (pool, counter) = counting_pool();
        let _ = pool.acquire(|| next(&counter)).unwrap();
        assert!(pool.release(999).is_err());
    }

    #[test]
    fn double_release_is_rejected() {
        let (pool, counter) = counting_pool();
        let handle = pool.acquire(|| next(&counter)).unwrap();
        pool.release(handle).unwrap();
        assert!(pool.release(handle).is_err());
    }

    #[test]
    fn acquire_prefers_the_free_list() {
        let (pool, counter) = counting_pool();
        let first = pool.acquire(|| next(&counter)).unwrap();
        pool.release(first).unwrap();
        let second = pool.acquire(|| next(&counter)).unwrap();
        assert_eq!(first, second);
        assert_eq!(pool.free_count(), 0);
    }
}
