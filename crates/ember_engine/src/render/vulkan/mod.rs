//! Vulkan rendering backend
//!
//! Organized bottom-up: instance/device bootstrap in [`context`], memory in
//! [`allocator`] and [`buffer`], cached pass/layout objects in
//! [`render_pass`] and [`pipeline_layout`], recording in [`commands`], and
//! the composition root in [`device`].

pub mod allocator;
pub mod buffer;
pub mod commands;
pub mod context;
pub mod device;
pub mod pipeline_layout;
pub mod render_pass;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use context::{validation_error_count, VulkanError, VulkanResult};
pub use device::VulkanDevice;
