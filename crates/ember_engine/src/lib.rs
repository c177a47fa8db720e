//! # Ember Engine
//!
//! A cross-platform real-time graphics engine runtime built around a
//! multi-backend rendering hardware interface (RHI).
//!
//! ## Features
//!
//! - **Vulkan RHI**: explicit device/queue/memory management with
//!   content-addressed render-pass, framebuffer and pipeline caches
//! - **Declarative resources**: buffers, textures, shaders and pipelines
//!   created from plain descriptor structs
//! - **Headless operation**: a null backend for tooling and tests that
//!   must run without a GPU
//! - **Cross-Platform**: Windows, Linux, and macOS support
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ember_engine::config::RenderSettings;
//! use ember_engine::render::{GraphicsDevice, Window};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = RenderSettings::default();
//!     let mut window = Window::new(&settings.title, settings.width, settings.height)?;
//!     let mut device = GraphicsDevice::new(&settings, Some(&mut window))?;
//!
//!     while !window.should_close() {
//!         window.poll_events();
//!         device.begin_frame()?;
//!         // record draw commands...
//!         device.end_frame()?;
//!     }
//!
//!     device.wait_idle()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod render;

/// Initialize the engine's logging backend from the `RUST_LOG` environment.
///
/// Safe to call more than once; subsequent calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .try_init();
}

/// Commonly used types, re-exported for application code.
pub mod prelude {
    pub use crate::config::RenderSettings;
    pub use crate::render::{
        BackendType, BufferDescriptor, BufferHandle, BufferUsage, ClearColor, GraphicsDevice,
        IndexType, LoadAction, PipelineHandle, PixelFormat, PrimitiveTopology, RenderError,
        RenderPassDescriptor, RenderPipelineDescriptor, ResourceLayout, ResourceUsage,
        ShaderHandle, ShaderModuleDescriptor, ShaderStage, ShaderStageDescriptor, StoreAction,
        TextureDescriptor, TextureHandle, VertexInputRate, Window,
    };
}
