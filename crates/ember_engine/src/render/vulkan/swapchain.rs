//! Swapchain negotiation and resize handling
//!
//! Surface format, present mode, extent, and image count follow fixed
//! negotiation rules; resizing recreates the swapchain with the old handle
//! passed as `old_swapchain`.

use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::{vk, Device};

use crate::render::vulkan::context::{VulkanError, VulkanResult};
use crate::render::vulkan::texture::Texture;

/// Preferred surface format: BGRA8 sRGB with nonlinear color space; falls
/// back to the first advertised format.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> VulkanResult<vk::SurfaceFormatKHR> {
    if formats.is_empty() {
        return Err(VulkanError::InitializationFailed(
            "surface advertises no formats".to_string(),
        ));
    }
    Ok(formats
        .iter()
        .copied()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .unwrap_or(formats[0]))
}

/// Present mode negotiation: FIFO when vsync is requested (always
/// available), otherwise MAILBOX if advertised with FIFO as the fallback.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        log::debug!("[Vulkan] MAILBOX not available, falling back to FIFO");
        vk::PresentModeKHR::FIFO
    }
}

/// Clamp the desired extent to the surface capabilities. When the surface
/// dictates an exact extent, that wins.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: desired.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: desired.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// Minimum image count plus one, clamped to the surface maximum (zero max
/// means unbounded).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count = count.min(capabilities.max_image_count);
    }
    count
}

/// Swapchain with its back-buffer textures
pub struct Swapchain {
    loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    backbuffers: Vec<Texture>,
}

impl Swapchain {
    /// Create a swapchain for a surface.
    pub fn new(
        device: Device,
        loader: SwapchainLoader,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
        physical_device: vk::PhysicalDevice,
        graphics_family: u32,
        desired_extent: vk::Extent2D,
        vsync: bool,
    ) -> VulkanResult<Self> {
        Self::create(
            device,
            loader,
            surface,
            surface_loader,
            physical_device,
            graphics_family,
            desired_extent,
            vsync,
            vk::SwapchainKHR::null(),
        )
    }

    /// Recreate after a resize, handing the old swapchain to the driver.
    pub fn recreate(
        self,
        device: Device,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
        physical_device: vk::PhysicalDevice,
        graphics_family: u32,
        desired_extent: vk::Extent2D,
        vsync: bool,
    ) -> VulkanResult<Self> {
        let loader = self.loader.clone();
        let old_handle = self.swapchain;
        // Views must be gone before the old swapchain handle is retired,
        // but the old handle itself is destroyed by our Drop after the new
        // chain exists.
        let new = Self::create(
            device,
            loader,
            surface,
            surface_loader,
            physical_device,
            graphics_family,
            desired_extent,
            vsync,
            old_handle,
        )?;
        drop(self);
        Ok(new)
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        device: Device,
        loader: SwapchainLoader,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
        physical_device: vk::PhysicalDevice,
        graphics_family: u32,
        desired_extent: vk::Extent2D,
        vsync: bool,
        old_swapchain: vk::SwapchainKHR,
    ) -> VulkanResult<Self> {
        let capabilities = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(physical_device, surface)
                .map_err(VulkanError::Api)?
        };
        let formats = unsafe {
            surface_loader
                .get_physical_device_surface_formats(physical_device, surface)
                .map_err(VulkanError::Api)?
        };
        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(physical_device, surface)
                .map_err(VulkanError::Api)?
        };

        let surface_format = choose_surface_format(&formats)?;
        let present_mode = choose_present_mode(&present_modes, vsync);
        let extent = choose_extent(&capabilities, desired_extent);
        let image_count = choose_image_count(&capabilities);

        let queue_families = [graphics_family];
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe {
            loader
                .create_swapchain(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        let images = unsafe {
            loader
                .get_swapchain_images(swapchain)
                .map_err(VulkanError::Api)?
        };
        let mut backbuffers = Vec::with_capacity(images.len());
        for image in images {
            backbuffers.push(Texture::from_swapchain_image(
                device.clone(),
                image,
                surface_format.format,
                extent,
            )?);
        }

        log::debug!(
            "[Vulkan] Swapchain {}x{}, {} images, format {:?}, present mode {:?}",
            extent.width,
            extent.height,
            backbuffers.len(),
            surface_format.format,
            present_mode
        );

        Ok(Self {
            loader,
            swapchain,
            surface_format,
            extent,
            backbuffers,
        })
    }

    /// Acquire the next back-buffer image, signaling `semaphore`.
    ///
    /// Returns the image index plus whether the swapchain is suboptimal and
    /// should be recreated at the next opportunity.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> VulkanResult<(u32, bool)> {
        let result = unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, suboptimal)) => Ok((index, suboptimal)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok((0, true)),
            Err(e) => Err(VulkanError::Api(e)),
        }
    }

    /// Present an acquired image after waiting on `wait_semaphore`.
    ///
    /// Returns true when the swapchain must be recreated.
    pub fn present(
        &self,
        queue: vk::Queue,
        wait_semaphore: vk::Semaphore,
        image_index: u32,
    ) -> VulkanResult<bool> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.swapchain];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };
        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(VulkanError::Api(e)),
        }
    }

    /// Raw swapchain handle
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Negotiated surface format
    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    /// Current extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Back-buffer texture for an image index
    pub fn backbuffer(&self, index: u32) -> Option<&Texture> {
        self.backbuffers.get(index as usize)
    }

    /// Number of back-buffer images
    pub fn image_count(&self) -> usize {
        self.backbuffers.len()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // Views first, then the swapchain that owns the images.
        self.backbuffers.clear();
        unsafe {
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn prefers_bgra8_srgb() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_first_format() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::R8G8B8A8_UNORM
        );
        assert!(choose_surface_format(&[]).is_err());
    }

    #[test]
    fn vsync_always_uses_fifo() {
        let modes = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn mailbox_preferred_without_vsync_with_fifo_fallback() {
        let modes = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_clamps_to_capabilities() {
        let caps = capabilities(2, 8);
        let extent = choose_extent(
            &caps,
            vk::Extent2D {
                width: 10_000,
                height: 0,
            },
        );
        assert_eq!(extent.width, 4096);
        assert_eq!(extent.height, 1);
    }

    #[test]
    fn exact_surface_extent_wins() {
        let mut caps = capabilities(2, 8);
        caps.current_extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        let extent = choose_extent(
            &caps,
            vk::Extent2D {
                width: 640,
                height: 480,
            },
        );
        assert_eq!(extent.width, 1280);
        assert_eq!(extent.height, 720);
    }

    #[test]
    fn image_count_is_min_plus_one_clamped() {
        assert_eq!(choose_image_count(&capabilities(2, 8)), 3);
        assert_eq!(choose_image_count(&capabilities(2, 3)), 3);
        assert_eq!(choose_image_count(&capabilities(3, 3)), 3);
        // Zero max means unbounded.
        assert_eq!(choose_image_count(&capabilities(2, 0)), 3);
    }
}
