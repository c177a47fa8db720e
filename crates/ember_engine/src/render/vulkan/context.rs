//! Vulkan instance and device bootstrap
//!
//! Instance/layer/extension negotiation, adapter scoring and selection,
//! queue-family resolution, and logical-device creation. The selection
//! logic is kept as pure functions over snapshot data so it can be tested
//! without a driver.

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::vk;
use ash::{Device, Entry, Instance};
use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Vulkan initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No adapter passed suitability checks
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// A Required-tier device extension is absent on the selected adapter
    #[error("Required device extension missing: {name}")]
    RequiredExtensionMissing {
        /// The extension's canonical name
        name: String,
    },

    /// No queue family satisfies the graphics+compute+present requirement
    #[error("No suitable queue family: {reason}")]
    NoSuitableQueueFamily {
        /// Why resolution failed
        reason: String,
    },

    /// GPU memory allocation failed
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Resource with specified handle could not be found
    #[error("Resource not found")]
    ResourceNotFound,
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

static VALIDATION_ERROR_COUNT: AtomicU32 = AtomicU32::new(0);

/// Number of validation errors reported by the debug messenger since startup.
///
/// Advisory: an application running under validation may treat a nonzero
/// count as fatal in debug builds.
pub fn validation_error_count() -> u32 {
    VALIDATION_ERROR_COUNT.load(Ordering::Relaxed)
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *callback_data;
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        VALIDATION_ERROR_COUNT.fetch_add(1, Ordering::Relaxed);
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    /// Debug utilities extension, present when validation is active
    pub debug_utils: Option<DebugUtils>,
    /// Debug messenger handle, present when validation is active
    pub debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanInstance {
    /// Create a new Vulkan instance.
    ///
    /// `window_extensions` are the surface extensions the windowing layer
    /// requires (empty in headless mode). Validation layers and the debug
    /// messenger are enabled only when requested AND actually present.
    pub fn new(
        app_name: &str,
        window_extensions: &[String],
        enable_validation: bool,
    ) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| {
            VulkanError::InitializationFailed(format!("Failed to load Vulkan: {:?}", e))
        })?;

        let app_name_cstr = CString::new(app_name)
            .map_err(|_| VulkanError::InitializationFailed("Invalid app name".to_string()))?;
        let engine_name_cstr = CString::new("EmberEngine")
            .map_err(|_| VulkanError::InitializationFailed("Invalid engine name".to_string()))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_1);

        let cstr_extensions: Vec<CString> = window_extensions
            .iter()
            .filter_map(|ext| CString::new(ext.as_str()).ok())
            .collect();
        let mut extensions: Vec<*const i8> =
            cstr_extensions.iter().map(|ext| ext.as_ptr()).collect();

        let validation_layer = CString::new("VK_LAYER_KHRONOS_validation")
            .map_err(|_| VulkanError::InitializationFailed("Invalid layer name".to_string()))?;
        let validation = enable_validation
            && Self::instance_layer_available(&entry, &validation_layer)?
            && Self::instance_extension_available(&entry, DebugUtils::name())?;
        if enable_validation && !validation {
            log::warn!("[Vulkan] Validation requested but layer/extension unavailable, disabled");
        }

        let mut layer_names_ptrs = Vec::new();
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
            layer_names_ptrs.push(validation_layer.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names_ptrs);

        let instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        let (debug_utils, debug_messenger) = if validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let debug_messenger = Self::setup_debug_messenger(&debug_utils)?;
            (Some(debug_utils), Some(debug_messenger))
        } else {
            (None, None)
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
            debug_messenger,
        })
    }

    fn instance_layer_available(entry: &Entry, name: &CStr) -> VulkanResult<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .map_err(VulkanError::Api)?;
        Ok(layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == name))
    }

    fn instance_extension_available(entry: &Entry, name: &CStr) -> VulkanResult<bool> {
        let extensions = entry
            .enumerate_instance_extension_properties(None)
            .map_err(VulkanError::Api)?;
        Ok(extensions
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name))
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let (Some(debug_utils), Some(debug_messenger)) =
                (&self.debug_utils, &self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(*debug_messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// GPU vendor, classified from the PCI vendor id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuVendor {
    /// Arm Mali
    Arm,
    /// Nvidia
    Nvidia,
    /// AMD
    Amd,
    /// Intel
    Intel,
    /// Unrecognized vendor id
    Unknown,
}

impl GpuVendor {
    /// Classify a PCI vendor id
    pub fn from_vendor_id(vendor_id: u32) -> Self {
        match vendor_id {
            0x13B5 => Self::Arm,
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            _ => Self::Unknown,
        }
    }
}

/// Score an adapter for selection.
///
/// Discrete GPUs get a large bonus, ties broken by maximum 2D texture
/// dimension. Adapters without geometry-shader support score zero and are
/// never selected over one that has it.
pub fn score_adapter(device_type: vk::PhysicalDeviceType, max_image_dimension_2d: u32, geometry_shader: bool) -> u64 {
    if !geometry_shader {
        return 0;
    }

    let mut score: u64 = 0;
    if device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
        score += 1000;
    }
    score + u64::from(max_image_dimension_2d)
}

/// Whether a scored adapter should replace the current best candidate.
///
/// A zero score marks an unsuitable adapter; it never becomes a candidate,
/// so selection fails when every adapter scores zero.
pub fn candidate_improves(best: Option<u64>, score: u64) -> bool {
    score > 0 && best.map_or(true, |best| score > best)
}

/// Requirement tier of a device extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionTier {
    /// Nice to have; absence is logged at debug level
    Optional,
    /// Wanted for full functionality; absence is logged as a warning
    Desired,
    /// Device creation fails without it
    Required,
}

/// One requested device extension with its requirement tier
#[derive(Debug, Clone, Copy)]
pub struct ExtensionRequest {
    /// Canonical extension name
    pub name: &'static CStr,
    /// Requirement tier
    pub tier: ExtensionTier,
}

/// Device extensions the backend asks for.
///
/// The swapchain extension is Required only when presenting to a surface.
pub fn device_extension_requests(headless: bool) -> Vec<ExtensionRequest> {
    let mut requests = vec![
        ExtensionRequest {
            name: vk::KhrMaintenance1Fn::name(),
            tier: ExtensionTier::Desired,
        },
        ExtensionRequest {
            name: vk::KhrGetMemoryRequirements2Fn::name(),
            tier: ExtensionTier::Desired,
        },
        ExtensionRequest {
            name: vk::KhrDedicatedAllocationFn::name(),
            tier: ExtensionTier::Optional,
        },
    ];
    if !headless {
        requests.push(ExtensionRequest {
            name: SwapchainLoader::name(),
            tier: ExtensionTier::Required,
        });
    }
    requests
}

/// Resolve extension requests against the adapter's available set.
///
/// Returns the names to enable. A missing Required extension is an error;
/// missing Desired/Optional extensions are logged and skipped.
pub fn resolve_extensions(
    requests: &[ExtensionRequest],
    available: &HashSet<&CStr>,
) -> VulkanResult<Vec<&'static CStr>> {
    let mut enabled = Vec::new();
    for request in requests {
        if available.contains(request.name) {
            enabled.push(request.name);
            continue;
        }
        match request.tier {
            ExtensionTier::Required => {
                log::error!(
                    "[Vulkan] Required device extension {:?} is not supported",
                    request.name
                );
                return Err(VulkanError::RequiredExtensionMissing {
                    name: request.name.to_string_lossy().into_owned(),
                });
            }
            ExtensionTier::Desired => {
                log::warn!("[Vulkan] Desired device extension {:?} unavailable", request.name);
            }
            ExtensionTier::Optional => {
                log::debug!("[Vulkan] Optional device extension {:?} unavailable", request.name);
            }
        }
    }
    Ok(enabled)
}

/// Resolved queue-family assignment for the three logical queue roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilySelection {
    /// Graphics (and present) queue family
    pub graphics_family: u32,
    /// Compute queue family; equals graphics when no dedicated family exists
    pub compute_family: u32,
    /// Transfer queue family; equals graphics when no dedicated family exists
    pub transfer_family: u32,
    /// Queue index of the graphics role within its family
    pub graphics_queue_index: u32,
    /// Queue index of the compute role within its family
    pub compute_queue_index: u32,
    /// Queue index of the transfer role within its family
    pub transfer_queue_index: u32,
}

impl QueueFamilySelection {
    /// Distinct families actually used, each with the queue count needed to
    /// cover every role assigned to it.
    pub fn family_queue_counts(&self) -> Vec<(u32, u32)> {
        let mut counts: Vec<(u32, u32)> = Vec::new();
        for (family, index) in [
            (self.graphics_family, self.graphics_queue_index),
            (self.compute_family, self.compute_queue_index),
            (self.transfer_family, self.transfer_queue_index),
        ] {
            match counts.iter_mut().find(|(f, _)| *f == family) {
                Some((_, count)) => *count = (*count).max(index + 1),
                None => counts.push((family, index + 1)),
            }
        }
        counts
    }
}

/// Resolve the three queue roles against a queue-family table.
///
/// The graphics family must support both GRAPHICS and COMPUTE, and present
/// when `present_support` is given (one entry per family, surface-dependent).
/// Compute and transfer prefer dedicated families and deterministically fall
/// back to sharing the graphics family on distinct queue indices, clamped to
/// the family's queue count.
pub fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
    present_support: Option<&[bool]>,
) -> VulkanResult<QueueFamilySelection> {
    let universal = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
    let graphics_family = families
        .iter()
        .enumerate()
        .position(|(i, family)| {
            family.queue_flags.contains(universal)
                && present_support.map_or(true, |support| support.get(i).copied().unwrap_or(false))
        })
        .ok_or_else(|| VulkanError::NoSuitableQueueFamily {
            reason: "no family supports graphics+compute+present".to_string(),
        })? as u32;

    let compute_family = families
        .iter()
        .position(|family| {
            family.queue_flags.contains(vk::QueueFlags::COMPUTE)
                && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        })
        .map(|i| i as u32)
        .unwrap_or(graphics_family);

    let transfer_family = families
        .iter()
        .position(|family| {
            family.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                && !family.queue_flags.contains(vk::QueueFlags::COMPUTE)
        })
        .map(|i| i as u32)
        .unwrap_or(graphics_family);

    // Roles sharing the graphics family take the next queue index, clamped
    // to what the family actually exposes.
    let graphics_queue_count = families[graphics_family as usize].queue_count;
    let mut next_shared_index = 1u32;
    let compute_queue_index = if compute_family == graphics_family {
        let index = next_shared_index.min(graphics_queue_count - 1);
        next_shared_index += 1;
        index
    } else {
        0
    };
    let transfer_queue_index = if transfer_family == graphics_family {
        next_shared_index.min(graphics_queue_count - 1)
    } else {
        0
    };

    Ok(QueueFamilySelection {
        graphics_family,
        compute_family,
        transfer_family,
        graphics_queue_index: 0,
        compute_queue_index,
        transfer_queue_index,
    })
}

/// Immutable snapshot of the selected adapter
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported device features
    pub features: vk::PhysicalDeviceFeatures,
    /// Available queue families
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    /// Resolved queue-role assignment
    pub queue_selection: QueueFamilySelection,
}

impl PhysicalDeviceInfo {
    /// Enumerate adapters, score each, and select the best suitable one.
    ///
    /// `surface` is `None` in headless mode; present support is then not
    /// part of the suitability check.
    pub fn select_adapter(
        instance: &Instance,
        surface: Option<(vk::SurfaceKHR, &Surface)>,
    ) -> VulkanResult<Self> {
        let devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(VulkanError::Api)?
        };
        if devices.is_empty() {
            return Err(VulkanError::NoSuitableGpu);
        }

        let mut best: Option<(u64, Self)> = None;
        for device in devices {
            let info = match Self::evaluate_adapter(instance, device, surface) {
                Ok(info) => info,
                Err(e) => {
                    log::debug!("[Vulkan] Adapter rejected: {}", e);
                    continue;
                }
            };

            let score = score_adapter(
                info.properties.device_type,
                info.properties.limits.max_image_dimension2_d,
                info.features.geometry_shader == vk::TRUE,
            );
            if candidate_improves(best.as_ref().map(|&(best_score, _)| best_score), score) {
                best = Some((score, info));
            }
        }

        let (_, info) = best.ok_or(VulkanError::NoSuitableGpu)?;
        let name = unsafe { CStr::from_ptr(info.properties.device_name.as_ptr()) };
        log::info!(
            "[Vulkan] Selected GPU: {} (vendor: {:?}, type: {:?})",
            name.to_string_lossy(),
            GpuVendor::from_vendor_id(info.properties.vendor_id),
            info.properties.device_type
        );
        if info.properties.device_type != vk::PhysicalDeviceType::DISCRETE_GPU {
            log::warn!("[Vulkan] No discrete GPU available, performance may suffer");
        }

        Ok(info)
    }

    fn evaluate_adapter(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: Option<(vk::SurfaceKHR, &Surface)>,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        let present_support = match surface {
            Some((surface, surface_loader)) => {
                let mut support = Vec::with_capacity(queue_families.len());
                for index in 0..queue_families.len() as u32 {
                    let supported = unsafe {
                        surface_loader
                            .get_physical_device_surface_support(device, index, surface)
                            .map_err(VulkanError::Api)?
                    };
                    support.push(supported);
                }
                Some(support)
            }
            None => None,
        };

        let queue_selection =
            select_queue_families(&queue_families, present_support.as_deref())?;

        Ok(Self {
            device,
            properties,
            features,
            queue_families,
            queue_selection,
        })
    }

    /// The device's required flush alignment for non-coherent mapped memory
    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.properties.limits.non_coherent_atom_size
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Graphics operations queue (also used for present)
    pub graphics_queue: vk::Queue,
    /// Compute queue, possibly aliasing the graphics queue
    pub compute_queue: vk::Queue,
    /// Transfer queue, possibly aliasing the graphics queue
    pub transfer_queue: vk::Queue,
    /// Resolved queue-role assignment
    pub queue_selection: QueueFamilySelection,
    /// Swapchain extension loader, absent in headless mode
    pub swapchain_loader: Option<SwapchainLoader>,
}

impl LogicalDevice {
    /// Create the logical device with one queue create-info per distinct
    /// family, covering all three roles with the minimum queue counts.
    pub fn new(
        instance: &Instance,
        physical_device: &PhysicalDeviceInfo,
        headless: bool,
    ) -> VulkanResult<Self> {
        let selection = physical_device.queue_selection;

        // One priority slot per queue; all equal priority.
        let family_counts = selection.family_queue_counts();
        let priorities: Vec<Vec<f32>> = family_counts
            .iter()
            .map(|&(_, count)| vec![1.0; count as usize])
            .collect();
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = family_counts
            .iter()
            .zip(&priorities)
            .map(|(&(family, _), priorities)| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(priorities)
                    .build()
            })
            .collect();

        let available = unsafe {
            instance
                .enumerate_device_extension_properties(physical_device.device)
                .map_err(VulkanError::Api)?
        };
        let available_names: HashSet<&CStr> = available
            .iter()
            .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
            .collect();
        let enabled =
            resolve_extensions(&device_extension_requests(headless), &available_names)?;
        let enabled_ptrs: Vec<*const i8> = enabled.iter().map(|name| name.as_ptr()).collect();

        let device_features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(physical_device.features.sampler_anisotropy == vk::TRUE)
            .geometry_shader(physical_device.features.geometry_shader == vk::TRUE);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&enabled_ptrs)
            .enabled_features(&device_features);

        let device = unsafe {
            instance
                .create_device(physical_device.device, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        let graphics_queue = unsafe {
            device.get_device_queue(selection.graphics_family, selection.graphics_queue_index)
        };
        let compute_queue = unsafe {
            device.get_device_queue(selection.compute_family, selection.compute_queue_index)
        };
        let transfer_queue = unsafe {
            device.get_device_queue(selection.transfer_family, selection.transfer_queue_index)
        };

        let swapchain_loader = if headless {
            None
        } else {
            Some(SwapchainLoader::new(instance, &device))
        };

        Ok(Self {
            device,
            graphics_queue,
            compute_queue,
            transfer_queue,
            queue_selection: selection,
            swapchain_loader,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            // Ensure device is idle before destruction
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn discrete_gpu_outscores_integrated() {
        let discrete = score_adapter(vk::PhysicalDeviceType::DISCRETE_GPU, 16384, true);
        let integrated = score_adapter(vk::PhysicalDeviceType::INTEGRATED_GPU, 16384, true);
        assert!(discrete > integrated);
    }

    #[test]
    fn missing_geometry_shader_scores_zero() {
        assert_eq!(score_adapter(vk::PhysicalDeviceType::DISCRETE_GPU, 16384, false), 0);
    }

    #[test]
    fn zero_score_adapters_are_never_candidates() {
        assert!(!candidate_improves(None, 0));
        assert!(candidate_improves(None, 1));
        assert!(!candidate_improves(Some(100), 100));
        assert!(candidate_improves(Some(100), 101));
    }

    #[test]
    fn dedicated_families_are_preferred() {
        let families = [
            family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                16,
            ),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 8),
            family(vk::QueueFlags::TRANSFER, 2),
        ];
        let selection = select_queue_families(&families, None).unwrap();
        assert_eq!(selection.graphics_family, 0);
        assert_eq!(selection.compute_family, 1);
        assert_eq!(selection.transfer_family, 2);
        assert_eq!(selection.compute_queue_index, 0);
        assert_eq!(selection.transfer_queue_index, 0);
    }

    #[test]
    fn shared_family_uses_distinct_queue_indices() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            4,
        )];
        let selection = select_queue_families(&families, None).unwrap();
        assert_eq!(selection.graphics_family, 0);
        assert_eq!(selection.compute_family, 0);
        assert_eq!(selection.transfer_family, 0);
        assert_eq!(selection.graphics_queue_index, 0);
        assert_eq!(selection.compute_queue_index, 1);
        assert_eq!(selection.transfer_queue_index, 2);
        assert_eq!(selection.family_queue_counts(), vec![(0, 3)]);
    }

    #[test]
    fn shared_queue_indices_clamp_to_queue_count() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            1,
        )];
        let selection = select_queue_families(&families, None).unwrap();
        assert_eq!(selection.compute_queue_index, 0);
        assert_eq!(selection.transfer_queue_index, 0);
        assert_eq!(selection.family_queue_counts(), vec![(0, 1)]);
    }

    #[test]
    fn graphics_family_requires_present_when_surface_exists() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
        ];
        let selection = select_queue_families(&families, Some(&[false, true])).unwrap();
        assert_eq!(selection.graphics_family, 1);
    }

    #[test]
    fn selection_is_deterministic() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 2),
            family(vk::QueueFlags::COMPUTE, 4),
        ];
        let first = select_queue_families(&families, None).unwrap();
        let second = select_queue_families(&families, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn no_universal_family_is_an_error() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::COMPUTE, 1),
        ];
        assert!(select_queue_families(&families, None).is_err());
    }

    #[test]
    fn required_extension_missing_fails_resolution() {
        let requests = device_extension_requests(false);
        let available: HashSet<&CStr> = HashSet::new();
        assert!(matches!(
            resolve_extensions(&requests, &available),
            Err(VulkanError::RequiredExtensionMissing { .. })
        ));
    }

    #[test]
    fn headless_does_not_require_swapchain() {
        let requests = device_extension_requests(true);
        let available: HashSet<&CStr> = HashSet::new();
        let enabled = resolve_extensions(&requests, &available).unwrap();
        assert!(enabled.is_empty());
    }

    #[test]
    fn vendor_classification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Unknown);
    }
}
