//! Shader programs
//!
//! A program owns the shader modules for its stages, the reflected resource
//! layout, and every graphics pipeline derived from it. Pipelines are keyed
//! by the render-state hash computed at draw time.

use ash::{vk, Device};
use std::collections::HashMap;
use std::ffi::CString;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::render::types::{ResourceLayout, ShaderModuleDescriptor, ShaderStage};
use crate::render::vulkan::context::{VulkanError, VulkanResult};

const SPIRV_MAGIC: u32 = 0x0723_0203;

static NEXT_PROGRAM_ID: AtomicU64 = AtomicU64::new(1);

/// Translate an engine shader stage to Vulkan stage flags.
pub fn translate_shader_stage(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
    }
}

/// Sanity-check a SPIR-V blob before handing it to the driver.
pub fn validate_spirv(words: &[u32]) -> VulkanResult<()> {
    if words.is_empty() {
        return Err(VulkanError::InvalidOperation {
            reason: "empty SPIR-V blob".to_string(),
        });
    }
    if words[0] != SPIRV_MAGIC {
        return Err(VulkanError::InvalidOperation {
            reason: format!("bad SPIR-V magic number {:#010x}", words[0]),
        });
    }
    Ok(())
}

struct StageModule {
    stage: vk::ShaderStageFlags,
    module: vk::ShaderModule,
    entry_point: CString,
}

/// Shader program: per-stage modules plus derived pipelines
pub struct ShaderProgram {
    device: Device,
    stages: Vec<StageModule>,
    layout: ResourceLayout,
    id: u64,
    pipelines: HashMap<u64, vk::Pipeline>,
}

impl ShaderProgram {
    /// Create a program from externally compiled SPIR-V stages.
    pub fn new(device: Device, descriptor: &ShaderModuleDescriptor) -> VulkanResult<Self> {
        if descriptor.stages.is_empty() {
            return Err(VulkanError::InvalidOperation {
                reason: "shader program needs at least one stage".to_string(),
            });
        }

        let mut stages: Vec<StageModule> = Vec::with_capacity(descriptor.stages.len());
        for stage in &descriptor.stages {
            validate_spirv(&stage.spirv)?;
            let entry_point = CString::new(stage.entry_point.as_str()).map_err(|_| {
                VulkanError::InvalidOperation {
                    reason: "entry point contains a NUL byte".to_string(),
                }
            })?;

            let create_info = vk::ShaderModuleCreateInfo::builder().code(&stage.spirv);
            let module = match unsafe { device.create_shader_module(&create_info, None) } {
                Ok(module) => module,
                Err(e) => {
                    for created in &stages {
                        unsafe { device.destroy_shader_module(created.module, None) };
                    }
                    return Err(VulkanError::Api(e));
                }
            };
            stages.push(StageModule {
                stage: translate_shader_stage(stage.stage),
                module,
                entry_point,
            });
        }

        Ok(Self {
            device,
            stages,
            layout: descriptor.layout,
            id: NEXT_PROGRAM_ID.fetch_add(1, Ordering::Relaxed),
            pipelines: HashMap::new(),
        })
    }

    /// Unique program id, part of every derived pipeline's hash
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The reflected resource layout
    pub fn layout(&self) -> &ResourceLayout {
        &self.layout
    }

    /// Stage create-infos for pipeline construction
    pub fn stage_create_infos(&self) -> Vec<vk::PipelineShaderStageCreateInfo> {
        self.stages
            .iter()
            .map(|stage| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage.stage)
                    .module(stage.module)
                    .name(&stage.entry_point)
                    .build()
            })
            .collect()
    }

    /// Look up a previously derived pipeline by render-state hash.
    pub fn get_pipeline(&self, hash: u64) -> Option<vk::Pipeline> {
        self.pipelines.get(&hash).copied()
    }

    /// Register a newly derived pipeline under its hash.
    pub fn add_pipeline(&mut self, hash: u64, pipeline: vk::Pipeline) {
        self.pipelines.insert(hash, pipeline);
    }
}

impl Drop for ShaderProgram {
    fn drop(&mut self) {
        unsafe {
            for (_, pipeline) in self.pipelines.drain() {
                self.device.destroy_pipeline(pipeline, None);
            }
            for stage in self.stages.drain(..) {
                self.device.destroy_shader_module(stage.module, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_translation() {
        assert_eq!(
            translate_shader_stage(ShaderStage::Vertex),
            vk::ShaderStageFlags::VERTEX
        );
        assert_eq!(
            translate_shader_stage(ShaderStage::Fragment),
            vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(
            translate_shader_stage(ShaderStage::Compute),
            vk::ShaderStageFlags::COMPUTE
        );
    }

    #[test]
    fn spirv_validation_checks_magic() {
        assert!(validate_spirv(&[]).is_err());
        assert!(validate_spirv(&[0xDEAD_BEEF]).is_err());
        assert!(validate_spirv(&[SPIRV_MAGIC, 0x0001_0000]).is_ok());
    }
}
