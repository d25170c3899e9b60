use std::sync::Arc;

use ash::vk;

use crate::error::{Result, RhiError};
use crate::pipeline::{ComputePipelineDesc, ShaderType};

use super::{create_pipeline_layout, PipelineKind, VulkanPipeline, VulkanShader};

pub fn create_compute_pipeline(
    device: &Arc<ash::Device>,
    desc: &ComputePipelineDesc,
    shader: &VulkanShader,
    set_layouts: &[vk::DescriptorSetLayout],
) -> Result<VulkanPipeline> {
    if shader.stage != ShaderType::Compute {
        return Err(RhiError::unsupported(format!("{:?} shader in a compute pipeline", shader.stage)));
    }
    let layout = create_pipeline_layout(device, set_layouts)?;
    let create_info = vk::ComputePipelineCreateInfo::default()
        .stage(shader.stage_info(vk::ShaderStageFlags::COMPUTE))
        .layout(layout);
    let pipeline = match unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None) } {
        Ok(p) => p[0],
        Err((_, e)) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            return Err(e.into());
        }
    };
    log::debug!("created Vulkan compute pipeline {}", desc.label.as_deref().unwrap_or("<unnamed>"));
    Ok(VulkanPipeline {
        device: device.clone(),
        pipeline,
        layout,
        kind: PipelineKind::Compute,
        set_layouts: desc.binding_layouts.clone(),
    })
}
