//! Shader modules and pipelines.

mod compute;
mod graphics;

use std::ffi::CString;
use std::sync::Arc;

use ash::vk;

use crate::error::{Result, RhiError};
use crate::handle::DescriptorSetLayoutHandle;
use crate::pipeline::{CompareFunc, ShaderCode, ShaderDesc, ShaderType, StencilOp};
use crate::render_target::RenderTargetLayout;

pub use compute::create_compute_pipeline;
pub use graphics::create_graphics_pipeline;

pub struct VulkanShader {
    pub device: Arc<ash::Device>,
    pub module: vk::ShaderModule,
    pub stage: ShaderType,
    pub entry_point: CString,
}

impl VulkanShader {
    pub fn new(device: &Arc<ash::Device>, desc: &ShaderDesc) -> Result<Self> {
        let ShaderCode::SpirV(words) = &desc.code else {
            return Err(RhiError::unsupported("the Vulkan backend consumes SPIR-V shaders"));
        };
        if words.is_empty() {
            return Err(RhiError::unsupported("empty SPIR-V module"));
        }
        let entry_point = CString::new(desc.entry_point.as_str())
            .map_err(|_| RhiError::unsupported("shader entry point contains a NUL byte"))?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(words);
        let module = unsafe { device.create_shader_module(&create_info, None)? };
        Ok(Self { device: device.clone(), module, stage: desc.stage, entry_point })
    }

    fn stage_info(&self, stage: vk::ShaderStageFlags) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(stage)
            .module(self.module)
            .name(&self.entry_point)
    }
}

impl Drop for VulkanShader {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

pub enum PipelineKind {
    Graphics { render_layout: RenderTargetLayout },
    Compute,
}

pub struct VulkanPipeline {
    pub device: Arc<ash::Device>,
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub kind: PipelineKind,
    pub set_layouts: Vec<DescriptorSetLayoutHandle>,
}

impl VulkanPipeline {
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        match self.kind {
            PipelineKind::Graphics { .. } => vk::PipelineBindPoint::GRAPHICS,
            PipelineKind::Compute => vk::PipelineBindPoint::COMPUTE,
        }
    }
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

impl std::fmt::Debug for VulkanPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanPipeline").field("bind_point", &self.bind_point()).finish_non_exhaustive()
    }
}

fn create_pipeline_layout(device: &ash::Device, set_layouts: &[vk::DescriptorSetLayout]) -> Result<vk::PipelineLayout> {
    let create_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);
    Ok(unsafe { device.create_pipeline_layout(&create_info, None)? })
}

/// `Disabled` maps to `ALWAYS`; callers switch the test off separately.
pub fn compare_op(func: CompareFunc) -> vk::CompareOp {
    match func {
        CompareFunc::Disabled | CompareFunc::Always => vk::CompareOp::ALWAYS,
        CompareFunc::Greater => vk::CompareOp::GREATER,
        CompareFunc::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareFunc::Less => vk::CompareOp::LESS,
        CompareFunc::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareFunc::Equal => vk::CompareOp::EQUAL,
        CompareFunc::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareFunc::Never => vk::CompareOp::NEVER,
    }
}

pub fn stencil_op(op: StencilOp) -> vk::StencilOp {
    match op {
        StencilOp::Keep => vk::StencilOp::KEEP,
        StencilOp::Zero => vk::StencilOp::ZERO,
        StencilOp::Replace => vk::StencilOp::REPLACE,
        StencilOp::Increment => vk::StencilOp::INCREMENT_AND_CLAMP,
        StencilOp::IncrementWrap => vk::StencilOp::INCREMENT_AND_WRAP,
        StencilOp::Decrement => vk::StencilOp::DECREMENT_AND_CLAMP,
        StencilOp::DecrementWrap => vk::StencilOp::DECREMENT_AND_WRAP,
        StencilOp::Invert => vk::StencilOp::INVERT,
    }
}
