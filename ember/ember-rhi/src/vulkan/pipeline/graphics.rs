use std::sync::Arc;

use ash::vk;

use crate::error::{Result, RhiError};
use crate::format::DataType;
use crate::pipeline::{BlendMode, CompareFunc, CullMode, PipelineBuilder, PrimitiveType};
use crate::render_target::RenderTargetLayout;

use super::{compare_op, create_pipeline_layout, stencil_op, PipelineKind, VulkanPipeline, VulkanShader};

/// Build a graphics pipeline against `render_pass`. Viewport and scissor are dynamic.
#[allow(clippy::too_many_arguments)]
pub fn create_graphics_pipeline(
    device: &Arc<ash::Device>,
    builder: &PipelineBuilder,
    vertex: &VulkanShader,
    fragment: Option<&VulkanShader>,
    set_layouts: &[vk::DescriptorSetLayout],
    render_pass: vk::RenderPass,
    render_layout: RenderTargetLayout,
    vertex_supported: impl Fn(vk::Format) -> bool,
) -> Result<VulkanPipeline> {
    let ff = builder.fixed_function;
    let mut stages = vec![vertex.stage_info(vk::ShaderStageFlags::VERTEX)];
    if let Some(fragment) = fragment {
        stages.push(fragment.stage_info(vk::ShaderStageFlags::FRAGMENT));
    }

    let attributes = builder
        .vertex_format
        .attributes
        .iter()
        .map(|a| {
            let format = vertex_format(a.data_type, a.normalized)?;
            if !vertex_supported(format) {
                return Err(RhiError::unsupported(format!("{format:?} is not a supported vertex format")));
            }
            Ok(vk::VertexInputAttributeDescription::default()
                .location(a.location)
                .binding(0)
                .format(format)
                .offset(a.offset))
        })
        .collect::<Result<Vec<_>>>()?;
    let bindings = if attributes.is_empty() {
        Vec::new()
    } else {
        vec![vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(builder.vertex_format.size())
            .input_rate(vk::VertexInputRate::VERTEX)]
    };
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(topology(ff.topology)?)
        .primitive_restart_enable(ff.primitive_restart);
    let viewport_state = vk::PipelineViewportStateCreateInfo::default().viewport_count(1).scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(cull_mode(ff.cull_mode))
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(ff.polygon_offset)
        .depth_bias_constant_factor(ff.polygon_offset_units)
        .depth_bias_slope_factor(ff.polygon_offset_factor);
    let multisample =
        vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let stencil_enabled = ff.stencil_compare != CompareFunc::Disabled;
    let face = vk::StencilOpState::default()
        .fail_op(stencil_op(ff.stencil_fail_op))
        .pass_op(stencil_op(ff.stencil_depth_pass_op))
        .depth_fail_op(stencil_op(ff.stencil_depth_fail_op))
        .compare_op(compare_op(ff.stencil_compare))
        .compare_mask(ff.stencil_mask)
        .write_mask(ff.stencil_mask)
        .reference(ff.stencil_reference);
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(ff.depth_compare != CompareFunc::Disabled)
        .depth_write_enable(ff.depth_compare != CompareFunc::Disabled)
        .depth_compare_op(compare_op(ff.depth_compare))
        .stencil_test_enable(stencil_enabled)
        .front(face)
        .back(face);

    let blend_attachments: Vec<_> = render_layout
        .color_attachments()
        .map(|(_, a)| blend_attachment(if a.format.is_integer() { BlendMode::Replace } else { ff.blend_mode }))
        .collect();
    let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let layout = create_pipeline_layout(device, set_layouts)?;
    let mut create_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);
    if render_layout.depth_attachment().is_some() {
        create_info = create_info.depth_stencil_state(&depth_stencil);
    }
    let pipelines = unsafe { device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None) };
    let pipeline = match pipelines {
        Ok(p) => p[0],
        Err((_, e)) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            return Err(e.into());
        }
    };
    log::debug!("created Vulkan pipeline {}", builder.label.as_deref().unwrap_or("<unnamed>"));
    Ok(VulkanPipeline {
        device: device.clone(),
        pipeline,
        layout,
        kind: PipelineKind::Graphics { render_layout },
        set_layouts: builder.binding_layouts.clone(),
    })
}

fn topology(ty: PrimitiveType) -> Result<vk::PrimitiveTopology> {
    Ok(match ty {
        PrimitiveType::Points => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveType::Lines => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveType::LineStrips => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveType::Triangles => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveType::TriangleStrips => vk::PrimitiveTopology::TRIANGLE_STRIP,
        PrimitiveType::TriangleFans => vk::PrimitiveTopology::TRIANGLE_FAN,
        PrimitiveType::Quads | PrimitiveType::Patches => {
            return Err(RhiError::unsupported(format!("{ty:?} topology is not supported")))
        }
    })
}

fn cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::Disabled => vk::CullModeFlags::NONE,
        CullMode::CullBackFace => vk::CullModeFlags::BACK,
        CullMode::CullFrontFace => vk::CullModeFlags::FRONT,
    }
}

fn blend_attachment(mode: BlendMode) -> vk::PipelineColorBlendAttachmentState {
    let state = vk::PipelineColorBlendAttachmentState::default().color_write_mask(vk::ColorComponentFlags::RGBA);
    let (src, dst, src_alpha, dst_alpha) = match mode {
        BlendMode::Replace => return state.blend_enable(false),
        BlendMode::Add => (vk::BlendFactor::ONE, vk::BlendFactor::ONE, vk::BlendFactor::ONE, vk::BlendFactor::ONE),
        BlendMode::AlphaBlend => (
            vk::BlendFactor::SRC_ALPHA,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            vk::BlendFactor::ONE,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        ),
    };
    state
        .blend_enable(true)
        .src_color_blend_factor(src)
        .dst_color_blend_factor(dst)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(src_alpha)
        .dst_alpha_blend_factor(dst_alpha)
        .alpha_blend_op(vk::BlendOp::ADD)
}

pub fn vertex_format(data_type: DataType, normalized: bool) -> Result<vk::Format> {
    use DataType::*;
    Ok(match (data_type, normalized) {
        (Byte, false) => vk::Format::R8_UINT,
        (Byte2, false) => vk::Format::R8G8_UINT,
        (Byte3, false) => vk::Format::R8G8B8_UINT,
        (Byte4, false) => vk::Format::R8G8B8A8_UINT,
        (Byte, true) => vk::Format::R8_UNORM,
        (Byte2, true) => vk::Format::R8G8_UNORM,
        (Byte3, true) => vk::Format::R8G8B8_UNORM,
        (Byte4, true) => vk::Format::R8G8B8A8_UNORM,
        (Char, false) => vk::Format::R8_SINT,
        (Char2, false) => vk::Format::R8G8_SINT,
        (Char3, false) => vk::Format::R8G8B8_SINT,
        (Char4, false) => vk::Format::R8G8B8A8_SINT,
        (Char, true) => vk::Format::R8_SNORM,
        (Char2, true) => vk::Format::R8G8_SNORM,
        (Char3, true) => vk::Format::R8G8B8_SNORM,
        (Char4, true) => vk::Format::R8G8B8A8_SNORM,
        (Short, false) => vk::Format::R16_SINT,
        (Short2, false) => vk::Format::R16G16_SINT,
        (Short3, false) => vk::Format::R16G16B16_SINT,
        (Short4, false) => vk::Format::R16G16B16A16_SINT,
        (Short, true) => vk::Format::R16_SNORM,
        (Short2, true) => vk::Format::R16G16_SNORM,
        (Short3, true) => vk::Format::R16G16B16_SNORM,
        (Short4, true) => vk::Format::R16G16B16A16_SNORM,
        (UShort, false) => vk::Format::R16_UINT,
        (UShort2, false) => vk::Format::R16G16_UINT,
        (UShort3, false) => vk::Format::R16G16B16_UINT,
        (UShort4, false) => vk::Format::R16G16B16A16_UINT,
        (UShort, true) => vk::Format::R16_UNORM,
        (UShort2, true) => vk::Format::R16G16_UNORM,
        (UShort3, true) => vk::Format::R16G16B16_UNORM,
        (UShort4, true) => vk::Format::R16G16B16A16_UNORM,
        (Half, _) => vk::Format::R16_SFLOAT,
        (Half2, _) => vk::Format::R16G16_SFLOAT,
        (Half3, _) => vk::Format::R16G16B16_SFLOAT,
        (Half4, _) => vk::Format::R16G16B16A16_SFLOAT,
        (Int, _) => vk::Format::R32_SINT,
        (Int2, _) => vk::Format::R32G32_SINT,
        (Int3, _) => vk::Format::R32G32B32_SINT,
        (Int4, _) => vk::Format::R32G32B32A32_SINT,
        (UInt, _) => vk::Format::R32_UINT,
        (Float, _) => vk::Format::R32_SFLOAT,
        (Float2, _) => vk::Format::R32G32_SFLOAT,
        (Float3, _) => vk::Format::R32G32B32_SFLOAT,
        (Float4, _) => vk::Format::R32G32B32A32_SFLOAT,
        (UInt4_10_10_10_2, false) => vk::Format::A2B10G10R10_UINT_PACK32,
        (UInt4_10_10_10_2, true) => vk::Format::A2B10G10R10_UNORM_PACK32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fans_are_native_but_quads_are_not() {
        assert_eq!(topology(PrimitiveType::TriangleFans).unwrap(), vk::PrimitiveTopology::TRIANGLE_FAN);
        assert!(matches!(topology(PrimitiveType::Quads), Err(RhiError::Unsupported(_))));
    }

    #[test]
    fn normalized_flag_selects_unorm() {
        assert_eq!(vertex_format(DataType::Byte4, true).unwrap(), vk::Format::R8G8B8A8_UNORM);
        assert_eq!(vertex_format(DataType::Byte4, false).unwrap(), vk::Format::R8G8B8A8_UINT);
        assert_eq!(vertex_format(DataType::Float3, true).unwrap(), vk::Format::R32G32B32_SFLOAT);
    }

    #[test]
    fn replace_disables_blending() {
        assert_eq!(blend_attachment(BlendMode::Replace).blend_enable, vk::FALSE);
        let alpha = blend_attachment(BlendMode::AlphaBlend);
        assert_eq!(alpha.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
    }
}
