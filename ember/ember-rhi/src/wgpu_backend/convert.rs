//! Mapping from RHI enums to wgpu types.

use crate::descriptor::{BindingType, ShaderStages};
use crate::error::{Result, RhiError};
use crate::format::{DataType, IndexFormat, StorageFormat};
use crate::pipeline::{BlendMode, CompareFunc, CullMode, PrimitiveType, StencilOp};
use crate::resource::{TextureFilter, TextureKind, WrapMode};

pub fn texture_format(format: StorageFormat) -> Result<wgpu::TextureFormat> {
    use wgpu::TextureFormat as F;
    use StorageFormat::*;
    Ok(match format {
        R8 => F::R8Unorm,
        RI8 => F::R8Sint,
        R16 => F::R16Unorm,
        RI16 => F::R16Sint,
        Int32Raw => F::R32Sint,
        RF16 => F::R16Float,
        RF32 => F::R32Float,
        Rg8 => F::Rg8Unorm,
        Rg16 => F::Rg16Unorm,
        RgI8 => F::Rg8Sint,
        RgI16 => F::Rg16Sint,
        RgI32Raw => F::Rg32Sint,
        RgF16 => F::Rg16Float,
        RgF32 => F::Rg32Float,
        Rgba8 => F::Rgba8Unorm,
        RgbaI8 => F::Rgba8Sint,
        Rgba16 => F::Rgba16Unorm,
        RgbaI16 => F::Rgba16Sint,
        RgbaI32Raw => F::Rgba32Sint,
        RgbaF16 => F::Rgba16Float,
        RgbaF32 => F::Rgba32Float,
        R11fG11fB10f => F::Rg11b10Ufloat,
        Rgb10A2 => F::Rgb10a2Unorm,
        Bc1 => F::Bc1RgbaUnorm,
        Bc3 => F::Bc3RgbaUnorm,
        Bc5 => F::Bc5RgUnorm,
        Depth24 => F::Depth24Plus,
        Depth32 => F::Depth32Float,
        Depth24Stencil8 => F::Depth24PlusStencil8,
        RgbaCompressed => {
            return Err(RhiError::unsupported("RgbaCompressed has no wgpu equivalent"));
        }
    })
}

pub fn view_dimension(kind: TextureKind) -> wgpu::TextureViewDimension {
    match kind {
        TextureKind::D2 => wgpu::TextureViewDimension::D2,
        TextureKind::D2Array => wgpu::TextureViewDimension::D2Array,
        TextureKind::D3 => wgpu::TextureViewDimension::D3,
        TextureKind::Cube => wgpu::TextureViewDimension::Cube,
        TextureKind::CubeArray => wgpu::TextureViewDimension::CubeArray,
    }
}

pub fn texture_dimension(kind: TextureKind) -> wgpu::TextureDimension {
    match kind {
        TextureKind::D3 => wgpu::TextureDimension::D3,
        _ => wgpu::TextureDimension::D2,
    }
}

pub fn shader_stages(stages: ShaderStages) -> wgpu::ShaderStages {
    let mut out = wgpu::ShaderStages::NONE;
    if stages.contains(ShaderStages::VERTEX) {
        out |= wgpu::ShaderStages::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        out |= wgpu::ShaderStages::FRAGMENT;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        out |= wgpu::ShaderStages::COMPUTE;
    }
    out
}

/// `None` for `Unused` bindings.
pub fn binding_type(ty: &BindingType) -> Option<wgpu::BindingType> {
    Some(match *ty {
        BindingType::UniformBuffer => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingType::StorageBuffer { read_only } => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingType::Texture { kind, depth } => wgpu::BindingType::Texture {
            sample_type: if depth {
                wgpu::TextureSampleType::Depth
            } else {
                wgpu::TextureSampleType::Float { filterable: true }
            },
            view_dimension: view_dimension(kind),
            multisampled: false,
        },
        BindingType::Sampler { comparison } => wgpu::BindingType::Sampler(if comparison {
            wgpu::SamplerBindingType::Comparison
        } else {
            wgpu::SamplerBindingType::Filtering
        }),
        BindingType::Unused => return None,
    })
}

pub fn vertex_format(data_type: DataType, normalized: bool) -> Result<wgpu::VertexFormat> {
    use wgpu::VertexFormat as V;
    use DataType::*;
    Ok(match (data_type, normalized) {
        (Byte2, false) => V::Uint8x2,
        (Byte4, false) => V::Uint8x4,
        (Byte2, true) => V::Unorm8x2,
        (Byte4, true) => V::Unorm8x4,
        (Char2, false) => V::Sint8x2,
        (Char4, false) => V::Sint8x4,
        (Char2, true) => V::Snorm8x2,
        (Char4, true) => V::Snorm8x4,
        (Short2, false) => V::Sint16x2,
        (Short4, false) => V::Sint16x4,
        (Short2, true) => V::Snorm16x2,
        (Short4, true) => V::Snorm16x4,
        (UShort2, false) => V::Uint16x2,
        (UShort4, false) => V::Uint16x4,
        (UShort2, true) => V::Unorm16x2,
        (UShort4, true) => V::Unorm16x4,
        (Half2, _) => V::Float16x2,
        (Half4, _) => V::Float16x4,
        (Int, _) => V::Sint32,
        (Int2, _) => V::Sint32x2,
        (Int3, _) => V::Sint32x3,
        (Int4, _) => V::Sint32x4,
        (UInt, _) => V::Uint32,
        (Float, _) => V::Float32,
        (Float2, _) => V::Float32x2,
        (Float3, _) => V::Float32x3,
        (Float4, _) => V::Float32x4,
        (other, n) => {
            return Err(RhiError::unsupported(format!(
                "vertex attribute {other:?} (normalized: {n}) has no wgpu vertex format"
            )))
        }
    })
}

pub fn index_format(format: IndexFormat) -> wgpu::IndexFormat {
    match format {
        IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
        IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
    }
}

pub fn topology(ty: PrimitiveType) -> Result<wgpu::PrimitiveTopology> {
    Ok(match ty {
        PrimitiveType::Points => wgpu::PrimitiveTopology::PointList,
        PrimitiveType::Lines => wgpu::PrimitiveTopology::LineList,
        PrimitiveType::LineStrips => wgpu::PrimitiveTopology::LineStrip,
        PrimitiveType::Triangles => wgpu::PrimitiveTopology::TriangleList,
        PrimitiveType::TriangleStrips => wgpu::PrimitiveTopology::TriangleStrip,
        PrimitiveType::TriangleFans | PrimitiveType::Quads | PrimitiveType::Patches => {
            return Err(RhiError::unsupported(format!("{ty:?} topology is not supported by wgpu")))
        }
    })
}

pub fn cull_mode(mode: CullMode) -> Option<wgpu::Face> {
    match mode {
        CullMode::Disabled => None,
        CullMode::CullBackFace => Some(wgpu::Face::Back),
        CullMode::CullFrontFace => Some(wgpu::Face::Front),
    }
}

/// `Disabled` maps to `Always`; callers turn depth writes off separately.
pub fn compare(func: CompareFunc) -> wgpu::CompareFunction {
    match func {
        CompareFunc::Disabled | CompareFunc::Always => wgpu::CompareFunction::Always,
        CompareFunc::Greater => wgpu::CompareFunction::Greater,
        CompareFunc::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFunc::Less => wgpu::CompareFunction::Less,
        CompareFunc::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunc::Equal => wgpu::CompareFunction::Equal,
        CompareFunc::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareFunc::Never => wgpu::CompareFunction::Never,
    }
}

pub fn stencil_op(op: StencilOp) -> wgpu::StencilOperation {
    match op {
        StencilOp::Keep => wgpu::StencilOperation::Keep,
        StencilOp::Zero => wgpu::StencilOperation::Zero,
        StencilOp::Replace => wgpu::StencilOperation::Replace,
        StencilOp::Increment => wgpu::StencilOperation::IncrementClamp,
        StencilOp::IncrementWrap => wgpu::StencilOperation::IncrementWrap,
        StencilOp::Decrement => wgpu::StencilOperation::DecrementClamp,
        StencilOp::DecrementWrap => wgpu::StencilOperation::DecrementWrap,
        StencilOp::Invert => wgpu::StencilOperation::Invert,
    }
}

pub fn blend(mode: BlendMode) -> Option<wgpu::BlendState> {
    match mode {
        BlendMode::Replace => None,
        BlendMode::Add => Some(wgpu::BlendState {
            color: wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::One,
                dst_factor: wgpu::BlendFactor::One,
                operation: wgpu::BlendOperation::Add,
            },
            alpha: wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::One,
                dst_factor: wgpu::BlendFactor::One,
                operation: wgpu::BlendOperation::Add,
            },
        }),
        BlendMode::AlphaBlend => Some(wgpu::BlendState::ALPHA_BLENDING),
    }
}

pub fn address_mode(wrap: WrapMode) -> wgpu::AddressMode {
    match wrap {
        WrapMode::Repeat => wgpu::AddressMode::Repeat,
        WrapMode::Clamp => wgpu::AddressMode::ClampToEdge,
        WrapMode::Mirror => wgpu::AddressMode::MirrorRepeat,
    }
}

/// (mag/min filter, mipmap filter)
pub fn filter(filter: TextureFilter) -> (wgpu::FilterMode, wgpu::FilterMode) {
    match filter {
        TextureFilter::Nearest => (wgpu::FilterMode::Nearest, wgpu::FilterMode::Nearest),
        TextureFilter::Linear => (wgpu::FilterMode::Linear, wgpu::FilterMode::Nearest),
        _ => (wgpu::FilterMode::Linear, wgpu::FilterMode::Linear),
    }
}

pub fn clear_color(rgba: [f32; 4]) -> wgpu::Color {
    wgpu::Color {
        r: f64::from(rgba[0]),
        g: f64::from(rgba[1]),
        b: f64::from(rgba[2]),
        a: f64::from(rgba[3]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_component_bytes_are_unsupported() {
        assert!(vertex_format(DataType::Byte3, true).is_err());
        assert_eq!(vertex_format(DataType::Float3, false).unwrap(), wgpu::VertexFormat::Float32x3);
        assert_eq!(vertex_format(DataType::Byte4, true).unwrap(), wgpu::VertexFormat::Unorm8x4);
    }

    #[test]
    fn fans_are_unsupported() {
        assert!(topology(PrimitiveType::TriangleFans).is_err());
        assert_eq!(topology(PrimitiveType::Triangles).unwrap(), wgpu::PrimitiveTopology::TriangleList);
    }

    #[test]
    fn depth_formats() {
        assert_eq!(texture_format(StorageFormat::Depth32).unwrap(), wgpu::TextureFormat::Depth32Float);
        assert!(texture_format(StorageFormat::RgbaCompressed).is_err());
    }
}
