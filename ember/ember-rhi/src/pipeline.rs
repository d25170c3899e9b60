//! Pipeline description: shader stages, vertex layout, fixed-function state, and the builder
//! that turns them into a backend pipeline.

use crate::error::{Result, RhiError};
use crate::format::DataType;
use crate::handle::{DescriptorSetLayoutHandle, PipelineHandle, RenderTargetLayoutHandle, ShaderHandle};
use crate::renderer::HardwareRenderer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Replace,
    Add,
    AlphaBlend,
}

/// Depth/stencil/sampler comparison. `Disabled` turns the test off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareFunc {
    #[default]
    Disabled,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Equal,
    NotEqual,
    Always,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    Disabled,
    #[default]
    CullBackFace,
    CullFrontFace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    Increment,
    IncrementWrap,
    Decrement,
    DecrementWrap,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveType {
    Points,
    Lines,
    LineStrips,
    #[default]
    Triangles,
    TriangleStrips,
    TriangleFans,
    Quads,
    Patches,
}

impl PrimitiveType {
    pub fn is_strip(self) -> bool {
        matches!(self, PrimitiveType::LineStrips | PrimitiveType::TriangleStrips)
    }
}

/// Non-programmable state baked into a pipeline. Defaults match the engine's.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedFunctionStates {
    pub primitive_restart: bool,
    pub polygon_offset: bool,
    pub polygon_offset_factor: f32,
    pub polygon_offset_units: f32,
    pub topology: PrimitiveType,
    pub patch_size: u32,
    pub depth_compare: CompareFunc,
    pub stencil_compare: CompareFunc,
    pub stencil_fail_op: StencilOp,
    pub stencil_depth_fail_op: StencilOp,
    pub stencil_depth_pass_op: StencilOp,
    pub blend_mode: BlendMode,
    pub stencil_mask: u32,
    pub stencil_reference: u32,
    pub cull_mode: CullMode,
}

impl Default for FixedFunctionStates {
    fn default() -> Self {
        Self {
            primitive_restart: false,
            polygon_offset: false,
            polygon_offset_factor: 0.4,
            polygon_offset_units: 1.0,
            topology: PrimitiveType::Triangles,
            patch_size: 3,
            depth_compare: CompareFunc::Disabled,
            stencil_compare: CompareFunc::Disabled,
            stencil_fail_op: StencilOp::Keep,
            stencil_depth_fail_op: StencilOp::Keep,
            stencil_depth_pass_op: StencilOp::Keep,
            blend_mode: BlendMode::Replace,
            stencil_mask: 0xFFFF_FFFF,
            stencil_reference: 0,
            cull_mode: CullMode::CullBackFace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttributeDesc {
    pub data_type: DataType,
    pub normalized: bool,
    pub offset: u32,
    pub location: u32,
}

impl VertexAttributeDesc {
    pub fn new(data_type: DataType, normalized: bool, offset: u32, location: u32) -> Self {
        Self { data_type, normalized, offset, location }
    }
}

/// Interleaved layout of one vertex buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VertexFormat {
    pub attributes: Vec<VertexAttributeDesc>,
    /// Explicit stride; `None` means tightly packed up to the last attribute.
    pub stride: Option<u32>,
}

impl VertexFormat {
    pub fn new(attributes: Vec<VertexAttributeDesc>) -> Self {
        Self { attributes, stride: None }
    }

    /// Byte stride of one vertex.
    pub fn size(&self) -> u32 {
        if let Some(stride) = self.stride {
            return stride;
        }
        self.attributes
            .iter()
            .map(|a| a.offset + a.data_type.size())
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderType {
    Vertex,
    Fragment,
    Hull,
    Domain,
    Compute,
}

/// Shader blob in the form the active backend consumes (see `HardwareRenderer::shader_target`).
#[derive(Debug, Clone, PartialEq)]
pub enum ShaderCode {
    Wgsl(String),
    SpirV(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShaderDesc {
    pub stage: ShaderType,
    pub code: ShaderCode,
    pub entry_point: String,
}

impl ShaderDesc {
    pub fn wgsl(stage: ShaderType, source: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self { stage, code: ShaderCode::Wgsl(source.into()), entry_point: entry_point.into() }
    }

    pub fn spirv(stage: ShaderType, words: Vec<u32>, entry_point: impl Into<String>) -> Self {
        Self { stage, code: ShaderCode::SpirV(words), entry_point: entry_point.into() }
    }

    /// SPIR-V from a little-endian byte blob. Must be a whole number of words.
    pub fn spirv_bytes(stage: ShaderType, bytes: &[u8], entry_point: impl Into<String>) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(RhiError::unsupported("SPIR-V must be 4-byte aligned"));
        }
        let words = bytes.chunks_exact(4).map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]])).collect();
        Ok(Self::spirv(stage, words, entry_point))
    }
}

/// Stage slots of a graphics pipeline after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraphicsStages {
    pub vertex: Option<ShaderHandle>,
    pub fragment: Option<ShaderHandle>,
}

impl GraphicsStages {
    /// Sort `shaders` into stage slots. Each stage may appear once. Neither backend drives
    /// tessellation, so hull and domain stages are rejected here.
    pub fn collect(shaders: &[(ShaderHandle, ShaderType)]) -> Result<Self> {
        let mut stages = GraphicsStages::default();
        for &(handle, ty) in shaders {
            let slot = match ty {
                ShaderType::Vertex => &mut stages.vertex,
                ShaderType::Fragment => &mut stages.fragment,
                ShaderType::Hull | ShaderType::Domain => {
                    return Err(RhiError::unsupported(format!("{ty:?} shaders are not supported")))
                }
                ShaderType::Compute => {
                    return Err(RhiError::unsupported(
                        "compute shaders go through create_compute_pipeline",
                    ))
                }
            };
            if slot.replace(handle).is_some() {
                return Err(RhiError::unsupported(format!("more than one {ty:?} shader supplied")));
            }
        }
        if stages.vertex.is_none() {
            return Err(RhiError::unsupported("a graphics pipeline needs a vertex shader"));
        }
        Ok(stages)
    }
}

/// Collects everything a graphics pipeline needs; `to_pipeline` compiles it against a render target layout.
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    pub label: Option<String>,
    pub shaders: Vec<ShaderHandle>,
    pub vertex_format: VertexFormat,
    pub binding_layouts: Vec<DescriptorSetLayoutHandle>,
    pub fixed_function: FixedFunctionStates,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_shaders(&mut self, shaders: &[ShaderHandle]) -> &mut Self {
        self.shaders = shaders.to_vec();
        self
    }

    pub fn set_vertex_layout(&mut self, format: VertexFormat) -> &mut Self {
        self.vertex_format = format;
        self
    }

    pub fn set_binding_layout(&mut self, layouts: &[DescriptorSetLayoutHandle]) -> &mut Self {
        self.binding_layouts = layouts.to_vec();
        self
    }

    pub fn set_debug_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.label = Some(name.into());
        self
    }

    pub fn to_pipeline(
        &self,
        renderer: &mut dyn HardwareRenderer,
        layout: RenderTargetLayoutHandle,
    ) -> Result<PipelineHandle> {
        renderer.create_pipeline(self, layout)
    }

    /// Checks that do not depend on the backend.
    pub fn validate_fixed_function(&self) -> Result<()> {
        let ff = &self.fixed_function;
        if matches!(ff.topology, PrimitiveType::Patches | PrimitiveType::Quads) {
            return Err(RhiError::unsupported(format!("{:?} topology is not supported", ff.topology)));
        }
        if ff.primitive_restart && !ff.topology.is_strip() {
            return Err(RhiError::unsupported(format!(
                "primitive restart needs a strip topology, got {:?}",
                ff.topology
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for attr in &self.vertex_format.attributes {
            if !seen.insert(attr.location) {
                return Err(RhiError::unsupported(format!(
                    "vertex location {} declared twice",
                    attr.location
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ComputePipelineDesc {
    pub label: Option<String>,
    pub shader: ShaderHandle,
    pub binding_layouts: Vec<DescriptorSetLayoutHandle>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn handles(n: usize) -> Vec<ShaderHandle> {
        let mut map: SlotMap<ShaderHandle, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    #[test]
    fn spirv_bytes_are_read_as_little_endian_words() {
        let bytes = [0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00];
        let desc = ShaderDesc::spirv_bytes(ShaderType::Vertex, &bytes, "main").unwrap();
        assert_eq!(desc.code, ShaderCode::SpirV(vec![0x0723_0203, 0x0001_0000]));
        assert!(ShaderDesc::spirv_bytes(ShaderType::Vertex, &bytes[..6], "main").is_err());
    }

    #[test]
    fn engine_defaults() {
        let ff = FixedFunctionStates::default();
        assert_eq!(ff.blend_mode, BlendMode::Replace);
        assert_eq!(ff.cull_mode, CullMode::CullBackFace);
        assert_eq!(ff.stencil_mask, 0xFFFF_FFFF);
        assert_eq!(ff.patch_size, 3);
        assert!((ff.polygon_offset_factor - 0.4).abs() < f32::EPSILON);
    }

    #[test]
    fn vertex_size_is_end_of_last_attribute() {
        let format = VertexFormat::new(vec![
            VertexAttributeDesc::new(DataType::Float3, false, 0, 0),
            VertexAttributeDesc::new(DataType::Float2, false, 12, 1),
            VertexAttributeDesc::new(DataType::Byte4, true, 20, 2),
        ]);
        assert_eq!(format.size(), 24);
        let padded = VertexFormat { stride: Some(32), ..format };
        assert_eq!(padded.size(), 32);
    }

    #[test]
    fn duplicate_stage_is_rejected() {
        let h = handles(3);
        let shaders = [(h[0], ShaderType::Vertex), (h[1], ShaderType::Fragment), (h[2], ShaderType::Fragment)];
        assert!(GraphicsStages::collect(&shaders).is_err());
    }

    #[test]
    fn tessellation_stages_fail_at_build_time() {
        let h = handles(3);
        let shaders = [(h[0], ShaderType::Vertex), (h[1], ShaderType::Hull), (h[2], ShaderType::Fragment)];
        assert!(matches!(GraphicsStages::collect(&shaders), Err(RhiError::Unsupported(_))));
        let mut builder = PipelineBuilder::new();
        builder.fixed_function.topology = PrimitiveType::Patches;
        assert!(matches!(builder.validate_fixed_function(), Err(RhiError::Unsupported(_))));
    }

    #[test]
    fn vertex_stage_required() {
        let h = handles(2);
        assert!(GraphicsStages::collect(&[(h[0], ShaderType::Fragment)]).is_err());
        let stages = GraphicsStages::collect(&[(h[0], ShaderType::Vertex), (h[1], ShaderType::Fragment)]).unwrap();
        assert_eq!(stages.fragment, Some(h[1]));
    }

    #[test]
    fn primitive_restart_only_for_strips() {
        let mut builder = PipelineBuilder::new();
        builder.fixed_function.primitive_restart = true;
        assert!(builder.validate_fixed_function().is_err());
        builder.fixed_function.topology = PrimitiveType::TriangleStrips;
        builder.validate_fixed_function().unwrap();
    }
}
