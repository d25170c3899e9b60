//! Shared setup for the GPU tests: one renderer per available backend, WGSL shaders in
//! whichever form the backend consumes, and an RGBA8 render target with read-back.

#![allow(dead_code)]

use ember_rhi::*;

pub const SIZE: u32 = 256;

/// Full-screen triangle from the vertex index; no vertex buffer.
pub const FULLSCREEN_VS: &str = r#"
@vertex
fn main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let x = f32(i32(index & 1u) * 4 - 1);
    let y = f32(i32(index >> 1u) * 4 - 1);
    return vec4<f32>(x, y, 0.0, 1.0);
}
"#;

pub const GREEN_FS: &str = r#"
@fragment
fn main() -> @location(0) vec4<f32> {
    return vec4<f32>(0.0, 1.0, 0.0, 1.0);
}
"#;

/// Writes the color held in a uniform block at group 0, binding 0.
pub const UNIFORM_FS: &str = r#"
struct Tint { color: vec4<f32> }
@group(0) @binding(0) var<uniform> tint: Tint;

@fragment
fn main() -> @location(0) vec4<f32> {
    return tint.color;
}
"#;

/// Every backend that can be created on this machine, with contract checks on.
pub fn renderers() -> Vec<Box<dyn HardwareRenderer>> {
    renderers_with(ValidationPolicy::Always)
}

pub fn renderers_with(validation: ValidationPolicy) -> Vec<Box<dyn HardwareRenderer>> {
    let _ = env_logger::builder().is_test(true).try_init();
    [BackendChoice::Vulkan, BackendChoice::Wgpu]
        .into_iter()
        .filter_map(|backend| {
            let config = RhiConfig { backend, validation, ..RhiConfig::default() };
            match create_renderer(&config) {
                Ok(renderer) => {
                    log::info!("testing on {:?} ({})", renderer.backend(), renderer.device_name());
                    Some(renderer)
                }
                Err(e) => {
                    log::warn!("skipping {backend:?}: {e}");
                    None
                }
            }
        })
        .collect()
}

pub fn to_spirv(source: &str, stage: ShaderType, entry: &str) -> Vec<u32> {
    let module = naga::front::wgsl::parse_str(source).expect("parse wgsl");
    let info = naga::valid::Validator::new(naga::valid::ValidationFlags::default(), naga::valid::Capabilities::default())
        .validate(&module)
        .expect("validate");
    let shader_stage = match stage {
        ShaderType::Vertex => naga::ShaderStage::Vertex,
        ShaderType::Fragment => naga::ShaderStage::Fragment,
        ShaderType::Compute => naga::ShaderStage::Compute,
        other => panic!("no naga stage for {other:?}"),
    };
    // Default options flip Y, which puts both backends in the same clip space.
    let options = naga::back::spv::Options::default();
    let pipeline_options = naga::back::spv::PipelineOptions { shader_stage, entry_point: entry.to_string() };
    naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options)).expect("compile to spirv")
}

pub fn shader(renderer: &mut dyn HardwareRenderer, stage: ShaderType, source: &str) -> Result<ShaderHandle> {
    let desc = match renderer.shader_target() {
        ShaderTarget::Wgsl => ShaderDesc::wgsl(stage, source, "main"),
        ShaderTarget::SpirV => ShaderDesc::spirv(stage, to_spirv(source, stage, "main"), "main"),
    };
    renderer.create_shader(&desc)
}

pub struct Target {
    pub texture: TextureHandle,
    pub layout: RenderTargetLayoutHandle,
    pub frame_buffer: FrameBufferHandle,
}

pub fn color_layout() -> RenderTargetLayout {
    RenderTargetLayout::new(vec![AttachmentLayout::color(StorageFormat::Rgba8)]).expect("layout")
}

pub fn color_target(renderer: &mut dyn HardwareRenderer) -> Result<Target> {
    let desc = TextureDesc::d2(TextureUsage::SAMPLED_COLOR_ATTACHMENT, SIZE, SIZE, 1, StorageFormat::Rgba8);
    let texture = renderer.create_texture(&desc)?;
    let layout = renderer.create_render_target_layout(color_layout())?;
    let frame_buffer = renderer.create_frame_buffer(layout, &RenderAttachments::new().texture(texture))?;
    Ok(Target { texture, layout, frame_buffer })
}

/// A Replace-blended pipeline drawing the full-screen triangle with `fragment`.
pub fn fullscreen_pipeline(
    renderer: &mut dyn HardwareRenderer,
    layout: RenderTargetLayoutHandle,
    fragment: &str,
    sets: &[DescriptorSetLayoutHandle],
) -> Result<PipelineHandle> {
    vertex_index_pipeline(renderer, layout, FULLSCREEN_VS, fragment, sets)
}

/// A Replace-blended pipeline without vertex buffers; `vertex` positions from the vertex index.
pub fn vertex_index_pipeline(
    renderer: &mut dyn HardwareRenderer,
    layout: RenderTargetLayoutHandle,
    vertex: &str,
    fragment: &str,
    sets: &[DescriptorSetLayoutHandle],
) -> Result<PipelineHandle> {
    let vs = shader(renderer, ShaderType::Vertex, vertex)?;
    let fs = shader(renderer, ShaderType::Fragment, fragment)?;
    let mut builder = PipelineBuilder::new();
    builder.set_shaders(&[vs, fs]).set_binding_layout(sets).set_debug_name("vertex_index");
    builder.fixed_function.blend_mode = BlendMode::Replace;
    builder.fixed_function.cull_mode = CullMode::Disabled;
    let pipeline = builder.to_pipeline(renderer, layout)?;
    renderer.destroy_shader(vs)?;
    renderer.destroy_shader(fs)?;
    Ok(pipeline)
}

/// Record a pass that clears to `clear` and then draws the triangle, optionally with one set bound.
pub fn record_fullscreen(
    cmd: &mut CommandBuffer,
    target: &Target,
    pipeline: PipelineHandle,
    set: Option<DescriptorSetHandle>,
    clear: [f32; 4],
) -> Result<()> {
    cmd.begin_recording_with_frame_buffer(target.frame_buffer)?;
    cmd.set_viewport(Viewport::new(0, 0, SIZE, SIZE));
    cmd.clear_attachments(&[AttachmentClear::color(0, clear)]);
    cmd.bind_pipeline(pipeline);
    if let Some(set) = set {
        cmd.bind_descriptor_set(0, set);
    }
    cmd.draw(0, 3);
    cmd.end_recording()
}

pub fn uniform_set_layout(renderer: &mut dyn HardwareRenderer) -> Result<DescriptorSetLayoutHandle> {
    renderer.create_descriptor_set_layout(DescriptorLayout::new().with(BindingType::UniformBuffer, ShaderStages::FRAGMENT))
}

pub fn read_texels(renderer: &mut dyn HardwareRenderer, texture: TextureHandle) -> Result<Vec<[u8; 4]>> {
    let region = TextureRegion::full(renderer.texture_desc(texture)?, 0);
    let bytes = renderer.texture_get_data(texture, region)?;
    Ok(bytes.chunks_exact(4).map(|t| [t[0], t[1], t[2], t[3]]).collect())
}

pub fn assert_all(texels: &[[u8; 4]], expected: [u8; 4], what: &str) {
    assert_eq!(texels.len() as u32, SIZE * SIZE, "{what}: texel count");
    if let Some((i, texel)) = texels.iter().enumerate().find(|(_, t)| **t != expected) {
        panic!("{what}: texel {i} is {texel:?}, expected {expected:?}");
    }
}

pub fn color_bytes(rgba: [f32; 4]) -> Vec<u8> {
    bytemuck::cast_slice(&rgba).to_vec()
}
