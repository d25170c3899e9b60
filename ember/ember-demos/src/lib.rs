//! Pieces shared by the demo binaries: shader loading and a tinted triangle scene.

use ember_rhi::*;

pub const TRIANGLE_VS: &str = r#"
struct VertexOut {
    @builtin(position) position: vec4<f32>,
    @location(0) shade: f32,
}

@vertex
fn main(@location(0) position: vec2<f32>, @location(1) shade: f32) -> VertexOut {
    var out: VertexOut;
    out.position = vec4<f32>(position, 0.0, 1.0);
    out.shade = shade;
    return out;
}
"#;

pub const TRIANGLE_FS: &str = r#"
struct Tint { color: vec4<f32> }
@group(0) @binding(0) var<uniform> tint: Tint;

@fragment
fn main(@location(0) shade: f32) -> @location(0) vec4<f32> {
    return vec4<f32>(tint.color.rgb * shade, tint.color.a);
}
"#;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub shade: f32,
}

pub const TRIANGLE: [Vertex; 3] = [
    Vertex { position: [-0.6, -0.6], shade: 1.0 },
    Vertex { position: [0.6, -0.6], shade: 1.0 },
    Vertex { position: [0.0, 0.6], shade: 1.0 },
];

pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// `--backend wgpu|vulkan` on the command line overrides the config file.
pub fn load_config() -> Result<RhiConfig> {
    let mut config = RhiConfig::load_from_path("ember.toml")?;
    let args: Vec<String> = std::env::args().collect();
    if let Some(pos) = args.iter().position(|a| a == "--backend") {
        config.backend = match args.get(pos + 1).map(String::as_str) {
            Some("wgpu") => BackendChoice::Wgpu,
            Some("vulkan") => BackendChoice::Vulkan,
            other => return Err(RhiError::Config(format!("unknown backend {other:?}"))),
        };
    }
    Ok(config)
}

fn compile_wgsl_to_spirv(source: &str, stage: naga::ShaderStage) -> Result<Vec<u32>> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| RhiError::backend(e.emit_to_string(source)))?;
    let info = naga::valid::Validator::new(naga::valid::ValidationFlags::default(), naga::valid::Capabilities::default())
        .validate(&module)
        .map_err(|e| RhiError::backend(format!("{e:?}")))?;
    let options = naga::back::spv::Options::default();
    let pipeline_options = naga::back::spv::PipelineOptions { shader_stage: stage, entry_point: "main".to_string() };
    naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options)).map_err(RhiError::backend)
}

/// Create a shader from WGSL in the form the renderer consumes.
pub fn load_shader(renderer: &mut dyn HardwareRenderer, stage: ShaderType, source: &str) -> Result<ShaderHandle> {
    let desc = match renderer.shader_target() {
        ShaderTarget::Wgsl => ShaderDesc::wgsl(stage, source, "main"),
        ShaderTarget::SpirV => {
            let naga_stage = match stage {
                ShaderType::Vertex => naga::ShaderStage::Vertex,
                ShaderType::Fragment => naga::ShaderStage::Fragment,
                ShaderType::Compute => naga::ShaderStage::Compute,
                other => return Err(RhiError::unsupported(format!("{other:?} shaders"))),
            };
            ShaderDesc::spirv(stage, compile_wgsl_to_spirv(source, naga_stage)?, "main")
        }
    };
    renderer.create_shader(&desc)
}

/// Pipeline, vertex buffer and tint binding for the demo triangle.
pub struct TriangleScene {
    pub pipeline: PipelineHandle,
    pub vertices: BufferHandle,
    pub set_layout: DescriptorSetLayoutHandle,
}

impl TriangleScene {
    pub fn new(renderer: &mut dyn HardwareRenderer, layout: RenderTargetLayoutHandle) -> Result<Self> {
        let vs = load_shader(renderer, ShaderType::Vertex, TRIANGLE_VS)?;
        let fs = load_shader(renderer, ShaderType::Fragment, TRIANGLE_FS)?;
        let set_layout = renderer
            .create_descriptor_set_layout(DescriptorLayout::new().with(BindingType::UniformBuffer, ShaderStages::FRAGMENT))?;
        let mut builder = PipelineBuilder::new();
        builder
            .set_shaders(&[vs, fs])
            .set_vertex_layout(VertexFormat::new(vec![
                VertexAttributeDesc::new(DataType::Float2, false, 0, 0),
                VertexAttributeDesc::new(DataType::Float, false, 8, 1),
            ]))
            .set_binding_layout(&[set_layout])
            .set_debug_name("triangle");
        builder.fixed_function.cull_mode = CullMode::Disabled;
        let pipeline = builder.to_pipeline(renderer, layout)?;
        renderer.destroy_shader(vs)?;
        renderer.destroy_shader(fs)?;

        let vertices = renderer.create_buffer(std::mem::size_of_val(&TRIANGLE) as u64, BufferUsage::VERTEX)?;
        renderer.begin_data_transfer()?;
        renderer.buffer_set_data(vertices, 0, bytemuck::cast_slice(&TRIANGLE))?;
        renderer.end_data_transfer()?;
        Ok(Self { pipeline, vertices, set_layout })
    }

    /// Record one pass: clear to `background`, draw the triangle tinted through `set`.
    pub fn record(
        &self,
        cmd: &mut CommandBuffer,
        frame_buffer: FrameBufferHandle,
        extent: (u32, u32),
        set: DescriptorSetHandle,
        background: [f32; 4],
    ) -> Result<()> {
        cmd.begin_recording_with_frame_buffer(frame_buffer)?;
        cmd.set_viewport(Viewport::new(0, 0, extent.0, extent.1));
        cmd.clear_attachments(&[AttachmentClear::color(0, background)]);
        cmd.bind_pipeline(self.pipeline);
        cmd.bind_vertex_buffer(self.vertices, 0);
        cmd.bind_descriptor_set(0, set);
        cmd.draw(0, 3);
        cmd.end_recording()
    }
}
