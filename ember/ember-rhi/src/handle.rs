//! Typed arena handles. Every GPU object lives in a slot map owned by the renderer;
//! callers only ever hold these keys.

use slotmap::new_key_type;

new_key_type! {
    pub struct BufferHandle;
    pub struct TextureHandle;
    pub struct SamplerHandle;
    pub struct ShaderHandle;
    pub struct FenceHandle;
    pub struct DescriptorSetLayoutHandle;
    pub struct DescriptorSetHandle;
    pub struct RenderTargetLayoutHandle;
    pub struct FrameBufferHandle;
    pub struct PipelineHandle;
    pub struct CommandBufferHandle;
    pub struct SurfaceHandle;
}
