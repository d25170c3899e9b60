//! Ember RHI: one resource and command model over two native graphics APIs.
//! `wgpu` (implicitly synchronized, immediate replay) and Vulkan through `ash`
//! (explicitly synchronized, pre-recorded secondary command buffers).

pub mod command;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod format;
pub mod frame;
pub mod handle;
pub mod pipeline;
pub mod render_target;
pub mod renderer;
pub mod resource;
pub mod ring;

#[cfg(feature = "vulkan")]
pub mod vulkan;
#[cfg(feature = "wgpu")]
pub mod wgpu_backend;

pub use command::{
    AttachmentClear, Blit, ClearValue, Command, CommandBuffer, CommandBufferState, ImageLayout, LayoutTransfer,
    RecordTarget, Viewport,
};
pub use config::{BackendChoice, RhiConfig, ValidationPolicy};
pub use descriptor::{
    BindingType, DescriptorBinding, DescriptorLayout, DescriptorSetUpdate, DescriptorWrite, ShaderStages,
};
pub use error::{Result, RhiError};
pub use format::{BufferUsage, DataType, IndexFormat, StorageFormat, TextureUsage};
pub use handle::*;
pub use pipeline::{
    BlendMode, CompareFunc, ComputePipelineDesc, CullMode, FixedFunctionStates, PipelineBuilder, PrimitiveType,
    ShaderCode, ShaderDesc, ShaderType, StencilOp, VertexAttributeDesc, VertexFormat,
};
pub use render_target::{AttachmentImage, AttachmentLayout, RenderAttachments, RenderTargetLayout};
pub use renderer::{create_renderer, Backend, HardwareRenderer, ShaderTarget};
pub use resource::{
    CubeFace, SamplerDesc, TextureAspect, TextureDesc, TextureFilter, TextureKind, TextureRegion, WrapMode,
};
pub use ring::{RingAllocator, RingSlice, UniformRing, VersionedCommandBuffer};

#[cfg(feature = "window")]
pub use raw_window_handle;
