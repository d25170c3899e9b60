use std::sync::Arc;

use ash::vk;

use crate::error::Result;
use crate::pipeline::CompareFunc;
use crate::resource::{SamplerDesc, TextureFilter, WrapMode};

use super::pipeline::compare_op;

pub struct VulkanSampler {
    pub device: Arc<ash::Device>,
    pub desc: SamplerDesc,
    pub sampler: vk::Sampler,
}

impl Drop for VulkanSampler {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.sampler, None);
        }
    }
}

impl std::fmt::Debug for VulkanSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanSampler").field("desc", &self.desc).finish()
    }
}

fn filters(filter: TextureFilter) -> (vk::Filter, vk::SamplerMipmapMode) {
    match filter {
        TextureFilter::Nearest => (vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST),
        TextureFilter::Linear => (vk::Filter::LINEAR, vk::SamplerMipmapMode::NEAREST),
        _ => (vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR),
    }
}

fn address_mode(wrap: WrapMode) -> vk::SamplerAddressMode {
    match wrap {
        WrapMode::Repeat => vk::SamplerAddressMode::REPEAT,
        WrapMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        WrapMode::Mirror => vk::SamplerAddressMode::MIRRORED_REPEAT,
    }
}

/// Build a sampler. `max_anisotropy` is the device limit, or `None` when the feature is off.
pub fn create_sampler(device: &Arc<ash::Device>, desc: &SamplerDesc, max_anisotropy: Option<f32>) -> Result<VulkanSampler> {
    let (filter, mipmap_mode) = filters(desc.filter);
    let address = address_mode(desc.wrap);
    let anisotropy = match (desc.filter.anisotropy(), max_anisotropy) {
        (n, Some(limit)) if n > 1 => Some(f32::from(n).min(limit)),
        _ => None,
    };
    let create_info = vk::SamplerCreateInfo::default()
        .mag_filter(filter)
        .min_filter(filter)
        .mipmap_mode(mipmap_mode)
        .address_mode_u(address)
        .address_mode_v(address)
        .address_mode_w(address)
        .anisotropy_enable(anisotropy.is_some())
        .max_anisotropy(anisotropy.unwrap_or(1.0))
        .compare_enable(desc.compare != CompareFunc::Disabled)
        .compare_op(compare_op(desc.compare))
        .min_lod(0.0)
        .max_lod(vk::LOD_CLAMP_NONE)
        .unnormalized_coordinates(false);
    let sampler = unsafe { device.create_sampler(&create_info, None)? };
    Ok(VulkanSampler { device: device.clone(), desc: *desc, sampler })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_trilinear_and_anisotropic_blend_mips() {
        assert_eq!(filters(TextureFilter::Linear).1, vk::SamplerMipmapMode::NEAREST);
        assert_eq!(filters(TextureFilter::Trilinear).1, vk::SamplerMipmapMode::LINEAR);
        assert_eq!(filters(TextureFilter::Anisotropic8x), (vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR));
    }
}
