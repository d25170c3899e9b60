//! Vulkan descriptor set layouts, a growing chain of descriptor pools, and native set writes.

use std::sync::Arc;

use ash::vk;

use crate::descriptor::{BindingType, DescriptorContents, DescriptorLayout, ShaderStages, UpdateFlag};
use crate::error::Result;
use crate::handle::DescriptorSetLayoutHandle;

pub struct VulkanSetLayout {
    pub device: Arc<ash::Device>,
    pub layout: Arc<DescriptorLayout>,
    pub raw: vk::DescriptorSetLayout,
}

impl Drop for VulkanSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.raw, None);
        }
    }
}

impl std::fmt::Debug for VulkanSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanSetLayout").field("layout", &self.layout).finish()
    }
}

/// `None` for holes in the binding table.
pub fn descriptor_type_to_vk(ty: &BindingType) -> Option<vk::DescriptorType> {
    match ty {
        BindingType::UniformBuffer => Some(vk::DescriptorType::UNIFORM_BUFFER),
        BindingType::StorageBuffer { .. } => Some(vk::DescriptorType::STORAGE_BUFFER),
        BindingType::Texture { .. } => Some(vk::DescriptorType::SAMPLED_IMAGE),
        BindingType::Sampler { .. } => Some(vk::DescriptorType::SAMPLER),
        BindingType::Unused => None,
    }
}

pub fn shader_stages_to_vk(s: ShaderStages) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if s.contains(ShaderStages::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if s.contains(ShaderStages::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if s.contains(ShaderStages::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    flags
}

pub fn create_set_layout(device: &Arc<ash::Device>, layout: DescriptorLayout) -> Result<VulkanSetLayout> {
    let bindings: Vec<vk::DescriptorSetLayoutBinding> = layout
        .bindings()
        .iter()
        .filter_map(|b| {
            descriptor_type_to_vk(&b.ty).map(|ty| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(ty)
                    .descriptor_count(1)
                    .stage_flags(shader_stages_to_vk(b.stages))
            })
        })
        .collect();
    let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    let raw = unsafe { device.create_descriptor_set_layout(&create_info, None)? };
    Ok(VulkanSetLayout { device: device.clone(), layout: Arc::new(layout), raw })
}

/// Descriptors of each type reserved per set in a pool.
const DEFAULT_POOL_MULTIPLIER: u32 = 4;

/// Allocates sets from a chain of pools, adding a pool whenever the newest one runs dry.
pub struct DescriptorAllocator {
    device: Arc<ash::Device>,
    pools: Vec<vk::DescriptorPool>,
    sets_per_pool: u32,
}

impl DescriptorAllocator {
    pub fn new(device: &Arc<ash::Device>, sets_per_pool: u32) -> Self {
        Self { device: device.clone(), pools: Vec::new(), sets_per_pool }
    }

    fn add_pool(&mut self) -> Result<()> {
        let per_type = self.sets_per_pool * DEFAULT_POOL_MULTIPLIER;
        let pool_sizes = [
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::DescriptorType::SAMPLER,
        ]
        .map(|ty| vk::DescriptorPoolSize::default().ty(ty).descriptor_count(per_type));
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(self.sets_per_pool)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&create_info, None)? };
        self.pools.push(pool);
        log::debug!("descriptor pool chain grew to {} pools", self.pools.len());
        Ok(())
    }

    /// Returns the set and the index of the pool it came from.
    pub fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> Result<(vk::DescriptorSet, usize)> {
        if self.pools.is_empty() {
            self.add_pool()?;
        }
        // Older pools may have room again after frees.
        for (index, &pool) in self.pools.iter().enumerate() {
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool)
                .set_layouts(std::slice::from_ref(&layout));
            match unsafe { self.device.allocate_descriptor_sets(&alloc_info) } {
                Ok(sets) => return Ok((sets[0], index)),
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.add_pool()?;
        let index = self.pools.len() - 1;
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pools[index])
            .set_layouts(std::slice::from_ref(&layout));
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info)? };
        Ok((sets[0], index))
    }

    pub fn free(&mut self, pool: usize, set: vk::DescriptorSet) {
        let Some(&pool) = self.pools.get(pool) else { return };
        if let Err(e) = unsafe { self.device.free_descriptor_sets(pool, &[set]) } {
            log::warn!("failed to free descriptor set: {e:?}");
        }
    }
}

impl Drop for DescriptorAllocator {
    fn drop(&mut self) {
        for pool in self.pools.drain(..) {
            unsafe { self.device.destroy_descriptor_pool(pool, None) };
        }
    }
}

pub struct VulkanDescriptorSet {
    pub layout: DescriptorSetLayoutHandle,
    pub raw: vk::DescriptorSet,
    pub pool: usize,
    pub contents: DescriptorContents,
    pub updating: UpdateFlag,
    /// Bumped on every native rewrite; secondaries that bound an older version are stale.
    pub version: u64,
    /// Last submission that used the set.
    pub last_use: u64,
}

/// A descriptor write with its handles resolved to native objects.
#[derive(Debug, Clone, Copy)]
pub enum ResolvedWrite {
    Buffer { buffer: vk::Buffer, offset: u64, range: u64 },
    Image { view: vk::ImageView },
    Sampler(vk::Sampler),
}

/// Write `writes` into `set`. Sampled images are expected in `SHADER_READ_ONLY_OPTIMAL`.
pub fn write_set(
    device: &ash::Device,
    set: vk::DescriptorSet,
    layout: &DescriptorLayout,
    writes: &[(u32, ResolvedWrite)],
) {
    let mut buffer_infos = Vec::with_capacity(writes.len());
    let mut image_infos = Vec::with_capacity(writes.len());
    // (location, type, index into buffer_infos or image_infos, is_buffer)
    let mut entries = Vec::with_capacity(writes.len());
    for (location, write) in writes {
        let Some(binding) = layout.get(*location) else { continue };
        let Some(ty) = descriptor_type_to_vk(&binding.ty) else { continue };
        match *write {
            ResolvedWrite::Buffer { buffer, offset, range } => {
                buffer_infos.push(vk::DescriptorBufferInfo::default().buffer(buffer).offset(offset).range(range));
                entries.push((*location, ty, buffer_infos.len() - 1, true));
            }
            ResolvedWrite::Image { view } => {
                image_infos.push(
                    vk::DescriptorImageInfo::default()
                        .image_view(view)
                        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
                );
                entries.push((*location, ty, image_infos.len() - 1, false));
            }
            ResolvedWrite::Sampler(sampler) => {
                image_infos.push(vk::DescriptorImageInfo::default().sampler(sampler));
                entries.push((*location, ty, image_infos.len() - 1, false));
            }
        }
    }
    let native: Vec<vk::WriteDescriptorSet> = entries
        .iter()
        .map(|&(location, ty, index, is_buffer)| {
            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(location)
                .dst_array_element(0)
                .descriptor_type(ty);
            if is_buffer {
                write.buffer_info(std::slice::from_ref(&buffer_infos[index]))
            } else {
                write.image_info(std::slice::from_ref(&image_infos[index]))
            }
        })
        .collect();
    if native.len() != writes.len() {
        log::debug!("skipped {} descriptor writes outside the layout", writes.len() - native.len());
    }
    unsafe { device.update_descriptor_sets(&native, &[]) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::TextureKind;

    #[test]
    fn unused_bindings_have_no_native_type() {
        assert_eq!(descriptor_type_to_vk(&BindingType::Unused), None);
        assert_eq!(
            descriptor_type_to_vk(&BindingType::Texture { kind: TextureKind::Cube, depth: true }),
            Some(vk::DescriptorType::SAMPLED_IMAGE)
        );
        assert_eq!(
            descriptor_type_to_vk(&BindingType::StorageBuffer { read_only: true }),
            Some(vk::DescriptorType::STORAGE_BUFFER)
        );
    }

    #[test]
    fn graphics_stages_map_to_vertex_and_fragment() {
        let flags = shader_stages_to_vk(ShaderStages::GRAPHICS);
        assert_eq!(flags, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT);
    }
}
