//! Vulkan buffers. Mapped buffers stay persistently mapped and are written with a plain copy.

use std::sync::Arc;

use ash::vk;

use crate::error::{Result, RhiError};
use crate::format::BufferUsage;
use crate::resource::buffer_range_end;

use super::memory::{self, Allocation};

pub struct VulkanBuffer {
    pub device: Arc<ash::Device>,
    pub buffer: vk::Buffer,
    pub allocation: Allocation,
    pub size: u64,
    pub usage: BufferUsage,
}

impl VulkanBuffer {
    pub fn host_visible(&self) -> bool {
        self.allocation.mapped.is_some()
    }

    /// Copy `data` into a mapped buffer at `offset`. The memory is coherent, so the write
    /// is visible to every later submission.
    pub fn write_mapped(&self, offset: u64, data: &[u8]) -> Result<()> {
        let Some(ptr) = self.allocation.mapped else {
            return Err(RhiError::backend("direct write to a buffer that is not host visible"));
        };
        buffer_range_end("write", offset, data.len() as u64, self.size)?;
        // SAFETY: the mapping covers the whole allocation and the range was checked above.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len()) };
        Ok(())
    }

    pub fn read_mapped(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let Some(ptr) = self.allocation.mapped else {
            return Err(RhiError::backend("direct read from a buffer that is not host visible"));
        };
        let mut out = vec![0u8; len as usize];
        // SAFETY: callers check `offset + len <= size`.
        unsafe { std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), out.len()) };
        Ok(out)
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
        }
        memory::free(&self.device, &self.allocation);
    }
}

impl std::fmt::Debug for VulkanBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBuffer")
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("host_visible", &self.host_visible())
            .finish()
    }
}

pub fn buffer_usage_to_vk(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    flags
}

/// Create a buffer. Every family in `queue_families` may access it without ownership transfers.
pub fn create_buffer(
    device: &Arc<ash::Device>,
    memory_props: &vk::PhysicalDeviceMemoryProperties,
    queue_families: &[u32],
    size: u64,
    usage: BufferUsage,
    host_visible: bool,
) -> Result<VulkanBuffer> {
    if size == 0 {
        return Err(RhiError::unsupported("buffer size must be non-zero"));
    }
    let create_info = vk::BufferCreateInfo::default().size(size).usage(buffer_usage_to_vk(usage));
    let create_info = if queue_families.len() > 1 {
        create_info.sharing_mode(vk::SharingMode::CONCURRENT).queue_family_indices(queue_families)
    } else {
        create_info.sharing_mode(vk::SharingMode::EXCLUSIVE)
    };
    let buffer = unsafe { device.create_buffer(&create_info, None)? };
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
    let allocation = match memory::allocate(device, memory_props, requirements, host_visible) {
        Ok(a) => a,
        Err(e) => {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(e);
        }
    };
    let buffer = VulkanBuffer { device: device.clone(), buffer, allocation, size, usage };
    unsafe { device.bind_buffer_memory(buffer.buffer, buffer.allocation.memory, 0)? };
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_buffer_can_be_copied() {
        let flags = buffer_usage_to_vk(BufferUsage::VERTEX | BufferUsage::INDEX);
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST));
        assert!(flags.contains(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::INDEX_BUFFER));
        assert!(!flags.contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
    }
}
