//! Device memory allocation: one `vk::DeviceMemory` per resource, chosen by property flags.

use ash::vk;

use crate::error::{Result, RhiError};

pub struct Allocation {
    pub memory: vk::DeviceMemory,
    pub size: u64,
    /// Persistent mapping for host-visible allocations.
    pub mapped: Option<*mut u8>,
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("size", &self.size)
            .field("mapped", &self.mapped.is_some())
            .finish()
    }
}

/// First memory type allowed by `type_bits` with all of `flags`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        let suitable = type_bits & (1 << i) != 0;
        suitable && props.memory_types[i as usize].property_flags.contains(flags)
    })
}

pub fn allocate(
    device: &ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    requirements: vk::MemoryRequirements,
    host_visible: bool,
) -> Result<Allocation> {
    let wanted = if host_visible {
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
    } else {
        vk::MemoryPropertyFlags::DEVICE_LOCAL
    };
    let memory_type_index = find_memory_type(props, requirements.memory_type_bits, wanted)
        .or_else(|| {
            // Device-local is a preference; any allowed type works.
            if host_visible {
                None
            } else {
                find_memory_type(props, requirements.memory_type_bits, vk::MemoryPropertyFlags::empty())
            }
        })
        .ok_or_else(|| RhiError::unsupported(format!("no memory type with {wanted:?}")))?;
    let allocate_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);
    let memory = unsafe { device.allocate_memory(&allocate_info, None)? };
    let mapped = if host_visible {
        match unsafe { device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) } {
            Ok(ptr) => Some(ptr.cast::<u8>()),
            Err(e) => {
                unsafe { device.free_memory(memory, None) };
                return Err(e.into());
            }
        }
    } else {
        None
    };
    Ok(Allocation { memory, size: requirements.size, mapped })
}

pub fn free(device: &ash::Device, allocation: &Allocation) {
    unsafe {
        if allocation.mapped.is_some() {
            device.unmap_memory(allocation.memory);
        }
        device.free_memory(allocation.memory, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties { memory_type_count: flags.len() as u32, ..Default::default() };
        for (i, f) in flags.iter().enumerate() {
            props.memory_types[i].property_flags = *f;
        }
        props
    }

    #[test]
    fn memory_type_respects_type_bits_and_flags() {
        let props = props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL), Some(0));
        assert_eq!(find_memory_type(&props, 0b110, vk::MemoryPropertyFlags::DEVICE_LOCAL), Some(2));
        assert_eq!(find_memory_type(&props, 0b111, host), Some(1));
        assert_eq!(find_memory_type(&props, 0b101, host), None);
    }
}
