//! Per-frame-version helpers: a command buffer per version, and an aligned uniform suballocator.

use crate::command::CommandBuffer;
use crate::error::{Result, RhiError};
use crate::format::BufferUsage;
use crate::handle::BufferHandle;
use crate::renderer::HardwareRenderer;

/// One `CommandBuffer` per frame version so a frame can be recorded while the previous one is in flight.
#[derive(Debug)]
pub struct VersionedCommandBuffer {
    buffers: Vec<CommandBuffer>,
    current: usize,
}

impl VersionedCommandBuffer {
    pub fn new(renderer: &mut dyn HardwareRenderer) -> Result<Self> {
        let buffers = (0..renderer.max_temp_buffer_versions())
            .map(|_| renderer.create_command_buffer())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { buffers, current: 0 })
    }

    /// Rotate to the buffer of `version` and return it ready for `begin_recording*`.
    pub fn select(&mut self, version: u32) -> &mut CommandBuffer {
        self.current = version as usize % self.buffers.len();
        &mut self.buffers[self.current]
    }

    pub fn current(&self) -> &CommandBuffer {
        &self.buffers[self.current]
    }

    pub fn current_mut(&mut self) -> &mut CommandBuffer {
        &mut self.buffers[self.current]
    }

    pub fn destroy(self, renderer: &mut dyn HardwareRenderer) -> Result<()> {
        for cmd in self.buffers {
            renderer.destroy_command_buffer(cmd)?;
        }
        Ok(())
    }
}

/// Bump allocator over `versions` equal regions of one buffer.
#[derive(Debug, Clone)]
pub struct RingAllocator {
    alignment: u64,
    region_size: u64,
    versions: u32,
    version: u32,
    cursor: u64,
}

impl RingAllocator {
    pub fn new(region_size: u64, versions: u32, alignment: u64) -> Result<Self> {
        if !alignment.is_power_of_two() {
            return Err(RhiError::unsupported(format!("alignment {alignment} is not a power of two")));
        }
        if versions == 0 {
            return Err(RhiError::unsupported("ring needs at least one version"));
        }
        let region_size = align_up(region_size, alignment);
        Ok(Self { alignment, region_size, versions, version: 0, cursor: 0 })
    }

    pub fn total_size(&self) -> u64 {
        self.region_size * u64::from(self.versions)
    }

    /// Start allocating from `version`'s region, discarding what it held.
    pub fn reset(&mut self, version: u32) {
        self.version = version % self.versions;
        self.cursor = 0;
    }

    /// Offset of `size` bytes in the current region.
    pub fn allocate(&mut self, size: u64) -> Result<u64> {
        let start = align_up(self.cursor, self.alignment);
        if start + size > self.region_size {
            return Err(RhiError::unsupported(format!(
                "uniform ring region exhausted: {size} bytes requested, {} free",
                self.region_size.saturating_sub(start)
            )));
        }
        self.cursor = start + size;
        Ok(u64::from(self.version) * self.region_size + start)
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// A slice handed out by `UniformRing`, ready for `update_buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSlice {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
}

/// Per-frame uniform data carved from one host-visible buffer.
#[derive(Debug)]
pub struct UniformRing {
    buffer: BufferHandle,
    allocator: RingAllocator,
}

impl UniformRing {
    pub fn new(renderer: &mut dyn HardwareRenderer, bytes_per_version: u64) -> Result<Self> {
        let allocator = RingAllocator::new(
            bytes_per_version,
            renderer.max_temp_buffer_versions(),
            renderer.uniform_buffer_alignment(),
        )?;
        let buffer = renderer.create_mapped_buffer(allocator.total_size(), BufferUsage::UNIFORM)?;
        Ok(Self { buffer, allocator })
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn reset(&mut self, version: u32) {
        self.allocator.reset(version);
    }

    /// Copy `data` into the current version's region. Must run inside the data transfer window.
    pub fn write(&mut self, renderer: &mut dyn HardwareRenderer, data: &[u8]) -> Result<RingSlice> {
        let size = data.len() as u64;
        let offset = self.allocator.allocate(size)?;
        renderer.buffer_set_data(self.buffer, offset, data)?;
        Ok(RingSlice { buffer: self.buffer, offset, size })
    }

    /// Write one plain-old-data uniform block.
    pub fn write_pod<T: bytemuck::Pod>(&mut self, renderer: &mut dyn HardwareRenderer, value: &T) -> Result<RingSlice> {
        self.write(renderer, bytemuck::bytes_of(value))
    }

    pub fn destroy(self, renderer: &mut dyn HardwareRenderer) -> Result<()> {
        renderer.destroy_buffer(self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_versioned() {
        let mut ring = RingAllocator::new(1000, 2, 256).unwrap();
        assert_eq!(ring.total_size(), 2048);
        assert_eq!(ring.allocate(64).unwrap(), 0);
        assert_eq!(ring.allocate(64).unwrap(), 256);
        ring.reset(1);
        assert_eq!(ring.allocate(16).unwrap(), 1024);
        assert_eq!(ring.allocate(16).unwrap(), 1024 + 256);
        ring.reset(2);
        assert_eq!(ring.allocate(16).unwrap(), 0);
    }

    #[test]
    fn exhausted_region_is_reported() {
        let mut ring = RingAllocator::new(512, 2, 256).unwrap();
        ring.allocate(256).unwrap();
        ring.allocate(200).unwrap();
        assert!(ring.allocate(1).is_err());
    }

    #[test]
    fn alignment_must_be_power_of_two() {
        assert!(RingAllocator::new(512, 2, 48).is_err());
    }
}
