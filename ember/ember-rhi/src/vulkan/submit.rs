//! Per-version command pools and transfer streams, in-flight submission tracking,
//! deferred destruction, and synchronous one-shot work on the graphics queue.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use ash::vk;

use crate::error::Result;
use crate::format::BufferUsage;
use crate::frame::SubmissionTimeline;

use super::buffer::{create_buffer, VulkanBuffer};
use super::VulkanRenderer;

pub(super) struct CommandPool {
    device: Arc<ash::Device>,
    pub raw: vk::CommandPool,
}

impl CommandPool {
    pub fn new(device: &Arc<ash::Device>, family: u32, flags: vk::CommandPoolCreateFlags) -> Result<Self> {
        let info = vk::CommandPoolCreateInfo::default().queue_family_index(family).flags(flags);
        let raw = unsafe { device.create_command_pool(&info, None)? };
        Ok(Self { device: device.clone(), raw })
    }

    pub fn allocate(&self, level: vk::CommandBufferLevel) -> Result<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.raw)
            .level(level)
            .command_buffer_count(1);
        Ok(unsafe { self.device.allocate_command_buffers(&info)? }[0])
    }

    pub fn free(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(self.raw, &[cmd]) };
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.device.destroy_command_pool(self.raw, None) };
    }
}

/// Host-visible staging memory for one frame version's transfer stream. Chunks are reused
/// once the version's previous transfer has finished.
pub(super) struct StagingBelt {
    chunks: Vec<(VulkanBuffer, u64)>,
    chunk_size: u64,
}

impl StagingBelt {
    pub fn new(chunk_size: u64) -> Self {
        Self { chunks: Vec::new(), chunk_size: chunk_size.max(1) }
    }

    pub fn reset(&mut self) {
        for (_, cursor) in &mut self.chunks {
            *cursor = 0;
        }
    }

    /// Copy `data` into staging memory; returns the buffer and offset it landed at.
    pub fn stage(
        &mut self,
        device: &Arc<ash::Device>,
        memory_props: &vk::PhysicalDeviceMemoryProperties,
        queue_families: &[u32],
        data: &[u8],
        align: u64,
    ) -> Result<(vk::Buffer, u64)> {
        let size = data.len() as u64;
        for (buffer, cursor) in &mut self.chunks {
            let offset = cursor.next_multiple_of(align);
            if offset + size <= buffer.size {
                buffer.write_mapped(offset, data)?;
                *cursor = offset + size;
                return Ok((buffer.buffer, offset));
            }
        }
        let buffer =
            create_buffer(device, memory_props, queue_families, self.chunk_size.max(size), BufferUsage::empty(), true)?;
        buffer.write_mapped(0, data)?;
        let raw = buffer.buffer;
        self.chunks.push((buffer, size));
        log::debug!("staging belt grew to {} chunks", self.chunks.len());
        Ok((raw, 0))
    }
}

/// Everything owned by one frame version.
pub(super) struct FrameResources {
    device: Arc<ash::Device>,
    /// Primaries for render submissions made under this version.
    pub command_pool: CommandPool,
    /// The transfer stream recorded between `begin_data_transfer` and `end_data_transfer`.
    pub transfer_cmd: vk::CommandBuffer,
    pub transfer_recording: bool,
    /// Signalled when the version's last transfer submission finished. Created signalled.
    pub transfer_fence: vk::Fence,
    pub transfer_semaphore: vk::Semaphore,
    pub staging: StagingBelt,
    _transfer_pool: CommandPool,
}

impl FrameResources {
    pub fn new(device: &Arc<ash::Device>, graphics_family: u32, transfer_family: u32, staging_size: u64) -> Result<Self> {
        let command_pool = CommandPool::new(device, graphics_family, vk::CommandPoolCreateFlags::TRANSIENT)?;
        let transfer_pool =
            CommandPool::new(device, transfer_family, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?;
        let transfer_cmd = transfer_pool.allocate(vk::CommandBufferLevel::PRIMARY)?;
        let mut frame = Self {
            device: device.clone(),
            command_pool,
            transfer_cmd,
            transfer_recording: false,
            transfer_fence: vk::Fence::null(),
            transfer_semaphore: vk::Semaphore::null(),
            staging: StagingBelt::new(staging_size),
            _transfer_pool: transfer_pool,
        };
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        frame.transfer_fence = unsafe { device.create_fence(&fence_info, None)? };
        frame.transfer_semaphore = unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? };
        Ok(frame)
    }

    /// Wait for the previous transfer of this version, then start recording a new one.
    pub fn begin_transfer(&mut self) -> Result<()> {
        if self.transfer_recording {
            return Ok(());
        }
        unsafe {
            self.device.wait_for_fences(&[self.transfer_fence], true, u64::MAX)?;
            self.device.reset_fences(&[self.transfer_fence])?;
            self.device
                .reset_command_buffer(self.transfer_cmd, vk::CommandBufferResetFlags::empty())?;
            let begin = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(self.transfer_cmd, &begin)?;
        }
        self.staging.reset();
        self.transfer_recording = true;
        Ok(())
    }
}

impl Drop for FrameResources {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.transfer_semaphore, None);
            self.device.destroy_fence(self.transfer_fence, None);
        }
    }
}

pub(super) struct InFlight {
    pub number: u64,
    pub version: u32,
    fence: vk::Fence,
    pool: vk::CommandPool,
    primary: vk::CommandBuffer,
}

/// Render submissions still on the GPU, oldest first, plus a free list of their fences.
pub(super) struct Submissions {
    device: Arc<ash::Device>,
    in_flight: VecDeque<InFlight>,
    spare: Vec<vk::Fence>,
}

impl Submissions {
    pub fn new(device: &Arc<ash::Device>) -> Self {
        Self { device: device.clone(), in_flight: VecDeque::new(), spare: Vec::new() }
    }

    /// An unsignalled fence for the next submission.
    pub fn fence(&mut self) -> Result<vk::Fence> {
        match self.spare.pop() {
            Some(fence) => Ok(fence),
            None => Ok(unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None)? }),
        }
    }

    pub fn recycle(&mut self, fence: vk::Fence) {
        self.spare.push(fence);
    }

    pub fn push(&mut self, number: u64, version: u32, fence: vk::Fence, pool: vk::CommandPool, primary: vk::CommandBuffer) {
        self.in_flight.push_back(InFlight { number, version, fence, pool, primary });
    }

    pub fn last_for_version(&self, version: u32) -> Option<u64> {
        self.in_flight.iter().rev().find(|s| s.version == version).map(|s| s.number)
    }

    fn retire_front(&mut self, timeline: &SubmissionTimeline) -> Result<()> {
        if let Some(done) = self.in_flight.pop_front() {
            unsafe {
                self.device.free_command_buffers(done.pool, &[done.primary]);
                self.device.reset_fences(&[done.fence])?;
            }
            self.spare.push(done.fence);
            timeline.mark_complete(done.number);
        }
        Ok(())
    }

    /// Retire every submission whose fence has signalled, stopping at the first that has not.
    pub fn poll(&mut self, timeline: &SubmissionTimeline) -> Result<()> {
        while let Some(front) = self.in_flight.front() {
            if !unsafe { self.device.get_fence_status(front.fence)? } {
                break;
            }
            self.retire_front(timeline)?;
        }
        Ok(())
    }

    /// Block until submission `number` and everything before it has finished.
    pub fn wait_until(&mut self, number: u64, timeline: &SubmissionTimeline) -> Result<()> {
        while let Some(front) = self.in_flight.front() {
            if front.number > number {
                break;
            }
            unsafe { self.device.wait_for_fences(&[front.fence], true, u64::MAX)? };
            self.retire_front(timeline)?;
        }
        Ok(())
    }

    /// After a device-wide idle: everything is finished.
    pub fn drain(&mut self, timeline: &SubmissionTimeline) -> Result<()> {
        while !self.in_flight.is_empty() {
            self.retire_front(timeline)?;
        }
        timeline.mark_all_complete();
        Ok(())
    }
}

impl Drop for Submissions {
    fn drop(&mut self) {
        unsafe {
            for s in self.in_flight.drain(..) {
                self.device.destroy_fence(s.fence, None);
            }
            for fence in self.spare.drain(..) {
                self.device.destroy_fence(fence, None);
            }
        }
    }
}

/// An object kept alive until the GPU work that might still use it has finished.
pub(super) enum Retired {
    Object(Box<dyn Any>),
    Secondary(vk::CommandBuffer),
    DescriptorSet { pool: usize, raw: vk::DescriptorSet },
}

impl VulkanRenderer {
    /// Queue `item` for release once every submission made so far has finished.
    pub(super) fn retire(&mut self, item: Retired) {
        let after = self.timeline.last_submitted();
        if self.timeline.is_complete(after) {
            self.release(item);
        } else {
            self.retired.push((after, item));
        }
    }

    fn release(&mut self, item: Retired) {
        match item {
            Retired::Object(object) => drop(object),
            Retired::Secondary(cmd) => self.secondary_pool.free(cmd),
            Retired::DescriptorSet { pool, raw } => self.descriptors.free(pool, raw),
        }
    }

    /// Poll fences, then release whatever no longer has GPU work pending.
    pub(super) fn collect_completed(&mut self) -> Result<()> {
        self.submissions.poll(&self.timeline)?;
        let done = self.timeline.last_completed();
        if self.retired.iter().all(|(n, _)| *n > done) {
            return Ok(());
        }
        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retired).into_iter().partition(|(n, _)| *n <= done);
        self.retired = pending;
        for (_, item) in ready {
            self.release(item);
        }
        Ok(())
    }

    /// Block until submission `number` has finished.
    pub(super) fn wait_for(&mut self, number: u64) -> Result<()> {
        if self.timeline.is_complete(number) {
            return Ok(());
        }
        self.submissions.wait_until(number, &self.timeline)?;
        self.collect_completed()
    }

    pub(super) fn wait_idle(&mut self) -> Result<()> {
        unsafe { self.ctx.device.device_wait_idle()? };
        self.submissions.drain(&self.timeline)?;
        self.collect_completed()
    }

    /// Record with `record`, submit to the graphics queue, and wait for it.
    pub(super) fn one_shot(&self, record: impl FnOnce(vk::CommandBuffer) -> Result<()>) -> Result<()> {
        let cmd = self.oneshot_pool.allocate(vk::CommandBufferLevel::PRIMARY)?;
        let result = self.run_one_shot(cmd, record);
        self.oneshot_pool.free(cmd);
        result
    }

    fn run_one_shot(&self, cmd: vk::CommandBuffer, record: impl FnOnce(vk::CommandBuffer) -> Result<()>) -> Result<()> {
        let device = &self.ctx.device;
        let begin = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin)? };
        let recorded = record(cmd);
        unsafe { device.end_command_buffer(cmd)? };
        recorded?;
        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None)? };
        let cmds = [cmd];
        let submit = vk::SubmitInfo::default().command_buffers(&cmds);
        let result = unsafe {
            device
                .queue_submit(self.ctx.graphics_queue, &[submit], fence)
                .and_then(|()| device.wait_for_fences(&[fence], true, u64::MAX))
        };
        unsafe { device.destroy_fence(fence, None) };
        Ok(result?)
    }
}

/// Execution and memory dependency between everything before and everything after.
pub(super) fn full_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}
