/*!
The driver boundary.

A [`Driver`] is the table of compute API entry points the runtime records and
submits work through, plus the few facts about the device the runtime needs
(queues, limits and memory types). Handles and flags are [`ash::vk`] types.

The runtime only ever passes handles back to the driver that the same driver
created, and follows the external synchronization rules of the compute API:
command pools and queues are only touched while the engine holds their locks.
*/

use ash::vk;
use std::{ptr::NonNull, time::Duration};

/// Result of a driver entry point.
pub type DriverResult<T> = std::result::Result<T, vk::Result>;

/// A memory type exposed by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    /// Locality flags of the memory type.
    pub property_flags: vk::MemoryPropertyFlags,
    /// Index of the heap the memory type allocates from.
    pub heap_index: u32,
}

impl MemoryType {
    /// Memory most efficient for the device to access.
    pub fn is_device_local(&self) -> bool {
        self.property_flags
            .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
    }
    /// Memory that can be mapped on the host.
    pub fn is_host_visible(&self) -> bool {
        self.property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }
}

/// Compute limits of the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_compute_work_group_count: [u32; 3],
    pub max_compute_work_group_invocations: u32,
    pub max_compute_work_group_size: [u32; 3],
}

impl Default for DeviceLimits {
    fn default() -> Self {
        // Minimums guaranteed by the Vulkan specification.
        Self {
            max_compute_work_group_count: [65_535; 3],
            max_compute_work_group_invocations: 128,
            max_compute_work_group_size: [128, 128, 64],
        }
    }
}

/// Memory requirements of a newly created buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

/// A buffer range written into a descriptor set binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub range: u64,
}

/// A buffer memory barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

/// Name and color of a debug label region.
#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
pub struct LabelInfo {
    pub name: String,
    #[serde(default = "LabelInfo::default_color")]
    pub color: [f32; 4],
}

impl LabelInfo {
    /// A label with the default (white) color.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: Self::default_color(),
        }
    }
    /// Adds `color`.
    pub fn with_color(mut self, color: [f32; 4]) -> Self {
        self.color = color;
        self
    }
    fn default_color() -> [f32; 4] {
        [1.; 4]
    }
}

/// Parameters of a compute pipeline.
#[derive(Clone, Copy, Debug)]
pub struct ComputePipelineInfo<'a> {
    pub layout: vk::PipelineLayout,
    pub module: vk::ShaderModule,
    pub entry_point: &'a str,
    /// Specialization constants, the constant id is the index.
    pub specialization: &'a [u32],
}

/** Compute driver entry points.

Implemented by the Vulkan driver (feature "device") and by the
[software driver](super::sim::SimDriver). */
pub trait Driver: Send + Sync {
    /// Name of the device.
    fn name(&self) -> &str;
    /// Queue family all queues belong to.
    fn queue_family_index(&self) -> u32;
    /// Queues created for the device, one per hardware queue of the family.
    fn queues(&self) -> &[vk::Queue];
    /// Compute limits.
    fn limits(&self) -> DeviceLimits;
    /// Number of memory types.
    fn memory_type_count(&self) -> u32;
    /// Number of memory heaps.
    fn memory_heap_count(&self) -> u32;
    /// Memory type `index`, or None if out of range.
    fn memory_type(&self, index: u32) -> Option<MemoryType>;
    /// Whether debug label entry points do anything.
    fn supports_debug_labels(&self) -> bool;

    fn create_fence(&self, signaled: bool) -> DriverResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn reset_fence(&self, fence: vk::Fence) -> DriverResult<()>;
    /// True if signaled.
    fn fence_status(&self, fence: vk::Fence) -> DriverResult<bool>;
    /// True if signaled, false on timeout.
    fn wait_fence(&self, fence: vk::Fence, timeout: Duration) -> DriverResult<bool>;

    fn create_command_pool(&self, queue_family_index: u32) -> DriverResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> DriverResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> DriverResult<()>;
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> DriverResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> DriverResult<()>;

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    );
    fn cmd_fill_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        dst: vk::Buffer,
        offset: u64,
        size: u64,
        data: u32,
    );
    fn cmd_buffer_barrier(&self, command_buffer: vk::CommandBuffer, barrier: &BufferBarrier);
    fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn cmd_bind_descriptor_set(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    );
    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        offset: u32,
        data: &[u8],
    );
    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, groups: [u32; 3]);
    fn cmd_begin_label(&self, command_buffer: vk::CommandBuffer, label: &LabelInfo);
    fn cmd_end_label(&self, command_buffer: vk::CommandBuffer);

    fn queue_begin_label(&self, queue: vk::Queue, label: &LabelInfo);
    fn queue_end_label(&self, queue: vk::Queue);
    /// Submits one command buffer, `fence` may be null.
    fn queue_submit(
        &self,
        queue: vk::Queue,
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> DriverResult<()>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> DriverResult<()>;
    fn device_wait_idle(&self) -> DriverResult<()>;

    /// Creates an unbound buffer.
    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> DriverResult<(vk::Buffer, MemoryRequirements)>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn allocate_memory(&self, size: u64, memory_type_index: u32)
        -> DriverResult<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory)
        -> DriverResult<()>;
    /// Maps the whole allocation.
    fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> DriverResult<NonNull<u8>>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);
    fn flush_memory(&self, memory: vk::DeviceMemory, offset: u64, size: u64) -> DriverResult<()>;
    fn invalidate_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> DriverResult<()>;

    fn create_shader_module(&self, spirv: &[u32]) -> DriverResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    /// One binding per entry, binding index is the position.
    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorType],
    ) -> DriverResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[(vk::DescriptorType, u32)],
    ) -> DriverResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> DriverResult<vk::DescriptorSet>;
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);
    fn create_pipeline_layout(
        &self,
        set_layout: vk::DescriptorSetLayout,
        push_constant_size: u32,
    ) -> DriverResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_compute_pipeline(&self, info: &ComputePipelineInfo) -> DriverResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
}
