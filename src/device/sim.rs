/*!
A software driver.

[`SimDriver`] implements [`Driver`] on the host. Device memory is host memory,
commands are recorded per command buffer and executed at submission (copies
and fills; dispatches are recorded but run nothing), and fences are signaled
as soon as their submission executes.

Every entry point call is logged as a [`SimCall`], so tests can assert exactly
which commands a launch recorded. Misuse that a Vulkan validation layer would
flag (recording outside of a begin/end pair, submitting a signaled fence,
mapping memory that is not host visible, out of bounds copies) is collected in
[`.validation_errors()`](SimDriver::validation_errors).

```
# use krnl_runtime::{anyhow::Result, device::{Device, sim::{SimConfig, SimDriver}}};
# fn main() -> Result<()> {
let sim = std::sync::Arc::new(SimDriver::new(SimConfig::discrete()));
let device = Device::builder().driver(sim.clone()).build()?;
assert!(sim.validation_errors().is_empty());
# Ok(())
# }
```
*/

use super::driver::{
    BufferBarrier, ComputePipelineInfo, DescriptorWrite, DeviceLimits, Driver, DriverResult,
    LabelInfo, MemoryRequirements, MemoryType,
};
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    ptr::NonNull,
    time::Duration,
};

/// Device description of a [`SimDriver`].
#[derive(Clone, Debug)]
pub struct SimConfig {
    pub name: String,
    pub memory_types: Vec<MemoryType>,
    pub memory_heap_count: u32,
    pub queue_count: usize,
    pub debug_labels: bool,
    pub limits: DeviceLimits,
}

impl SimConfig {
    /** A discrete device.

    - type 0: device local, heap 0
    - type 1: host visible and coherent, heap 1
    - type 2: host visible and cached, heap 1 */
    pub fn discrete() -> Self {
        use vk::MemoryPropertyFlags as F;
        Self {
            name: "sim-discrete".into(),
            memory_types: vec![
                MemoryType {
                    property_flags: F::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: F::HOST_VISIBLE | F::HOST_COHERENT,
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: F::HOST_VISIBLE | F::HOST_CACHED,
                    heap_index: 1,
                },
            ],
            memory_heap_count: 2,
            queue_count: 2,
            debug_labels: true,
            limits: DeviceLimits {
                max_compute_work_group_invocations: 1024,
                max_compute_work_group_size: [1024, 1024, 64],
                ..DeviceLimits::default()
            },
        }
    }
    /** An integrated device with a single heap.

    - type 0: device local, host visible and coherent
    - type 1: host visible, coherent and cached */
    pub fn unified() -> Self {
        use vk::MemoryPropertyFlags as F;
        Self {
            name: "sim-unified".into(),
            memory_types: vec![
                MemoryType {
                    property_flags: F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED,
                    heap_index: 0,
                },
            ],
            memory_heap_count: 1,
            queue_count: 1,
            debug_labels: false,
            limits: DeviceLimits::default(),
        }
    }
    /// Adds `queue_count`.
    pub fn with_queue_count(mut self, queue_count: usize) -> Self {
        self.queue_count = queue_count;
        self
    }
    /// Adds `debug_labels`.
    pub fn with_debug_labels(mut self, debug_labels: bool) -> Self {
        self.debug_labels = debug_labels;
        self
    }
    /// Adds `limits`.
    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// A recorded command.
#[derive(Clone, Debug, PartialEq)]
pub enum SimCommand {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    },
    FillBuffer {
        dst: vk::Buffer,
        offset: u64,
        size: u64,
        data: u32,
    },
    Barrier(BufferBarrier),
    BindPipeline(vk::Pipeline),
    BindDescriptorSet(vk::DescriptorSet),
    PushConstants {
        offset: u32,
        data: Vec<u8>,
    },
    Dispatch([u32; 3]),
    BeginLabel(String),
    EndLabel,
}

/// A logged entry point call.
#[derive(Clone, Debug, PartialEq)]
pub enum SimCall {
    CreateFence(vk::Fence),
    DestroyFence(vk::Fence),
    ResetFence(vk::Fence),
    WaitFence(vk::Fence),
    CreateCommandPool(vk::CommandPool),
    DestroyCommandPool(vk::CommandPool),
    AllocateCommandBuffer(vk::CommandBuffer),
    FreeCommandBuffer(vk::CommandBuffer),
    ResetCommandBuffer(vk::CommandBuffer),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    Record(vk::CommandBuffer, SimCommand),
    QueueBeginLabel(vk::Queue, String),
    QueueEndLabel(vk::Queue),
    QueueSubmit {
        queue: vk::Queue,
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
    },
    QueueWaitIdle(vk::Queue),
    DeviceWaitIdle,
    CreateBuffer(vk::Buffer, u64),
    DestroyBuffer(vk::Buffer),
    AllocateMemory(vk::DeviceMemory, u64, u32),
    FreeMemory(vk::DeviceMemory),
    BindBufferMemory(vk::Buffer, vk::DeviceMemory),
    MapMemory(vk::DeviceMemory),
    UnmapMemory(vk::DeviceMemory),
    FlushMemory(vk::DeviceMemory),
    InvalidateMemory(vk::DeviceMemory),
    CreateShaderModule(vk::ShaderModule),
    DestroyShaderModule(vk::ShaderModule),
    CreateDescriptorSetLayout(vk::DescriptorSetLayout),
    DestroyDescriptorSetLayout(vk::DescriptorSetLayout),
    CreateDescriptorPool(vk::DescriptorPool),
    DestroyDescriptorPool(vk::DescriptorPool),
    AllocateDescriptorSet(vk::DescriptorSet),
    UpdateDescriptorSet(vk::DescriptorSet, Vec<DescriptorWrite>),
    CreatePipelineLayout(vk::PipelineLayout),
    DestroyPipelineLayout(vk::PipelineLayout),
    CreateComputePipeline(vk::Pipeline),
    DestroyPipeline(vk::Pipeline),
}

impl SimCall {
    /// The recorded command, if this is a recording call.
    pub fn command(&self) -> Option<&SimCommand> {
        match self {
            Self::Record(_, command) => Some(command),
            _ => None,
        }
    }
}

/// An executed submission.
#[derive(Clone, Debug, PartialEq)]
pub struct SimSubmission {
    pub queue: vk::Queue,
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    pub commands: Vec<SimCommand>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordState {
    Initial,
    Recording,
    Executable,
}

#[derive(Debug)]
struct SimCommandBuffer {
    pool: vk::CommandPool,
    state: RecordState,
    commands: Vec<SimCommand>,
}

#[derive(Debug)]
struct SimBuffer {
    size: u64,
    memory: Option<vk::DeviceMemory>,
}

struct SimMemory {
    data: NonNull<u8>,
    len: usize,
    type_index: u32,
    mapped: bool,
}

impl SimMemory {
    fn new(len: usize, type_index: u32) -> Self {
        let data = Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8;
        Self {
            // Box pointers are never null.
            data: NonNull::new(data).unwrap_or(NonNull::dangling()),
            len,
            type_index,
            mapped: false,
        }
    }
}

impl Drop for SimMemory {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.data.as_ptr(), self.len);
        // # Safety
        // Allocated in SimMemory::new with the same len.
        drop(unsafe { Box::from_raw(slice) });
    }
}

// # Safety
// The allocation is owned, access is serialized through the driver's mutex or
// through mappings whose synchronization is the caller's responsibility.
unsafe impl Send for SimMemory {}

#[derive(Debug)]
struct SimPipeline {
    entry_point: String,
    specialization: Vec<u32>,
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    calls: Vec<SimCall>,
    validation_errors: Vec<String>,
    submissions: Vec<SimSubmission>,
    fail_next_submit: Option<vk::Result>,
    fail_next_allocation: Option<vk::Result>,
    fences: HashMap<vk::Fence, bool>,
    command_pools: Vec<vk::CommandPool>,
    command_buffers: HashMap<vk::CommandBuffer, SimCommandBuffer>,
    buffers: HashMap<vk::Buffer, SimBuffer>,
    memories: HashMap<vk::DeviceMemory, SimMemory>,
    shader_modules: HashMap<vk::ShaderModule, usize>,
    set_layouts: HashMap<vk::DescriptorSetLayout, Vec<vk::DescriptorType>>,
    descriptor_pools: Vec<vk::DescriptorPool>,
    descriptor_sets: HashMap<vk::DescriptorSet, Vec<Option<DescriptorWrite>>>,
    pipeline_layouts: HashMap<vk::PipelineLayout, u32>,
    pipelines: HashMap<vk::Pipeline, SimPipeline>,
}

impl SimState {
    fn handle<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }
    fn invalid(&mut self, msg: String) {
        tracing::warn!("sim validation: {msg}");
        self.validation_errors.push(msg);
    }
    fn record(&mut self, command_buffer: vk::CommandBuffer, command: SimCommand) {
        self.calls
            .push(SimCall::Record(command_buffer, command.clone()));
        match self.command_buffers.get_mut(&command_buffer) {
            Some(cb) if cb.state == RecordState::Recording => cb.commands.push(command),
            Some(_) => self.invalid(format!(
                "{command:?} recorded into {command_buffer:?} outside of begin / end"
            )),
            None => self.invalid(format!(
                "{command:?} recorded into unknown {command_buffer:?}"
            )),
        }
    }
    fn buffer_memory(&self, buffer: vk::Buffer, offset: u64, size: u64) -> Result<NonNull<u8>, String> {
        let sim_buffer = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| format!("unknown {buffer:?}"))?;
        if offset.checked_add(size).map_or(true, |end| end > sim_buffer.size) {
            return Err(format!(
                "range {offset}..{offset}+{size} out of bounds of {buffer:?} with size {}",
                sim_buffer.size
            ));
        }
        let memory = sim_buffer
            .memory
            .and_then(|x| self.memories.get(&x))
            .ok_or_else(|| format!("{buffer:?} has no memory bound"))?;
        // # Safety
        // offset + size <= buffer size <= allocation len.
        Ok(unsafe { NonNull::new_unchecked(memory.data.as_ptr().add(offset as usize)) })
    }
    fn execute(&mut self, commands: &[SimCommand]) {
        for command in commands {
            match command {
                SimCommand::CopyBuffer {
                    src,
                    dst,
                    src_offset,
                    dst_offset,
                    size,
                } => {
                    let src = self.buffer_memory(*src, *src_offset, *size);
                    let dst = self.buffer_memory(*dst, *dst_offset, *size);
                    match (src, dst) {
                        (Ok(src), Ok(dst)) => {
                            // # Safety
                            // Both ranges are in bounds, copy handles overlap.
                            unsafe {
                                std::ptr::copy(src.as_ptr(), dst.as_ptr(), *size as usize);
                            }
                        }
                        (Err(e), _) | (_, Err(e)) => self.invalid(e),
                    }
                }
                SimCommand::FillBuffer {
                    dst,
                    offset,
                    size,
                    data,
                } => {
                    if offset % 4 != 0 || size % 4 != 0 {
                        self.invalid(format!(
                            "fill of {dst:?} at {offset} with size {size} is not 4 byte aligned"
                        ));
                        continue;
                    }
                    match self.buffer_memory(*dst, *offset, *size) {
                        Ok(ptr) => {
                            let bytes = data.to_ne_bytes();
                            for i in 0..*size as usize {
                                // # Safety
                                // In bounds, checked above.
                                unsafe {
                                    ptr.as_ptr().add(i).write(bytes[i % 4]);
                                }
                            }
                        }
                        Err(e) => self.invalid(e),
                    }
                }
                SimCommand::BindDescriptorSet(set) => {
                    let unwritten = self
                        .descriptor_sets
                        .get(set)
                        .map(|bindings| bindings.iter().any(Option::is_none));
                    match unwritten {
                        Some(true) => self.invalid(format!("{set:?} bound with unwritten bindings")),
                        Some(false) => (),
                        None => self.invalid(format!("unknown {set:?} bound")),
                    }
                }
                _ => (),
            }
        }
    }
}

/// A software [`Driver`].
pub struct SimDriver {
    config: SimConfig,
    queues: Vec<vk::Queue>,
    state: Mutex<SimState>,
}

impl SimDriver {
    /// Creates a driver for the device described by `config`.
    pub fn new(config: SimConfig) -> Self {
        let mut state = SimState::default();
        let queues = (0..config.queue_count).map(|_| state.handle()).collect();
        Self {
            config,
            queues,
            state: Mutex::new(state),
        }
    }
    /// Every logged entry point call, in order.
    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }
    /// Clears the call log.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
    /// Executed submissions, in order.
    pub fn submissions(&self) -> Vec<SimSubmission> {
        self.state.lock().submissions.clone()
    }
    /// Misuse detected so far.
    pub fn validation_errors(&self) -> Vec<String> {
        self.state.lock().validation_errors.clone()
    }
    /// The next submission fails with `result` without executing.
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.lock().fail_next_submit.replace(result);
    }
    /// The next memory allocation fails with `result`.
    pub fn fail_next_allocation(&self, result: vk::Result) {
        self.state.lock().fail_next_allocation.replace(result);
    }
    /// Signals `fence` as if work completed.
    pub fn signal_fence(&self, fence: vk::Fence) {
        if let Some(signaled) = self.state.lock().fences.get_mut(&fence) {
            *signaled = true;
        }
    }
    /// Number of fences not yet destroyed.
    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }
    /// Number of command buffers not yet freed.
    pub fn live_command_buffers(&self) -> usize {
        self.state.lock().command_buffers.len()
    }
    /// Number of buffers not yet destroyed.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }
    /// Number of memory allocations not yet freed.
    pub fn live_memory(&self) -> usize {
        self.state.lock().memories.len()
    }
    /// Number of pipelines not yet destroyed.
    pub fn live_pipelines(&self) -> usize {
        self.state.lock().pipelines.len()
    }
    /// Number of shader modules not yet destroyed.
    pub fn live_shader_modules(&self) -> usize {
        self.state.lock().shader_modules.len()
    }
    /// Copies out the contents of the memory bound to `buffer`.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let size = state.buffers.get(&buffer)?.size;
        let ptr = state.buffer_memory(buffer, 0, size).ok()?;
        // # Safety
        // The range is in bounds.
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size as usize) };
        Some(bytes.to_vec())
    }
    /// Current bindings of a descriptor set.
    pub fn descriptor_bindings(&self, set: vk::DescriptorSet) -> Option<Vec<Option<DescriptorWrite>>> {
        self.state.lock().descriptor_sets.get(&set).cloned()
    }
    /// Binding types of a descriptor set layout.
    pub fn set_layout_bindings(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Option<Vec<vk::DescriptorType>> {
        self.state.lock().set_layouts.get(&layout).cloned()
    }
    /// Specialization constants a pipeline was created with.
    pub fn pipeline_specialization(&self, pipeline: vk::Pipeline) -> Option<Vec<u32>> {
        self.state
            .lock()
            .pipelines
            .get(&pipeline)
            .map(|x| x.specialization.clone())
    }
    /// Entry point a pipeline was created with.
    pub fn pipeline_entry_point(&self, pipeline: vk::Pipeline) -> Option<String> {
        self.state
            .lock()
            .pipelines
            .get(&pipeline)
            .map(|x| x.entry_point.clone())
    }
    fn memory_requirements(&self, size: u64) -> MemoryRequirements {
        MemoryRequirements {
            size: size.max(1),
            alignment: 16,
            memory_type_bits: (1u32 << self.config.memory_types.len()) - 1,
        }
    }
}

impl Driver for SimDriver {
    fn name(&self) -> &str {
        &self.config.name
    }
    fn queue_family_index(&self) -> u32 {
        0
    }
    fn queues(&self) -> &[vk::Queue] {
        &self.queues
    }
    fn limits(&self) -> DeviceLimits {
        self.config.limits
    }
    fn memory_type_count(&self) -> u32 {
        self.config.memory_types.len() as u32
    }
    fn memory_heap_count(&self) -> u32 {
        self.config.memory_heap_count
    }
    fn memory_type(&self, index: u32) -> Option<MemoryType> {
        self.config.memory_types.get(index as usize).copied()
    }
    fn supports_debug_labels(&self) -> bool {
        self.config.debug_labels
    }

    fn create_fence(&self, signaled: bool) -> DriverResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence = state.handle();
        state.fences.insert(fence, signaled);
        state.calls.push(SimCall::CreateFence(fence));
        Ok(fence)
    }
    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.calls.push(SimCall::DestroyFence(fence));
        if fence.as_raw() != 0 && state.fences.remove(&fence).is_none() {
            state.invalid(format!("destroyed unknown {fence:?}"));
        }
    }
    fn reset_fence(&self, fence: vk::Fence) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::ResetFence(fence));
        match state.fences.get_mut(&fence) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => {
                state.invalid(format!("reset unknown {fence:?}"));
                Err(vk::Result::ERROR_UNKNOWN)
            }
        }
    }
    fn fence_status(&self, fence: vk::Fence) -> DriverResult<bool> {
        self.state
            .lock()
            .fences
            .get(&fence)
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }
    fn wait_fence(&self, fence: vk::Fence, _timeout: Duration) -> DriverResult<bool> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::WaitFence(fence));
        // Submissions execute immediately, an unsignaled fence never signals.
        state
            .fences
            .get(&fence)
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn create_command_pool(&self, _queue_family_index: u32) -> DriverResult<vk::CommandPool> {
        let mut state = self.state.lock();
        let pool = state.handle();
        state.command_pools.push(pool);
        state.calls.push(SimCall::CreateCommandPool(pool));
        Ok(pool)
    }
    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state.calls.push(SimCall::DestroyCommandPool(pool));
        state.command_pools.retain(|x| *x != pool);
        state.command_buffers.retain(|_, cb| cb.pool != pool);
    }
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> DriverResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        if !state.command_pools.contains(&pool) {
            state.invalid(format!("allocated from unknown {pool:?}"));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let command_buffer = state.handle();
        state.command_buffers.insert(
            command_buffer,
            SimCommandBuffer {
                pool,
                state: RecordState::Initial,
                commands: Vec::new(),
            },
        );
        state
            .calls
            .push(SimCall::AllocateCommandBuffer(command_buffer));
        Ok(command_buffer)
    }
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        let mut state = self.state.lock();
        state.calls.push(SimCall::FreeCommandBuffer(command_buffer));
        match state.command_buffers.remove(&command_buffer) {
            Some(cb) if cb.pool == pool => (),
            Some(_) => state.invalid(format!("{command_buffer:?} freed to the wrong pool")),
            None => state.invalid(format!("freed unknown {command_buffer:?}")),
        }
    }
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> DriverResult<()> {
        let mut state = self.state.lock();
        state
            .calls
            .push(SimCall::ResetCommandBuffer(command_buffer));
        let cb = state
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        cb.state = RecordState::Initial;
        cb.commands.clear();
        Ok(())
    }
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _usage: vk::CommandBufferUsageFlags,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        state
            .calls
            .push(SimCall::BeginCommandBuffer(command_buffer));
        let cb = state
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let previous = cb.state;
        cb.state = RecordState::Recording;
        cb.commands.clear();
        if previous == RecordState::Recording {
            state.invalid(format!("{command_buffer:?} begun while recording"));
        }
        Ok(())
    }
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::EndCommandBuffer(command_buffer));
        let cb = state
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if cb.state != RecordState::Recording {
            state.invalid(format!("{command_buffer:?} ended while not recording"));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        cb.state = RecordState::Executable;
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        self.state.lock().record(
            command_buffer,
            SimCommand::CopyBuffer {
                src,
                dst,
                src_offset: region.src_offset,
                dst_offset: region.dst_offset,
                size: region.size,
            },
        );
    }
    fn cmd_fill_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        dst: vk::Buffer,
        offset: u64,
        size: u64,
        data: u32,
    ) {
        self.state.lock().record(
            command_buffer,
            SimCommand::FillBuffer {
                dst,
                offset,
                size,
                data,
            },
        );
    }
    fn cmd_buffer_barrier(&self, command_buffer: vk::CommandBuffer, barrier: &BufferBarrier) {
        self.state
            .lock()
            .record(command_buffer, SimCommand::Barrier(*barrier));
    }
    fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.state
            .lock()
            .record(command_buffer, SimCommand::BindPipeline(pipeline));
    }
    fn cmd_bind_descriptor_set(
        &self,
        command_buffer: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        self.state
            .lock()
            .record(command_buffer, SimCommand::BindDescriptorSet(set));
    }
    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        offset: u32,
        data: &[u8],
    ) {
        let mut state = self.state.lock();
        let range = state.pipeline_layouts.get(&layout).copied().unwrap_or(0);
        if offset as usize + data.len() > range as usize {
            state.invalid(format!(
                "push constants {offset}+{} exceed the range {range} of {layout:?}",
                data.len()
            ));
        }
        state.record(
            command_buffer,
            SimCommand::PushConstants {
                offset,
                data: data.to_vec(),
            },
        );
    }
    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, groups: [u32; 3]) {
        let mut state = self.state.lock();
        let limit = self.config.limits.max_compute_work_group_count;
        if groups.iter().zip(limit).any(|(g, l)| *g == 0 || *g > l) {
            state.invalid(format!("dispatch {groups:?} exceeds {limit:?}"));
        }
        state.record(command_buffer, SimCommand::Dispatch(groups));
    }
    fn cmd_begin_label(&self, command_buffer: vk::CommandBuffer, label: &LabelInfo) {
        self.state
            .lock()
            .record(command_buffer, SimCommand::BeginLabel(label.name.clone()));
    }
    fn cmd_end_label(&self, command_buffer: vk::CommandBuffer) {
        self.state.lock().record(command_buffer, SimCommand::EndLabel);
    }

    fn queue_begin_label(&self, queue: vk::Queue, label: &LabelInfo) {
        self.state
            .lock()
            .calls
            .push(SimCall::QueueBeginLabel(queue, label.name.clone()));
    }
    fn queue_end_label(&self, queue: vk::Queue) {
        self.state.lock().calls.push(SimCall::QueueEndLabel(queue));
    }
    fn queue_submit(
        &self,
        queue: vk::Queue,
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::QueueSubmit {
            queue,
            command_buffer,
            fence,
        });
        if let Some(result) = state.fail_next_submit.take() {
            return Err(result);
        }
        if !self.queues.contains(&queue) {
            state.invalid(format!("submitted to unknown {queue:?}"));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let commands = match state.command_buffers.get(&command_buffer) {
            Some(cb) if cb.state == RecordState::Executable => cb.commands.clone(),
            Some(cb) => {
                let msg = format!("{command_buffer:?} submitted in state {:?}", cb.state);
                state.invalid(msg);
                return Err(vk::Result::ERROR_UNKNOWN);
            }
            None => {
                state.invalid(format!("submitted unknown {command_buffer:?}"));
                return Err(vk::Result::ERROR_UNKNOWN);
            }
        };
        if fence.as_raw() != 0 {
            match state.fences.get(&fence).copied() {
                Some(false) => (),
                Some(true) => state.invalid(format!("{fence:?} submitted while signaled")),
                None => {
                    state.invalid(format!("submitted with unknown {fence:?}"));
                    return Err(vk::Result::ERROR_UNKNOWN);
                }
            }
        }
        state.execute(&commands);
        if let Some(signaled) = state.fences.get_mut(&fence) {
            *signaled = true;
        }
        state.submissions.push(SimSubmission {
            queue,
            command_buffer,
            fence,
            commands,
        });
        Ok(())
    }
    fn queue_wait_idle(&self, queue: vk::Queue) -> DriverResult<()> {
        self.state.lock().calls.push(SimCall::QueueWaitIdle(queue));
        Ok(())
    }
    fn device_wait_idle(&self) -> DriverResult<()> {
        self.state.lock().calls.push(SimCall::DeviceWaitIdle);
        Ok(())
    }

    fn create_buffer(
        &self,
        size: u64,
        _usage: vk::BufferUsageFlags,
    ) -> DriverResult<(vk::Buffer, MemoryRequirements)> {
        let mut state = self.state.lock();
        if size == 0 {
            state.invalid("created a buffer with size 0".into());
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let buffer = state.handle();
        state.buffers.insert(buffer, SimBuffer { size, memory: None });
        state.calls.push(SimCall::CreateBuffer(buffer, size));
        Ok((buffer, self.memory_requirements(size)))
    }
    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        state.calls.push(SimCall::DestroyBuffer(buffer));
        if buffer.as_raw() != 0 && state.buffers.remove(&buffer).is_none() {
            state.invalid(format!("destroyed unknown {buffer:?}"));
        }
    }
    fn allocate_memory(
        &self,
        size: u64,
        memory_type_index: u32,
    ) -> DriverResult<vk::DeviceMemory> {
        let mut state = self.state.lock();
        if let Some(result) = state.fail_next_allocation.take() {
            return Err(result);
        }
        if size == 0 || memory_type_index as usize >= self.config.memory_types.len() {
            state.invalid(format!(
                "allocated {size} bytes of memory type {memory_type_index}"
            ));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let memory = state.handle();
        state
            .memories
            .insert(memory, SimMemory::new(size as usize, memory_type_index));
        state
            .calls
            .push(SimCall::AllocateMemory(memory, size, memory_type_index));
        Ok(memory)
    }
    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        state.calls.push(SimCall::FreeMemory(memory));
        if memory.as_raw() != 0 && state.memories.remove(&memory).is_none() {
            state.invalid(format!("freed unknown {memory:?}"));
        }
    }
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::BindBufferMemory(buffer, memory));
        let len = state
            .memories
            .get(&memory)
            .map(|x| x.len as u64)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let sim_buffer = state
            .buffers
            .get_mut(&buffer)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if sim_buffer.size > len || sim_buffer.memory.is_some() {
            state.invalid(format!("bound {memory:?} to {buffer:?}"));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        sim_buffer.memory.replace(memory);
        Ok(())
    }
    fn map_memory(&self, memory: vk::DeviceMemory, _size: u64) -> DriverResult<NonNull<u8>> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::MapMemory(memory));
        let (data, type_index, mapped) = state
            .memories
            .get(&memory)
            .map(|x| (x.data, x.type_index, x.mapped))
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let host_visible = self.config.memory_types[type_index as usize].is_host_visible();
        if !host_visible || mapped {
            state.invalid(format!("mapped {memory:?} (host visible: {host_visible}, mapped: {mapped})"));
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        if let Some(x) = state.memories.get_mut(&memory) {
            x.mapped = true;
        }
        Ok(data)
    }
    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        state.calls.push(SimCall::UnmapMemory(memory));
        match state.memories.get_mut(&memory) {
            Some(x) if x.mapped => x.mapped = false,
            _ => state.invalid(format!("unmapped {memory:?} which is not mapped")),
        }
    }
    fn flush_memory(&self, memory: vk::DeviceMemory, _offset: u64, _size: u64) -> DriverResult<()> {
        self.state.lock().calls.push(SimCall::FlushMemory(memory));
        Ok(())
    }
    fn invalidate_memory(
        &self,
        memory: vk::DeviceMemory,
        _offset: u64,
        _size: u64,
    ) -> DriverResult<()> {
        self.state
            .lock()
            .calls
            .push(SimCall::InvalidateMemory(memory));
        Ok(())
    }

    fn create_shader_module(&self, spirv: &[u32]) -> DriverResult<vk::ShaderModule> {
        let mut state = self.state.lock();
        if spirv.is_empty() {
            state.invalid("created an empty shader module".into());
            return Err(vk::Result::ERROR_INVALID_SHADER_NV);
        }
        let module = state.handle();
        state.shader_modules.insert(module, spirv.len());
        state.calls.push(SimCall::CreateShaderModule(module));
        Ok(module)
    }
    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        let mut state = self.state.lock();
        state.calls.push(SimCall::DestroyShaderModule(module));
        if state.shader_modules.remove(&module).is_none() {
            state.invalid(format!("destroyed unknown {module:?}"));
        }
    }
    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorType],
    ) -> DriverResult<vk::DescriptorSetLayout> {
        let mut state = self.state.lock();
        let layout = state.handle();
        state.set_layouts.insert(layout, bindings.to_vec());
        state.calls.push(SimCall::CreateDescriptorSetLayout(layout));
        Ok(layout)
    }
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        let mut state = self.state.lock();
        state.calls.push(SimCall::DestroyDescriptorSetLayout(layout));
        state.set_layouts.remove(&layout);
    }
    fn create_descriptor_pool(
        &self,
        _max_sets: u32,
        _pool_sizes: &[(vk::DescriptorType, u32)],
    ) -> DriverResult<vk::DescriptorPool> {
        let mut state = self.state.lock();
        let pool = state.handle();
        state.descriptor_pools.push(pool);
        state.calls.push(SimCall::CreateDescriptorPool(pool));
        Ok(pool)
    }
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        state.calls.push(SimCall::DestroyDescriptorPool(pool));
        state.descriptor_pools.retain(|x| *x != pool);
    }
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> DriverResult<vk::DescriptorSet> {
        let mut state = self.state.lock();
        let len = state
            .set_layouts
            .get(&layout)
            .map(Vec::len)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if !state.descriptor_pools.contains(&pool) {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        let set = state.handle();
        state.descriptor_sets.insert(set, vec![None; len]);
        state.calls.push(SimCall::AllocateDescriptorSet(set));
        Ok(set)
    }
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let mut state = self.state.lock();
        state
            .calls
            .push(SimCall::UpdateDescriptorSet(set, writes.to_vec()));
        let Some(bindings) = state.descriptor_sets.get_mut(&set) else {
            state.invalid(format!("updated unknown {set:?}"));
            return;
        };
        let mut errors = Vec::new();
        for write in writes {
            match bindings.get_mut(write.binding as usize) {
                Some(binding) => {
                    binding.replace(*write);
                }
                None => errors.push(format!("{set:?} has no binding {}", write.binding)),
            }
        }
        for e in errors {
            state.invalid(e);
        }
    }
    fn create_pipeline_layout(
        &self,
        set_layout: vk::DescriptorSetLayout,
        push_constant_size: u32,
    ) -> DriverResult<vk::PipelineLayout> {
        let mut state = self.state.lock();
        if !state.set_layouts.contains_key(&set_layout) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let layout = state.handle();
        state.pipeline_layouts.insert(layout, push_constant_size);
        state.calls.push(SimCall::CreatePipelineLayout(layout));
        Ok(layout)
    }
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        let mut state = self.state.lock();
        state.calls.push(SimCall::DestroyPipelineLayout(layout));
        state.pipeline_layouts.remove(&layout);
    }
    fn create_compute_pipeline(&self, info: &ComputePipelineInfo) -> DriverResult<vk::Pipeline> {
        let mut state = self.state.lock();
        if !state.shader_modules.contains_key(&info.module)
            || !state.pipeline_layouts.contains_key(&info.layout)
        {
            state.invalid(format!("created a pipeline from {info:?}"));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let pipeline = state.handle();
        state.pipelines.insert(
            pipeline,
            SimPipeline {
                entry_point: info.entry_point.to_string(),
                specialization: info.specialization.to_vec(),
            },
        );
        state.calls.push(SimCall::CreateComputePipeline(pipeline));
        Ok(pipeline)
    }
    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        let mut state = self.state.lock();
        state.calls.push(SimCall::DestroyPipeline(pipeline));
        state.pipelines.remove(&pipeline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn host_buffer(sim: &SimDriver, size: u64) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        let (buffer, requirements) = sim.create_buffer(size, vk::BufferUsageFlags::TRANSFER_DST)?;
        let memory = sim.allocate_memory(requirements.size, 1)?;
        sim.bind_buffer_memory(buffer, memory)?;
        Ok((buffer, memory))
    }

    #[test]
    fn submit_executes_fill_and_signals() -> Result<()> {
        let sim = SimDriver::new(SimConfig::discrete());
        let (buffer, _) = host_buffer(&sim, 16)?;
        let pool = sim.create_command_pool(0)?;
        let command_buffer = sim.allocate_command_buffer(pool)?;
        let fence = sim.create_fence(false)?;
        sim.begin_command_buffer(command_buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        sim.cmd_fill_buffer(command_buffer, buffer, 4, 8, u32::from_ne_bytes([1, 2, 3, 4]));
        sim.end_command_buffer(command_buffer)?;
        sim.queue_submit(sim.queues()[0], command_buffer, fence)?;
        assert!(sim.fence_status(fence)?);
        assert_eq!(
            sim.buffer_contents(buffer).unwrap(),
            [0, 0, 0, 0, 1, 2, 3, 4, 1, 2, 3, 4, 0, 0, 0, 0]
        );
        assert!(sim.validation_errors().is_empty());
        Ok(())
    }

    #[test]
    fn record_outside_begin_is_invalid() -> Result<()> {
        let sim = SimDriver::new(SimConfig::discrete());
        let pool = sim.create_command_pool(0)?;
        let command_buffer = sim.allocate_command_buffer(pool)?;
        sim.cmd_dispatch(command_buffer, [1, 1, 1]);
        assert_eq!(sim.validation_errors().len(), 1);
        Ok(())
    }

    #[test]
    fn map_device_local_fails() -> Result<()> {
        let sim = SimDriver::new(SimConfig::discrete());
        let memory = sim.allocate_memory(64, 0)?;
        assert_eq!(
            sim.map_memory(memory, 64),
            Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
        );
        sim.free_memory(memory);
        assert_eq!(sim.live_memory(), 0);
        Ok(())
    }

    #[test]
    fn injected_submit_failure() -> Result<()> {
        let sim = SimDriver::new(SimConfig::discrete());
        let pool = sim.create_command_pool(0)?;
        let command_buffer = sim.allocate_command_buffer(pool)?;
        sim.begin_command_buffer(command_buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        sim.end_command_buffer(command_buffer)?;
        sim.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
        let queue = sim.queues()[0];
        assert_eq!(
            sim.queue_submit(queue, command_buffer, vk::Fence::null()),
            Err(vk::Result::ERROR_DEVICE_LOST)
        );
        sim.queue_submit(queue, command_buffer, vk::Fence::null())?;
        assert_eq!(sim.submissions().len(), 1);
        Ok(())
    }
}
