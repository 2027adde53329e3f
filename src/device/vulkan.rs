/*!
The Vulkan driver.

The instance, physical device, logical device and queues are created with
vulkano. Commands are issued through the raw entry points of the vulkano device,
the runtime does its own synchronization.
*/

use super::{
    driver::{
        BufferBarrier, ComputePipelineInfo, DescriptorWrite, DeviceLimits, Driver, DriverResult,
        LabelInfo, MemoryRequirements, MemoryType,
    },
    error::{DeviceIndexOutOfRange, DeviceUnavailable},
};
use anyhow::Error;
use ash::vk;
use std::{ffi::CString, ptr, ptr::NonNull, sync::Arc, time::Duration};
use vulkano::{
    device::{Device, DeviceCreateInfo, Queue, QueueCreateInfo, QueueFlags},
    instance::{Instance, InstanceCreateInfo, InstanceExtensions},
    library::VulkanLibrary,
    VulkanObject,
};

#[cfg(any(target_os = "ios", target_os = "macos"))]
mod molten {
    use ash::vk;
    use std::os::raw::c_char;
    use vulkano::library::loader::Loader;

    pub(super) struct AshMoltenLoader;

    unsafe impl Loader for AshMoltenLoader {
        unsafe fn get_instance_proc_addr(
            &self,
            instance: vk::Instance,
            name: *const c_char,
        ) -> vk::PFN_vkVoidFunction {
            let entry = ash_molten::load();
            let ptr = unsafe { entry.get_instance_proc_addr(std::mem::transmute(instance), name) };
            unsafe { std::mem::transmute(ptr) }
        }
    }
}

fn load_library() -> anyhow::Result<Arc<VulkanLibrary>> {
    #[allow(unused_mut)]
    let mut library = VulkanLibrary::new();
    #[cfg(any(target_os = "ios", target_os = "macos"))]
    if library.is_err() {
        tracing::debug!("loading MoltenVK");
        library = VulkanLibrary::with_loader(molten::AshMoltenLoader);
    }
    library.map_err(|e| Error::new(DeviceUnavailable).context(e))
}

/// The Vulkan device at an index.
pub struct VulkanDriver {
    name: String,
    queue_family_index: u32,
    queues: Vec<vk::Queue>,
    limits: DeviceLimits,
    memory_types: Vec<MemoryType>,
    memory_heap_count: u32,
    debug_utils: bool,
    _queues: Vec<Arc<Queue>>,
    device: Arc<Device>,
    instance: Arc<Instance>,
}

impl VulkanDriver {
    /** Creates the device at `index`, with every queue of its compute family.

    **errors**
    - [`DeviceUnavailable`] if the Vulkan library could not be loaded.
    - [`DeviceIndexOutOfRange`]
    - The instance or device could not be created. */
    pub fn new(index: usize) -> anyhow::Result<Self> {
        let library = load_library()?;
        let debug_utils = library.supported_extensions().ext_debug_utils;
        let instance = Instance::new(
            library,
            InstanceCreateInfo {
                enabled_extensions: InstanceExtensions {
                    ext_debug_utils: debug_utils,
                    ..InstanceExtensions::empty()
                },
                enumerate_portability: true,
                ..InstanceCreateInfo::application_from_cargo_toml()
            },
        )?;
        let mut physical_devices = instance.enumerate_physical_devices()?;
        let devices = physical_devices.len();
        let physical_device = physical_devices
            .nth(index)
            .ok_or(DeviceIndexOutOfRange { index, devices })?;
        let families = physical_device.queue_family_properties();
        let queue_family_index = families
            .iter()
            .position(|x| {
                x.queue_flags.contains(QueueFlags::COMPUTE)
                    && !x.queue_flags.contains(QueueFlags::GRAPHICS)
            })
            .or_else(|| {
                families
                    .iter()
                    .position(|x| x.queue_flags.contains(QueueFlags::COMPUTE))
            })
            .ok_or(DeviceUnavailable)? as u32;
        let queue_count = families[queue_family_index as usize].queue_count as usize;
        let properties = physical_device.properties();
        let name = properties.device_name.clone();
        let limits = DeviceLimits {
            max_compute_work_group_count: properties.max_compute_work_group_count,
            max_compute_work_group_invocations: properties.max_compute_work_group_invocations,
            max_compute_work_group_size: properties.max_compute_work_group_size,
        };
        let memory_properties = physical_device.memory_properties();
        let memory_types = memory_properties
            .memory_types
            .iter()
            .map(|x| MemoryType {
                property_flags: x.property_flags.into(),
                heap_index: x.heap_index,
            })
            .collect();
        let memory_heap_count = memory_properties.memory_heaps.len() as u32;
        let (device, queues) = Device::new(
            physical_device,
            DeviceCreateInfo {
                queue_create_infos: vec![QueueCreateInfo {
                    queue_family_index,
                    queues: vec![0.5; queue_count],
                    ..Default::default()
                }],
                ..Default::default()
            },
        )?;
        let queues: Vec<_> = queues.collect();
        tracing::debug!("created vulkan device {name:?} with {} queues", queues.len());
        Ok(Self {
            name,
            queue_family_index,
            queues: queues.iter().map(|x| x.handle()).collect(),
            limits,
            memory_types,
            memory_heap_count,
            debug_utils,
            _queues: queues,
            device,
            instance,
        })
    }
    fn fns(&self) -> &vk::DeviceFnV1_0 {
        &self.device.fns().v1_0
    }
    fn handle(&self) -> vk::Device {
        self.device.handle()
    }
    fn label_name(label: &LabelInfo) -> CString {
        CString::new(label.name.replace('\0', "")).unwrap_or_default()
    }
}

fn timeout_nanos(timeout: Duration) -> u64 {
    timeout.as_nanos().min(u128::from(u64::MAX)) as u64
}

// # Safety
// Handles passed in are created by this driver and externally synchronized by
// the runtime, create infos outlive the calls that read them.
impl Driver for VulkanDriver {
    fn name(&self) -> &str {
        &self.name
    }
    fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }
    fn queues(&self) -> &[vk::Queue] {
        &self.queues
    }
    fn limits(&self) -> DeviceLimits {
        self.limits
    }
    fn memory_type_count(&self) -> u32 {
        self.memory_types.len() as u32
    }
    fn memory_heap_count(&self) -> u32 {
        self.memory_heap_count
    }
    fn memory_type(&self, index: u32) -> Option<MemoryType> {
        self.memory_types.get(index as usize).copied()
    }
    fn supports_debug_labels(&self) -> bool {
        self.debug_utils
    }
    fn create_fence(&self, signaled: bool) -> DriverResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        let mut fence = vk::Fence::null();
        unsafe { (self.fns().create_fence)(self.handle(), &*info, ptr::null(), &mut fence) }
            .result()?;
        Ok(fence)
    }
    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { (self.fns().destroy_fence)(self.handle(), fence, ptr::null()) }
    }
    fn reset_fence(&self, fence: vk::Fence) -> DriverResult<()> {
        unsafe { (self.fns().reset_fences)(self.handle(), 1, &fence) }.result()
    }
    fn fence_status(&self, fence: vk::Fence) -> DriverResult<bool> {
        match unsafe { (self.fns().get_fence_status)(self.handle(), fence) } {
            vk::Result::SUCCESS => Ok(true),
            vk::Result::NOT_READY => Ok(false),
            result => Err(result),
        }
    }
    fn wait_fence(&self, fence: vk::Fence, timeout: Duration) -> DriverResult<bool> {
        let timeout = timeout_nanos(timeout);
        match unsafe { (self.fns().wait_for_fences)(self.handle(), 1, &fence, vk::TRUE, timeout) }
        {
            vk::Result::SUCCESS => Ok(true),
            vk::Result::TIMEOUT => Ok(false),
            result => Err(result),
        }
    }
    fn create_command_pool(&self, queue_family_index: u32) -> DriverResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);
        let mut pool = vk::CommandPool::null();
        unsafe { (self.fns().create_command_pool)(self.handle(), &*info, ptr::null(), &mut pool) }
            .result()?;
        Ok(pool)
    }
    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { (self.fns().destroy_command_pool)(self.handle(), pool, ptr::null()) }
    }
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> DriverResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let mut command_buffer = vk::CommandBuffer::null();
        unsafe {
            (self.fns().allocate_command_buffers)(self.handle(), &*info, &mut command_buffer)
        }
        .result()?;
        Ok(command_buffer)
    }
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe { (self.fns().free_command_buffers)(self.handle(), pool, 1, &command_buffer) }
    }
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> DriverResult<()> {
        unsafe {
            (self.fns().reset_command_buffer)(command_buffer, vk::CommandBufferResetFlags::empty())
        }
        .result()
    }
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> DriverResult<()> {
        let info = vk::CommandBufferBeginInfo::builder().flags(usage);
        unsafe { (self.fns().begin_command_buffer)(command_buffer, &*info) }.result()
    }
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> DriverResult<()> {
        unsafe { (self.fns().end_command_buffer)(command_buffer) }.result()
    }
    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        unsafe { (self.fns().cmd_copy_buffer)(command_buffer, src, dst, 1, &region) }
    }
    fn cmd_fill_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        dst: vk::Buffer,
        offset: u64,
        size: u64,
        data: u32,
    ) {
        unsafe { (self.fns().cmd_fill_buffer)(command_buffer, dst, offset, size, data) }
    }
    fn cmd_buffer_barrier(&self, command_buffer: vk::CommandBuffer, barrier: &BufferBarrier) {
        let buffer_barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(barrier.buffer)
            .offset(barrier.offset)
            .size(barrier.size);
        unsafe {
            (self.fns().cmd_pipeline_barrier)(
                command_buffer,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                0,
                ptr::null(),
                1,
                &*buffer_barrier,
                0,
                ptr::null(),
            )
        }
    }
    fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe {
            (self.fns().cmd_bind_pipeline)(command_buffer, vk::PipelineBindPoint::COMPUTE, pipeline)
        }
    }
    fn cmd_bind_descriptor_set(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            (self.fns().cmd_bind_descriptor_sets)(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                layout,
                0,
                1,
                &set,
                0,
                ptr::null(),
            )
        }
    }
    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            (self.fns().cmd_push_constants)(
                command_buffer,
                layout,
                vk::ShaderStageFlags::COMPUTE,
                offset,
                data.len() as u32,
                data.as_ptr().cast(),
            )
        }
    }
    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, groups: [u32; 3]) {
        let [x, y, z] = groups;
        unsafe { (self.fns().cmd_dispatch)(command_buffer, x, y, z) }
    }
    fn cmd_begin_label(&self, command_buffer: vk::CommandBuffer, label: &LabelInfo) {
        if !self.debug_utils {
            return;
        }
        let name = Self::label_name(label);
        let info = vk::DebugUtilsLabelEXT::builder()
            .label_name(&name)
            .color(label.color);
        unsafe {
            (self.instance.fns().ext_debug_utils.cmd_begin_debug_utils_label_ext)(
                command_buffer,
                &*info,
            )
        }
    }
    fn cmd_end_label(&self, command_buffer: vk::CommandBuffer) {
        if self.debug_utils {
            unsafe {
                (self.instance.fns().ext_debug_utils.cmd_end_debug_utils_label_ext)(command_buffer)
            }
        }
    }
    fn queue_begin_label(&self, queue: vk::Queue, label: &LabelInfo) {
        if !self.debug_utils {
            return;
        }
        let name = Self::label_name(label);
        let info = vk::DebugUtilsLabelEXT::builder()
            .label_name(&name)
            .color(label.color);
        unsafe {
            (self.instance.fns().ext_debug_utils.queue_begin_debug_utils_label_ext)(queue, &*info)
        }
    }
    fn queue_end_label(&self, queue: vk::Queue) {
        if self.debug_utils {
            unsafe { (self.instance.fns().ext_debug_utils.queue_end_debug_utils_label_ext)(queue) }
        }
    }
    fn queue_submit(
        &self,
        queue: vk::Queue,
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> DriverResult<()> {
        let command_buffers = [command_buffer];
        let info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        unsafe { (self.fns().queue_submit)(queue, 1, &*info, fence) }.result()
    }
    fn queue_wait_idle(&self, queue: vk::Queue) -> DriverResult<()> {
        unsafe { (self.fns().queue_wait_idle)(queue) }.result()
    }
    fn device_wait_idle(&self) -> DriverResult<()> {
        unsafe { (self.fns().device_wait_idle)(self.handle()) }.result()
    }
    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> DriverResult<(vk::Buffer, MemoryRequirements)> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let mut buffer = vk::Buffer::null();
        unsafe { (self.fns().create_buffer)(self.handle(), &*info, ptr::null(), &mut buffer) }
            .result()?;
        let mut requirements = vk::MemoryRequirements::default();
        unsafe {
            (self.fns().get_buffer_memory_requirements)(self.handle(), buffer, &mut requirements)
        }
        Ok((
            buffer,
            MemoryRequirements {
                size: requirements.size,
                alignment: requirements.alignment,
                memory_type_bits: requirements.memory_type_bits,
            },
        ))
    }
    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { (self.fns().destroy_buffer)(self.handle(), buffer, ptr::null()) }
    }
    fn allocate_memory(
        &self,
        size: u64,
        memory_type_index: u32,
    ) -> DriverResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        let mut memory = vk::DeviceMemory::null();
        unsafe { (self.fns().allocate_memory)(self.handle(), &*info, ptr::null(), &mut memory) }
            .result()?;
        Ok(memory)
    }
    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { (self.fns().free_memory)(self.handle(), memory, ptr::null()) }
    }
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
    ) -> DriverResult<()> {
        unsafe { (self.fns().bind_buffer_memory)(self.handle(), buffer, memory, 0) }.result()
    }
    fn map_memory(&self, memory: vk::DeviceMemory, _size: u64) -> DriverResult<NonNull<u8>> {
        let mut data = ptr::null_mut();
        unsafe {
            (self.fns().map_memory)(
                self.handle(),
                memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
                &mut data,
            )
        }
        .result()?;
        NonNull::new(data.cast()).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
    }
    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { (self.fns().unmap_memory)(self.handle(), memory) }
    }
    fn flush_memory(&self, memory: vk::DeviceMemory, offset: u64, size: u64) -> DriverResult<()> {
        let range = vk::MappedMemoryRange::builder()
            .memory(memory)
            .offset(offset)
            .size(size);
        unsafe { (self.fns().flush_mapped_memory_ranges)(self.handle(), 1, &*range) }.result()
    }
    fn invalidate_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> DriverResult<()> {
        let range = vk::MappedMemoryRange::builder()
            .memory(memory)
            .offset(offset)
            .size(size);
        unsafe { (self.fns().invalidate_mapped_memory_ranges)(self.handle(), 1, &*range) }
            .result()
    }
    fn create_shader_module(&self, spirv: &[u32]) -> DriverResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::builder().code(spirv);
        let mut module = vk::ShaderModule::null();
        unsafe {
            (self.fns().create_shader_module)(self.handle(), &*info, ptr::null(), &mut module)
        }
        .result()?;
        Ok(module)
    }
    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { (self.fns().destroy_shader_module)(self.handle(), module, ptr::null()) }
    }
    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorType],
    ) -> DriverResult<vk::DescriptorSetLayout> {
        let bindings: Vec<_> = bindings
            .iter()
            .enumerate()
            .map(|(binding, descriptor_type)| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding as u32)
                    .descriptor_type(*descriptor_type)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build()
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let mut layout = vk::DescriptorSetLayout::null();
        unsafe {
            (self.fns().create_descriptor_set_layout)(
                self.handle(),
                &*info,
                ptr::null(),
                &mut layout,
            )
        }
        .result()?;
        Ok(layout)
    }
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { (self.fns().destroy_descriptor_set_layout)(self.handle(), layout, ptr::null()) }
    }
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[(vk::DescriptorType, u32)],
    ) -> DriverResult<vk::DescriptorPool> {
        let pool_sizes: Vec<_> = pool_sizes
            .iter()
            .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
                ty: *ty,
                descriptor_count: *descriptor_count,
            })
            .collect();
        let info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);
        let mut pool = vk::DescriptorPool::null();
        unsafe {
            (self.fns().create_descriptor_pool)(self.handle(), &*info, ptr::null(), &mut pool)
        }
        .result()?;
        Ok(pool)
    }
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { (self.fns().destroy_descriptor_pool)(self.handle(), pool, ptr::null()) }
    }
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> DriverResult<vk::DescriptorSet> {
        let set_layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        let mut set = vk::DescriptorSet::null();
        unsafe { (self.fns().allocate_descriptor_sets)(self.handle(), &*info, &mut set) }
            .result()?;
        Ok(set)
    }
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let buffer_infos: Vec<_> = writes
            .iter()
            .map(|write| vk::DescriptorBufferInfo {
                buffer: write.buffer,
                offset: write.offset,
                range: write.range,
            })
            .collect();
        let writes: Vec<_> = writes
            .iter()
            .zip(&buffer_infos)
            .map(|(write, buffer_info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(write.binding)
                    .descriptor_type(write.descriptor_type)
                    .buffer_info(std::slice::from_ref(buffer_info))
                    .build()
            })
            .collect();
        unsafe {
            (self.fns().update_descriptor_sets)(
                self.handle(),
                writes.len() as u32,
                writes.as_ptr(),
                0,
                ptr::null(),
            )
        }
    }
    fn create_pipeline_layout(
        &self,
        set_layout: vk::DescriptorSetLayout,
        push_constant_size: u32,
    ) -> DriverResult<vk::PipelineLayout> {
        let set_layouts = [set_layout];
        let push_constant_ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            offset: 0,
            size: push_constant_size,
        }];
        let push_constant_ranges = if push_constant_size > 0 {
            push_constant_ranges.as_slice()
        } else {
            &[]
        };
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(push_constant_ranges);
        let mut layout = vk::PipelineLayout::null();
        unsafe {
            (self.fns().create_pipeline_layout)(self.handle(), &*info, ptr::null(), &mut layout)
        }
        .result()?;
        Ok(layout)
    }
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { (self.fns().destroy_pipeline_layout)(self.handle(), layout, ptr::null()) }
    }
    fn create_compute_pipeline(&self, info: &ComputePipelineInfo) -> DriverResult<vk::Pipeline> {
        let entry_point =
            CString::new(info.entry_point).map_err(|_| vk::Result::ERROR_INITIALIZATION_FAILED)?;
        let map_entries: Vec<_> = (0..info.specialization.len() as u32)
            .map(|id| vk::SpecializationMapEntry {
                constant_id: id,
                offset: id * 4,
                size: 4,
            })
            .collect();
        let specialization_info = vk::SpecializationInfo::builder()
            .map_entries(&map_entries)
            .data(bytemuck::cast_slice(info.specialization));
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(info.module)
            .name(&entry_point)
            .specialization_info(&specialization_info);
        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(*stage)
            .layout(info.layout);
        let mut pipeline = vk::Pipeline::null();
        unsafe {
            (self.fns().create_compute_pipelines)(
                self.handle(),
                vk::PipelineCache::null(),
                1,
                &*create_info,
                ptr::null(),
                &mut pipeline,
            )
        }
        .result()?;
        Ok(pipeline)
    }
    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { (self.fns().destroy_pipeline)(self.handle(), pipeline, ptr::null()) }
    }
}
