/*!
Kernels.

A [`Kernel`] is created from a [`KernelDesc`] with
[`Device::create_kernel()`](crate::device::Device::create_kernel). The desc
names a compiled [module](ModuleDesc), the entry point, the number of dimensions
and the arguments, each classified as a buffer, a POD value or a local array.

- Buffers are bound in declaration order, one descriptor binding each.
- POD values are packed into a uniform buffer bound in the last slot. The packed
values are compared with the previous launch and only uploaded when changed.
- Local arrays set the workgroup memory length, passed as specialization
constants after the workgroup shape.

The global offset of [`LaunchOptions`] is passed as push constants.

```
# use krnl_runtime::{anyhow::Result, buffer::BufferKind, device::{Device, MemoryUsage, sim::{SimConfig, SimDriver}}};
# use krnl_runtime::{future::BlockableFuture, kernel::{ArgDesc, KernelArg, KernelDesc, ModuleDesc}, launch::LaunchOptions};
# use std::sync::Arc;
# fn main() -> Result<()> {
# let device = Device::builder().driver(Arc::new(SimDriver::new(SimConfig::discrete()))).build()?;
# let spirv = vec![0x0723_0203];
let module = ModuleDesc::new("saxpy", spirv);
let desc = KernelDesc::new("saxpy", module)
    .with_arg(ArgDesc::pod::<f32>())
    .with_arg(ArgDesc::buffer(BufferKind::Storage))
    .with_arg(ArgDesc::buffer_mut(BufferKind::Storage));
let mut kernel = device.create_kernel(desc)?;
let mut x = device.create_buffer::<f32>(BufferKind::Storage, MemoryUsage::DeviceOnly);
x.set_size(1000)?;
let mut y = device.create_buffer::<f32>(BufferKind::Storage, MemoryUsage::DeviceOnly);
y.set_size(1000)?;
let result = kernel.run(
    [1000, 1, 1],
    &[KernelArg::pod(&2f32), KernelArg::buffer(&x), KernelArg::buffer_mut(&mut y)],
    LaunchOptions::new().with_fence(true),
)?;
assert!(result.is_async());
result.finish().block()?;
# Ok(())
# }
```
*/

use crate::{
    buffer::{Buffer, BufferAlloc, BufferKind, RawBuffer},
    device::{
        driver::{BufferBarrier, ComputePipelineInfo, DescriptorWrite, LabelInfo},
        CommandSlot, Device, Engine, MemoryUsage,
    },
    error::Error,
    launch::{LaunchOptions, LaunchResult},
    result::Result,
    scope::{CommandRegion, DebugLabel},
};
use ash::vk::{self, Handle};
use bytemuck::Pod;
use std::{
    fmt::{self, Debug},
    mem::{align_of, size_of},
    sync::Arc,
};

/// Size of the global offset push constants.
const PUSH_CONSTANT_SIZE: u32 = size_of::<[u32; 3]>() as u32;

/// A compiled shader module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleDesc {
    /// Modules with the same id are created once per device.
    pub id: String,
    pub spirv: Vec<u32>,
}

impl ModuleDesc {
    pub fn new(id: impl Into<String>, spirv: Vec<u32>) -> Self {
        Self {
            id: id.into(),
            spirv,
        }
    }
}

/// A kernel argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::IsVariant)]
pub enum ArgDesc {
    /// A buffer, `mutable` if the kernel writes to it.
    Buffer { kind: BufferKind, mutable: bool },
    /// A plain value of `size` bytes.
    Pod { size: u32, align: u32 },
    /// Workgroup memory of `len` elements.
    Local { elem_size: u32, len: u32 },
}

impl ArgDesc {
    /// A read only buffer.
    pub fn buffer(kind: BufferKind) -> Self {
        Self::Buffer {
            kind,
            mutable: false,
        }
    }
    /// A buffer written by the kernel.
    pub fn buffer_mut(kind: BufferKind) -> Self {
        Self::Buffer {
            kind,
            mutable: true,
        }
    }
    /// A value of type `T`.
    pub fn pod<T: Pod>() -> Self {
        Self::Pod {
            size: size_of::<T>() as u32,
            align: align_of::<T>() as u32,
        }
    }
    /// An array of `len` `T` in workgroup memory.
    pub fn local<T: Pod>(len: u32) -> Self {
        Self::Local {
            elem_size: size_of::<T>() as u32,
            len,
        }
    }
}

/// Describes a kernel, see [`Device::create_kernel()`](crate::device::Device::create_kernel).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelDesc {
    name: String,
    module: ModuleDesc,
    entry_point: String,
    dims: u32,
    args: Vec<ArgDesc>,
}

impl KernelDesc {
    /// A 1 dimensional kernel with entry point "main" and no arguments.
    pub fn new(name: impl Into<String>, module: ModuleDesc) -> Self {
        Self {
            name: name.into(),
            module,
            entry_point: "main".to_string(),
            dims: 1,
            args: Vec::new(),
        }
    }
    /// Sets the entry point.
    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }
    /** Sets the number of dimensions, 1, 2 or 3.

    Other values are rejected by [`Device::create_kernel()`](crate::device::Device::create_kernel). */
    pub fn with_dims(mut self, dims: u32) -> Self {
        self.dims = dims;
        self
    }
    /// Appends an argument.
    pub fn with_arg(mut self, arg: ArgDesc) -> Self {
        self.args.push(arg);
        self
    }
    /// The name.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The arguments.
    pub fn args(&self) -> &[ArgDesc] {
        &self.args
    }
}

/// An argument passed to [`Kernel::run()`].
pub enum KernelArg<'a> {
    Buffer(&'a RawBuffer),
    BufferMut(&'a mut RawBuffer),
    Pod(&'a [u8]),
    /// The length of a local array, must match the desc.
    Local(u32),
}

impl<'a> KernelArg<'a> {
    pub fn buffer<T: Pod>(buffer: &'a Buffer<T>) -> Self {
        Self::Buffer(buffer.as_raw())
    }
    pub fn buffer_mut<T: Pod>(buffer: &'a mut Buffer<T>) -> Self {
        Self::BufferMut(buffer.as_raw_mut())
    }
    pub fn pod<T: Pod>(value: &'a T) -> Self {
        Self::Pod(bytemuck::bytes_of(value))
    }
    fn as_buffer(&self) -> Option<&RawBuffer> {
        match self {
            Self::Buffer(buffer) => Some(*buffer),
            Self::BufferMut(buffer) => Some(&**buffer),
            _ => None,
        }
    }
    fn as_pod(&self) -> Option<&[u8]> {
        match self {
            Self::Pod(bytes) => Some(*bytes),
            _ => None,
        }
    }
}

impl Debug for KernelArg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Buffer(buffer) => f.debug_tuple("Buffer").field(buffer).finish(),
            Self::BufferMut(buffer) => f.debug_tuple("BufferMut").field(buffer).finish(),
            Self::Pod(bytes) => f.debug_tuple("Pod").field(bytes).finish(),
            Self::Local(len) => f.debug_tuple("Local").field(len).finish(),
        }
    }
}

/** Offsets of the POD args in the uniform buffer and its size.

Fields are aligned to at least 4 bytes and the size is rounded up to 16, as
with std140 scalars. */
fn pod_layout(args: &[ArgDesc]) -> (Vec<u64>, u64) {
    let mut offsets = Vec::new();
    let mut offset = 0u64;
    for arg in args {
        if let ArgDesc::Pod { size, align } = *arg {
            let align = u64::from(align.max(4));
            offset = (offset + align - 1) / align * align;
            offsets.push(offset);
            offset += u64::from(size);
        }
    }
    (offsets, (offset + 15) / 16 * 16)
}

/// The POD uniform buffer and its host mirror.
struct PodBuffers {
    device: BufferAlloc,
    cache: BufferAlloc,
    // Set when the cache has changed since the last upload.
    dirty: bool,
}

/** A kernel.

Created with [`Device::create_kernel()`](crate::device::Device::create_kernel),
launched with [`.run()`](Kernel::run). */
pub struct Kernel {
    engine: Arc<Engine>,
    name: String,
    dims: u32,
    args: Vec<ArgDesc>,
    pod_offsets: Vec<u64>,
    set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    slot: CommandSlot,
    pod: Option<PodBuffers>,
}

impl Kernel {
    pub(crate) fn new(engine: Arc<Engine>, desc: KernelDesc) -> Result<Self> {
        let KernelDesc {
            name,
            module,
            entry_point,
            dims,
            args,
        } = desc;
        if !(1..=3).contains(&dims) {
            return Err(Error::InvalidDimensions { kernel: name, dims });
        }
        let slot = CommandSlot::new(engine.clone())?;
        let (pod_offsets, pod_size) = pod_layout(&args);
        // Handles are filled in as they are created, drop destroys the non null ones.
        let mut kernel = Self {
            engine: engine.clone(),
            name,
            dims,
            args,
            pod_offsets,
            set_layout: vk::DescriptorSetLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_set: vk::DescriptorSet::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            slot,
            pod: None,
        };
        let driver = engine.driver();
        let shader_module = engine.shader_module(&module.id, &module.spirv)?;
        let mut bindings: Vec<_> = kernel
            .args
            .iter()
            .filter_map(|arg| match arg {
                ArgDesc::Buffer { kind, .. } => Some(kind.descriptor_type()),
                _ => None,
            })
            .collect();
        if kernel.args.iter().any(ArgDesc::is_pod) {
            bindings.push(vk::DescriptorType::UNIFORM_BUFFER);
        }
        kernel.set_layout = driver
            .create_descriptor_set_layout(&bindings)
            .map_err(|result| Error::allocation("descriptor set layout", 0, result))?;
        if !bindings.is_empty() {
            let pool_sizes: Vec<_> = [
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorType::UNIFORM_BUFFER,
            ]
            .into_iter()
            .map(|ty| (ty, bindings.iter().filter(|x| **x == ty).count() as u32))
            .filter(|(_, count)| *count > 0)
            .collect();
            kernel.descriptor_pool = driver
                .create_descriptor_pool(1, &pool_sizes)
                .map_err(|result| Error::allocation("descriptor pool", 0, result))?;
            kernel.descriptor_set = driver
                .allocate_descriptor_set(kernel.descriptor_pool, kernel.set_layout)
                .map_err(|result| Error::allocation("descriptor set", 0, result))?;
        }
        kernel.pipeline_layout = driver
            .create_pipeline_layout(kernel.set_layout, PUSH_CONSTANT_SIZE)
            .map_err(|result| Error::allocation("pipeline layout", 0, result))?;
        let specialization: Vec<u32> = engine
            .sizer()
            .shape(dims)
            .into_iter()
            .chain(kernel.args.iter().filter_map(|arg| match arg {
                ArgDesc::Local { len, .. } => Some(*len),
                _ => None,
            }))
            .collect();
        kernel.pipeline = driver
            .create_compute_pipeline(&ComputePipelineInfo {
                layout: kernel.pipeline_layout,
                module: shader_module,
                entry_point: &entry_point,
                specialization: &specialization,
            })
            .map_err(|result| Error::allocation("compute pipeline", 0, result))?;
        if !kernel.pod_offsets.is_empty() {
            let device = BufferAlloc::new(
                engine.clone(),
                pod_size,
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                MemoryUsage::DeviceOnly,
            )?;
            let cache = BufferAlloc::new(
                engine.clone(),
                pod_size,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryUsage::Upload,
            )?;
            kernel.pod.replace(PodBuffers {
                device,
                cache,
                dirty: true,
            });
        }
        tracing::debug!(
            "created kernel {:?} with {} bindings and specialization {specialization:?}",
            kernel.name,
            bindings.len(),
        );
        Ok(kernel)
    }
    /// The device.
    pub fn device(&self) -> Device {
        Device::from_engine(self.engine.clone())
    }
    /// The name.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The number of dimensions.
    pub fn dims(&self) -> u32 {
        self.dims
    }
    /// The arguments.
    pub fn args(&self) -> &[ArgDesc] {
        &self.args
    }
    /// The workgroup shape.
    pub fn group_shape(&self) -> [u32; 3] {
        self.engine.sizer().shape(self.dims)
    }
    fn check_args(&self, args: &[KernelArg]) -> Result<()> {
        let name = self.name.as_str();
        if args.len() != self.args.len() {
            return Err(Error::argument(
                name,
                args.len().min(self.args.len()),
                format!("expected {} arguments, found {}", self.args.len(), args.len()),
            ));
        }
        for (index, (desc, arg)) in self.args.iter().zip(args).enumerate() {
            match (*desc, arg) {
                (ArgDesc::Buffer { mutable: true, .. }, KernelArg::Buffer(_)) => {
                    return Err(Error::argument(name, index, "expected a mutable buffer"));
                }
                (ArgDesc::Buffer { kind, .. }, KernelArg::Buffer(_) | KernelArg::BufferMut(_)) => {
                    let Some(buffer) = arg.as_buffer() else {
                        continue;
                    };
                    if !Arc::ptr_eq(buffer.engine(), &self.engine) {
                        return Err(Error::DeviceMismatch);
                    }
                    if buffer.kind() != kind {
                        return Err(Error::argument(
                            name,
                            index,
                            format!("expected a {kind:?} buffer, found {:?}", buffer.kind()),
                        ));
                    }
                    if buffer.alloc().is_none() {
                        return Err(Error::argument(name, index, "buffer is empty"));
                    }
                }
                (ArgDesc::Pod { size, .. }, KernelArg::Pod(bytes)) => {
                    if bytes.len() != size as usize {
                        return Err(Error::argument(
                            name,
                            index,
                            format!("expected {size} bytes, found {}", bytes.len()),
                        ));
                    }
                }
                (ArgDesc::Local { len, .. }, KernelArg::Local(arg_len)) => {
                    if *arg_len != len {
                        return Err(Error::argument(
                            name,
                            index,
                            format!("expected local length {len}, found {arg_len}"),
                        ));
                    }
                }
                (desc, arg) => {
                    return Err(Error::argument(
                        name,
                        index,
                        format!("expected {desc:?}, found {arg:?}"),
                    ));
                }
            }
        }
        Ok(())
    }
    /** Launches the kernel over `global_size` invocations.

    Axes of `global_size` past [`.dims()`](Kernel::dims) are ignored. Arguments
    are checked before anything is recorded, on error nothing is modified. A
    launch with no invocations does nothing and returns a sync result.

    Re-recording waits for the previous launch of this kernel unless
    `options.external_sync`.

    **errors**
    - [`ArgumentMismatch`](Error::ArgumentMismatch) if `args` do not match the desc.
    - [`DeviceMismatch`](Error::DeviceMismatch)
    - [`QueueIndexOutOfRange`](Error::QueueIndexOutOfRange)
    - [`DispatchTooLarge`](Error::DispatchTooLarge) if the group count exceeds the device limits.
    - [`LaunchFailed`](Error::LaunchFailed) if recording failed.
    - [`SubmissionFailed`](Error::SubmissionFailed) */
    pub fn run(
        &mut self,
        global_size: [u32; 3],
        args: &[KernelArg],
        options: LaunchOptions,
    ) -> Result<LaunchResult> {
        self.check_args(args)?;
        self.engine.check_queue(options.queue_index)?;
        let dims = self.dims as usize;
        if global_size[..dims].contains(&0) {
            return Ok(LaunchResult::sync());
        }
        let groups = self.engine.sizer().group_count(global_size, self.dims);
        let limit = self.engine.info().limits().max_compute_work_group_count;
        if groups.iter().zip(limit).any(|(groups, limit)| *groups > limit) {
            return Err(Error::DispatchTooLarge { groups, limit });
        }
        let command_buffer = self.slot.prepare(options.external_sync)?;
        let driver = self.engine.driver();
        let mut writes: Vec<_> = args
            .iter()
            .filter_map(KernelArg::as_buffer)
            .enumerate()
            .map(|(binding, buffer)| DescriptorWrite {
                binding: binding as u32,
                descriptor_type: buffer.kind().descriptor_type(),
                buffer: buffer.handle(),
                offset: 0,
                range: buffer.byte_len(),
            })
            .collect();
        let upload = if let Some(pod) = self.pod.as_mut() {
            writes.push(DescriptorWrite {
                binding: writes.len() as u32,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                buffer: pod.device.handle(),
                offset: 0,
                range: pod.device.size(),
            });
            let fields: Vec<_> = self
                .pod_offsets
                .iter()
                .copied()
                .zip(args.iter().filter_map(KernelArg::as_pod))
                .collect();
            if pod.cache.update_fields(&fields)? {
                pod.dirty = true;
            } else if !pod.dirty {
                tracing::trace!("{:?} pod args unchanged, skipping upload", self.name);
            }
            pod.dirty
        } else {
            false
        };
        if !writes.is_empty() {
            driver.update_descriptor_set(self.descriptor_set, &writes);
        }
        let label = options.label.clone().or_else(|| {
            self.engine
                .debug_labels()
                .then(|| LabelInfo::new(self.name.clone()))
        });
        let recording_failed = |result| Error::LaunchFailed {
            kernel: self.name.clone(),
            result,
        };
        {
            let mut region = CommandRegion::begin(
                driver,
                command_buffer,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )
            .map_err(recording_failed)?;
            let debug_label = label.as_ref().map(|label| {
                DebugLabel::begin(driver, self.engine.command_label(command_buffer), label)
            });
            driver.cmd_bind_pipeline(command_buffer, self.pipeline);
            if self.descriptor_set.as_raw() != 0 {
                driver.cmd_bind_descriptor_set(
                    command_buffer,
                    self.pipeline_layout,
                    self.descriptor_set,
                );
            }
            driver.cmd_push_constants(
                command_buffer,
                self.pipeline_layout,
                0,
                bytemuck::cast_slice(&options.global_offset),
            );
            if let Some(pod) = self.pod.as_ref().filter(|_| upload) {
                let size = pod.device.size();
                driver.cmd_copy_buffer(
                    command_buffer,
                    pod.cache.handle(),
                    pod.device.handle(),
                    vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: 0,
                        size,
                    },
                );
                driver.cmd_buffer_barrier(
                    command_buffer,
                    &BufferBarrier {
                        buffer: pod.device.handle(),
                        offset: 0,
                        size,
                        src_stage: vk::PipelineStageFlags::TRANSFER,
                        dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
                        src_access: vk::AccessFlags::TRANSFER_WRITE,
                        dst_access: vk::AccessFlags::UNIFORM_READ,
                    },
                );
            }
            driver.cmd_dispatch(command_buffer, groups);
            drop(debug_label);
            region.end().map_err(recording_failed)?;
        }
        let (submission, fence) = self.engine.submit(
            options.queue_index,
            command_buffer,
            options.fence,
            label.as_ref(),
        )?;
        self.slot.submitted(submission);
        if let Some(pod) = self.pod.as_mut() {
            pod.dirty = false;
            pod.device.note(submission);
            pod.cache.note(submission);
        }
        for buffer in args.iter().filter_map(KernelArg::as_buffer) {
            if let Some(alloc) = buffer.alloc() {
                alloc.note(submission);
            }
        }
        tracing::trace!("launched {:?} with groups {groups:?}", self.name);
        Ok(LaunchResult::submitted(fence))
    }
}

impl Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("device", &self.engine.id())
            .field("name", &self.name)
            .field("dims", &self.dims)
            .field("args", &self.args)
            .finish()
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if let Some(last) = self.slot.last() {
            if let Err(e) = self.engine.wait_submission(last) {
                tracing::warn!("{e}");
            }
        }
        let driver = self.engine.driver();
        if self.pipeline.as_raw() != 0 {
            driver.destroy_pipeline(self.pipeline);
        }
        if self.pipeline_layout.as_raw() != 0 {
            driver.destroy_pipeline_layout(self.pipeline_layout);
        }
        if self.descriptor_pool.as_raw() != 0 {
            driver.destroy_descriptor_pool(self.descriptor_pool);
        }
        if self.set_layout.as_raw() != 0 {
            driver.destroy_descriptor_set_layout(self.set_layout);
        }
        tracing::debug!("destroyed kernel {:?}", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{SimCall, SimCommand, SimConfig, SimDriver};
    use crate::device::driver::DeviceLimits;
    use anyhow::Result;

    fn sim_device(config: SimConfig) -> anyhow::Result<(Arc<SimDriver>, Device)> {
        let sim = Arc::new(SimDriver::new(config));
        let device = Device::builder()
            .driver(sim.clone())
            .debug_labels(false)
            .build()?;
        Ok((sim, device))
    }

    fn module() -> ModuleDesc {
        ModuleDesc::new("test", vec![0x0723_0203, 0x0001_0000])
    }

    fn storage<T: Pod>(device: &Device, len: usize) -> Result<Buffer<T>> {
        let mut buffer = device.create_buffer(BufferKind::Storage, MemoryUsage::DeviceOnly);
        buffer.set_size(len)?;
        Ok(buffer)
    }

    fn axpy(device: &Device) -> crate::result::Result<Kernel> {
        device.create_kernel(
            KernelDesc::new("axpy", module())
                .with_arg(ArgDesc::pod::<u32>())
                .with_arg(ArgDesc::buffer(BufferKind::Storage))
                .with_arg(ArgDesc::pod::<f32>())
                .with_arg(ArgDesc::buffer_mut(BufferKind::Storage)),
        )
    }

    fn uploads(commands: &[SimCommand]) -> (usize, usize) {
        let copies = commands
            .iter()
            .filter(|x| matches!(x, SimCommand::CopyBuffer { .. }))
            .count();
        let barriers = commands
            .iter()
            .filter(|x| matches!(x, SimCommand::Barrier(_)))
            .count();
        (copies, barriers)
    }

    #[test]
    fn pod_layout_offsets() {
        let args = [
            ArgDesc::pod::<u8>(),
            ArgDesc::buffer(BufferKind::Storage),
            ArgDesc::pod::<u64>(),
            ArgDesc::local::<f32>(8),
            ArgDesc::pod::<u16>(),
        ];
        assert_eq!(pod_layout(&args), (vec![0, 8, 16], 32));
        assert_eq!(pod_layout(&[ArgDesc::pod::<f32>()]), (vec![0], 16));
        assert_eq!(pod_layout(&[]), (vec![], 0));
        assert!(args.iter().filter(|x| x.is_pod()).count() == 3);
    }

    #[test]
    fn bindings_in_declaration_order() -> Result<()> {
        let (sim, device) = sim_device(SimConfig::discrete())?;
        let kernel = device.create_kernel(
            KernelDesc::new("bindings", module())
                .with_arg(ArgDesc::buffer(BufferKind::Storage))
                .with_arg(ArgDesc::pod::<u32>())
                .with_arg(ArgDesc::local::<f32>(64))
                .with_arg(ArgDesc::buffer(BufferKind::Uniform))
                .with_arg(ArgDesc::buffer_mut(BufferKind::Storage)),
        )?;
        assert_eq!(
            sim.set_layout_bindings(kernel.set_layout).unwrap(),
            [
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorType::UNIFORM_BUFFER,
            ]
        );
        Ok(())
    }

    #[test]
    fn kernel_without_bindings() -> Result<()> {
        let (sim, device) = sim_device(SimConfig::discrete())?;
        let mut kernel = device.create_kernel(KernelDesc::new("empty", module()))?;
        assert!(kernel.descriptor_set.as_raw() == 0);
        let _ = kernel.run([10, 1, 1], &[], LaunchOptions::new())?;
        let commands = &sim.submissions()[0].commands;
        assert!(matches!(
            commands.as_slice(),
            [
                SimCommand::BindPipeline(_),
                SimCommand::PushConstants { .. },
                SimCommand::Dispatch([1, 1, 1])
            ]
        ));
        assert!(sim.validation_errors().is_empty());
        Ok(())
    }

    #[test]
    fn specialization_constants() -> Result<()> {
        let (sim, device) = sim_device(SimConfig::discrete())?;
        let kernel = device.create_kernel(
            KernelDesc::new("specialized", module())
                .with_entry_point("reduce")
                .with_dims(2)
                .with_arg(ArgDesc::local::<f32>(64))
                .with_arg(ArgDesc::local::<u32>(3)),
        )?;
        assert_eq!(kernel.group_shape(), [16, 16, 1]);
        assert_eq!(
            sim.pipeline_specialization(kernel.pipeline).unwrap(),
            [16, 16, 1, 64, 3]
        );
        assert_eq!(
            sim.pipeline_entry_point(kernel.pipeline).as_deref(),
            Some("reduce")
        );
        Ok(())
    }

    #[test]
    fn dims_out_of_range() -> Result<()> {
        let (sim, device) = sim_device(SimConfig::discrete())?;
        sim.clear_calls();
        for dims in [0, 4] {
            let result = device.create_kernel(KernelDesc::new("bad", module()).with_dims(dims));
            assert!(matches!(
                result,
                Err(Error::InvalidDimensions { dims: x, .. }) if x == dims
            ));
        }
        assert!(sim.calls().is_empty());
        let kernel = device.create_kernel(KernelDesc::new("volume", module()).with_dims(3))?;
        assert_eq!(kernel.dims(), 3);
        Ok(())
    }

    #[test]
    fn modules_are_shared() -> Result<()> {
        let (sim, device) = sim_device(SimConfig::discrete())?;
        let a = axpy(&device)?;
        let b = axpy(&device)?;
        assert_eq!(sim.live_shader_modules(), 1);
        assert_eq!(sim.live_pipelines(), 2);
        drop(a);
        drop(b);
        assert_eq!(sim.live_pipelines(), 0);
        assert_eq!(sim.live_shader_modules(), 1);
        drop(device);
        assert_eq!(sim.live_shader_modules(), 0);
        Ok(())
    }

    #[test]
    fn pod_upload_only_when_changed() -> Result<()> {
        let (sim, device) = sim_device(SimConfig::discrete())?;
        let mut kernel = axpy(&device)?;
        let x = storage::<f32>(&device, 100)?;
        let mut y = storage::<f32>(&device, 100)?;
        let mut launch = |n: u32, alpha: f32| {
            kernel
                .run(
                    [n, 1, 1],
                    &[
                        KernelArg::pod(&n),
                        KernelArg::buffer(&x),
                        KernelArg::pod(&alpha),
                        KernelArg::buffer_mut(&mut y),
                    ],
                    LaunchOptions::new(),
                )
                .map(|_| ())
        };
        launch(100, 2.)?;
        launch(100, 2.)?;
        launch(100, 3.)?;
        launch(100, 3.)?;
        let submissions = sim.submissions();
        let counts: Vec<_> = submissions.iter().map(|x| uploads(&x.commands)).collect();
        assert_eq!(counts, [(1, 1), (0, 0), (1, 1), (0, 0)]);
        assert!(sim.validation_errors().is_empty());
        Ok(())
    }

    #[test]
    fn upload_precedes_dispatch() -> Result<()> {
        let (sim, device) = sim_device(SimConfig::discrete())?;
        let mut kernel = axpy(&device)?;
        let x = storage::<f32>(&device, 300)?;
        let mut y = storage::<f32>(&device, 300)?;
        let _ = kernel.run(
            [300, 1, 1],
            &[
                KernelArg::pod(&300u32),
                KernelArg::buffer(&x),
                KernelArg::pod(&1f32),
                KernelArg::buffer_mut(&mut y),
            ],
            LaunchOptions::new().with_global_offset([7, 0, 0]),
        )?;
        let pod = kernel.pod.as_ref().unwrap();
        let commands = &sim.submissions()[0].commands;
        let mut push = 7u32.to_ne_bytes().to_vec();
        push.resize(12, 0);
        assert_eq!(
            commands.as_slice(),
            [
                SimCommand::BindPipeline(kernel.pipeline),
                SimCommand::BindDescriptorSet(kernel.descriptor_set),
                SimCommand::PushConstants {
                    offset: 0,
                    data: push
                },
                SimCommand::CopyBuffer {
                    src: pod.cache.handle(),
                    dst: pod.device.handle(),
                    src_offset: 0,
                    dst_offset: 0,
                    size: 16,
                },
                SimCommand::Barrier(BufferBarrier {
                    buffer: pod.device.handle(),
                    offset: 0,
                    size: 16,
                    src_stage: vk::PipelineStageFlags::TRANSFER,
                    dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
                    src_access: vk::AccessFlags::TRANSFER_WRITE,
                    dst_access: vk::AccessFlags::UNIFORM_READ,
                }),
                SimCommand::Dispatch([2, 1, 1]),
            ]
        );
        let mut pod_bytes = 300u32.to_ne_bytes().to_vec();
        pod_bytes.extend(1f32.to_ne_bytes());
        pod_bytes.resize(16, 0);
        assert_eq!(sim.buffer_contents(pod.device.handle()).unwrap()[..16], pod_bytes);
        let bindings = sim.descriptor_bindings(kernel.descriptor_set).unwrap();
        let buffers: Vec<_> = bindings.iter().map(|x| x.unwrap().buffer).collect();
        assert_eq!(
            buffers,
            [x.as_raw().handle(), y.as_raw().handle(), pod.device.handle()]
        );
        Ok(())
    }

    #[test]
    fn argument_mismatch_does_not_record() -> Result<()> {
        let (sim, device) = sim_device(SimConfig::discrete())?;
        let mut kernel = axpy(&device)?;
        let x = storage::<f32>(&device, 8)?;
        let mut y = storage::<f32>(&device, 8)?;
        let mut empty = storage::<f32>(&device, 0)?;
        let mut uniform = device.create_buffer::<f32>(BufferKind::Uniform, MemoryUsage::DeviceOnly);
        uniform.set_size(8)?;
        sim.clear_calls();
        let result = kernel.run(
            [8, 1, 1],
            &[KernelArg::pod(&8u32), KernelArg::buffer(&x)],
            LaunchOptions::new(),
        );
        assert!(matches!(result, Err(Error::ArgumentMismatch { .. })));
        let result = kernel.run(
            [8, 1, 1],
            &[
                KernelArg::pod(&8u32),
                KernelArg::buffer(&x),
                KernelArg::pod(&1f32),
                KernelArg::Buffer(y.as_raw()),
            ],
            LaunchOptions::new(),
        );
        assert!(matches!(result, Err(Error::ArgumentMismatch { index: 3, .. })));
        let result = kernel.run(
            [8, 1, 1],
            &[
                KernelArg::pod(&8u64),
                KernelArg::buffer(&x),
                KernelArg::pod(&1f32),
                KernelArg::buffer_mut(&mut y),
            ],
            LaunchOptions::new(),
        );
        assert!(matches!(result, Err(Error::ArgumentMismatch { index: 0, .. })));
        let result = kernel.run(
            [8, 1, 1],
            &[
                KernelArg::pod(&8u32),
                KernelArg::buffer(&uniform),
                KernelArg::pod(&1f32),
                KernelArg::buffer_mut(&mut y),
            ],
            LaunchOptions::new(),
        );
        assert!(matches!(result, Err(Error::ArgumentMismatch { index: 1, .. })));
        let result = kernel.run(
            [8, 1, 1],
            &[
                KernelArg::pod(&8u32),
                KernelArg::buffer(&x),
                KernelArg::pod(&1f32),
                KernelArg::buffer_mut(&mut empty),
            ],
            LaunchOptions::new(),
        );
        assert!(matches!(result, Err(Error::ArgumentMismatch { index: 3, .. })));
        let result = kernel.run(
            [8, 1, 1],
            &[
                KernelArg::buffer(&x),
                KernelArg::buffer(&x),
                KernelArg::pod(&1f32),
                KernelArg::buffer_mut(&mut y),
            ],
            LaunchOptions::new(),
        );
        assert!(matches!(result, Err(Error::ArgumentMismatch { index: 0, .. })));
        let result = kernel.run(
            [8, 1, 1],
            &[
                KernelArg::pod(&8u32),
                KernelArg::buffer(&x),
                KernelArg::pod(&1f32),
                KernelArg::buffer_mut(&mut y),
            ],
            LaunchOptions::new().with_queue_index(9),
        );
        assert!(matches!(result, Err(Error::QueueIndexOutOfRange { .. })));
        assert!(sim.calls().is_empty());
        assert!(kernel.pod.as_ref().unwrap().dirty);
        Ok(())
    }

    #[test]
    fn buffers_from_another_device() -> Result<()> {
        let (_sim, device) = sim_device(SimConfig::discrete())?;
        let (_sim, other) = sim_device(SimConfig::discrete())?;
        let mut kernel = device.create_kernel(
            KernelDesc::new("copy", module()).with_arg(ArgDesc::buffer(BufferKind::Storage)),
        )?;
        let x = storage::<u32>(&other, 4)?;
        assert!(matches!(
            kernel.run([4, 1, 1], &[KernelArg::buffer(&x)], LaunchOptions::new()),
            Err(Error::DeviceMismatch)
        ));
        Ok(())
    }

    #[test]
    fn local_len_must_match() -> Result<()> {
        let (_sim, device) = sim_device(SimConfig::discrete())?;
        let mut kernel = device.create_kernel(
            KernelDesc::new("local", module()).with_arg(ArgDesc::local::<f32>(32)),
        )?;
        assert!(matches!(
            kernel.run([4, 1, 1], &[KernelArg::Local(16)], LaunchOptions::new()),
            Err(Error::ArgumentMismatch { index: 0, .. })
        ));
        let _ = kernel.run([4, 1, 1], &[KernelArg::Local(32)], LaunchOptions::new())?;
        Ok(())
    }

    #[test]
    fn failed_submit_uploads_next_launch() -> Result<()> {
        let (sim, device) = sim_device(SimConfig::discrete())?;
        let mut kernel = axpy(&device)?;
        let x = storage::<f32>(&device, 8)?;
        let mut y = storage::<f32>(&device, 8)?;
        let fences = device.fence_pool_status();
        sim.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
        let result = kernel.run(
            [8, 1, 1],
            &[
                KernelArg::pod(&8u32),
                KernelArg::buffer(&x),
                KernelArg::pod(&2f32),
                KernelArg::buffer_mut(&mut y),
            ],
            LaunchOptions::new().with_fence(true),
        );
        assert!(matches!(
            result,
            Err(Error::SubmissionFailed(vk::Result::ERROR_DEVICE_LOST))
        ));
        assert_eq!(device.fence_pool_status(), fences);
        let result = kernel.run(
            [8, 1, 1],
            &[
                KernelArg::pod(&8u32),
                KernelArg::buffer(&x),
                KernelArg::pod(&2f32),
                KernelArg::buffer_mut(&mut y),
            ],
            LaunchOptions::new().with_fence(true),
        )?;
        result.wait(std::time::Duration::from_secs(1))?;
        let submissions = sim.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(uploads(&submissions[0].commands), (1, 1));
        Ok(())
    }

    #[test]
    fn dispatch_too_large() -> Result<()> {
        let limits = DeviceLimits {
            max_compute_work_group_count: [4, 4, 4],
            ..DeviceLimits::default()
        };
        let (sim, device) = sim_device(SimConfig::discrete().with_limits(limits))?;
        let group_size = device.info().workgroup_size();
        let mut kernel = device.create_kernel(KernelDesc::new("big", module()))?;
        sim.clear_calls();
        let result = kernel.run([group_size * 4 + 1, 1, 1], &[], LaunchOptions::new());
        assert!(matches!(
            result,
            Err(Error::DispatchTooLarge {
                groups: [5, 1, 1],
                limit: [4, 4, 4]
            })
        ));
        assert!(sim.calls().is_empty());
        let _ = kernel.run([group_size * 4, 1, 1], &[], LaunchOptions::new())?;
        Ok(())
    }

    #[test]
    fn empty_launch_is_sync() -> Result<()> {
        let (sim, device) = sim_device(SimConfig::discrete())?;
        let mut kernel = device.create_kernel(KernelDesc::new("empty", module()).with_dims(2))?;
        let result = kernel.run([0, 5, 1], &[], LaunchOptions::new().with_fence(true))?;
        assert!(!result.is_async());
        assert!(result.fence().is_none());
        // axes past dims are ignored
        let result = kernel.run([5, 5, 0], &[], LaunchOptions::new())?;
        assert!(result.is_async());
        assert_eq!(sim.submissions().len(), 1);
        Ok(())
    }

    #[test]
    fn launches_are_labeled_with_kernel_name() -> Result<()> {
        let sim = Arc::new(SimDriver::new(SimConfig::discrete()));
        let device = Device::builder()
            .driver(sim.clone())
            .debug_labels(true)
            .build()?;
        let mut kernel = device.create_kernel(KernelDesc::new("named", module()))?;
        let _ = kernel.run([1, 1, 1], &[], LaunchOptions::new())?;
        let label = LabelInfo::new("custom");
        let _ = kernel.run([1, 1, 1], &[], LaunchOptions::new().with_label(label))?;
        let submissions = sim.submissions();
        assert_eq!(
            submissions[0].commands.first(),
            Some(&SimCommand::BeginLabel("named".into()))
        );
        assert_eq!(
            submissions[1].commands.first(),
            Some(&SimCommand::BeginLabel("custom".into()))
        );
        let queue_labels = sim
            .calls()
            .into_iter()
            .filter(|x| matches!(x, SimCall::QueueBeginLabel(..)))
            .count();
        assert_eq!(queue_labels, 2);
        Ok(())
    }

    #[test]
    fn create_failure_releases_handles() -> Result<()> {
        let (sim, device) = sim_device(SimConfig::discrete())?;
        sim.fail_next_allocation(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let result = axpy(&device);
        assert!(matches!(
            result,
            Err(Error::AllocationFailed {
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                ..
            })
        ));
        assert_eq!(sim.live_pipelines(), 0);
        assert_eq!(sim.live_command_buffers(), 0);
        assert_eq!(sim.live_buffers(), 0);
        assert!(sim.validation_errors().is_empty());
        Ok(())
    }
}
