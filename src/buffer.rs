/*!
Buffers.

A [`Buffer<T>`] is a typed, resizable array in device memory. Buffers are created
empty with [`Device::create_buffer()`](crate::device::Device::create_buffer) and
allocated with [`.set_size()`](Buffer::set_size). The [`MemoryUsage`] picks the
memory type:
- [`DeviceOnly`](MemoryUsage::DeviceOnly): device local, accessed with copies and fills.
- [`Upload`](MemoryUsage::Upload) / [`Download`](MemoryUsage::Download): host visible,
mapped persistently and accessed with [`.map_memory()`](Buffer::map_memory).

Copies and fills on device local buffers are recorded into the buffer's own
command buffer and submitted, returning an async [`LaunchResult`]. Otherwise they
are done on the host before returning.

```
# use krnl_runtime::{anyhow::Result, buffer::BufferKind, device::{Device, MemoryUsage, sim::{SimConfig, SimDriver}}, launch::LaunchOptions};
# use std::{sync::Arc, time::Duration};
# fn main() -> Result<()> {
# let device = Device::builder().driver(Arc::new(SimDriver::new(SimConfig::discrete()))).build()?;
let mut x = device.create_buffer::<u32>(BufferKind::Storage, MemoryUsage::DeviceOnly);
x.set_size(64)?;
x.fill(7, LaunchOptions::new())?.wait(Duration::from_secs(1))?;
let mut y = device.create_buffer::<u32>(BufferKind::Storage, MemoryUsage::Download);
y.set_size(64)?;
let _ = y.copy_from(&x, LaunchOptions::new())?;
assert_eq!(&*y.map_memory()?, [7; 64].as_slice());
# Ok(())
# }
```
*/

use crate::{
    device::{Allocation, CommandSlot, Device, Engine, MemoryUsage, SubmissionHistory},
    error::{Error, MappingError},
    fence::Submission,
    launch::{LaunchOptions, LaunchResult},
    result::Result,
    scope::{CommandRegion, DebugLabel},
};
use ash::vk;
use bytemuck::Pod;
use parking_lot::Mutex;
use std::{
    fmt::{self, Debug},
    marker::PhantomData,
    mem::size_of,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    sync::Arc,
};

/// How a buffer is bound to kernels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Storage buffer, read or written by kernels.
    Storage,
    /// Uniform buffer, read only.
    Uniform,
}

impl BufferKind {
    fn usage(&self) -> vk::BufferUsageFlags {
        let transfer = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        match self {
            Self::Storage => transfer | vk::BufferUsageFlags::STORAGE_BUFFER,
            Self::Uniform => transfer | vk::BufferUsageFlags::UNIFORM_BUFFER,
        }
    }
    pub(crate) fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::Storage => vk::DescriptorType::STORAGE_BUFFER,
            Self::Uniform => vk::DescriptorType::UNIFORM_BUFFER,
        }
    }
}

/** A buffer bound to device memory.

Host visible memory is mapped for the lifetime of the allocation. Dropping waits
for submissions that used the buffer, then frees it. */
pub(crate) struct BufferAlloc {
    engine: Arc<Engine>,
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
    mapped: Option<NonNull<u8>>,
    history: SubmissionHistory,
}

// # Safety
// The mapping is only dereferenced through the owning buffer, which requires
// &mut for host writes.
unsafe impl Send for BufferAlloc {}
unsafe impl Sync for BufferAlloc {}

impl BufferAlloc {
    pub(crate) fn new(
        engine: Arc<Engine>,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory_usage: MemoryUsage,
    ) -> Result<Self> {
        let driver = engine.driver();
        let (buffer, requirements) = driver
            .create_buffer(size, usage)
            .map_err(|result| Error::allocation("buffer", size, result))?;
        let allocation = match engine.allocate_memory(&requirements, memory_usage) {
            Ok(allocation) => allocation,
            Err(e) => {
                driver.destroy_buffer(buffer);
                return Err(e);
            }
        };
        let mut this = Self {
            engine: engine.clone(),
            buffer,
            allocation,
            size,
            mapped: None,
            history: SubmissionHistory::default(),
        };
        driver
            .bind_buffer_memory(buffer, this.allocation.memory)
            .map_err(|result| Error::allocation("memory", size, result))?;
        if this.allocation.is_host_visible() {
            let mapped = driver
                .map_memory(this.allocation.memory, this.allocation.size)
                .map_err(|result| Error::MappingFailed(MappingError::Driver(result)))?;
            this.mapped.replace(mapped);
        }
        Ok(this)
    }
    pub(crate) fn handle(&self) -> vk::Buffer {
        self.buffer
    }
    pub(crate) fn size(&self) -> u64 {
        self.size
    }
    pub(crate) fn is_device_local(&self) -> bool {
        self.allocation.is_device_local()
    }
    pub(crate) fn memory_type(&self) -> u32 {
        self.allocation.type_index
    }
    pub(crate) fn note(&self, submission: Submission) {
        self.history.note(submission);
    }
    /// Waits for submissions that used the buffer.
    pub(crate) fn wait(&self) -> Result<()> {
        self.history.wait(&self.engine)
    }
    fn mapped(&self) -> Result<NonNull<u8>, MappingError> {
        self.mapped.ok_or(MappingError::NotHostVisible)
    }
    /// Makes device writes visible to the host.
    fn invalidate(&self) -> Result<(), MappingError> {
        if self.allocation.is_host_coherent() {
            return Ok(());
        }
        self.engine
            .driver()
            .invalidate_memory(self.allocation.memory, 0, vk::WHOLE_SIZE)
            .map_err(MappingError::Driver)
    }
    /// Makes host writes visible to the device.
    fn flush(&self) -> Result<(), MappingError> {
        if self.allocation.is_host_coherent() {
            return Ok(());
        }
        self.engine
            .driver()
            .flush_memory(self.allocation.memory, 0, vk::WHOLE_SIZE)
            .map_err(MappingError::Driver)
    }
    /** Host bytes `offset..offset + len`.

    # Safety
    The range must be in bounds and not be written while borrowed. */
    unsafe fn host_bytes(&self, offset: u64, len: u64) -> Result<&[u8], MappingError> {
        let ptr = self.mapped()?;
        Ok(unsafe { std::slice::from_raw_parts(ptr.as_ptr().add(offset as usize), len as usize) })
    }
    /** Mutable host bytes `offset..offset + len`.

    # Safety
    The range must be in bounds and not be aliased while borrowed. */
    #[allow(clippy::mut_from_ref)]
    unsafe fn host_bytes_mut(&self, offset: u64, len: u64) -> Result<&mut [u8], MappingError> {
        let ptr = self.mapped()?;
        Ok(unsafe {
            std::slice::from_raw_parts_mut(ptr.as_ptr().add(offset as usize), len as usize)
        })
    }
    /// Writes `pattern` repeatedly over `offset..offset + len` on the host.
    pub(crate) fn write_pattern(&mut self, offset: u64, len: u64, pattern: &[u8]) -> Result<()> {
        debug_assert!(offset + len <= self.size);
        // # Safety
        // In bounds, &mut self excludes other host access.
        let bytes = unsafe { self.host_bytes_mut(offset, len) }.map_err(Error::MappingFailed)?;
        for chunk in bytes.chunks_mut(pattern.len()) {
            chunk.copy_from_slice(&pattern[..chunk.len()]);
        }
        self.flush().map_err(Error::MappingFailed)
    }
    /** Overwrites the fields of `data` that differ from the host copy.

    Returns true if anything changed. */
    pub(crate) fn update_fields(&mut self, fields: &[(u64, &[u8])]) -> Result<bool> {
        let mut changed = false;
        for (offset, data) in fields.iter().copied() {
            debug_assert!(offset + data.len() as u64 <= self.size);
            // # Safety
            // In bounds, &mut self excludes other host access.
            let bytes = unsafe { self.host_bytes_mut(offset, data.len() as u64) }
                .map_err(Error::MappingFailed)?;
            if bytes != data {
                bytes.copy_from_slice(data);
                changed = true;
            }
        }
        if changed {
            self.flush().map_err(Error::MappingFailed)?;
        }
        Ok(changed)
    }
}

impl Debug for BufferAlloc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BufferAlloc")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("memory_type", &self.allocation.type_index)
            .finish()
    }
}

impl Drop for BufferAlloc {
    fn drop(&mut self) {
        if let Err(e) = self.wait() {
            tracing::warn!("{e}");
        }
        let driver = self.engine.driver();
        if self.mapped.take().is_some() {
            driver.unmap_memory(self.allocation.memory);
        }
        driver.destroy_buffer(self.buffer);
        self.engine.free_memory(&self.allocation);
    }
}

/// A packed fill word, if `pattern` repeats every 4 bytes.
fn fill_word(pattern: &[u8]) -> Option<u32> {
    let word = match *pattern {
        [a] => [a; 4],
        [a, b] => [a, b, a, b],
        _ if !pattern.is_empty() && pattern.len() % 4 == 0 => {
            let first = &pattern[..4];
            if !pattern.chunks_exact(4).all(|x| x == first) {
                return None;
            }
            [first[0], first[1], first[2], first[3]]
        }
        _ => return None,
    };
    Some(u32::from_ne_bytes(word))
}

/** An untyped buffer.

See [`Buffer`]. */
pub struct RawBuffer {
    engine: Arc<Engine>,
    kind: BufferKind,
    usage: MemoryUsage,
    stride: usize,
    len: usize,
    alloc: Option<BufferAlloc>,
    // Present iff the allocation is device local.
    slot: Option<Mutex<CommandSlot>>,
    staging: Option<BufferAlloc>,
}

impl RawBuffer {
    fn new(engine: Arc<Engine>, kind: BufferKind, usage: MemoryUsage, stride: usize) -> Self {
        Self {
            engine,
            kind,
            usage,
            stride,
            len: 0,
            alloc: None,
            slot: None,
            staging: None,
        }
    }
    /// The device.
    pub fn device(&self) -> Device {
        Device::from_engine(self.engine.clone())
    }
    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }
    /// Whether the buffer has no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// Size of an element in bytes.
    pub fn stride(&self) -> usize {
        self.stride
    }
    /// Size in bytes.
    pub fn byte_len(&self) -> u64 {
        self.alloc.as_ref().map_or(0, BufferAlloc::size)
    }
    /// The buffer kind.
    pub fn kind(&self) -> BufferKind {
        self.kind
    }
    /// The requested memory usage.
    pub fn memory_usage(&self) -> MemoryUsage {
        self.usage
    }
    /// Index of the memory type, None if not allocated.
    pub fn memory_type(&self) -> Option<u32> {
        self.alloc.as_ref().map(BufferAlloc::memory_type)
    }
    /// Whether the memory is device local.
    pub fn is_device_local(&self) -> bool {
        self.alloc.as_ref().map_or(false, BufferAlloc::is_device_local)
    }
    /// Whether the memory can be mapped.
    pub fn is_host_visible(&self) -> bool {
        self.alloc.as_ref().map_or(false, |x| x.mapped.is_some())
    }
    /// The driver handle, null if not allocated.
    pub fn handle(&self) -> vk::Buffer {
        self.alloc
            .as_ref()
            .map_or(vk::Buffer::null(), BufferAlloc::handle)
    }
    pub(crate) fn alloc(&self) -> Option<&BufferAlloc> {
        self.alloc.as_ref()
    }
    /** Resizes to `len` elements.

    Does nothing if the length is unchanged. Otherwise the previous allocation is
    released first (after submissions using it have finished) and the contents
    are not preserved. Device local allocations get a command buffer, which is
    released when the buffer is resized to zero or is no longer device local.

    **errors**
    - [`AllocationFailed`](Error::AllocationFailed), the buffer is left empty.
    - [`MappingFailed`](Error::MappingFailed) if host visible memory could not be mapped. */
    pub fn set_size(&mut self, len: usize) -> Result<()> {
        if len == self.len {
            return Ok(());
        }
        let bytes = (len as u64)
            .checked_mul(self.stride as u64)
            .ok_or(Error::InvalidRange {
                offset: 0,
                size: u64::MAX,
                len: 0,
                stride: self.stride,
            })?;
        self.staging = None;
        self.alloc = None;
        self.len = 0;
        if bytes == 0 {
            self.slot = None;
            self.len = len;
            return Ok(());
        }
        let alloc = match BufferAlloc::new(self.engine.clone(), bytes, self.kind.usage(), self.usage)
        {
            Ok(alloc) => alloc,
            Err(e) => {
                self.slot = None;
                return Err(e);
            }
        };
        if alloc.is_device_local() {
            if self.slot.is_none() {
                let slot = CommandSlot::new(self.engine.clone())?;
                self.slot.replace(Mutex::new(slot));
            }
        } else {
            self.slot = None;
        }
        tracing::debug!("allocated {alloc:?} for {len} elements");
        self.alloc.replace(alloc);
        self.len = len;
        Ok(())
    }
    fn check_range(&self, offset: u64, size: u64) -> Result<()> {
        let len = self.byte_len();
        let stride = self.stride as u64;
        let aligned = stride == 0 || (offset % stride == 0 && size % stride == 0);
        let in_bounds = offset.checked_add(size).map_or(false, |end| end <= len);
        if aligned && in_bounds {
            Ok(())
        } else {
            Err(Error::InvalidRange {
                offset,
                size,
                len,
                stride: self.stride,
            })
        }
    }
    fn allocated(&self, offset: u64, size: u64) -> Result<&BufferAlloc> {
        self.alloc.as_ref().ok_or(Error::InvalidRange {
            offset,
            size,
            len: 0,
            stride: self.stride,
        })
    }
    /** Copies bytes from `src`.

    See [`Buffer::copy_from()`]. */
    pub fn copy_from(&mut self, src: &RawBuffer, options: LaunchOptions) -> Result<LaunchResult> {
        if !Arc::ptr_eq(&self.engine, &src.engine) {
            return Err(Error::DeviceMismatch);
        }
        let LaunchOptions {
            src_offset,
            dst_offset,
            ..
        } = options;
        let size = options.size.unwrap_or_else(|| {
            let src_len = src.byte_len().saturating_sub(src_offset);
            let dst_len = self.byte_len().saturating_sub(dst_offset);
            src_len.min(dst_len)
        });
        src.check_range(src_offset, size)?;
        self.check_range(dst_offset, size)?;
        if size == 0 {
            return Ok(LaunchResult::sync());
        }
        let src_alloc = src.allocated(src_offset, size)?;
        let dst_alloc = self.allocated(dst_offset, size)?;
        if !dst_alloc.is_device_local() && !src_alloc.is_device_local() {
            src_alloc.wait()?;
            dst_alloc.wait()?;
            src_alloc.invalidate().map_err(Error::MappingFailed)?;
            // # Safety
            // Ranges are checked, src and dst are different allocations.
            unsafe {
                let src_bytes = src_alloc
                    .host_bytes(src_offset, size)
                    .map_err(Error::MappingFailed)?;
                dst_alloc
                    .host_bytes_mut(dst_offset, size)
                    .map_err(Error::MappingFailed)?
                    .copy_from_slice(src_bytes);
            }
            dst_alloc.flush().map_err(Error::MappingFailed)?;
            tracing::trace!("copied {size} bytes on the host");
            return Ok(LaunchResult::sync());
        }
        self.engine.check_queue(options.queue_index)?;
        let slot = if dst_alloc.is_device_local() {
            self.slot.as_ref()
        } else {
            src.slot.as_ref()
        };
        let mut slot = slot
            .ok_or_else(|| Error::allocation("command buffer", 0, vk::Result::ERROR_UNKNOWN))?
            .lock();
        let command_buffer = slot.prepare(options.external_sync)?;
        let driver = self.engine.driver();
        let recording_failed = |result| Error::LaunchFailed {
            kernel: "copy".into(),
            result,
        };
        {
            let mut region = CommandRegion::begin(
                driver,
                command_buffer,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )
            .map_err(recording_failed)?;
            let label = options.label.as_ref().map(|label| {
                DebugLabel::begin(driver, self.engine.command_label(command_buffer), label)
            });
            driver.cmd_copy_buffer(
                command_buffer,
                src_alloc.handle(),
                dst_alloc.handle(),
                vk::BufferCopy {
                    src_offset,
                    dst_offset,
                    size,
                },
            );
            drop(label);
            region.end().map_err(recording_failed)?;
        }
        let (submission, fence) = self.engine.submit(
            options.queue_index,
            command_buffer,
            options.fence,
            options.label.as_ref(),
        )?;
        slot.submitted(submission);
        src_alloc.note(submission);
        dst_alloc.note(submission);
        Ok(LaunchResult::submitted(fence))
    }
    /** Fills elements with `pattern`, the bytes of one element.

    See [`Buffer::fill()`].

    **errors**
    - [`UnsupportedFillAlignment`](Error::UnsupportedFillAlignment) if `pattern`
    is empty or its length is not the element size. */
    pub fn fill_pattern(&mut self, pattern: &[u8], options: LaunchOptions) -> Result<LaunchResult> {
        let offset = options.dst_offset;
        let size = options
            .size
            .unwrap_or_else(|| self.byte_len().saturating_sub(offset));
        if pattern.is_empty() || pattern.len() != self.stride {
            return Err(Error::UnsupportedFillAlignment {
                elem_size: pattern.len(),
                offset,
                size,
            });
        }
        self.check_range(offset, size)?;
        if size == 0 {
            return Ok(LaunchResult::sync());
        }
        let device_local = self.allocated(offset, size)?.is_device_local();
        if !device_local {
            if let Some(alloc) = self.alloc.as_mut() {
                alloc.wait()?;
                alloc.write_pattern(offset, size, pattern)?;
            }
            tracing::trace!("filled {size} bytes on the host");
            return Ok(LaunchResult::sync());
        }
        self.engine.check_queue(options.queue_index)?;
        let plan = FillPlan::new(pattern, self.stride as u64, offset, size);
        let staged = plan.staging_size();
        if staged > 0 {
            if self.staging.as_ref().map_or(true, |x| x.size() < staged) {
                self.staging = None;
                let staging = BufferAlloc::new(
                    self.engine.clone(),
                    staged,
                    vk::BufferUsageFlags::TRANSFER_SRC,
                    MemoryUsage::Upload,
                )?;
                tracing::debug!("allocated staging {staging:?}");
                self.staging.replace(staging);
            }
            if let Some(staging) = self.staging.as_mut() {
                if !options.external_sync {
                    staging.wait()?;
                }
                match plan {
                    FillPlan::Word { head, tail, .. } => {
                        if head > 0 {
                            staging.write_pattern(0, head, pattern)?;
                        }
                        if tail > 0 {
                            staging.write_pattern(FILL_TAIL_OFFSET, tail, pattern)?;
                        }
                    }
                    FillPlan::Blocks { block } => staging.write_pattern(0, block, pattern)?,
                }
            }
        }
        let alloc = self.allocated(offset, size)?;
        let staging = self.staging.as_ref().filter(|_| staged > 0);
        let mut slot = self
            .slot
            .as_ref()
            .ok_or_else(|| Error::allocation("command buffer", 0, vk::Result::ERROR_UNKNOWN))?
            .lock();
        let command_buffer = slot.prepare(options.external_sync)?;
        let driver = self.engine.driver();
        let recording_failed = |result| Error::LaunchFailed {
            kernel: "fill".into(),
            result,
        };
        {
            let mut region = CommandRegion::begin(
                driver,
                command_buffer,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )
            .map_err(recording_failed)?;
            let label = options.label.as_ref().map(|label| {
                DebugLabel::begin(driver, self.engine.command_label(command_buffer), label)
            });
            let dst = alloc.handle();
            let copy = |src_offset, dst_offset, size| {
                if let Some(staging) = staging {
                    driver.cmd_copy_buffer(
                        command_buffer,
                        staging.handle(),
                        dst,
                        vk::BufferCopy {
                            src_offset,
                            dst_offset,
                            size,
                        },
                    );
                }
            };
            match plan {
                FillPlan::Word { word, head, tail } => {
                    let body_offset = offset + head;
                    let body_size = size - head - tail;
                    tracing::trace!(
                        "fill {body_size} bytes with {word:#x}, staged {head} head and {tail} tail bytes"
                    );
                    if head > 0 {
                        copy(0, offset, head);
                    }
                    if body_size > 0 {
                        driver.cmd_fill_buffer(command_buffer, dst, body_offset, body_size, word);
                    }
                    if tail > 0 {
                        copy(FILL_TAIL_OFFSET, body_offset + body_size, tail);
                    }
                }
                FillPlan::Blocks { block } => {
                    tracing::trace!("staged fill of {size} bytes at {offset} in blocks of {block}");
                    let end = offset + size;
                    let mut dst_offset = offset;
                    while dst_offset < end {
                        let len = block.min(end - dst_offset);
                        copy(0, dst_offset, len);
                        dst_offset += len;
                    }
                }
            }
            drop(label);
            region.end().map_err(recording_failed)?;
        }
        let (submission, fence) = self.engine.submit(
            options.queue_index,
            command_buffer,
            options.fence,
            options.label.as_ref(),
        )?;
        slot.submitted(submission);
        alloc.note(submission);
        if let Some(staging) = staging {
            staging.note(submission);
        }
        Ok(LaunchResult::submitted(fence))
    }
}

// Bytes staged for one block of a fill that can't use a fill word.
const FILL_BLOCK_SIZE: u64 = 1 << 16;
// Staging offset of the unaligned tail of a word fill.
const FILL_TAIL_OFFSET: u64 = 4;

/// How a device local fill is recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FillPlan {
    /// `vkCmdFillBuffer` over the 4 byte aligned body, the unaligned head and
    /// tail (each under 4 bytes) are copied from staging.
    Word { word: u32, head: u64, tail: u64 },
    /// One staged block of whole elements, copied repeatedly.
    Blocks { block: u64 },
}

impl FillPlan {
    fn new(pattern: &[u8], stride: u64, offset: u64, size: u64) -> Self {
        let end = offset + size;
        if let Some(word) = fill_word(pattern) {
            let body_start = ((offset + 3) / 4 * 4).min(end);
            let body_end = (end / 4 * 4).max(body_start);
            Self::Word {
                word,
                head: body_start - offset,
                tail: end - body_end,
            }
        } else {
            let block = (FILL_BLOCK_SIZE / stride).max(1) * stride;
            Self::Blocks {
                block: block.min(size),
            }
        }
    }
    fn staging_size(&self) -> u64 {
        match *self {
            Self::Word { head: 0, tail: 0, .. } => 0,
            Self::Word { tail: 0, head, .. } => head,
            Self::Word { tail, .. } => FILL_TAIL_OFFSET + tail,
            Self::Blocks { block } => block,
        }
    }
}

impl Debug for RawBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RawBuffer")
            .field("device", &self.engine.id())
            .field("kind", &self.kind)
            .field("usage", &self.usage)
            .field("len", &self.len)
            .field("alloc", &self.alloc)
            .finish()
    }
}

/// A typed buffer.
pub struct Buffer<T> {
    raw: RawBuffer,
    _m: PhantomData<T>,
}

impl<T: Pod> Buffer<T> {
    pub(crate) fn new(engine: Arc<Engine>, kind: BufferKind, usage: MemoryUsage) -> Self {
        Self {
            raw: RawBuffer::new(engine, kind, usage, size_of::<T>()),
            _m: PhantomData,
        }
    }
    /// The untyped buffer.
    pub fn as_raw(&self) -> &RawBuffer {
        &self.raw
    }
    /// The untyped buffer.
    pub fn as_raw_mut(&mut self) -> &mut RawBuffer {
        &mut self.raw
    }
    /// The device.
    pub fn device(&self) -> Device {
        self.raw.device()
    }
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.raw.len()
    }
    /// Whether the buffer has no elements.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
    /// The buffer kind.
    pub fn kind(&self) -> BufferKind {
        self.raw.kind()
    }
    /// Whether the memory is device local.
    pub fn is_device_local(&self) -> bool {
        self.raw.is_device_local()
    }
    /// Whether the memory can be mapped.
    pub fn is_host_visible(&self) -> bool {
        self.raw.is_host_visible()
    }
    /// See [`RawBuffer::set_size()`].
    pub fn set_size(&mut self, len: usize) -> Result<()> {
        self.raw.set_size(len)
    }
    /** Maps the memory for host access.

    Waits for submissions that used the buffer. Memory that is not host coherent
    is invalidated on map and flushed when the map is dropped.

    **errors**
    - [`MappingFailed`](Error::MappingFailed) if the buffer is empty, not host
    visible, or the driver failed. */
    pub fn map_memory(&mut self) -> Result<BufferMap<T>> {
        let len = self.raw.len;
        let alloc = self
            .raw
            .alloc
            .as_ref()
            .ok_or(Error::MappingFailed(MappingError::Empty))?;
        let data = alloc.mapped().map_err(Error::MappingFailed)?;
        alloc.wait()?;
        alloc.invalidate().map_err(Error::MappingFailed)?;
        debug_assert_eq!(data.as_ptr() as usize % std::mem::align_of::<T>(), 0);
        Ok(BufferMap {
            alloc,
            data: data.cast(),
            len,
            _m: PhantomData,
        })
    }
    /** Copies from `src`.

    Copies `options.size` bytes (by default as many as fit) from
    `options.src_offset` in `src` to `options.dst_offset`. Offsets and size must
    be multiples of the element size.

    If either buffer is device local the copy is recorded into the command
    buffer of the destination if it is device local, else the source's, and
    submitted to `options.queue_index`. Otherwise the copy is done on the host
    and no command buffer or fence is used.

    **errors**
    - [`DeviceMismatch`](Error::DeviceMismatch)
    - [`InvalidRange`](Error::InvalidRange)
    - [`QueueIndexOutOfRange`](Error::QueueIndexOutOfRange)
    - [`LaunchFailed`](Error::LaunchFailed) if recording failed.
    - [`SubmissionFailed`](Error::SubmissionFailed) */
    pub fn copy_from(&mut self, src: &Buffer<T>, options: LaunchOptions) -> Result<LaunchResult> {
        self.raw.copy_from(&src.raw, options)
    }
    /** Fills with `value`.

    Fills `options.size` bytes (by default the rest of the buffer) from
    `options.dst_offset`. Offset and size must be multiples of the element size.

    Device local buffers are filled with `vkCmdFillBuffer` when `value` is a
    repeating 4 byte word (1, 2 or 4 byte elements, or larger ones made of one
    repeated word). Bytes before and after the 4 byte aligned part of the range
    are copied from a small staging buffer. Other values are written to one
    staging block of at most 64 KiB, which is copied over the range. Host visible
    buffers that are not device local are filled on the host.

    **errors**
    - [`UnsupportedFillAlignment`](Error::UnsupportedFillAlignment) if `T` is zero sized.
    - See [`.copy_from()`](Buffer::copy_from). */
    pub fn fill(&mut self, value: T, options: LaunchOptions) -> Result<LaunchResult> {
        self.raw
            .fill_pattern(bytemuck::bytes_of(&value), options)
    }
}

impl<T> Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("elem", &std::any::type_name::<T>())
            .field("raw", &self.raw)
            .finish()
    }
}

/// Host access to a mapped buffer, see [`Buffer::map_memory()`].
pub struct BufferMap<'a, T> {
    alloc: &'a BufferAlloc,
    data: NonNull<T>,
    len: usize,
    _m: PhantomData<&'a mut [T]>,
}

impl<T> Deref for BufferMap<'_, T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        // # Safety
        // The mapping holds len elements and is borrowed mutably from the buffer.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for BufferMap<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // # Safety
        // See deref.
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }
}

impl<T> Drop for BufferMap<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.alloc.flush() {
            tracing::warn!("failed to flush mapped memory: {e}");
        }
    }
}
