use super::{
    driver::{Driver, LabelInfo, MemoryRequirements},
    memory::{find_memory_type, HeapUsage, MemoryUsage},
    DeviceId, DeviceInfo, DeviceOptions,
};
use crate::{
    error::Error,
    fence::{Fence, FencePool, Submission},
    result::Result,
    scope::{DebugLabel, LabelTarget},
    workgroup::WorkgroupSizer,
};
use ash::vk::{self, Handle};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Capacity and availability of the fence pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FencePoolStatus {
    pub capacity: usize,
    pub available: usize,
}

pub(crate) struct QueueState {
    handle: vk::Queue,
    // Held while submitting or waiting, queues are externally synchronized.
    lock: Mutex<()>,
    submitted: AtomicU64,
    completed: AtomicU64,
}

impl QueueState {
    fn new(handle: vk::Queue) -> Self {
        Self {
            handle,
            lock: Mutex::default(),
            submitted: AtomicU64::default(),
            completed: AtomicU64::default(),
        }
    }
}

/// A memory allocation, freed with [`Engine::free_memory()`].
#[derive(Debug)]
pub(crate) struct Allocation {
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) size: u64,
    pub(crate) type_index: u32,
    pub(crate) heap_index: u32,
    pub(crate) flags: vk::MemoryPropertyFlags,
}

impl Allocation {
    pub(crate) fn is_device_local(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
    }
    pub(crate) fn is_host_visible(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }
    pub(crate) fn is_host_coherent(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

/// The device resource owner.
pub(crate) struct Engine {
    driver: Arc<dyn Driver>,
    info: Arc<DeviceInfo>,
    options: DeviceOptions,
    command_pool: Mutex<vk::CommandPool>,
    queues: Vec<QueueState>,
    fences: Mutex<FencePool>,
    // Dropped fences whose submission had not finished.
    retired_fences: Mutex<Vec<(vk::Fence, Submission)>>,
    heaps: Mutex<Vec<HeapUsage>>,
    modules: DashMap<String, vk::ShaderModule>,
    sizer: WorkgroupSizer,
    debug_labels: bool,
}

impl Engine {
    pub(crate) fn new(driver: Arc<dyn Driver>, options: DeviceOptions) -> Result<Arc<Self>> {
        let limits = driver.limits();
        let group_size = options.workgroup_size.unwrap_or_else(|| {
            WorkgroupSizer::default_group_size(limits.max_compute_work_group_invocations)
        });
        if group_size > limits.max_compute_work_group_invocations {
            return Err(Error::InvalidWorkgroupSize(group_size));
        }
        let sizer = WorkgroupSizer::new(group_size)?;
        let queues: Vec<_> = driver.queues().iter().copied().map(QueueState::new).collect();
        if queues.is_empty() {
            return Err(Error::QueueIndexOutOfRange {
                index: 0,
                queues: 0,
            });
        }
        let debug_labels = options.debug_labels && driver.supports_debug_labels();
        let info = Arc::new(DeviceInfo {
            index: options.index,
            name: driver.name().to_string(),
            queues: queues.len(),
            memory_types: (0..driver.memory_type_count())
                .filter_map(|i| driver.memory_type(i))
                .collect(),
            limits,
            workgroup_size: group_size,
            debug_labels,
        });
        let command_pool = driver
            .create_command_pool(driver.queue_family_index())
            .map_err(|result| Error::allocation("command pool", 0, result))?;
        let heaps = vec![HeapUsage::default(); driver.memory_heap_count() as usize];
        let fences = FencePool::new(driver.clone());
        let engine = Arc::new(Self {
            driver,
            info,
            command_pool: Mutex::new(command_pool),
            queues,
            fences: Mutex::new(fences),
            retired_fences: Mutex::default(),
            heaps: Mutex::new(heaps),
            modules: DashMap::default(),
            sizer,
            debug_labels,
            options,
        });
        engine.fences.lock().resize(engine.options.fence_pool_size)?;
        tracing::debug!(
            "created {:?} {:?} with {} queues and group size {group_size}",
            engine.id(),
            engine.info.name,
            engine.queues.len(),
        );
        Ok(engine)
    }
    pub(crate) fn id(&self) -> DeviceId {
        DeviceId {
            index: self.info.index,
            handle: self as *const Self as usize,
        }
    }
    pub(crate) fn driver(&self) -> &dyn Driver {
        &*self.driver
    }
    pub(crate) fn info(&self) -> &Arc<DeviceInfo> {
        &self.info
    }
    pub(crate) fn options(&self) -> &DeviceOptions {
        &self.options
    }
    pub(crate) fn sizer(&self) -> &WorkgroupSizer {
        &self.sizer
    }
    pub(crate) fn debug_labels(&self) -> bool {
        self.debug_labels
    }
    pub(crate) fn check_queue(&self, index: usize) -> Result<()> {
        if index < self.queues.len() {
            Ok(())
        } else {
            Err(Error::QueueIndexOutOfRange {
                index,
                queues: self.queues.len(),
            })
        }
    }
    fn queue(&self, index: usize) -> Result<&QueueState> {
        self.check_queue(index)?;
        Ok(&self.queues[index])
    }
    /// Label target for `command_buffer`, None when labels are disabled.
    pub(crate) fn command_label(&self, command_buffer: vk::CommandBuffer) -> Option<LabelTarget> {
        self.debug_labels
            .then_some(LabelTarget::CommandBuffer(command_buffer))
    }

    // fences
    pub(crate) fn take_fence(self: &Arc<Self>) -> Result<Fence> {
        self.reclaim_fences();
        let mut pool = self.fences.lock();
        let handle = match pool.take() {
            Err(Error::ResourceExhausted { capacity }) if self.options.fence_pool_growth > 0 => {
                let len = capacity + self.options.fence_pool_growth;
                tracing::debug!("fence pool exhausted, growing to {len}");
                pool.resize(len)?;
                pool.take()?
            }
            result => result?,
        };
        Ok(Fence::new(handle, self))
    }
    /** Returns `fence` to the pool if `submission` has finished.

    Otherwise the fence is retired until a later wait or take observes it
    signaled. */
    pub(crate) fn release_fence(&self, fence: vk::Fence, submission: Option<Submission>) {
        if let Some(submission) = submission {
            if !self.fence_finished(fence, submission) {
                tracing::trace!("retiring pending {fence:?} of {submission:?}");
                self.retired_fences.lock().push((fence, submission));
                return;
            }
        }
        if let Err(e) = self.fences.lock().release(fence) {
            tracing::warn!("{e}");
        }
    }
    fn fence_finished(&self, fence: vk::Fence, submission: Submission) -> bool {
        if self.is_complete(submission) {
            return true;
        }
        match self.driver.fence_status(fence) {
            Ok(signaled) => {
                if signaled {
                    self.complete(submission);
                }
                signaled
            }
            Err(result) => {
                tracing::warn!("failed to query {fence:?}: {result}");
                false
            }
        }
    }
    /// Moves retired fences that have finished back into the pool.
    fn reclaim_fences(&self) {
        let finished: Vec<_> = {
            let mut retired = self.retired_fences.lock();
            if retired.is_empty() {
                return;
            }
            let mut finished = Vec::new();
            retired.retain(|&(fence, submission)| {
                let done = self.fence_finished(fence, submission);
                if done {
                    finished.push(fence);
                }
                !done
            });
            finished
        };
        if finished.is_empty() {
            return;
        }
        tracing::trace!("reclaimed {} retired fences", finished.len());
        let mut pool = self.fences.lock();
        for fence in finished {
            if let Err(e) = pool.release(fence) {
                tracing::warn!("{e}");
            }
        }
    }
    pub(crate) fn fence_pool_status(&self) -> FencePoolStatus {
        let pool = self.fences.lock();
        FencePoolStatus {
            capacity: pool.capacity(),
            available: pool.available(),
        }
    }
    pub(crate) fn resize_fence_pool(&self, len: usize) -> Result<()> {
        self.fences.lock().resize(len)
    }

    // submissions
    /// Records that `submission` has finished.
    pub(crate) fn complete(&self, submission: Submission) {
        if let Some(queue) = self.queues.get(submission.queue) {
            queue
                .completed
                .fetch_max(submission.epoch, Ordering::SeqCst);
        }
    }
    pub(crate) fn is_complete(&self, submission: Submission) -> bool {
        self.queues
            .get(submission.queue)
            .map_or(true, |x| x.completed.load(Ordering::SeqCst) >= submission.epoch)
    }
    /// Blocks until `submission` has finished, waiting for its queue if necessary.
    pub(crate) fn wait_submission(&self, submission: Submission) -> Result<()> {
        if self.is_complete(submission) {
            return Ok(());
        }
        tracing::trace!("waiting for {submission:?}");
        self.wait_queue(submission.queue)
    }
    /** Submits `command_buffer` to queue `queue_index`.

    If `fence` is true, a fence is taken from the pool before submitting. With
    debug labels enabled and a `label`, the submission is wrapped in a queue
    label. */
    pub(crate) fn submit(
        self: &Arc<Self>,
        queue_index: usize,
        command_buffer: vk::CommandBuffer,
        fence: bool,
        label: Option<&LabelInfo>,
    ) -> Result<(Submission, Option<Fence>)> {
        let queue = self.queue(queue_index)?;
        let mut fence = if fence {
            Some(self.take_fence()?)
        } else {
            None
        };
        let fence_handle = fence.as_ref().map_or(vk::Fence::null(), Fence::handle);
        let _guard = queue.lock.lock();
        let queue_label = label.filter(|_| self.debug_labels).map(|label| {
            DebugLabel::begin(self.driver(), Some(LabelTarget::Queue(queue.handle)), label)
        });
        let result = self
            .driver
            .queue_submit(queue.handle, command_buffer, fence_handle);
        drop(queue_label);
        result.map_err(Error::SubmissionFailed)?;
        let epoch = queue.submitted.fetch_add(1, Ordering::SeqCst) + 1;
        let submission = Submission {
            queue: queue_index,
            epoch,
        };
        if let Some(fence) = fence.as_mut() {
            fence.activate(submission);
        }
        tracing::trace!("submitted {command_buffer:?} as {submission:?}");
        Ok((submission, fence))
    }
    fn lock_queue<'a>(&self, queue: &'a QueueState) -> (MutexGuard<'a, ()>, u64) {
        let guard = queue.lock.lock();
        let submitted = queue.submitted.load(Ordering::SeqCst);
        (guard, submitted)
    }
    /// Blocks until queue `index` is idle.
    pub(crate) fn wait_queue(&self, index: usize) -> Result<()> {
        let queue = self.queue(index)?;
        {
            let (_guard, submitted) = self.lock_queue(queue);
            self.driver
                .queue_wait_idle(queue.handle)
                .map_err(Error::WaitFailed)?;
            queue.completed.fetch_max(submitted, Ordering::SeqCst);
        }
        self.reclaim_fences();
        Ok(())
    }
    /// Blocks until the device is idle.
    pub(crate) fn wait(&self) -> Result<()> {
        let locked: Vec<_> = self.queues.iter().map(|x| self.lock_queue(x)).collect();
        self.driver.device_wait_idle().map_err(Error::WaitFailed)?;
        for (queue, (_guard, submitted)) in self.queues.iter().zip(locked) {
            queue.completed.fetch_max(submitted, Ordering::SeqCst);
        }
        self.reclaim_fences();
        Ok(())
    }

    // command buffers
    pub(crate) fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer> {
        let pool = self.command_pool.lock();
        self.driver
            .allocate_command_buffer(*pool)
            .map_err(|result| Error::allocation("command buffer", 0, result))
    }
    pub(crate) fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        let pool = self.command_pool.lock();
        self.driver.free_command_buffer(*pool, command_buffer);
    }

    // memory
    /// Allocates memory of a type compatible with `requirements` for `usage`.
    pub(crate) fn allocate_memory(
        &self,
        requirements: &MemoryRequirements,
        usage: MemoryUsage,
    ) -> Result<Allocation> {
        let (type_index, memory_type) =
            find_memory_type(self.driver(), requirements.memory_type_bits, usage).ok_or(
                Error::allocation(
                    "memory",
                    requirements.size,
                    vk::Result::ERROR_FEATURE_NOT_PRESENT,
                ),
            )?;
        let memory = self
            .driver
            .allocate_memory(requirements.size, type_index)
            .map_err(|result| Error::allocation("memory", requirements.size, result))?;
        if let Some(heap) = self.heaps.lock().get_mut(memory_type.heap_index as usize) {
            heap.add(requirements.size);
        }
        tracing::debug!(
            "allocated {} bytes of memory type {type_index} for {usage:?}",
            requirements.size
        );
        Ok(Allocation {
            memory,
            size: requirements.size,
            type_index,
            heap_index: memory_type.heap_index,
            flags: memory_type.property_flags,
        })
    }
    pub(crate) fn free_memory(&self, allocation: &Allocation) {
        self.driver.free_memory(allocation.memory);
        if let Some(heap) = self.heaps.lock().get_mut(allocation.heap_index as usize) {
            heap.sub(allocation.size);
        }
        tracing::debug!(
            "freed {} bytes of memory type {}",
            allocation.size,
            allocation.type_index
        );
    }
    pub(crate) fn memory_usage(&self) -> Vec<HeapUsage> {
        self.heaps.lock().clone()
    }

    // modules
    /// The cached module for `id`, created from `spirv` on first use.
    pub(crate) fn shader_module(&self, id: &str, spirv: &[u32]) -> Result<vk::ShaderModule> {
        if let Some(module) = self.modules.get(id) {
            return Ok(*module);
        }
        let module = self
            .modules
            .entry(id.to_string())
            .or_try_insert_with(|| {
                let module = self.driver.create_shader_module(spirv)?;
                tracing::debug!("created shader module {id:?}");
                Ok::<_, Error>(module)
            })?;
        Ok(*module)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(result) = self.driver.device_wait_idle() {
            tracing::warn!("failed to wait for {:?}: {result}", self.id());
        }
        for (_, module) in std::mem::take(&mut self.modules) {
            self.driver.destroy_shader_module(module);
        }
        let command_pool = std::mem::replace(self.command_pool.get_mut(), vk::CommandPool::null());
        if command_pool.as_raw() != 0 {
            self.driver.destroy_command_pool(command_pool);
        }
        tracing::debug!("destroyed {:?}", self.id());
    }
}

/** A command buffer owned by a buffer or a kernel.

Remembers its latest submission so it is only re-recorded once that has
finished. */
pub(crate) struct CommandSlot {
    engine: Arc<Engine>,
    command_buffer: vk::CommandBuffer,
    last: Option<Submission>,
}

impl CommandSlot {
    pub(crate) fn new(engine: Arc<Engine>) -> Result<Self> {
        let command_buffer = engine.allocate_command_buffer()?;
        Ok(Self {
            engine,
            command_buffer,
            last: None,
        })
    }
    /** The command buffer, ready to be recorded.

    Waits for the previous submission unless `external_sync`. */
    pub(crate) fn prepare(&self, external_sync: bool) -> Result<vk::CommandBuffer> {
        if let Some(last) = self.last {
            if !external_sync {
                self.engine.wait_submission(last)?;
            }
        }
        Ok(self.command_buffer)
    }
    pub(crate) fn submitted(&mut self, submission: Submission) {
        self.last.replace(submission);
    }
    pub(crate) fn last(&self) -> Option<Submission> {
        self.last
    }
}

impl Drop for CommandSlot {
    fn drop(&mut self) {
        if let Some(last) = self.last {
            if let Err(e) = self.engine.wait_submission(last) {
                tracing::warn!("{e}");
            }
        }
        self.engine.free_command_buffer(self.command_buffer);
    }
}

/// Latest submission per queue that used a resource.
#[derive(Debug, Default)]
pub(crate) struct SubmissionHistory {
    epochs: Mutex<Vec<u64>>,
}

impl SubmissionHistory {
    pub(crate) fn note(&self, submission: Submission) {
        let mut epochs = self.epochs.lock();
        if epochs.len() <= submission.queue {
            epochs.resize(submission.queue + 1, 0);
        }
        let epoch = &mut epochs[submission.queue];
        *epoch = (*epoch).max(submission.epoch);
    }
    /// Blocks until every noted submission has finished.
    pub(crate) fn wait(&self, engine: &Engine) -> Result<()> {
        let epochs = self.epochs.lock().clone();
        for (queue, epoch) in epochs.into_iter().enumerate() {
            if epoch > 0 {
                engine.wait_submission(Submission { queue, epoch })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{SimCall, SimConfig, SimDriver};

    fn engine(options: DeviceOptions) -> Result<(Arc<SimDriver>, Arc<Engine>)> {
        let sim = Arc::new(SimDriver::new(SimConfig::discrete()));
        let engine = Engine::new(sim.clone(), options)?;
        Ok((sim, engine))
    }

    fn empty_command_buffer(engine: &Engine) -> Result<vk::CommandBuffer> {
        let command_buffer = engine.allocate_command_buffer()?;
        let driver = engine.driver();
        driver.begin_command_buffer(command_buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        driver.end_command_buffer(command_buffer)?;
        Ok(command_buffer)
    }

    #[test]
    fn exhaustion_without_growth() -> Result<()> {
        let (_sim, engine) = engine(DeviceOptions {
            fence_pool_size: 1,
            ..DeviceOptions::default()
        })?;
        let _fence = engine.take_fence()?;
        assert!(matches!(
            engine.take_fence(),
            Err(Error::ResourceExhausted { capacity: 1 })
        ));
        Ok(())
    }

    #[test]
    fn exhaustion_grows_pool() -> Result<()> {
        let (_sim, engine) = engine(DeviceOptions {
            fence_pool_size: 1,
            fence_pool_growth: 2,
            ..DeviceOptions::default()
        })?;
        let fences = (0..3)
            .map(|_| engine.take_fence())
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(
            engine.fence_pool_status(),
            FencePoolStatus {
                capacity: 3,
                available: 0
            }
        );
        drop(fences);
        assert_eq!(engine.fence_pool_status().available, 3);
        Ok(())
    }

    #[test]
    fn epochs_track_completion() -> Result<()> {
        let (sim, engine) = engine(DeviceOptions::default())?;
        let command_buffer = empty_command_buffer(&engine)?;
        let (first, fence) = engine.submit(1, command_buffer, true, None)?;
        assert_eq!(first, Submission { queue: 1, epoch: 1 });
        assert!(!engine.is_complete(first));
        let fence = fence.unwrap();
        assert_eq!(fence.queue_index(), Some(1));
        fence.wait(std::time::Duration::from_secs(1))?;
        assert!(engine.is_complete(first));
        let command_buffer = empty_command_buffer(&engine)?;
        let (second, _) = engine.submit(1, command_buffer, false, None)?;
        assert_eq!(second.epoch, 2);
        engine.wait_submission(second)?;
        assert!(engine.is_complete(second));
        assert!(sim
            .calls()
            .contains(&SimCall::QueueWaitIdle(sim.queues()[1])));
        Ok(())
    }

    #[test]
    fn pending_fence_is_retired_until_finished() -> Result<()> {
        let (sim, engine) = engine(DeviceOptions {
            fence_pool_size: 1,
            ..DeviceOptions::default()
        })?;
        let command_buffer = empty_command_buffer(&engine)?;
        let (submission, fence) = engine.submit(0, command_buffer, true, None)?;
        let fence = fence.unwrap();
        let handle = fence.handle();
        // still executing
        sim.reset_fence(handle)?;
        drop(fence);
        assert!(!engine.is_complete(submission));
        assert_eq!(engine.fence_pool_status().available, 0);
        assert!(matches!(
            engine.take_fence(),
            Err(Error::ResourceExhausted { capacity: 1 })
        ));
        engine.wait_queue(0)?;
        assert_eq!(engine.fence_pool_status().available, 1);
        assert_eq!(engine.take_fence()?.handle(), handle);
        Ok(())
    }

    #[test]
    fn signaled_fence_returns_on_drop() -> Result<()> {
        let (sim, engine) = engine(DeviceOptions {
            fence_pool_size: 1,
            ..DeviceOptions::default()
        })?;
        let command_buffer = empty_command_buffer(&engine)?;
        let (submission, fence) = engine.submit(1, command_buffer, true, None)?;
        drop(fence);
        assert!(engine.is_complete(submission));
        assert_eq!(engine.fence_pool_status().available, 1);
        let command_buffer = empty_command_buffer(&engine)?;
        let (_, fence) = engine.submit(1, command_buffer, true, None)?;
        let handle = fence.as_ref().unwrap().handle();
        sim.reset_fence(handle)?;
        drop(fence);
        engine.wait()?;
        assert_eq!(engine.fence_pool_status().available, 1);
        assert!(sim.validation_errors().is_empty());
        Ok(())
    }

    #[test]
    fn failed_submit_returns_fence() -> Result<()> {
        let (sim, engine) = engine(DeviceOptions::default())?;
        let command_buffer = empty_command_buffer(&engine)?;
        sim.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
        let available = engine.fence_pool_status().available;
        assert!(matches!(
            engine.submit(0, command_buffer, true, None),
            Err(Error::SubmissionFailed(vk::Result::ERROR_DEVICE_LOST))
        ));
        assert_eq!(engine.fence_pool_status().available, available);
        assert!(matches!(
            engine.submit(2, command_buffer, false, None),
            Err(Error::QueueIndexOutOfRange { index: 2, queues: 2 })
        ));
        Ok(())
    }

    #[test]
    fn queue_label_wraps_submit() -> Result<()> {
        let (sim, engine) = engine(DeviceOptions {
            debug_labels: true,
            ..DeviceOptions::default()
        })?;
        let command_buffer = empty_command_buffer(&engine)?;
        sim.clear_calls();
        let queue = sim.queues()[0];
        engine.submit(0, command_buffer, false, Some(&LabelInfo::new("copy")))?;
        assert_eq!(
            sim.calls(),
            vec![
                SimCall::QueueBeginLabel(queue, "copy".into()),
                SimCall::QueueSubmit {
                    queue,
                    command_buffer,
                    fence: vk::Fence::null()
                },
                SimCall::QueueEndLabel(queue),
            ]
        );
        Ok(())
    }

    #[test]
    fn drop_releases_everything() -> Result<()> {
        let (sim, engine) = engine(DeviceOptions::default())?;
        engine.shader_module("m", &[0x0723_0203])?;
        engine.shader_module("m", &[0x0723_0203])?;
        assert_eq!(sim.live_shader_modules(), 1);
        assert_eq!(sim.live_fences(), engine.options().fence_pool_size);
        drop(engine);
        assert_eq!(sim.live_shader_modules(), 0);
        assert_eq!(sim.live_fences(), 0);
        assert!(sim.validation_errors().is_empty());
        Ok(())
    }
}
