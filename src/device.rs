/*!
A [`Device`] is used to create [buffers](crate::buffer) and [kernels](crate::kernel).

Devices are created with a [builder](Device::builder), either for the Vulkan
device at an index (feature "device"), or on top of any [`Driver`], like the
bundled [software driver](sim::SimDriver).

Creating a device and printing out useful info:
```no_run
# use krnl_runtime::{anyhow::Result, device::Device};
# fn main() -> Result<()> {
let device = Device::builder()
    .index(1)
    .build()?;
dbg!(device.info());
# Ok(())
# }
```

# Queues
Each launch, copy and fill is submitted to the queue selected by
[`LaunchOptions::queue_index`](crate::launch::LaunchOptions::queue_index).
Work on one queue executes in submission order, there is no ordering between
queues without waiting.

Submitting never blocks on the device, except when the command buffer of a
buffer or kernel is re-recorded while its previous submission may still be
executing. Then the runtime waits for that queue first, unless the launch was
made with [`external_sync`](crate::launch::LaunchOptions::external_sync).

# Configuration
[`DeviceOptions`] can be deserialized, for example from a config file:
```
# use krnl_runtime::device::DeviceOptions;
let options: DeviceOptions = serde_json::from_str(r#"{ "index": 0, "fence_pool_size": 4 }"#).unwrap();
assert_eq!(options.fence_pool_size, 4);
```
*/

use crate::{
    buffer::{Buffer, BufferKind},
    fence::Fence,
    kernel::{Kernel, KernelDesc},
    result::Result,
};
use bytemuck::Pod;
use serde::Deserialize;
use std::{
    fmt::{self, Debug},
    sync::Arc,
    time::Duration,
};

pub mod driver;
mod engine;
mod memory;
pub mod sim;
#[cfg(feature = "device")]
pub mod vulkan;

use driver::{DeviceLimits, Driver, MemoryType};
pub(crate) use engine::{Allocation, CommandSlot, Engine, SubmissionHistory};
pub use engine::FencePoolStatus;
pub use memory::{HeapUsage, MemoryUsage};

/// Errors.
pub mod error {
    /** Device is unavailable.

    - The "device" feature is not enabled.
    - Failed to load the Vulkan library.
    */
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("DeviceUnavailable")]
    pub struct DeviceUnavailable;

    /// The device index is greater than or equal to the number of devices.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Device index {index} is out of range 0..{devices}!")]
    pub struct DeviceIndexOutOfRange {
        pub(crate) index: usize,
        pub(crate) devices: usize,
    }
}
#[cfg(not(feature = "device"))]
use error::DeviceUnavailable;

/** Device options.

All fields have defaults, so partial configs deserialize. */
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    /// Index of the device, defaults to 0.
    pub index: usize,
    /// Initial number of fences, defaults to 16.
    pub fence_pool_size: usize,
    /// Fences added when the pool is exhausted, 0 (the default) fails instead.
    pub fence_pool_growth: usize,
    /// Invocations per workgroup, a power of two. Defaults to the largest power of two not greater than min(256, device max).
    pub workgroup_size: Option<u32>,
    /// Record debug labels, if supported. Defaults to true in debug builds.
    pub debug_labels: bool,
    /// Timeout of fence waits made by [`Device::wait_for_completion()`].
    pub wait_timeout: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            index: 0,
            fence_pool_size: 16,
            fence_pool_growth: 0,
            workgroup_size: None,
            debug_labels: cfg!(debug_assertions),
            wait_timeout: Duration::from_secs(60),
        }
    }
}

/// Builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Device`].
    pub struct DeviceBuilder {
        pub(super) options: DeviceOptions,
        pub(super) driver: Option<Arc<dyn Driver>>,
    }

    impl DeviceBuilder {
        /// Index of the device, defaults to 0.
        pub fn index(mut self, index: usize) -> Self {
            self.options.index = index;
            self
        }
        /// Use `driver` instead of loading Vulkan.
        pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
            self.driver.replace(driver);
            self
        }
        /// See [`DeviceOptions::fence_pool_size`].
        pub fn fence_pool_size(mut self, fence_pool_size: usize) -> Self {
            self.options.fence_pool_size = fence_pool_size;
            self
        }
        /// See [`DeviceOptions::fence_pool_growth`].
        pub fn fence_pool_growth(mut self, fence_pool_growth: usize) -> Self {
            self.options.fence_pool_growth = fence_pool_growth;
            self
        }
        /// See [`DeviceOptions::workgroup_size`].
        pub fn workgroup_size(mut self, workgroup_size: u32) -> Self {
            self.options.workgroup_size.replace(workgroup_size);
            self
        }
        /// See [`DeviceOptions::debug_labels`].
        pub fn debug_labels(mut self, debug_labels: bool) -> Self {
            self.options.debug_labels = debug_labels;
            self
        }
        /// See [`DeviceOptions::wait_timeout`].
        pub fn wait_timeout(mut self, wait_timeout: Duration) -> Self {
            self.options.wait_timeout = wait_timeout;
            self
        }
        /// Replaces all options.
        pub fn options(mut self, options: DeviceOptions) -> Self {
            self.options = options;
            self
        }
        /// Creates a device.
        ///
        /// **errors**
        ///
        /// - [`DeviceUnavailable`](super::error::DeviceUnavailable)
        /// - [`DeviceIndexOutOfRange`](super::error::DeviceIndexOutOfRange)
        /// - The device could not be created.
        pub fn build(self) -> anyhow::Result<Device> {
            let driver = match self.driver {
                Some(driver) => driver,
                #[cfg(feature = "device")]
                None => Arc::new(vulkan::VulkanDriver::new(self.options.index)?),
                #[cfg(not(feature = "device"))]
                None => return Err(DeviceUnavailable.into()),
            };
            let engine = Engine::new(driver, self.options)?;
            Ok(Device { engine })
        }
    }
}
use builder::DeviceBuilder;

/// What [`Device::wait_for_completion()`] waits for.
#[derive(Clone, Copy, Debug)]
pub enum WaitTarget<'a> {
    /// All queues.
    Device,
    /// One queue.
    Queue(usize),
    /// The work a fence was submitted with.
    Fence(&'a Fence),
}

/** A device.

Devices can be cloned, which is equivalent to [`Arc::clone()`].

Devices are unique:
```
# use krnl_runtime::{anyhow::Result, device::{Device, sim::{SimConfig, SimDriver}}};
# use std::sync::Arc;
# fn main() -> Result<()> {
let a = Device::builder().driver(Arc::new(SimDriver::new(SimConfig::discrete()))).build()?;
let b = Device::builder().driver(Arc::new(SimDriver::new(SimConfig::discrete()))).build()?;
assert_ne!(a, b);
assert_eq!(a, a.clone());
# Ok(())
# }
```
*/
#[derive(Clone)]
pub struct Device {
    engine: Arc<Engine>,
}

impl Device {
    /// A builder for creating a device.
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder {
            options: DeviceOptions::default(),
            driver: None,
        }
    }
    pub(crate) fn from_engine(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
    /// Device info.
    pub fn info(&self) -> &Arc<DeviceInfo> {
        self.engine.info()
    }
    /// The options the device was created with.
    pub fn options(&self) -> &DeviceOptions {
        self.engine.options()
    }
    /** Creates an empty buffer.

    Allocate it with [`.set_size()`](Buffer::set_size). */
    pub fn create_buffer<T: Pod>(&self, kind: BufferKind, usage: MemoryUsage) -> Buffer<T> {
        Buffer::new(self.engine.clone(), kind, usage)
    }
    /** Creates a kernel.

    The shader module is shared between kernels with the same module id.

    **errors**
    - [`InvalidDimensions`](crate::error::Error::InvalidDimensions) if the desc
    does not have 1, 2 or 3 dimensions.
    - The module, descriptors or pipeline could not be created. */
    pub fn create_kernel(&self, desc: KernelDesc) -> Result<Kernel> {
        Kernel::new(self.engine.clone(), desc)
    }
    /** Blocks until all submitted work has finished.

    **errors**
    - [`WaitFailed`](crate::error::Error::WaitFailed) if the device was lost. */
    pub fn wait(&self) -> Result<()> {
        self.engine.wait()
    }
    /** Blocks until queue `index` is idle.

    **errors**
    - [`QueueIndexOutOfRange`](crate::error::Error::QueueIndexOutOfRange)
    - [`WaitFailed`](crate::error::Error::WaitFailed) if the device was lost. */
    pub fn wait_queue(&self, index: usize) -> Result<()> {
        self.engine.wait_queue(index)
    }
    /** Blocks until `target` has finished.

    Fence waits time out after [`DeviceOptions::wait_timeout`].

    **errors**
    - [`WaitTimedOut`](crate::error::Error::WaitTimedOut)
    - [`WaitFailed`](crate::error::Error::WaitFailed) if the device was lost. */
    pub fn wait_for_completion(&self, target: WaitTarget) -> Result<()> {
        match target {
            WaitTarget::Device => self.wait(),
            WaitTarget::Queue(index) => self.wait_queue(index),
            WaitTarget::Fence(fence) => fence.wait(self.engine.options().wait_timeout),
        }
    }
    /// Allocated bytes per memory heap.
    pub fn memory_usage(&self) -> Vec<HeapUsage> {
        self.engine.memory_usage()
    }
    /// Capacity and availability of the fence pool.
    pub fn fence_pool_status(&self) -> FencePoolStatus {
        self.engine.fence_pool_status()
    }
    /** Grows or shrinks the fence pool to `len` fences.

    Shrinking destroys available fences from the end of the pool and stops at
    the highest fence that is still held, see [`FencePool::resize()`](crate::fence::FencePool::resize). */
    pub fn resize_fence_pool(&self, len: usize) -> Result<()> {
        self.engine.resize_fence_pool(len)
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.engine, &other.engine)
    }
}

impl Eq for Device {}

/** Prints `Device(index@handle)` where handle uniquely identifies the device.

See [`.info()`](Device::info) for printing device info. */
impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.engine.id().fmt(f)
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub(crate) struct DeviceId {
    index: usize,
    handle: usize,
}

impl Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Device({}@{:x})", self.index, self.handle)
    }
}

/// Device info.
#[derive(Debug)]
pub struct DeviceInfo {
    index: usize,
    name: String,
    queues: usize,
    memory_types: Vec<MemoryType>,
    limits: DeviceLimits,
    workgroup_size: u32,
    debug_labels: bool,
}

impl DeviceInfo {
    /// Index of the device.
    pub fn index(&self) -> usize {
        self.index
    }
    /// Name of the device.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Number of queues.
    pub fn queues(&self) -> usize {
        self.queues
    }
    /// Memory types.
    pub fn memory_types(&self) -> &[MemoryType] {
        &self.memory_types
    }
    /// Compute limits.
    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }
    /// Invocations per workgroup.
    pub fn workgroup_size(&self) -> u32 {
        self.workgroup_size
    }
    /// Whether debug labels are recorded.
    pub fn debug_labels(&self) -> bool {
        self.debug_labels
    }
}

#[cfg(test)]
mod tests {
    use super::{
        sim::{SimConfig, SimDriver},
        *,
    };
    use crate::{error::Error, launch::LaunchOptions};

    fn sim_device(config: SimConfig) -> anyhow::Result<(Arc<SimDriver>, Device)> {
        let sim = Arc::new(SimDriver::new(config));
        let device = Device::builder().driver(sim.clone()).build()?;
        Ok((sim, device))
    }

    #[test]
    fn device_info() -> anyhow::Result<()> {
        let (_sim, device) = sim_device(SimConfig::discrete())?;
        let info = device.info();
        assert_eq!(info.name(), "sim-discrete");
        assert_eq!(info.queues(), 2);
        assert_eq!(info.memory_types().len(), 3);
        assert_eq!(info.workgroup_size(), 256);
        let (_sim, device) = sim_device(SimConfig::unified())?;
        assert_eq!(device.info().workgroup_size(), 128);
        assert!(!device.info().debug_labels());
        Ok(())
    }

    #[test]
    fn workgroup_size_option() -> anyhow::Result<()> {
        let sim = Arc::new(SimDriver::new(SimConfig::discrete()));
        let device = Device::builder()
            .driver(sim.clone())
            .workgroup_size(64)
            .build()?;
        assert_eq!(device.info().workgroup_size(), 64);
        let e = Device::builder()
            .driver(sim)
            .workgroup_size(48)
            .build()
            .unwrap_err();
        assert!(matches!(
            e.downcast_ref::<Error>(),
            Some(Error::InvalidWorkgroupSize(48))
        ));
        Ok(())
    }

    #[test]
    fn options_deserialize_with_defaults() -> anyhow::Result<()> {
        let options: DeviceOptions = serde_json::from_str(
            r#"{ "fence_pool_growth": 4, "workgroup_size": 128, "wait_timeout": { "secs": 2, "nanos": 0 } }"#,
        )?;
        assert_eq!(
            options,
            DeviceOptions {
                fence_pool_growth: 4,
                workgroup_size: Some(128),
                wait_timeout: Duration::from_secs(2),
                ..DeviceOptions::default()
            }
        );
        Ok(())
    }

    #[test]
    fn wait_for_completion_targets() -> anyhow::Result<()> {
        let (_sim, device) = sim_device(SimConfig::discrete())?;
        device.wait_for_completion(WaitTarget::Device)?;
        device.wait_for_completion(WaitTarget::Queue(1))?;
        assert!(matches!(
            device.wait_for_completion(WaitTarget::Queue(2)),
            Err(Error::QueueIndexOutOfRange { index: 2, queues: 2 })
        ));
        Ok(())
    }

    #[test]
    fn fence_pool_resize() -> anyhow::Result<()> {
        let (sim, device) = sim_device(SimConfig::discrete())?;
        device.resize_fence_pool(4)?;
        assert_eq!(
            device.fence_pool_status(),
            FencePoolStatus {
                capacity: 4,
                available: 4
            }
        );
        assert_eq!(sim.live_fences(), 4);
        let mut x = device.create_buffer::<u32>(BufferKind::Storage, MemoryUsage::DeviceOnly);
        x.set_size(4)?;
        let _first = x.fill(1, LaunchOptions::new().with_fence(true))?;
        let second = x.fill(2, LaunchOptions::new().with_fence(true))?;
        device.resize_fence_pool(1)?;
        assert_eq!(
            device.fence_pool_status(),
            FencePoolStatus {
                capacity: 2,
                available: 0
            }
        );
        assert!(second.fence().unwrap().is_signaled()?);
        drop(second);
        device.resize_fence_pool(1)?;
        assert_eq!(device.fence_pool_status().capacity, 1);
        assert_eq!(sim.live_fences(), 1);
        assert!(sim.validation_errors().is_empty());
        Ok(())
    }

    #[cfg(not(feature = "device"))]
    #[test]
    fn device_unavailable() {
        let e = Device::builder().build().unwrap_err();
        assert!(e.downcast_ref::<error::DeviceUnavailable>().is_some());
    }
}
