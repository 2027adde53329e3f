/*!
Launch options and results.

Kernel launches, copies and fills all take [`LaunchOptions`] and return a
[`LaunchResult`].

```
# use krnl_runtime::{device::driver::LabelInfo, launch::LaunchOptions};
let options = LaunchOptions::new()
    .with_queue_index(1)
    .with_fence(true)
    .with_label(LabelInfo::new("axpy").with_color([0., 1., 0., 1.]));
assert!(options.fence);
```
*/

use crate::{
    device::driver::LabelInfo,
    fence::Fence,
    future::FenceFuture,
    result::Result,
};
use serde::Deserialize;
use std::time::Duration;

/** Options for launches, copies and fills.

Offsets and sizes are in bytes. Fields a given operation does not use are ignored. */
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LaunchOptions {
    /// Destination offset of copies and fills.
    pub dst_offset: u64,
    /// Source offset of copies.
    pub src_offset: u64,
    /// Number of bytes to copy or fill, the rest of the buffer if None.
    pub size: Option<u64>,
    /// Queue to submit to.
    pub queue_index: usize,
    /// Attach a [`Fence`] to the result.
    pub fence: bool,
    /** The caller has synchronized with previous work on the resources.

    Otherwise, re-recording a command buffer whose previous submission may
    still be executing waits for its queue first. */
    pub external_sync: bool,
    /// Global offset passed to kernels as push constants.
    pub global_offset: [u32; 3],
    /// Debug label, only recorded when labels are enabled for the device.
    pub label: Option<LabelInfo>,
}

impl LaunchOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }
    /// Adds `dst_offset`.
    pub fn with_dst_offset(mut self, dst_offset: u64) -> Self {
        self.dst_offset = dst_offset;
        self
    }
    /// Adds `src_offset`.
    pub fn with_src_offset(mut self, src_offset: u64) -> Self {
        self.src_offset = src_offset;
        self
    }
    /// Adds `size`.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size.replace(size);
        self
    }
    /// Adds `queue_index`.
    pub fn with_queue_index(mut self, queue_index: usize) -> Self {
        self.queue_index = queue_index;
        self
    }
    /// Adds `fence`.
    pub fn with_fence(mut self, fence: bool) -> Self {
        self.fence = fence;
        self
    }
    /// Adds `external_sync`.
    pub fn with_external_sync(mut self, external_sync: bool) -> Self {
        self.external_sync = external_sync;
        self
    }
    /// Adds `global_offset`.
    pub fn with_global_offset(mut self, global_offset: [u32; 3]) -> Self {
        self.global_offset = global_offset;
        self
    }
    /// Adds `label`.
    pub fn with_label(mut self, label: LabelInfo) -> Self {
        self.label.replace(label);
        self
    }
}

/** The outcome of a launch, copy or fill.

Async results were recorded into a command buffer and submitted, the rest
finished on the host before returning. */
#[must_use]
#[derive(Debug)]
pub struct LaunchResult {
    is_async: bool,
    fence: Option<Fence>,
}

impl LaunchResult {
    pub(crate) fn sync() -> Self {
        Self {
            is_async: false,
            fence: None,
        }
    }
    pub(crate) fn submitted(fence: Option<Fence>) -> Self {
        Self {
            is_async: true,
            fence,
        }
    }
    /// Whether the work was submitted to a queue.
    pub fn is_async(&self) -> bool {
        self.is_async
    }
    /// The fence, if one was requested.
    pub fn fence(&self) -> Option<&Fence> {
        self.fence.as_ref()
    }
    /// Takes the fence.
    pub fn into_fence(self) -> Option<Fence> {
        self.fence
    }
    /** Blocks until the work is finished.

    Results without a fence return immediately, use
    [`Device::wait_queue()`](crate::device::Device::wait_queue) to wait for those. */
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        if let Some(fence) = self.fence.as_ref() {
            fence.wait(timeout)?;
        }
        Ok(())
    }
    /** A future that resolves when the fence is signaled.

    ```no_run
    # use krnl_runtime::{future::BlockableFuture, launch::LaunchResult};
    # fn f(result: LaunchResult) -> krnl_runtime::result::Result<()> {
    result.finish().block()
    # }
    ``` */
    pub fn finish(self) -> FenceFuture {
        FenceFuture::new(self.fence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::BlockableFuture;

    #[test]
    fn options_deserialize() -> serde_json::Result<()> {
        let options: LaunchOptions = serde_json::from_str(
            r#"{ "size": 64, "fence": true, "label": { "name": "fill" } }"#,
        )?;
        assert_eq!(
            options,
            LaunchOptions::new()
                .with_size(64)
                .with_fence(true)
                .with_label(LabelInfo::new("fill"))
        );
        Ok(())
    }

    #[test]
    fn sync_result_is_finished() -> Result<()> {
        let result = LaunchResult::sync();
        assert!(!result.is_async());
        assert!(result.fence().is_none());
        result.wait(Duration::ZERO)?;
        result.finish().block()
    }
}
