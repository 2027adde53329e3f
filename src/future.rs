/*!
Futures.

[`LaunchResult::finish()`](crate::launch::LaunchResult::finish) returns a
[`FenceFuture`], which polls the fence of the launch. Drive futures on the
current thread with [`BlockableFuture::block()`].
*/

use crate::{fence::Fence, result::Result};
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// Extension for blocking on futures.
pub trait BlockableFuture: Future {
    /// Blocks the current thread until the future is ready.
    fn block(self) -> Self::Output;
}

impl<T> BlockableFuture for T
where
    T: Future,
{
    fn block(self) -> Self::Output {
        blocker::block(self)
    }
}

/** Resolves when the fence is signaled.

Without a fence, resolves immediately. The fence is returned to its pool when
the future is dropped. */
#[must_use]
#[derive(Debug)]
pub struct FenceFuture {
    fence: Option<Fence>,
}

impl FenceFuture {
    pub(crate) fn new(fence: Option<Fence>) -> Self {
        Self { fence }
    }
}

impl Future for FenceFuture {
    type Output = Result<()>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let Some(fence) = self.fence.as_ref() else {
            return Poll::Ready(Ok(()));
        };
        match fence.is_signaled() {
            Ok(true) => Poll::Ready(Ok(())),
            Ok(false) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer::BufferKind,
        device::{
            sim::{SimConfig, SimDriver},
            Device, MemoryUsage,
        },
        launch::LaunchOptions,
    };
    use std::sync::Arc;

    #[test]
    fn fence_future_resolves() -> anyhow::Result<()> {
        let sim = Arc::new(SimDriver::new(SimConfig::discrete()));
        let device = Device::builder().driver(sim).fence_pool_size(1).build()?;
        let mut x = device.create_buffer::<u32>(BufferKind::Storage, MemoryUsage::DeviceOnly);
        x.set_size(16)?;
        let future = x.fill(1, LaunchOptions::new().with_fence(true))?.finish();
        assert_eq!(device.fence_pool_status().available, 0);
        future.block()?;
        assert_eq!(device.fence_pool_status().available, 1);
        Ok(())
    }
}
