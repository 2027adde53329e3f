/*!
Fences.

A [`FencePool`] owns a bounded set of fences that are handed out for
submissions and returned afterwards, so launches never create and destroy
driver objects. The engine keeps its pool behind a mutex, the pool itself is a
plain single-owner value.

Operations that request a completion signal return a [`Fence`] in their
[`LaunchResult`](crate::launch::LaunchResult). Dropping the fence returns it to
the pool once its submission has finished. A fence dropped while its work is
still pending is retired by the engine and reclaimed after a later wait.
*/

use crate::{
    device::{driver::Driver, Engine},
    error::Error,
    result::Result,
};
use ash::vk;
use std::{
    collections::BTreeSet,
    fmt::{self, Debug},
    sync::{Arc, Weak},
    time::Duration,
};

/// Fixed capacity pool of reusable fences.
pub struct FencePool {
    driver: Arc<dyn Driver>,
    fences: Vec<vk::Fence>,
    free: BTreeSet<usize>,
}

impl FencePool {
    /// An empty pool, see [`.resize()`](FencePool::resize).
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            fences: Vec::new(),
            free: BTreeSet::new(),
        }
    }
    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.fences.len()
    }
    /// Number of slots that can be taken.
    pub fn available(&self) -> usize {
        self.free.len()
    }
    /** Grows or shrinks the pool to `len` slots.

    New fences are created unsignaled and are available. Shrinking destroys
    available fences from the tail and stops at the highest taken slot, so the
    capacity can remain above `len`.

    **errors**
    - [`AllocationFailed`](Error::AllocationFailed) if a fence could not be
    created. Fences created before the failure are kept. */
    pub fn resize(&mut self, len: usize) -> Result<()> {
        while self.fences.len() > len {
            let index = self.fences.len() - 1;
            if !self.free.remove(&index) {
                tracing::debug!("fence pool shrink stopped at taken slot {index}");
                break;
            }
            if let Some(fence) = self.fences.pop() {
                self.driver.destroy_fence(fence);
            }
        }
        self.fences.reserve(len.saturating_sub(self.fences.len()));
        while self.fences.len() < len {
            let fence = self
                .driver
                .create_fence(false)
                .map_err(|result| Error::allocation("fence", 0, result))?;
            self.free.insert(self.fences.len());
            self.fences.push(fence);
        }
        tracing::debug!("fence pool resized to {}", self.fences.len());
        Ok(())
    }
    /** Takes the first available fence.

    The fence is reset to unsignaled before it is returned.

    **errors**
    - [`ResourceExhausted`](Error::ResourceExhausted) if every slot is taken.
    - [`Driver`](Error::Driver) if the fence could not be reset, the slot stays available. */
    pub fn take(&mut self) -> Result<vk::Fence> {
        let index = *self.free.first().ok_or(Error::ResourceExhausted {
            capacity: self.fences.len(),
        })?;
        let fence = self.fences[index];
        self.driver.reset_fence(fence)?;
        self.free.remove(&index);
        Ok(fence)
    }
    /** Returns `fence` to its slot.

    Returning a fence that is already available is a no-op.

    **errors**
    - [`UnmanagedResourceReturned`](Error::UnmanagedResourceReturned) if the
    fence does not belong to the pool. The pool is unchanged. */
    pub fn release(&mut self, fence: vk::Fence) -> Result<()> {
        let index = self
            .fences
            .iter()
            .position(|x| *x == fence)
            .ok_or(Error::UnmanagedResourceReturned(fence))?;
        if !self.free.insert(index) {
            tracing::warn!("fence {fence:?} returned twice");
        }
        Ok(())
    }
}

impl Debug for FencePool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FencePool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

impl Drop for FencePool {
    fn drop(&mut self) {
        for fence in self.fences.drain(..) {
            self.driver.destroy_fence(fence);
        }
    }
}

/** A completion signal for submitted work.

Holds a slot of the device's fence pool, which it returns on drop. The fence
does not keep the device alive. */
pub struct Fence {
    handle: vk::Fence,
    engine: Weak<Engine>,
    submission: Option<Submission>,
}

/// A submission to a queue, identified by its epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Submission {
    pub(crate) queue: usize,
    pub(crate) epoch: u64,
}

impl Fence {
    pub(crate) fn new(handle: vk::Fence, engine: &Arc<Engine>) -> Self {
        Self {
            handle,
            engine: Arc::downgrade(engine),
            submission: None,
        }
    }
    pub(crate) fn activate(&mut self, submission: Submission) {
        self.submission.replace(submission);
    }
    /// The driver handle.
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }
    /// Whether the fence was attached to a submission.
    pub fn is_active(&self) -> bool {
        self.submission.is_some()
    }
    /// Index of the queue the work was submitted to.
    pub fn queue_index(&self) -> Option<usize> {
        self.submission.map(|x| x.queue)
    }
    /** Whether the work has finished.

    An inactive fence, or a fence whose device was dropped, is signaled. */
    pub fn is_signaled(&self) -> Result<bool> {
        let (Some(submission), Some(engine)) = (self.submission, self.engine.upgrade()) else {
            return Ok(true);
        };
        let signaled = engine
            .driver()
            .fence_status(self.handle)
            .map_err(Error::WaitFailed)?;
        if signaled {
            engine.complete(submission);
        }
        Ok(signaled)
    }
    /** Blocks until the work has finished.

    **errors**
    - [`WaitTimedOut`](Error::WaitTimedOut) if `timeout` elapsed first.
    - [`WaitFailed`](Error::WaitFailed) if the device was lost. */
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let (Some(submission), Some(engine)) = (self.submission, self.engine.upgrade()) else {
            return Ok(());
        };
        match engine.driver().wait_fence(self.handle, timeout) {
            Ok(true) => {
                engine.complete(submission);
                Ok(())
            }
            Ok(false) => Err(Error::WaitTimedOut(timeout)),
            Err(result) => Err(Error::WaitFailed(result)),
        }
    }
}

impl Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.handle)
            .field("submission", &self.submission)
            .finish()
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.release_fence(self.handle, self.submission);
        }
    }
}
