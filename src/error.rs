/*!
Errors.

Operations that touch the driver return [`Error`](crate::error::Error). Misuse of
pools (returning a fence twice, or one the pool never handed out) is reported as
[`Error::UnmanagedResourceReturned`] and logged, but never corrupts the pool.
*/

use ash::vk;
use std::time::Duration;

/// Runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Device memory, a descriptor pool, or another driver object could not be allocated.
    #[error("failed to allocate {what} ({bytes} bytes): {result}")]
    AllocationFailed {
        what: &'static str,
        bytes: u64,
        result: vk::Result,
    },
    /// No free fence in the pool.
    #[error("fence pool exhausted (capacity {capacity})")]
    ResourceExhausted { capacity: usize },
    /// A handle was returned to a pool that does not own it.
    #[error("unmanaged fence {0:?} returned to pool")]
    UnmanagedResourceReturned(vk::Fence),
    /// The fill can not be expressed on the device.
    #[error("fill of {elem_size} byte elements at offset {offset} size {size} is not supported")]
    UnsupportedFillAlignment {
        elem_size: usize,
        offset: u64,
        size: u64,
    },
    /// Host mapping of buffer memory failed.
    #[error("failed to map buffer memory: {0}")]
    MappingFailed(MappingError),
    /// The queue rejected a submission.
    #[error("queue submission failed: {0}")]
    SubmissionFailed(vk::Result),
    /// A wait did not finish within the timeout.
    #[error("wait timed out after {0:?}")]
    WaitTimedOut(Duration),
    /// A wait failed, typically because the device was lost.
    #[error("wait failed: {0}")]
    WaitFailed(vk::Result),
    /// Recording a kernel launch failed.
    #[error("launch of kernel {kernel:?} failed: {result}")]
    LaunchFailed { kernel: String, result: vk::Result },
    /// The arguments do not match the kernel signature.
    #[error("kernel {kernel:?} argument {index}: {reason}")]
    ArgumentMismatch {
        kernel: String,
        index: usize,
        reason: String,
    },
    /// A byte range is out of bounds or not element aligned.
    #[error("invalid range offset {offset} size {size} for buffer of {len} bytes (stride {stride})")]
    InvalidRange {
        offset: u64,
        size: u64,
        len: u64,
        stride: usize,
    },
    /// Resources from different devices were mixed.
    #[error("resources belong to different devices")]
    DeviceMismatch,
    /// The queue index is greater than or equal to the number of queues.
    #[error("queue index {index} is out of range 0..{queues}")]
    QueueIndexOutOfRange { index: usize, queues: usize },
    /// The target workgroup size is not a power of two.
    #[error("workgroup size {0} is not a power of two")]
    InvalidWorkgroupSize(u32),
    /// A kernel was described with other than 1, 2 or 3 dimensions.
    #[error("kernel {kernel:?} has {dims} dimensions, expected 1, 2 or 3")]
    InvalidDimensions { kernel: String, dims: u32 },
    /// The dispatch exceeds the device's group count limit.
    #[error("dispatch of {groups:?} groups exceeds device limit {limit:?}")]
    DispatchTooLarge { groups: [u32; 3], limit: [u32; 3] },
    /// Any other driver failure.
    #[error("driver error: {0}")]
    Driver(#[from] vk::Result),
}

/// Why a mapping failed.
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("buffer memory is not host visible")]
    NotHostVisible,
    #[error("buffer is empty")]
    Empty,
    #[error("{0}")]
    Driver(vk::Result),
}

impl Error {
    pub(crate) fn allocation(what: &'static str, bytes: u64, result: vk::Result) -> Self {
        Self::AllocationFailed {
            what,
            bytes,
            result,
        }
    }
    pub(crate) fn argument(kernel: &str, index: usize, reason: impl Into<String>) -> Self {
        Self::ArgumentMismatch {
            kernel: kernel.to_string(),
            index,
            reason: reason.into(),
        }
    }
}
