/*!
A runtime for launching compute kernels on Vulkan devices.

- [`device`]: devices, the driver boundary and the software driver.
- [`buffer`]: typed device buffers, copies and fills.
- [`kernel`]: kernels and their launches.
- [`fence`]: the fence pool and completion signals.
- [`launch`]: options and results shared by all launches.
*/
#![forbid(unsafe_op_in_unsafe_fn)]

pub use anyhow;
pub use ash;

pub mod result {
    pub type Result<T, E = crate::error::Error> = std::result::Result<T, E>;
}

pub mod buffer;
pub mod device;
pub mod error;
pub mod fence;
pub mod future;
pub mod kernel;
pub mod launch;
pub mod scope;
pub mod workgroup;
