/*!
Workgroup shapes.

The [`WorkgroupSizer`] distributes a power of two group size over 1, 2 or 3
dimensions once per device, and converts global work sizes into dispatch group
counts.
*/

use crate::{error::Error, result::Result};

/// Per dimension workgroup shapes for one target group size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkgroupSizer {
    group_size: u32,
    shapes: [[u32; 3]; 3],
}

impl WorkgroupSizer {
    /** Precomputes the shapes for `group_size` invocations.

    Starting from `[1, 1, 1]`, axis `i % dims` is doubled on the i-th step
    until the product of the first `dims` axes is `group_size`.

    **errors**
    - [`InvalidWorkgroupSize`](Error::InvalidWorkgroupSize) if `group_size` is not a power of two. */
    pub fn new(group_size: u32) -> Result<Self> {
        if !group_size.is_power_of_two() {
            return Err(Error::InvalidWorkgroupSize(group_size));
        }
        let mut shapes = [[1; 3]; 3];
        for (d, shape) in shapes.iter_mut().enumerate() {
            let dims = d + 1;
            let mut step = 0;
            while shape[..dims].iter().product::<u32>() != group_size {
                shape[step % dims] *= 2;
                step += 1;
            }
        }
        Ok(Self { group_size, shapes })
    }
    /// Largest power of two not greater than `min(256, max_invocations)`.
    pub fn default_group_size(max_invocations: u32) -> u32 {
        let x = max_invocations.clamp(1, 256);
        1 << (u32::BITS - 1 - x.leading_zeros())
    }
    /// The number of invocations in a group.
    pub fn group_size(&self) -> u32 {
        self.group_size
    }
    /// The group shape for `dims` dimensions, axes `>= dims` are 1.
    ///
    /// **panics**
    /// If `dims` is not 1, 2 or 3.
    pub fn shape(&self, dims: u32) -> [u32; 3] {
        assert!((1..=3).contains(&dims), "dims must be 1, 2 or 3, found {dims}");
        self.shapes[dims as usize - 1]
    }
    /** Groups to dispatch to cover `global_size`.

    Each axis below `dims` is `ceil(global_size / shape)`, the rest are 1. */
    pub fn group_count(&self, global_size: [u32; 3], dims: u32) -> [u32; 3] {
        let shape = self.shape(dims);
        let mut groups = [1; 3];
        for (axis, groups) in groups.iter_mut().enumerate().take(dims as usize) {
            let (global, shape) = (global_size[axis], shape[axis]);
            *groups = global / shape + u32::from(global % shape != 0);
        }
        groups
    }
}
