use super::driver::{Driver, MemoryType};
use ash::vk;
use serde::Deserialize;

/** Intended access pattern of an allocation.

Used to pick a memory type, similar to vulkano's `MemoryUsage`. */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
pub enum MemoryUsage {
    /// Only accessed by the device.
    DeviceOnly,
    /// Written by the host, read by the device.
    Upload,
    /// Written by the device, read by the host.
    Download,
}

impl MemoryUsage {
    fn required(&self) -> vk::MemoryPropertyFlags {
        match self {
            Self::DeviceOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Self::Upload | Self::Download => vk::MemoryPropertyFlags::HOST_VISIBLE,
        }
    }
    fn preferred(&self) -> vk::MemoryPropertyFlags {
        match self {
            Self::DeviceOnly => vk::MemoryPropertyFlags::empty(),
            Self::Upload => vk::MemoryPropertyFlags::HOST_COHERENT,
            Self::Download => vk::MemoryPropertyFlags::HOST_CACHED,
        }
    }
    fn avoided(&self) -> vk::MemoryPropertyFlags {
        match self {
            Self::DeviceOnly => vk::MemoryPropertyFlags::HOST_VISIBLE,
            Self::Upload => vk::MemoryPropertyFlags::HOST_CACHED,
            Self::Download => vk::MemoryPropertyFlags::empty(),
        }
    }
}

/// Number of bits set in `flags`.
fn count(flags: vk::MemoryPropertyFlags) -> u32 {
    flags.as_raw().count_ones()
}

/** Picks a memory type allowed by `type_bits` for `usage`.

Types with every required flag are ranked by preferred flags present, then by
avoided flags absent, ties go to the lowest index. Device only allocations fall
back to any allowed type when no device local type is allowed, so devices that
only expose host memory still work. */
pub(crate) fn find_memory_type(
    driver: &dyn Driver,
    type_bits: u32,
    usage: MemoryUsage,
) -> Option<(u32, MemoryType)> {
    let candidates = move || {
        (0..driver.memory_type_count().min(32))
            .filter(move |i| type_bits & (1 << i) != 0)
            .filter_map(move |i| Some((i, driver.memory_type(i)?)))
    };
    let score = |memory_type: &MemoryType| {
        let flags = memory_type.property_flags;
        (
            count(flags & usage.preferred()),
            u32::BITS - count(flags & usage.avoided()),
        )
    };
    let best = |required: vk::MemoryPropertyFlags| {
        candidates()
            .filter(|(_, x)| x.property_flags.contains(required))
            // ties keep the lowest index
            .fold(None, |best: Option<(u32, MemoryType)>, x| match best {
                Some(b) if score(&b.1) >= score(&x.1) => Some(b),
                _ => Some(x),
            })
    };
    best(usage.required()).or_else(|| {
        if usage == MemoryUsage::DeviceOnly {
            best(vk::MemoryPropertyFlags::empty())
        } else {
            None
        }
    })
}

/// Memory allocated from a heap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct HeapUsage {
    /// Bytes currently allocated.
    pub allocated: u64,
    /// Most bytes allocated at once.
    pub peak: u64,
}

impl HeapUsage {
    pub(crate) fn add(&mut self, bytes: u64) {
        self.allocated += bytes;
        self.peak = self.peak.max(self.allocated);
    }
    pub(crate) fn sub(&mut self, bytes: u64) {
        self.allocated = self.allocated.saturating_sub(bytes);
    }
}
