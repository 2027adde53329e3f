/*!
Scoped recording guards.

[`CommandRegion`] begins recording into a command buffer and guarantees it is
ended. [`DebugLabel`] brackets a command buffer or queue region with a label for
external tools. Both are no-ops when constructed without a handle, so call sites
that only record in some configurations do not need to branch.
*/

use crate::device::driver::{Driver, DriverResult, LabelInfo};
use ash::vk::{self, Handle};

/// A command buffer recording session, ended on drop.
pub struct CommandRegion<'a> {
    driver: &'a dyn Driver,
    command_buffer: vk::CommandBuffer,
}

impl<'a> CommandRegion<'a> {
    /** Begins recording into `command_buffer` with `usage`.

    A null `command_buffer` records nothing. */
    pub fn begin(
        driver: &'a dyn Driver,
        command_buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> DriverResult<Self> {
        if command_buffer.as_raw() != 0 {
            driver.begin_command_buffer(command_buffer, usage)?;
        }
        Ok(Self {
            driver,
            command_buffer,
        })
    }
    /// The command buffer being recorded, null once ended.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }
    /// Ends recording. Subsequent calls do nothing.
    pub fn end(&mut self) -> DriverResult<()> {
        let command_buffer = std::mem::replace(&mut self.command_buffer, vk::CommandBuffer::null());
        if command_buffer.as_raw() == 0 {
            return Ok(());
        }
        self.driver.end_command_buffer(command_buffer)
    }
}

impl Drop for CommandRegion<'_> {
    fn drop(&mut self) {
        if let Err(result) = self.end() {
            tracing::warn!("failed to end command buffer: {result}");
        }
    }
}

/// Where a label is inserted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelTarget {
    CommandBuffer(vk::CommandBuffer),
    Queue(vk::Queue),
}

impl LabelTarget {
    fn is_null(&self) -> bool {
        match self {
            Self::CommandBuffer(x) => x.as_raw() == 0,
            Self::Queue(x) => x.as_raw() == 0,
        }
    }
}

/// A labeled region, ended on drop.
pub struct DebugLabel<'a> {
    driver: &'a dyn Driver,
    target: Option<LabelTarget>,
}

impl<'a> DebugLabel<'a> {
    /** Begins a label region.

    Pass None (or a null handle) when debugging is disabled. */
    pub fn begin(driver: &'a dyn Driver, target: Option<LabelTarget>, label: &LabelInfo) -> Self {
        let target = target.filter(|x| !x.is_null());
        match target {
            Some(LabelTarget::CommandBuffer(command_buffer)) => {
                driver.cmd_begin_label(command_buffer, label);
            }
            Some(LabelTarget::Queue(queue)) => {
                driver.queue_begin_label(queue, label);
            }
            None => (),
        }
        Self { driver, target }
    }
    /// Whether the label is recorded.
    pub fn is_active(&self) -> bool {
        self.target.is_some()
    }
    /// Ends the region. Subsequent calls do nothing.
    pub fn end(&mut self) {
        match self.target.take() {
            Some(LabelTarget::CommandBuffer(command_buffer)) => {
                self.driver.cmd_end_label(command_buffer);
            }
            Some(LabelTarget::Queue(queue)) => {
                self.driver.queue_end_label(queue);
            }
            None => (),
        }
    }
}

impl Drop for DebugLabel<'_> {
    fn drop(&mut self) {
        self.end();
    }
}
