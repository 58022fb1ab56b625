//! Remote-Port devices and the per-channel device table.
//!
//! This module defines the `RemotePortDevice` trait implemented by everything
//! that receives packets from a channel. It provides:
//! 1. **Identification:** `name` for logs and error reports.
//! 2. **Command set:** The commands a device implements; dispatch of anything
//!    else to it is a protocol violation.
//! 3. **Handling:** `handle` receives one decoded packet on the consumer side.
//!
//! All implementors must be `Send + Sync`: the table is shared with the
//! receive thread, and requests may be issued from any thread.

use std::fmt;
use std::sync::Arc;

use crate::buffer::DynPacket;
use crate::channel::Channel;
use crate::common::{ConfigError, Result};
use crate::proto::header::Command;

/// Set of commands a device handles.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandSet(u32);

impl CommandSet {
    /// No commands.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Read and write.
    pub const fn bus() -> Self {
        Self::empty().with(Command::Read).with(Command::Write)
    }

    /// Returns the set with `cmd` added.
    pub const fn with(self, cmd: Command) -> Self {
        Self(self.0 | (1 << cmd.code()))
    }

    /// True if `cmd` is in the set.
    pub const fn contains(self, cmd: Command) -> bool {
        self.0 & (1 << cmd.code()) != 0
    }
}

impl fmt::Debug for CommandSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(Command::ALL.iter().filter(|&&c| self.contains(c)).map(|c| c.name()))
            .finish()
    }
}

/// A logical device reachable through a channel.
pub trait RemotePortDevice: Send + Sync {
    /// Short name for logs (e.g. `"memory-slave"`).
    fn name(&self) -> &str;

    /// Commands this device handles.
    fn commands(&self) -> CommandSet;

    /// Handles one request handed over by the channel.
    ///
    /// Runs on the consumer side. Responses are written through `channel`.
    ///
    /// # Errors
    ///
    /// Transport failures while answering. The channel is already terminated
    /// when that happens; the error is only logged.
    fn handle(&self, channel: &Channel, pkt: &DynPacket) -> Result<()>;
}

/// Fixed-size table mapping device indices to devices.
pub struct DeviceTable {
    slots: Vec<Option<Arc<dyn RemotePortDevice>>>,
}

impl DeviceTable {
    /// Creates a table with `size` empty slots.
    pub fn new(size: usize) -> Self {
        Self { slots: vec![None; size] }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if the table has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Attaches `device` at `index`, returning the device it replaced.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if `index` is outside the table.
    pub fn attach(
        &mut self,
        index: u32,
        device: Arc<dyn RemotePortDevice>,
    ) -> Result<Option<Arc<dyn RemotePortDevice>>, ConfigError> {
        let size = self.slots.len();
        let slot = self.slots.get_mut(index as usize).ok_or_else(|| ConfigError::Invalid {
            field: "device index",
            reason: format!("{index} is outside the table of {size} devices"),
        })?;
        Ok(slot.replace(device))
    }

    /// Removes the device at `index`.
    pub fn detach(&mut self, index: u32) -> Option<Arc<dyn RemotePortDevice>> {
        self.slots.get_mut(index as usize).and_then(Option::take)
    }

    /// The device at `index`, if any.
    pub fn get(&self, index: u32) -> Option<&Arc<dyn RemotePortDevice>> {
        self.slots.get(index as usize).and_then(Option::as_ref)
    }

    /// True if `index` is inside the table.
    pub fn in_range(&self, index: u32) -> bool {
        (index as usize) < self.slots.len()
    }

    /// Detaches every device.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }
}

impl fmt::Debug for DeviceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.slots
                    .iter()
                    .enumerate()
                    .filter_map(|(i, d)| d.as_ref().map(|d| (i, d.name().to_owned()))),
            )
            .finish()
    }
}
