//! Local memory system seen by remote bus accesses.
//!
//! This module defines the `BusTarget` trait that the memory slave executes
//! accesses against. It provides:
//! 1. **Access:** Byte-slice reads and writes at absolute bus addresses, with
//!    per-access attributes.
//! 2. **RAM:** A `Vec`-backed RAM window.
//! 3. **Routing:** An address map that forwards accesses to the target
//!    claiming the address.
//!
//! Errors are [`BusError`]s: they become response codes, never failures.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::common::{BusError, lock};

/// Per-access attributes forwarded from the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemAttrs {
    /// Secure-world access.
    pub secure: bool,
    /// Requester id.
    pub master_id: u64,
}

/// Something that answers bus reads and writes.
pub trait BusTarget: Send + Sync {
    /// Fills `buf` from `addr`.
    ///
    /// # Errors
    ///
    /// [`BusError::Decode`] if nothing is mapped at `addr`, [`BusError::Generic`]
    /// for any other rejection.
    fn read(&self, addr: u64, buf: &mut [u8], attrs: MemAttrs) -> Result<(), BusError>;

    /// Stores `data` at `addr`.
    ///
    /// # Errors
    ///
    /// As [`BusTarget::read`].
    fn write(&self, addr: u64, data: &[u8], attrs: MemAttrs) -> Result<(), BusError>;
}

/// RAM window mapped at a base address.
pub struct RamTarget {
    base: u64,
    bytes: Mutex<Vec<u8>>,
}

impl RamTarget {
    /// Creates `size` zeroed bytes mapped at `base`.
    pub fn new(base: u64, size: usize) -> Self {
        Self { base, bytes: Mutex::new(vec![0; size]) }
    }

    /// (base, size) of the window.
    pub fn address_range(&self) -> (u64, u64) {
        (self.base, lock(&self.bytes).len() as u64)
    }

    /// Copies `data` in at window offset `offset`. Out-of-range loads are ignored.
    pub fn load(&self, offset: usize, data: &[u8]) {
        let mut bytes = lock(&self.bytes);
        if let Some(dst) = offset.checked_add(data.len()).and_then(|end| bytes.get_mut(offset..end)) {
            dst.copy_from_slice(data);
        }
    }

    /// Copies `len` bytes out from window offset `offset`.
    pub fn dump(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let bytes = lock(&self.bytes);
        offset.checked_add(len).and_then(|end| bytes.get(offset..end)).map(<[u8]>::to_vec)
    }

    fn range(&self, addr: u64, len: usize, size: usize) -> Result<std::ops::Range<usize>, BusError> {
        let start = addr
            .checked_sub(self.base)
            .and_then(|off| usize::try_from(off).ok())
            .ok_or(BusError::Decode(addr))?;
        let end = start.checked_add(len).ok_or(BusError::Decode(addr))?;
        if end > size {
            return Err(BusError::Decode(addr));
        }
        Ok(start..end)
    }
}

impl BusTarget for RamTarget {
    fn read(&self, addr: u64, buf: &mut [u8], _attrs: MemAttrs) -> Result<(), BusError> {
        let bytes = lock(&self.bytes);
        let range = self.range(addr, buf.len(), bytes.len())?;
        buf.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn write(&self, addr: u64, data: &[u8], _attrs: MemAttrs) -> Result<(), BusError> {
        let mut bytes = lock(&self.bytes);
        let range = self.range(addr, data.len(), bytes.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }
}

impl fmt::Debug for RamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (base, size) = self.address_range();
        f.debug_struct("RamTarget").field("base", &format_args!("{base:#x}")).field("size", &size).finish()
    }
}

struct Region {
    start: u64,
    size: u64,
    target: Arc<dyn BusTarget>,
}

/// Routes accesses to the region containing the start address.
///
/// An access must fit in one region. Regions receive absolute addresses.
#[derive(Default)]
pub struct AddressMap {
    regions: Vec<Region>,
}

impl AddressMap {
    /// Creates an empty map; every access decodes to nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `target` at `[start, start + size)`.
    pub fn map(&mut self, start: u64, size: u64, target: Arc<dyn BusTarget>) {
        self.regions.push(Region { start, size, target });
    }

    fn find(&self, addr: u64, len: usize) -> Result<&Arc<dyn BusTarget>, BusError> {
        let last = addr.checked_add(len.saturating_sub(1) as u64).ok_or(BusError::Decode(addr))?;
        self.regions
            .iter()
            .find(|r| addr >= r.start && last - r.start < r.size)
            .map(|r| &r.target)
            .ok_or(BusError::Decode(addr))
    }
}

impl BusTarget for AddressMap {
    fn read(&self, addr: u64, buf: &mut [u8], attrs: MemAttrs) -> Result<(), BusError> {
        self.find(addr, buf.len())?.read(addr, buf, attrs)
    }

    fn write(&self, addr: u64, data: &[u8], attrs: MemAttrs) -> Result<(), BusError> {
        self.find(addr, data.len())?.write(addr, data, attrs)
    }
}

impl fmt::Debug for AddressMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.regions.iter().map(|r| format!("{:#x}+{:#x}", r.start, r.size)))
            .finish()
    }
}
