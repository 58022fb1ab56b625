//! Translation cache shared by the ATS server and client.
//!
//! Entries map an iova window `[iova, iova + addr_mask]` onto a translated
//! window of the same size in one target address space. The cache keeps one
//! invariant: no two entries with different address spaces overlap in iova
//! space. Entries that would break it are invalidated on the wire first and
//! removed second, so the peer never holds a translation the cache has
//! already forgotten.

use crate::common::Result;

/// Identifier of a target address space.
pub type AddressSpaceId = u32;

/// One cached translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtsEntry {
    /// First untranslated address.
    pub iova: u64,
    /// First translated address.
    pub translated_addr: u64,
    /// Window size minus one.
    pub addr_mask: u64,
    /// Address space the translation targets.
    pub target_as: AddressSpaceId,
    /// Granted permissions, see [`ats_attr`](crate::proto::packet::ats_attr).
    pub attributes: u64,
}

impl AtsEntry {
    /// Window size in bytes.
    pub const fn len(&self) -> u64 {
        self.addr_mask.saturating_add(1)
    }

    /// Last untranslated address.
    pub const fn iova_last(&self) -> u64 {
        self.iova.saturating_add(self.addr_mask)
    }

    /// Last translated address.
    pub const fn translated_last(&self) -> u64 {
        self.translated_addr.saturating_add(self.addr_mask)
    }

    /// True if the iova window intersects `[first, last]`.
    pub const fn overlaps_iova(&self, first: u64, last: u64) -> bool {
        self.iova <= last && first <= self.iova_last()
    }

    /// True if this window contains all of `other` and maps it identically.
    pub const fn covers(&self, other: &Self) -> bool {
        self.iova <= other.iova
            && other.iova_last() <= self.iova_last()
            && self.translated_addr.wrapping_add(other.iova - self.iova) == other.translated_addr
    }

    /// Translates `iova`, which must lie inside the window.
    pub const fn translate(&self, iova: u64) -> u64 {
        self.translated_addr.wrapping_add(iova - self.iova)
    }
}

/// Last address of `[addr, addr + len)`; zero-length ranges count as one byte.
const fn last_of(addr: u64, len: u64) -> u64 {
    addr.saturating_add(len.saturating_sub(1))
}

/// Destination for invalidations that must reach the peer.
pub trait InvalidateSink {
    /// Tells the peer to drop translations for `[iova, iova + len)` and waits
    /// for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Transport failures.
    fn invalidate(&mut self, iova: u64, len: u64) -> Result<()>;
}

/// What [`AtsCache::insert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The entry was added.
    Inserted,
    /// An existing entry already covers it; nothing changed.
    AlreadyCached,
}

/// Per-device translation cache.
#[derive(Debug, Default)]
pub struct AtsCache {
    entries: Vec<AtsEntry>,
}

impl AtsCache {
    /// Creates an empty cache.
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Cached entries in insertion order.
    pub fn entries(&self) -> &[AtsEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry whose translated window contains all of `[addr, addr + len)`.
    pub fn lookup(&self, addr: u64, len: u64) -> Option<&AtsEntry> {
        let last = last_of(addr, len);
        self.entries.iter().find(|e| e.translated_addr <= addr && last <= e.translated_last())
    }

    /// Entry whose iova window contains all of `[iova, iova + len)`.
    pub fn lookup_iova(&self, iova: u64, len: u64) -> Option<&AtsEntry> {
        let last = last_of(iova, len);
        self.entries.iter().find(|e| e.iova <= iova && last <= e.iova_last())
    }

    /// Entries whose iova window intersects `[iova, iova + len)`.
    pub fn overlapping(&self, iova: u64, len: u64) -> Vec<AtsEntry> {
        let last = last_of(iova, len);
        self.entries.iter().filter(|e| e.overlaps_iova(iova, last)).copied().collect()
    }

    /// Inserts `entry` unless that first needs wire invalidations.
    ///
    /// Returns the entries the peer must forget before `entry` can go in:
    /// overlapping entries in another address space, and same-space entries
    /// that overlap only partially or map differently. Same-space entries
    /// that `entry` covers are dropped locally.
    pub fn try_insert(&mut self, entry: AtsEntry) -> Result<InsertOutcome, Vec<AtsEntry>> {
        let last = entry.iova_last();
        if self.entries.iter().any(|e| e.target_as == entry.target_as && e.covers(&entry)) {
            return Ok(InsertOutcome::AlreadyCached);
        }
        let conflicts: Vec<AtsEntry> = self
            .entries
            .iter()
            .filter(|e| e.overlaps_iova(entry.iova, last))
            .filter(|e| e.target_as != entry.target_as || !entry.covers(e))
            .copied()
            .collect();
        if !conflicts.is_empty() {
            return Err(conflicts);
        }
        self.entries.retain(|e| !e.overlaps_iova(entry.iova, last));
        self.entries.push(entry);
        Ok(InsertOutcome::Inserted)
    }

    /// Inserts `entry`, invalidating conflicting entries through `sink` first.
    ///
    /// # Errors
    ///
    /// Propagates sink failures. Entries invalidated before the failure are
    /// already removed; `entry` is not inserted.
    pub fn insert<S: InvalidateSink + ?Sized>(&mut self, entry: AtsEntry, sink: &mut S) -> Result<InsertOutcome> {
        loop {
            match self.try_insert(entry) {
                Ok(outcome) => return Ok(outcome),
                Err(conflicts) => {
                    for c in conflicts {
                        sink.invalidate(c.iova, c.len())?;
                        let _ = self.remove(&c);
                    }
                }
            }
        }
    }

    /// Inserts `entry`, dropping conflicting entries locally.
    ///
    /// For the requesting side, which has nobody to invalidate.
    pub fn insert_local(&mut self, entry: AtsEntry) -> InsertOutcome {
        loop {
            match self.try_insert(entry) {
                Ok(outcome) => return outcome,
                Err(conflicts) => conflicts.iter().for_each(|c| {
                    let _ = self.remove(c);
                }),
            }
        }
    }

    /// Removes one exact entry. Returns false if it was not cached.
    pub fn remove(&mut self, entry: &AtsEntry) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e != entry);
        self.entries.len() != before
    }

    /// Removes every entry overlapping `[iova, iova + len)`. Returns how many.
    pub fn invalidate_range(&mut self, iova: u64, len: u64) -> usize {
        let last = last_of(iova, len);
        let before = self.entries.len();
        self.entries.retain(|e| !e.overlaps_iova(iova, last));
        before - self.entries.len()
    }

    /// Handles a local unmap of `[iova, iova + mask]`.
    ///
    /// If anything cached overlaps, the range is invalidated through `sink`
    /// before the entries are removed. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Propagates sink failures; nothing is removed in that case.
    pub fn unmap<S: InvalidateSink + ?Sized>(&mut self, iova: u64, mask: u64, sink: &mut S) -> Result<usize> {
        let len = mask.saturating_add(1);
        if self.overlapping(iova, len).is_empty() {
            return Ok(0);
        }
        sink.invalidate(iova, len)?;
        Ok(self.invalidate_range(iova, len))
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
