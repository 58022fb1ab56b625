//! Address Translation Service.
//!
//! A peer with its own DMA engines may ask this side's IOMMU for
//! translations instead of sending untranslated accesses. It provides:
//! 1. **Cache:** Translations handed out or received, with the
//!    invalidate-before-remove rule.
//! 2. **Server:** [`AtsDevice`] answers `ats_request` and revokes
//!    translations on unmap.
//! 3. **Client:** [`AtsClient`] requests translations and honors
//!    `ats_invalidation`.

/// Translation cache.
pub mod cache;
/// Translation requester.
pub mod client;
/// Translation server.
pub mod server;

pub use cache::{AddressSpaceId, AtsCache, AtsEntry, InsertOutcome, InvalidateSink};
pub use client::{AtsClient, ClientTranslation};
pub use server::{AtsDevice, IommuTranslator, Perms, Translation, UnmapListener};
