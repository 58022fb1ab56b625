//! ATS translation server.
//!
//! Answers `ats_request` packets from a peer that translates its own DMA
//! addresses through our IOMMU. Successful translations are remembered so
//! that later unmaps (and conflicting translations) can be invalidated on the
//! peer before the local entry goes away.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::buffer::DynPacket;
use crate::channel::Channel;
use crate::common::{Error, Result, lock};
use crate::device::{CommandSet, RemotePortDevice};
use crate::proto::codec;
use crate::proto::header::{Command, FLAG_RESPONSE};
use crate::proto::packet::{ATS_RESULT_ERROR, ATS_RESULT_OK, Ats, Body, ats_attr};

use super::cache::{AddressSpaceId, AtsCache, AtsEntry, InsertOutcome, InvalidateSink};

/// Access rights granted by a translation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Perms {
    /// Reads (and instruction fetches) allowed.
    pub read: bool,
    /// Writes allowed.
    pub write: bool,
}

/// Result of an IOMMU walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Translated address of the requested iova.
    pub translated_addr: u64,
    /// Bytes the translation is valid for, starting at the requested iova.
    pub len: u64,
    /// Address space the translated address lives in.
    pub target_as: AddressSpaceId,
    /// Granted rights.
    pub perms: Perms,
}

/// The local IOMMU.
pub trait IommuTranslator: Send + Sync {
    /// Translates `iova` for an access with ATS permission bits `attrs`.
    ///
    /// Returns `None` if there is no mapping.
    fn translate(&self, iova: u64, attrs: u64) -> Option<Translation>;
}

/// Receives unmap notifications from the local memory system.
pub trait UnmapListener: Send + Sync {
    /// `[iova, iova + mask]` is no longer mapped.
    ///
    /// # Errors
    ///
    /// Transport failures while invalidating on the peer.
    fn unmap_notify(&self, iova: u64, mask: u64) -> Result<()>;
}

/// Sends `ats_invalidation` requests for one device and waits for each ack.
pub(crate) struct WireInvalidator<'a> {
    pub(crate) channel: &'a Channel,
    pub(crate) dev: u32,
}

impl InvalidateSink for WireInvalidator<'_> {
    fn invalidate(&mut self, iova: u64, len: u64) -> Result<()> {
        let mut pkt = DynPacket::new();
        let id = self.channel.new_id();
        let inv = Ats {
            timestamp: self.channel.normalized_clk(),
            attributes: 0,
            addr: iova,
            len,
            result: ATS_RESULT_OK,
        };
        let size = codec::encode_ats_inv(&mut pkt, id, self.dev, &inv, 0);
        debug!(channel = self.channel.name(), dev = self.dev, iova, len, "ats invalidate");
        drop(self.channel.device_request(self.dev, &pkt, size)?);
        Ok(())
    }
}

/// Translation server attached at one device index.
pub struct AtsDevice {
    dev: u32,
    channel: Weak<Channel>,
    translator: Arc<dyn IommuTranslator>,
    cache: Mutex<AtsCache>,
}

impl AtsDevice {
    /// Creates the server for device index `dev` on `channel`.
    ///
    /// The device keeps a weak reference; attach it with
    /// [`Channel::attach`] to receive requests.
    pub fn new(channel: &Arc<Channel>, dev: u32, translator: Arc<dyn IommuTranslator>) -> Self {
        Self { dev, channel: Arc::downgrade(channel), translator, cache: Mutex::new(AtsCache::new()) }
    }

    /// Device index.
    pub const fn dev(&self) -> u32 {
        self.dev
    }

    /// Copy of the cached translations.
    pub fn entries(&self) -> Vec<AtsEntry> {
        lock(&self.cache).entries().to_vec()
    }

    /// Address space holding the translated range `[addr, addr + len)`, if a
    /// translation handed to the peer covers it.
    pub fn lookup_translation(&self, addr: u64, len: u64) -> Option<AddressSpaceId> {
        lock(&self.cache).lookup(addr, len).map(|e| e.target_as)
    }

    /// Caches `entry`, invalidating conflicts on the peer without holding the
    /// cache lock across the wire round trip.
    fn remember(&self, channel: &Channel, entry: AtsEntry) -> Result<InsertOutcome> {
        let mut sink = WireInvalidator { channel, dev: self.dev };
        loop {
            let conflicts = match lock(&self.cache).try_insert(entry) {
                Ok(outcome) => return Ok(outcome),
                Err(conflicts) => conflicts,
            };
            for c in conflicts {
                sink.invalidate(c.iova, c.len())?;
                let _ = lock(&self.cache).remove(&c);
            }
        }
    }

    fn answer(&self, channel: &Channel, req: &Ats) -> Result<Ats> {
        let mut rsp = Ats { result: ATS_RESULT_ERROR, ..*req };
        let Some(t) = self.translator.translate(req.addr, req.attributes) else {
            debug!(dev = self.dev, iova = req.addr, "ats: no translation");
            return Ok(rsp);
        };
        if t.len < req.len {
            debug!(dev = self.dev, iova = req.addr, want = req.len, got = t.len, "ats: translation too short");
            return Ok(rsp);
        }
        if !t.perms.read {
            rsp.attributes &= !(ats_attr::READ | ats_attr::EXEC);
        }
        if !t.perms.write {
            rsp.attributes &= !ats_attr::WRITE;
        }
        let entry = AtsEntry {
            iova: req.addr,
            translated_addr: t.translated_addr,
            addr_mask: t.len.saturating_sub(1),
            target_as: t.target_as,
            attributes: rsp.attributes,
        };
        let outcome = self.remember(channel, entry)?;
        debug!(
            dev = self.dev,
            iova = req.addr,
            translated = t.translated_addr,
            len = t.len,
            target_as = t.target_as,
            ?outcome,
            "ats: translated"
        );
        rsp.addr = t.translated_addr;
        rsp.len = t.len;
        rsp.result = ATS_RESULT_OK;
        Ok(rsp)
    }
}

impl RemotePortDevice for AtsDevice {
    fn name(&self) -> &str {
        "ats"
    }

    fn commands(&self) -> CommandSet {
        CommandSet::empty().with(Command::AtsReq)
    }

    fn handle(&self, channel: &Channel, pkt: &DynPacket) -> Result<()> {
        let Some((hdr, req)) = pkt.packet().and_then(|p| match p.body {
            Body::Ats(ats) => Some((p.header, ats)),
            _ => None,
        }) else {
            return Ok(());
        };
        let rsp = self.answer(channel, &req)?;
        let mut out = DynPacket::new();
        let size = codec::encode_ats_req(&mut out, hdr.id, hdr.dev, &rsp, hdr.flags | FLAG_RESPONSE);
        channel.write(&out.as_bytes()[..size])
    }
}

impl UnmapListener for AtsDevice {
    fn unmap_notify(&self, iova: u64, mask: u64) -> Result<()> {
        let len = mask.saturating_add(1);
        if lock(&self.cache).overlapping(iova, len).is_empty() {
            return Ok(());
        }
        let Some(channel) = self.channel.upgrade() else {
            warn!(dev = self.dev, "ats unmap after channel teardown");
            return Err(Error::Shutdown);
        };
        WireInvalidator { channel: &channel, dev: self.dev }.invalidate(iova, len)?;
        let removed = lock(&self.cache).invalidate_range(iova, len);
        debug!(dev = self.dev, iova, mask, removed, "ats: unmapped");
        Ok(())
    }
}

impl fmt::Debug for AtsDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtsDevice").field("dev", &self.dev).field("cache", &*lock(&self.cache)).finish_non_exhaustive()
    }
}
