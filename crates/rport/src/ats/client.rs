//! ATS translation client.
//!
//! Asks the peer's IOMMU for translations and caches the answers. The peer
//! revokes them with `ats_invalidation`, which this device handles.

use std::fmt;
use std::sync::Mutex;

use tracing::{debug, trace};

use crate::buffer::DynPacket;
use crate::channel::Channel;
use crate::common::{ProtocolError, Result, lock};
use crate::device::{CommandSet, RemotePortDevice};
use crate::proto::codec;
use crate::proto::header::{Command, FLAG_RESPONSE};
use crate::proto::packet::{ATS_RESULT_OK, Ats, Body};

use super::cache::{AtsCache, AtsEntry};

/// A translation obtained from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTranslation {
    /// Translated address of the requested iova.
    pub translated_addr: u64,
    /// Bytes valid from the requested iova onwards.
    pub len: u64,
    /// Granted permission bits.
    pub attributes: u64,
    /// Served from the cache without a round trip.
    pub from_cache: bool,
}

/// Translation requester attached at one device index.
pub struct AtsClient {
    dev: u32,
    cache: Mutex<AtsCache>,
}

impl AtsClient {
    /// Creates the client for device index `dev`.
    pub const fn new(dev: u32) -> Self {
        Self { dev, cache: Mutex::new(AtsCache::new()) }
    }

    /// Device index.
    pub const fn dev(&self) -> u32 {
        self.dev
    }

    /// Copy of the cached translations.
    pub fn entries(&self) -> Vec<AtsEntry> {
        lock(&self.cache).entries().to_vec()
    }

    /// Translates `[iova, iova + len)` with permission bits `attrs`.
    ///
    /// Returns `Ok(None)` if the peer refused.
    ///
    /// # Errors
    ///
    /// Channel failures while asking the peer.
    pub fn translate(&self, channel: &Channel, iova: u64, len: u64, attrs: u64) -> Result<Option<ClientTranslation>> {
        if let Some(hit) = self.cached(iova, len, attrs) {
            trace!(dev = self.dev, iova, len, "ats cache hit");
            return Ok(Some(hit));
        }

        let mut pkt = DynPacket::new();
        let id = channel.new_id();
        let req = Ats { timestamp: channel.normalized_clk(), attributes: attrs, addr: iova, len, result: 0 };
        let size = codec::encode_ats_req(&mut pkt, id, self.dev, &req, 0);
        let rsp = channel.device_request(self.dev, &pkt, size)?;
        let reply = rsp.packet().and_then(|p| match p.body {
            Body::Ats(ats) => Some(ats),
            _ => None,
        });
        drop(rsp);
        let Some(reply) = reply else {
            channel.fatal(ProtocolError::Malformed { cmd: "ats_request" });
        };

        if reply.result != ATS_RESULT_OK || reply.len == 0 {
            debug!(dev = self.dev, iova, len, result = reply.result, "ats translation refused");
            return Ok(None);
        }
        let entry = AtsEntry {
            iova,
            translated_addr: reply.addr,
            addr_mask: reply.len - 1,
            target_as: 0,
            attributes: reply.attributes,
        };
        let outcome = lock(&self.cache).insert_local(entry);
        debug!(dev = self.dev, iova, translated = reply.addr, len = reply.len, ?outcome, "ats translation cached");
        Ok(Some(ClientTranslation {
            translated_addr: reply.addr,
            len: reply.len,
            attributes: reply.attributes,
            from_cache: false,
        }))
    }

    fn cached(&self, iova: u64, len: u64, attrs: u64) -> Option<ClientTranslation> {
        let cache = lock(&self.cache);
        let e = cache.lookup_iova(iova, len)?;
        if e.attributes & attrs != attrs {
            return None;
        }
        Some(ClientTranslation {
            translated_addr: e.translate(iova),
            len: (e.iova_last() - iova).saturating_add(1),
            attributes: e.attributes,
            from_cache: true,
        })
    }
}

impl RemotePortDevice for AtsClient {
    fn name(&self) -> &str {
        "ats-client"
    }

    fn commands(&self) -> CommandSet {
        CommandSet::empty().with(Command::AtsInv)
    }

    fn handle(&self, channel: &Channel, pkt: &DynPacket) -> Result<()> {
        let Some((hdr, inv)) = pkt.packet().and_then(|p| match p.body {
            Body::Ats(ats) => Some((p.header, ats)),
            _ => None,
        }) else {
            return Ok(());
        };
        let removed = lock(&self.cache).invalidate_range(inv.addr, inv.len);
        debug!(dev = self.dev, iova = inv.addr, len = inv.len, removed, "ats invalidation");
        if hdr.is_posted() {
            return Ok(());
        }
        let ack = Ats { result: ATS_RESULT_OK, ..inv };
        let mut out = DynPacket::new();
        let size = codec::encode_ats_inv(&mut out, hdr.id, hdr.dev, &ack, hdr.flags | FLAG_RESPONSE);
        channel.write(&out.as_bytes()[..size])
    }
}

impl fmt::Debug for AtsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtsClient").field("dev", &self.dev).field("cache", &*lock(&self.cache)).finish()
    }
}
