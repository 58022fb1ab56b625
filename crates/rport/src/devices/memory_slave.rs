//! Memory slave: executes the peer's bus reads and writes locally.
//!
//! Every request gets a response. Target errors are mapped onto response
//! codes:
//! - [`BusError::Generic`] -> `BusGenericError`
//! - [`BusError::Decode`] -> `AddrError`
//!
//! Accesses flagged `PHYS_ADDR` carry an address already translated through
//! ATS; they go to the address space of the covering translation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::ats::{AddressSpaceId, AtsDevice};
use crate::buffer::DynPacket;
use crate::channel::Channel;
use crate::common::{BusError, Result};
use crate::device::{CommandSet, RemotePortDevice};
use crate::memory::{BusTarget, MemAttrs};
use crate::proto::codec::{self, BusAccessIn};
use crate::proto::header::{Command, Header};
use crate::proto::packet::{BusAccess, RespCode, attr};

/// Bus slave backed by local targets.
pub struct MemorySlave {
    target: Arc<dyn BusTarget>,
    spaces: BTreeMap<AddressSpaceId, Arc<dyn BusTarget>>,
    ats: Option<Arc<AtsDevice>>,
}

impl MemorySlave {
    /// Creates a slave serving untranslated accesses from `target`.
    pub fn new(target: Arc<dyn BusTarget>) -> Self {
        Self { target, spaces: BTreeMap::new(), ats: None }
    }

    /// Registers the target for translated accesses into address space `id`.
    #[must_use]
    pub fn with_address_space(mut self, id: AddressSpaceId, target: Arc<dyn BusTarget>) -> Self {
        let _ = self.spaces.insert(id, target);
        self
    }

    /// Resolves `PHYS_ADDR` accesses through `ats`.
    #[must_use]
    pub fn with_ats(mut self, ats: Arc<AtsDevice>) -> Self {
        self.ats = Some(ats);
        self
    }

    fn target_for(&self, ba: &BusAccess) -> Result<&Arc<dyn BusTarget>, BusError> {
        if ba.attributes & attr::PHYS_ADDR == 0 {
            return Ok(&self.target);
        }
        self.ats
            .as_ref()
            .and_then(|ats| ats.lookup_translation(ba.addr, u64::from(ba.len)))
            .and_then(|id| self.spaces.get(&id))
            .ok_or(BusError::Decode(ba.addr))
    }

    fn execute(
        &self,
        cmd: Command,
        ba: &BusAccess,
        pkt: &DynPacket,
        byte_en: Option<&[u8]>,
        data: &mut [u8],
    ) -> Result<(), BusError> {
        if ba.width != 0 {
            warn!(width = ba.width, "memory slave: bus width must be zero");
            return Err(BusError::Generic);
        }
        let target = self.target_for(ba)?;
        let attrs = MemAttrs { secure: ba.attributes & attr::SECURE != 0, master_id: ba.master_id };
        let len = ba.len as usize;
        let stream_width = ba.stream_width as usize;

        if cmd == Command::Write {
            let payload = pkt.bus_data().ok_or(BusError::Generic)?;
            data.copy_from_slice(payload);
        }

        if byte_en.is_none() && (stream_width == len || stream_width == 0) {
            return match cmd {
                Command::Read => target.read(ba.addr, data, attrs),
                _ => target.write(ba.addr, data, attrs),
            };
        }

        let stream_width = if stream_width == 0 { len } else { stream_width };
        for i in 0..len {
            if let Some(be) = byte_en {
                if be[i % be.len()] == 0 {
                    continue;
                }
            }
            let addr = ba.addr.wrapping_add((i % stream_width) as u64);
            let byte = &mut data[i..=i];
            match cmd {
                Command::Read => target.read(addr, byte, attrs)?,
                _ => target.write(addr, byte, attrs)?,
            }
        }
        Ok(())
    }

    fn respond(&self, channel: &Channel, hdr: &Header, ba: &BusAccess, resp: RespCode, data: &[u8]) -> Result<()> {
        let mut input = BusAccessIn::response_to(hdr, ba);
        input.attributes |= resp.to_attributes();
        let mut out = DynPacket::new();
        let size = codec::encode_busaccess(&mut out, &channel.peer().caps(), &input, data, &[])?;
        channel.write(&out.as_bytes()[..size])
    }
}

impl RemotePortDevice for MemorySlave {
    fn name(&self) -> &str {
        "memory-slave"
    }

    fn commands(&self) -> CommandSet {
        CommandSet::bus()
    }

    fn handle(&self, channel: &Channel, pkt: &DynPacket) -> Result<()> {
        let Some(packet) = pkt.packet() else {
            return Ok(());
        };
        let hdr = packet.header;
        let (Some(cmd), Some(ba)) = (hdr.command(), packet.bus_access().copied()) else {
            return Ok(());
        };
        let caps = channel.peer().caps();
        let byte_en = pkt.byte_enables(&caps);
        let mut data = vec![0u8; ba.len as usize];

        let resp = match self.execute(cmd, &ba, pkt, byte_en, &mut data) {
            Ok(()) => RespCode::Ok,
            Err(BusError::Generic) => RespCode::BusGenericError,
            Err(BusError::Decode(_)) => RespCode::AddrError,
        };
        trace!(dev = hdr.dev, %cmd, addr = ba.addr, len = ba.len, ?resp, "memory slave access");
        self.respond(channel, &hdr, &ba, resp, &data)
    }
}

impl fmt::Debug for MemorySlave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySlave")
            .field("address_spaces", &self.spaces.keys().collect::<Vec<_>>())
            .field("ats", &self.ats.is_some())
            .finish_non_exhaustive()
    }
}
